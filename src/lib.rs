//! stembox: resource governance for audio separation and transcoding jobs
//! Every job is bounded by input size, admission capacity, per-process memory
//! and wall time, and leaves no scratch state behind once it is done.
//!
//! # Architecture
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::memory`]: Host and process-tree memory readings from `/proc`
//! - [`kernel::signal`]: Process group termination and shutdown signals
//!
//! ## Ingest ([`ingest`])
//! - Bounded, chunked upload streaming with container sniffing
//!
//! ## Admission ([`admission`])
//! - [`admission::controller`]: Slot and memory-budget gating for heavy jobs
//!
//! ## Execution Control ([`exec`])
//! - [`exec::command`]: Argv construction from sanitized values only
//! - [`exec::supervisor`]: Polled supervision with TERM/KILL escalation
//! - [`exec::output`]: Bounded stderr collection
//!
//! ## Safety & Cleanup ([`safety`])
//! - [`safety::sanitizer`]: Whitelists and scratch-root containment
//! - [`safety::scratch`]: Artifact registry, release and TTL sweep
//! - [`safety::safe_cleanup`]: Symlink-safe, device-bounded removal
//!
//! ## Orchestration ([`core`])
//! - [`core::pipeline`]: End-to-end job flow
//! - [`core::cancel`]: Cooperative cancellation
//!
//! ## Observability ([`observability`])
//! - [`observability::metrics`]: Prometheus metrics export
//!
//! ## Configuration ([`config`])
//! - [`config::settings`]: File and environment configuration
//! - [`config::validator`]: Startup validation of limits and whitelists
//! - [`config::types`]: Shared type definitions and closed enums
//!
//! # Design Principles
//!
//! 1. **Deny when unsure** - Unknown memory is never treated as free memory
//! 2. **No shell** - External tools get argv vectors, never command strings
//! 3. **Kernel as truth** - Memory evidence comes from `/proc`, exits from wait status
//! 4. **Every exit path cleans up** - Slots and scratch are released on error too

// Kernel Primitives
pub mod kernel;

// Ingest
pub mod ingest;

// Admission
pub mod admission;

// Execution Control
pub mod exec;

// Job orchestration
pub mod core;

// Safety & Cleanup
pub mod safety;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Testing Infrastructure
pub mod testing;

// CLI entrypoint wiring for the stembox binary.
pub mod cli;

// Re-export commonly used types for convenience
pub use config::types::*;
pub use crate::core::cancel::CancelToken;
pub use crate::core::pipeline::{JobPipeline, JobSubmission};
