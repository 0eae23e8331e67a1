//! Thin wrappers around Linux kernel interfaces.
//!
//! procfs memory accounting and process-group signalling. All `unsafe` code
//! is concentrated here with explicit SAFETY comments.

pub mod memory;
pub mod signal;
