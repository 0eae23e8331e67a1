//! Job orchestration core.
//!
//! Core owns the job lifecycle: sanitize, ingest, admit, supervise, collect
//! outputs and hand scratch state back to the lifecycle manager. Tool
//! specifics live in `exec`, resource policy in `admission` and `kernel`.

pub mod cancel;
pub mod pipeline;
