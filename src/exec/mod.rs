//! Execution control
//!
//! Command construction from sanitized parameters, and supervised execution
//! of external tools under memory, wall-time and cancellation policing.

pub mod command;
pub mod output;
pub mod supervisor;
