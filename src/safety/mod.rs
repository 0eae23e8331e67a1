//! Safety and cleanup
//!
//! Parameter sanitization before anything reaches argv, and the scratch
//! lifecycle that owns every temporary file.

pub mod safe_cleanup;
pub mod sanitizer;
pub mod scratch;
