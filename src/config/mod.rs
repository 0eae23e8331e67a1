//! Configuration and shared types
//!
//! The governor configuration, its validation, and the types every component speaks.

pub mod settings;
pub mod types;
pub mod validator;
