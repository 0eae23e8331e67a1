//! Observability
//!
//! Metrics for operational visibility. Log records go through the `log` facade.

pub mod metrics;
