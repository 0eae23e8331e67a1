//! Admission control
//!
//! A job must hold an operation slot before its external tool is spawned.
//! Slots are granted against two caps at once: open-slot count and reserved
//! memory under the configured ceiling.

pub mod controller;

pub use controller::{AdmissionController, AdmissionStats, OperationSlot};

use crate::config::types::JobKind;

/// Advisory peak-memory estimate for a job of `kind` on `input_bytes` of input
pub fn estimate_memory(kind: JobKind, input_bytes: u64) -> u64 {
    input_bytes.saturating_mul(kind.memory_multiplier())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multipliers_follow_job_kind() {
        assert_eq!(estimate_memory(JobKind::Separate, 100), 400);
        assert_eq!(estimate_memory(JobKind::Transcode, 100), 200);
        assert_eq!(estimate_memory(JobKind::Separate, u64::MAX), u64::MAX);
    }
}
