//! Testing infrastructure
//!
//! Deterministic memory probes and fixtures for exercising admission and the
//! pipeline without depending on the host's actual memory state.

use crate::config::settings::GovernorConfig;
use crate::config::types::{JobError, MemorySnapshot, Result};
use crate::kernel::memory::{MemoryMonitor, MemoryProbe};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Probe with operator-set host numbers. Child process trees are still
/// measured from the live procfs so supervisor ceilings stay real.
#[derive(Debug)]
pub struct FixedMemoryProbe {
    total_bytes: AtomicU64,
    available_bytes: AtomicU64,
    process_rss_bytes: AtomicU64,
    unknown: AtomicBool,
    procfs: MemoryMonitor,
}

impl FixedMemoryProbe {
    pub fn new(total_bytes: u64, available_bytes: u64, process_rss_bytes: u64) -> Self {
        Self {
            total_bytes: AtomicU64::new(total_bytes),
            available_bytes: AtomicU64::new(available_bytes),
            process_rss_bytes: AtomicU64::new(process_rss_bytes),
            unknown: AtomicBool::new(false),
            procfs: MemoryMonitor::new(u64::MAX),
        }
    }

    /// Plenty of memory everywhere; only slot counts constrain admission
    pub fn roomy() -> Self {
        Self::new(64 << 30, 32 << 30, 0)
    }

    pub fn set_available(&self, bytes: u64) {
        self.available_bytes.store(bytes, Ordering::SeqCst);
    }

    pub fn set_process_rss(&self, bytes: u64) {
        self.process_rss_bytes.store(bytes, Ordering::SeqCst);
    }

    /// Make `sample` fail as if procfs were unreadable
    pub fn set_unknown(&self, unknown: bool) {
        self.unknown.store(unknown, Ordering::SeqCst);
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn sample(&self) -> Result<MemorySnapshot> {
        if self.unknown.load(Ordering::SeqCst) {
            return Err(JobError::MemoryUnknown("probe marked unknown".to_string()));
        }
        Ok(MemorySnapshot {
            total_bytes: self.total_bytes.load(Ordering::SeqCst),
            available_bytes: self.available_bytes.load(Ordering::SeqCst),
            process_rss_bytes: self.process_rss_bytes.load(Ordering::SeqCst),
            timestamp: Utc::now(),
        })
    }

    fn process_tree_rss(&self, pid: u32) -> Result<u64> {
        self.procfs.process_tree_rss(pid)
    }
}

/// Fake tool invocation: argv after the prefix lands in `$1..$n` of `script`
pub fn shell_tool(script: &str) -> Vec<String> {
    vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        script.to_string(),
        "sh".to_string(),
    ]
}

/// Unique, not yet created scratch root under the system temp dir
pub fn unique_scratch_root(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("stembox-{}-{}", label, uuid::Uuid::new_v4()))
}

/// Fast-moving configuration for tests: short polls, short grace, own scratch root
pub fn test_config(label: &str) -> GovernorConfig {
    GovernorConfig {
        scratch_root: unique_scratch_root(label),
        admission_wait_ms: 2_000,
        poll_interval_ms: 20,
        kill_grace_ms: 300,
        job_timeout_secs: 20,
        transcode_timeout_secs: 20,
        max_upload_bytes: 10 * 1024 * 1024,
        ..GovernorConfig::default()
    }
}
