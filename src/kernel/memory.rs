//! Host and process memory readings from procfs.
//!
//! Every call reads procfs fresh. Any read or parse failure is reported as
//! `MemoryUnknown`; callers treat that as "do not grant", never as headroom.

use crate::config::types::{JobError, MemorySnapshot, Result};
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

/// Memory source consumed by admission and the supervisor.
pub trait MemoryProbe: Send + Sync {
    /// Fresh host/process snapshot
    fn sample(&self) -> Result<MemorySnapshot>;
    /// RSS of `pid` plus all of its live descendants
    fn process_tree_rss(&self, pid: u32) -> Result<u64>;
}

/// procfs-backed memory monitor
#[derive(Debug, Clone)]
pub struct MemoryMonitor {
    proc_root: PathBuf,
    warning_threshold_bytes: u64,
}

impl MemoryMonitor {
    pub fn new(warning_threshold_bytes: u64) -> Self {
        Self::with_proc_root("/proc", warning_threshold_bytes)
    }

    /// Read from an alternate procfs mount (containers, tests)
    pub fn with_proc_root(proc_root: impl Into<PathBuf>, warning_threshold_bytes: u64) -> Self {
        Self {
            proc_root: proc_root.into(),
            warning_threshold_bytes,
        }
    }

    pub fn sample(&self) -> Result<MemorySnapshot> {
        let meminfo = read_proc(&self.proc_root.join("meminfo"))?;
        let (total_bytes, available_bytes) = parse_meminfo(&meminfo)
            .ok_or_else(|| unknown("meminfo lacks MemTotal/MemAvailable"))?;

        let status = read_proc(&self.proc_root.join("self").join("status"))?;
        let process_rss_bytes =
            parse_status_rss(&status).ok_or_else(|| unknown("self/status lacks VmRSS"))?;

        Ok(MemorySnapshot {
            total_bytes,
            available_bytes,
            process_rss_bytes,
            timestamp: Utc::now(),
        })
    }

    /// max(0, ceiling - process_rss) from a fresh sample
    pub fn available_budget(&self, ceiling: u64) -> Result<u64> {
        Ok(self.sample()?.available_budget(ceiling))
    }

    pub fn is_above_warning(&self, snapshot: &MemorySnapshot) -> bool {
        snapshot.process_rss_bytes > self.warning_threshold_bytes
    }

    /// RSS of a single process
    pub fn process_rss(&self, pid: u32) -> Result<u64> {
        let status = read_proc(&self.proc_root.join(pid.to_string()).join("status"))?;
        parse_status_rss(&status).ok_or_else(|| unknown(&format!("{}/status is malformed", pid)))
    }

    pub fn process_tree_rss(&self, pid: u32) -> Result<u64> {
        // The root must be readable; descendants may vanish mid-walk
        let mut total = self.process_rss(pid)?;
        for child in self.descendants(pid) {
            if let Ok(rss) = self.process_rss(child) {
                total = total.saturating_add(rss);
            }
        }
        Ok(total)
    }

    fn descendants(&self, root: u32) -> Vec<u32> {
        let entries = match fs::read_dir(&self.proc_root) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for entry in entries.flatten() {
            let pid = match entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) {
                Some(pid) => pid,
                None => continue,
            };
            if let Ok(stat) = fs::read_to_string(entry.path().join("stat")) {
                if let Some(ppid) = parse_stat_ppid(&stat) {
                    children.entry(ppid).or_default().push(pid);
                }
            }
        }

        let mut found = Vec::new();
        let mut seen = HashSet::from([root]);
        let mut queue = VecDeque::from([root]);
        while let Some(parent) = queue.pop_front() {
            for &child in children.get(&parent).into_iter().flatten() {
                if seen.insert(child) {
                    found.push(child);
                    queue.push_back(child);
                }
            }
        }
        found
    }
}

impl MemoryProbe for MemoryMonitor {
    fn sample(&self) -> Result<MemorySnapshot> {
        MemoryMonitor::sample(self)
    }

    fn process_tree_rss(&self, pid: u32) -> Result<u64> {
        MemoryMonitor::process_tree_rss(self, pid)
    }
}

fn unknown(detail: &str) -> JobError {
    JobError::MemoryUnknown(detail.to_string())
}

fn read_proc(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|e| unknown(&format!("failed to read {}: {}", path.display(), e)))
}

fn kib_field(line: &str) -> Option<u64> {
    let value = line.split_whitespace().nth(1)?;
    value.parse::<u64>().ok().map(|kib| kib * 1024)
}

/// (MemTotal, MemAvailable) in bytes
fn parse_meminfo(content: &str) -> Option<(u64, u64)> {
    let mut total = None;
    let mut available = None;
    for line in content.lines() {
        if line.starts_with("MemTotal:") {
            total = kib_field(line);
        } else if line.starts_with("MemAvailable:") {
            available = kib_field(line);
        }
    }
    Some((total?, available?))
}

/// VmRSS in bytes. Zombies and kernel threads carry no VmRSS line and count as 0.
fn parse_status_rss(content: &str) -> Option<u64> {
    if let Some(line) = content.lines().find(|l| l.starts_with("VmRSS:")) {
        return kib_field(line);
    }
    if content.lines().any(|l| l.starts_with("Name:")) {
        return Some(0);
    }
    None
}

/// Parent pid from /proc/<pid>/stat. The comm field may contain spaces and
/// parentheses, so fields are counted from the last ')'.
fn parse_stat_ppid(content: &str) -> Option<u32> {
    let rest = &content[content.rfind(')')? + 1..];
    rest.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeProc {
        root: PathBuf,
    }

    impl FakeProc {
        fn new() -> Self {
            let root = std::env::temp_dir().join(format!("stembox-proc-{}", uuid::Uuid::new_v4()));
            fs::create_dir_all(root.join("self")).unwrap();
            fs::write(
                root.join("meminfo"),
                "MemTotal:       16000000 kB\nMemFree:   100 kB\nMemAvailable:    8000000 kB\n",
            )
            .unwrap();
            fs::write(root.join("self/status"), "Name:\tstembox\nVmRSS:\t  2048 kB\n").unwrap();
            Self { root }
        }

        fn add_process(&self, pid: u32, ppid: u32, rss_kib: Option<u64>) {
            let dir = self.root.join(pid.to_string());
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("stat"), format!("{} (py (worker)) S {} 1 1 0", pid, ppid)).unwrap();
            let status = match rss_kib {
                Some(kib) => format!("Name:\tpy\nVmRSS:\t{} kB\n", kib),
                None => "Name:\tpy\nState:\tZ (zombie)\n".to_string(),
            };
            fs::write(dir.join("status"), status).unwrap();
        }

        fn monitor(&self) -> MemoryMonitor {
            MemoryMonitor::with_proc_root(&self.root, 1024 * 1024)
        }
    }

    impl Drop for FakeProc {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.root);
        }
    }

    #[test]
    fn sample_reads_meminfo_and_self_rss() {
        let proc = FakeProc::new();
        let snapshot = proc.monitor().sample().unwrap();
        assert_eq!(snapshot.total_bytes, 16_000_000 * 1024);
        assert_eq!(snapshot.available_bytes, 8_000_000 * 1024);
        assert_eq!(snapshot.process_rss_bytes, 2048 * 1024);
    }

    #[test]
    fn budget_is_ceiling_minus_rss() {
        let proc = FakeProc::new();
        let monitor = proc.monitor();
        assert_eq!(monitor.available_budget(4096 * 1024).unwrap(), 2048 * 1024);
        assert_eq!(monitor.available_budget(1024).unwrap(), 0);
    }

    #[test]
    fn warning_threshold_compares_process_rss() {
        let proc = FakeProc::new();
        let monitor = proc.monitor();
        let snapshot = monitor.sample().unwrap();
        assert!(monitor.is_above_warning(&snapshot));
    }

    #[test]
    fn missing_meminfo_is_unknown() {
        let proc = FakeProc::new();
        fs::remove_file(proc.root.join("meminfo")).unwrap();
        let err = proc.monitor().sample().unwrap_err();
        assert!(matches!(err, JobError::MemoryUnknown(_)));
    }

    #[test]
    fn tree_rss_sums_descendants() {
        let proc = FakeProc::new();
        proc.add_process(100, 1, Some(1000));
        proc.add_process(101, 100, Some(500));
        proc.add_process(102, 101, Some(250));
        proc.add_process(103, 1, Some(9999));
        proc.add_process(104, 100, None);

        let monitor = proc.monitor();
        assert_eq!(monitor.process_tree_rss(100).unwrap(), 1750 * 1024);
        assert_eq!(monitor.process_rss(104).unwrap(), 0);
    }

    #[test]
    fn tree_rss_of_missing_pid_is_unknown() {
        let proc = FakeProc::new();
        assert!(matches!(
            proc.monitor().process_tree_rss(4242),
            Err(JobError::MemoryUnknown(_))
        ));
    }

    #[test]
    fn stat_ppid_survives_parens_in_comm() {
        assert_eq!(parse_stat_ppid("7 (a) b) (c) R 55 7 7 0"), Some(55));
        assert_eq!(parse_stat_ppid("garbage"), None);
    }

    #[test]
    fn live_procfs_reports_our_own_process() {
        let monitor = MemoryMonitor::new(u64::MAX);
        let snapshot = monitor.sample().unwrap();
        assert!(snapshot.total_bytes > 0);
        assert!(snapshot.process_rss_bytes > 0);
        assert!(monitor.process_tree_rss(std::process::id()).unwrap() > 0);
    }
}
