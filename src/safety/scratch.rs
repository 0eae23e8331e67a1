//! Scratch lifecycle: the single authority that deletes temporary files.
//!
//! Producers register what they are about to create before the first byte is
//! written. Deletion happens only here: on job release, on caller handoff, or
//! from the periodic ttl sweep that walks the scratch root on disk.

use crate::config::types::{ArtifactKind, JobError, Result, ScratchArtifact};
use crate::observability::metrics::GovernorMetrics;
use crate::safety::safe_cleanup;
use chrono::Utc;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

/// How a job ended, which decides what release deletes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDisposition {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub removed: usize,
    pub retained: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub removed_paths: usize,
    pub pruned_entries: usize,
    pub errors: Vec<String>,
}

struct ScratchState {
    root: PathBuf,
    ttl: Duration,
    registry: Mutex<HashMap<String, Vec<ScratchArtifact>>>,
    metrics: Arc<GovernorMetrics>,
}

struct Sweeper {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct ScratchLifecycle {
    state: Arc<ScratchState>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl ScratchLifecycle {
    /// Create (or reuse) the scratch root with owner-only permissions
    pub fn new(
        root: impl Into<PathBuf>,
        ttl: Duration,
        metrics: Arc<GovernorMetrics>,
    ) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            JobError::Config(format!(
                "Failed to create scratch root {}: {}",
                root.display(),
                e
            ))
        })?;
        fs::set_permissions(&root, fs::Permissions::from_mode(0o700))?;

        Ok(Self {
            state: Arc::new(ScratchState {
                root,
                ttl,
                registry: Mutex::new(HashMap::new()),
                metrics,
            }),
            sweeper: Mutex::new(None),
        })
    }

    pub fn root(&self) -> &Path {
        &self.state.root
    }

    pub fn ttl(&self) -> Duration {
        self.state.ttl
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.state.root.join(job_id)
    }

    /// Create the per-job directory
    pub fn prepare_job_dir(&self, job_id: &str) -> Result<PathBuf> {
        if job_id.is_empty()
            || !job_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(JobError::PathRejected(format!("invalid job id {:?}", job_id)));
        }
        let dir = self.job_dir(job_id);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn register(&self, artifact: ScratchArtifact) {
        debug!(
            "Registered {:?} artifact {} for job {}",
            artifact.kind,
            artifact.path.display(),
            artifact.owner_job_id
        );
        self.state
            .lock_registry()
            .entry(artifact.owner_job_id.clone())
            .or_default()
            .push(artifact);
    }

    /// Register a path under this lifecycle's ttl
    pub fn register_path(
        &self,
        job_id: &str,
        path: impl Into<PathBuf>,
        kind: ArtifactKind,
    ) -> ScratchArtifact {
        let artifact = ScratchArtifact::new(path, job_id, kind, self.state.ttl);
        self.register(artifact.clone());
        artifact
    }

    /// Delete one artifact now and forget it (failed producer)
    pub fn discard(&self, job_id: &str, path: &Path) {
        if let Some(artifacts) = self.state.lock_registry().get_mut(job_id) {
            artifacts.retain(|a| a.path != path);
        }
        let mut report = CleanupReport::default();
        self.state.remove_path(path, &mut report);
    }

    /// End-of-job cleanup. Success deletes inputs and working files and keeps
    /// outputs for handoff; failure deletes everything the job owns.
    pub fn release(&self, job_id: &str, disposition: JobDisposition) -> CleanupReport {
        let mut report = CleanupReport::default();

        let doomed = {
            let mut registry = self.state.lock_registry();
            match disposition {
                JobDisposition::Failed => registry.remove(job_id).unwrap_or_default(),
                JobDisposition::Succeeded => match registry.get_mut(job_id) {
                    Some(artifacts) => {
                        let (keep, doomed): (Vec<_>, Vec<_>) = artifacts
                            .drain(..)
                            .partition(|a| a.kind == ArtifactKind::Output);
                        report.retained = keep.len();
                        *artifacts = keep;
                        if artifacts.is_empty() {
                            registry.remove(job_id);
                        }
                        doomed
                    }
                    None => Vec::new(),
                },
            }
        };

        // Most specific first so directories are emptied before removal
        for artifact in doomed.iter().rev() {
            self.state.remove_path(&artifact.path, &mut report);
        }
        if report.retained == 0 {
            self.state.remove_path(&self.job_dir(job_id), &mut report);
        }

        self.state.record(&report);
        info!(
            "Released scratch for job {} ({:?}): removed {}, retained {}, errors {}",
            job_id,
            disposition,
            report.removed,
            report.retained,
            report.errors.len()
        );
        report
    }

    /// The caller has consumed the outputs; delete them and the job directory
    pub fn complete_handoff(&self, job_id: &str) -> CleanupReport {
        let mut report = CleanupReport::default();
        let artifacts = self.state.lock_registry().remove(job_id).unwrap_or_default();
        for artifact in artifacts.iter().rev() {
            self.state.remove_path(&artifact.path, &mut report);
        }
        self.state.remove_path(&self.job_dir(job_id), &mut report);
        self.state.record(&report);
        report
    }

    pub fn artifacts_for(&self, job_id: &str) -> Vec<ScratchArtifact> {
        self.state
            .lock_registry()
            .get(job_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of jobs that still own registered artifacts
    pub fn tracked_jobs(&self) -> usize {
        self.state.lock_registry().len()
    }

    /// One sweep pass over the scratch root and the registry
    pub fn sweep_once(&self) -> SweepReport {
        self.state.sweep()
    }

    /// Start the periodic sweep thread. A second call is a no-op.
    pub fn start_sweeper(&self, interval: Duration) {
        let mut slot = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }

        let (shutdown, stop) = bounded::<()>(1);
        let state = Arc::clone(&self.state);
        let handle = thread::spawn(move || {
            info!("Started scratch sweep thread (every {:?})", interval);
            loop {
                match stop.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let report = state.sweep();
                        if report.removed_paths > 0 || !report.errors.is_empty() {
                            info!(
                                "Scratch sweep removed {} paths, pruned {} entries, {} errors",
                                report.removed_paths,
                                report.pruned_entries,
                                report.errors.len()
                            );
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!("Scratch sweep thread stopped");
        });

        *slot = Some(Sweeper { shutdown, handle });
    }

    pub fn stop_sweeper(&self) {
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.shutdown.send(());
            if sweeper.handle.join().is_err() {
                warn!("Scratch sweep thread panicked");
            }
        }
    }
}

impl Drop for ScratchLifecycle {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

impl ScratchState {
    fn lock_registry(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<ScratchArtifact>>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove_path(&self, path: &Path, report: &mut CleanupReport) {
        match safe_cleanup::remove_tree_secure(path) {
            Ok(true) => report.removed += 1,
            Ok(false) => {}
            Err(e) => {
                warn!("Failed to remove scratch path {}: {}", path.display(), e);
                report.errors.push(format!("{}: {}", path.display(), e));
            }
        }
    }

    fn record(&self, report: &CleanupReport) {
        self.metrics.record_cleanup(report.removed, report.errors.len());
    }

    fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let now = SystemTime::now();

        match fs::read_dir(&self.root) {
            Ok(entries) => {
                for entry in entries {
                    let entry = match entry {
                        Ok(e) => e,
                        Err(e) => {
                            warn!("Failed to read scratch entry: {}", e);
                            continue;
                        }
                    };
                    let path = entry.path();
                    let modified = match fs::symlink_metadata(&path).and_then(|m| m.modified()) {
                        Ok(m) => m,
                        Err(e) => {
                            warn!("Failed to stat {}: {}", path.display(), e);
                            continue;
                        }
                    };
                    let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
                    if age < self.ttl {
                        continue;
                    }

                    match safe_cleanup::remove_tree_secure(&path) {
                        Ok(_) => {
                            report.removed_paths += 1;
                            debug!(
                                "Swept expired scratch entry {} (age {:?})",
                                path.display(),
                                age
                            );
                        }
                        Err(e) => {
                            warn!("Sweep failed to remove {}: {}", path.display(), e);
                            report.errors.push(format!("{}: {}", path.display(), e));
                        }
                    }
                }
            }
            Err(e) => {
                warn!("Failed to read scratch root {}: {}", self.root.display(), e);
                report.errors.push(format!("{}: {}", self.root.display(), e));
            }
        }

        // Expired registrations go regardless of state. A registration whose
        // path is missing may belong to a producer that has not written yet,
        // so it is only pruned once its job directory is gone as well.
        let now_utc = Utc::now();
        let expired: Vec<PathBuf> = {
            let mut registry = self.lock_registry();
            let mut expired = Vec::new();
            for (job_id, artifacts) in registry.iter_mut() {
                let before = artifacts.len();
                let job_dir_present = self.root.join(job_id).exists();
                artifacts.retain(|a| {
                    if a.is_expired(now_utc) {
                        expired.push(a.path.clone());
                        false
                    } else {
                        job_dir_present || a.path.exists()
                    }
                });
                report.pruned_entries += before - artifacts.len();
            }
            registry.retain(|_, artifacts| !artifacts.is_empty());
            expired
        };
        for path in expired {
            match safe_cleanup::remove_tree_secure(&path) {
                Ok(true) => report.removed_paths += 1,
                Ok(false) => {}
                Err(e) => report.errors.push(format!("{}: {}", path.display(), e)),
            }
        }

        self.metrics.sweep_removed.add(report.removed_paths as u64);
        self.metrics.cleanup_failure.add(report.errors.len() as u64);
        report
    }
}
