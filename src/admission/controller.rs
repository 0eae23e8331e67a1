use crate::config::settings::GovernorConfig;
use crate::config::types::{JobError, Result};
use crate::core::cancel::CancelToken;
use crate::kernel::memory::MemoryProbe;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Upper bound on one condvar wait; memory can free up without a release
const RECHECK_INTERVAL: Duration = Duration::from_millis(100);

/// A granted concurrency + memory reservation
#[derive(Debug)]
pub struct OperationSlot {
    id: u64,
    job_id: String,
    estimated_memory_bytes: u64,
    acquired_at: DateTime<Utc>,
    released_at: Option<DateTime<Utc>>,
}

impl OperationSlot {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn estimated_memory_bytes(&self) -> u64 {
        self.estimated_memory_bytes
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn released_at(&self) -> Option<DateTime<Utc>> {
        self.released_at
    }

    pub fn is_released(&self) -> bool {
        self.released_at.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AdmissionStats {
    pub open_slots: usize,
    pub reserved_bytes: u64,
    pub waiting: usize,
    pub granted_total: u64,
    pub rejected_total: u64,
}

#[derive(Default)]
struct AdmissionState {
    open: HashMap<u64, (String, u64)>,
    next_id: u64,
    waiting: usize,
    granted_total: u64,
    rejected_total: u64,
}

impl AdmissionState {
    fn reserved(&self) -> u64 {
        self.open.values().map(|(_, bytes)| *bytes).sum()
    }
}

/// Why a request could not be granted on this attempt
enum Blocked {
    Count(usize),
    Memory(String),
    Unknown(String),
}

/// Gates heavy jobs on open-slot count and reserved memory.
/// All grants and releases go through one mutex.
pub struct AdmissionController {
    max_concurrent: usize,
    ceiling_bytes: u64,
    warning_threshold_bytes: u64,
    default_wait: Duration,
    probe: Arc<dyn MemoryProbe>,
    state: Mutex<AdmissionState>,
    changed: Condvar,
}

impl AdmissionController {
    pub fn new(
        max_concurrent: usize,
        ceiling_bytes: u64,
        warning_threshold_bytes: u64,
        default_wait: Duration,
        probe: Arc<dyn MemoryProbe>,
    ) -> Self {
        Self {
            max_concurrent,
            ceiling_bytes,
            warning_threshold_bytes,
            default_wait,
            probe,
            state: Mutex::new(AdmissionState::default()),
            changed: Condvar::new(),
        }
    }

    pub fn from_config(config: &GovernorConfig, probe: Arc<dyn MemoryProbe>) -> Self {
        Self::new(
            config.max_concurrent_operations,
            config.memory_ceiling_bytes,
            config.warning_threshold_bytes,
            config.admission_wait(),
            probe,
        )
    }

    /// Block up to the configured wait for a slot
    pub fn acquire(&self, job_id: &str, estimated_memory_bytes: u64) -> Result<OperationSlot> {
        self.acquire_with_cancel(
            job_id,
            estimated_memory_bytes,
            self.default_wait,
            &CancelToken::new(),
        )
    }

    /// Block up to `wait` for a slot. Cancellation while waiting returns
    /// `Cancelled` and leaves no trace.
    pub fn acquire_with_cancel(
        &self,
        job_id: &str,
        estimated_memory_bytes: u64,
        wait: Duration,
        cancel: &CancelToken,
    ) -> Result<OperationSlot> {
        if estimated_memory_bytes >= self.ceiling_bytes {
            self.lock_state().rejected_total += 1;
            warn!(
                "Job {} estimate {} bytes can never fit under ceiling {}",
                job_id, estimated_memory_bytes, self.ceiling_bytes
            );
            return Err(JobError::CapacityUnavailable(format!(
                "estimated {} bytes exceeds the {} byte ceiling",
                estimated_memory_bytes, self.ceiling_bytes
            )));
        }

        let deadline = Instant::now() + wait;
        let mut state = self.lock_state();
        state.waiting += 1;
        let mut contended = false;

        loop {
            if cancel.is_cancelled() {
                state.waiting -= 1;
                debug!("Job {} cancelled while waiting for admission", job_id);
                return Err(JobError::Cancelled);
            }

            let blocked = match self.try_grant(&mut state, job_id, estimated_memory_bytes) {
                Ok(slot) => {
                    state.waiting -= 1;
                    return Ok(slot);
                }
                Err(blocked) => blocked,
            };

            if !contended {
                contended = true;
                debug!("Job {} queued for admission", job_id);
            }

            let now = Instant::now();
            if now >= deadline {
                state.waiting -= 1;
                state.rejected_total += 1;
                return Err(match blocked {
                    Blocked::Unknown(reason) => JobError::MemoryUnknown(reason),
                    Blocked::Count(open) => JobError::CapacityUnavailable(format!(
                        "all {} operation slots busy after waiting {:?}",
                        open, wait
                    )),
                    Blocked::Memory(reason) => JobError::CapacityUnavailable(reason),
                });
            }

            let slice = (deadline - now).min(RECHECK_INTERVAL);
            state = self
                .changed
                .wait_timeout(state, slice)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    fn try_grant(
        &self,
        state: &mut AdmissionState,
        job_id: &str,
        estimated: u64,
    ) -> std::result::Result<OperationSlot, Blocked> {
        if state.open.len() >= self.max_concurrent {
            return Err(Blocked::Count(state.open.len()));
        }

        // Fresh sample at every decision point
        let snapshot = match self.probe.sample() {
            Ok(snapshot) => snapshot,
            Err(e) => return Err(Blocked::Unknown(e.to_string())),
        };

        let reserved = state.reserved();
        let projected = reserved
            .saturating_add(snapshot.process_rss_bytes)
            .saturating_add(estimated);
        if projected >= self.ceiling_bytes {
            return Err(Blocked::Memory(format!(
                "reserved {} + rss {} + estimate {} would reach ceiling {}",
                reserved, snapshot.process_rss_bytes, estimated, self.ceiling_bytes
            )));
        }
        if estimated > snapshot.available_bytes {
            return Err(Blocked::Memory(format!(
                "estimate {} exceeds host available memory {}",
                estimated, snapshot.available_bytes
            )));
        }
        if snapshot.process_rss_bytes > self.warning_threshold_bytes {
            warn!(
                "Process RSS {} bytes is above warning threshold {}",
                snapshot.process_rss_bytes, self.warning_threshold_bytes
            );
        }

        state.next_id += 1;
        let id = state.next_id;
        state.open.insert(id, (job_id.to_string(), estimated));
        state.granted_total += 1;
        info!(
            "Admitted job {} (estimate {} bytes, {} of {} slots open)",
            job_id,
            estimated,
            state.open.len(),
            self.max_concurrent
        );

        Ok(OperationSlot {
            id,
            job_id: job_id.to_string(),
            estimated_memory_bytes: estimated,
            acquired_at: Utc::now(),
            released_at: None,
        })
    }

    /// Return a slot. Releasing twice is a no-op.
    pub fn release(&self, slot: &mut OperationSlot) {
        if slot.released_at.is_some() {
            return;
        }
        let removed = self.lock_state().open.remove(&slot.id).is_some();
        slot.released_at = Some(Utc::now());
        if removed {
            debug!("Released slot for job {}", slot.job_id);
            self.changed.notify_all();
        }
    }

    pub fn stats(&self) -> AdmissionStats {
        let state = self.lock_state();
        AdmissionStats {
            open_slots: state.open.len(),
            reserved_bytes: state.reserved(),
            waiting: state.waiting,
            granted_total: state.granted_total,
            rejected_total: state.rejected_total,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, AdmissionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FixedMemoryProbe;
    use std::thread;

    const MIB: u64 = 1024 * 1024;

    fn controller(
        max: usize,
        ceiling: u64,
        probe: Arc<FixedMemoryProbe>,
    ) -> Arc<AdmissionController> {
        Arc::new(AdmissionController::new(
            max,
            ceiling,
            ceiling,
            Duration::from_millis(200),
            probe,
        ))
    }

    #[test]
    fn grants_up_to_count_limit() {
        let probe = Arc::new(FixedMemoryProbe::new(16 * 1024 * MIB, 8 * 1024 * MIB, 10 * MIB));
        let ctl = controller(2, 4 * 1024 * MIB, probe);

        let _a = ctl.acquire("a", MIB).unwrap();
        let _b = ctl.acquire("b", MIB).unwrap();
        let err = ctl.acquire("c", MIB).unwrap_err();
        assert!(matches!(err, JobError::CapacityUnavailable(_)));
        assert_eq!(ctl.stats().open_slots, 2);
        assert_eq!(ctl.stats().rejected_total, 1);
    }

    #[test]
    fn release_is_idempotent() {
        let probe = Arc::new(FixedMemoryProbe::new(16 * 1024 * MIB, 8 * 1024 * MIB, 10 * MIB));
        let ctl = controller(1, 4 * 1024 * MIB, probe);

        let mut slot = ctl.acquire("a", MIB).unwrap();
        ctl.release(&mut slot);
        ctl.release(&mut slot);
        assert!(slot.is_released());
        assert_eq!(ctl.stats().open_slots, 0);

        let mut again = ctl.acquire("b", MIB).unwrap();
        ctl.release(&mut slot);
        assert_eq!(ctl.stats().open_slots, 1);
        ctl.release(&mut again);
    }

    #[test]
    fn memory_reservation_blocks_grant() {
        let probe = Arc::new(FixedMemoryProbe::new(16 * 1024 * MIB, 8 * 1024 * MIB, 100 * MIB));
        let ctl = controller(10, 1000 * MIB, probe);

        let _a = ctl.acquire("a", 500 * MIB).unwrap();
        let err = ctl.acquire("b", 450 * MIB).unwrap_err();
        assert!(matches!(err, JobError::CapacityUnavailable(_)));
        let _c = ctl.acquire("c", 300 * MIB).unwrap();
        assert_eq!(ctl.stats().reserved_bytes, 800 * MIB);
    }

    #[test]
    fn impossible_estimate_fails_immediately() {
        let probe = Arc::new(FixedMemoryProbe::new(16 * 1024 * MIB, 8 * 1024 * MIB, 0));
        let ctl = Arc::new(AdmissionController::new(
            4,
            100 * MIB,
            100 * MIB,
            Duration::from_secs(30),
            probe,
        ));
        let started = Instant::now();
        assert!(ctl.acquire("huge", 100 * MIB).is_err());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn host_available_memory_is_respected() {
        let probe = Arc::new(FixedMemoryProbe::new(16 * 1024 * MIB, 50 * MIB, 0));
        let ctl = controller(4, 1024 * MIB, probe);
        assert!(matches!(
            ctl.acquire("a", 100 * MIB),
            Err(JobError::CapacityUnavailable(_))
        ));
    }

    #[test]
    fn unknown_memory_is_denied() {
        let probe = Arc::new(FixedMemoryProbe::new(16 * 1024 * MIB, 8 * 1024 * MIB, 0));
        probe.set_unknown(true);
        let ctl = controller(4, 1024 * MIB, probe);
        assert!(matches!(ctl.acquire("a", MIB), Err(JobError::MemoryUnknown(_))));
        assert_eq!(ctl.stats().open_slots, 0);
    }

    #[test]
    fn waiter_is_woken_by_release() {
        let probe = Arc::new(FixedMemoryProbe::new(16 * 1024 * MIB, 8 * 1024 * MIB, 0));
        let ctl = Arc::new(AdmissionController::new(
            1,
            1024 * MIB,
            1024 * MIB,
            Duration::from_secs(5),
            probe,
        ));
        let mut held = ctl.acquire("first", MIB).unwrap();

        let waiter = {
            let ctl = Arc::clone(&ctl);
            thread::spawn(move || ctl.acquire("second", MIB).map(|s| s.job_id().to_string()))
        };
        thread::sleep(Duration::from_millis(150));
        assert_eq!(ctl.stats().waiting, 1);
        ctl.release(&mut held);

        assert_eq!(waiter.join().unwrap().unwrap(), "second");
    }

    #[test]
    fn cancel_while_waiting_leaves_no_trace() {
        let probe = Arc::new(FixedMemoryProbe::new(16 * 1024 * MIB, 8 * 1024 * MIB, 0));
        let ctl = Arc::new(AdmissionController::new(
            1,
            1024 * MIB,
            1024 * MIB,
            Duration::from_secs(10),
            probe,
        ));
        let _held = ctl.acquire("first", MIB).unwrap();
        let cancel = CancelToken::new();

        let waiter = {
            let ctl = Arc::clone(&ctl);
            let cancel = cancel.clone();
            thread::spawn(move || {
                ctl.acquire_with_cancel("second", MIB, Duration::from_secs(10), &cancel)
            })
        };
        thread::sleep(Duration::from_millis(100));
        let started = Instant::now();
        cancel.cancel();

        assert!(matches!(waiter.join().unwrap(), Err(JobError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(1));
        let stats = ctl.stats();
        assert_eq!(stats.open_slots, 1);
        assert_eq!(stats.waiting, 0);
    }
}
