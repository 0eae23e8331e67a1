use crate::config::settings::GovernorConfig;
use crate::config::types::{JobError, KillReport, ProcessOutcome, ProcessResult, Result};
use crate::core::cancel::CancelToken;
use crate::exec::command::CommandSpec;
use crate::exec::output::TailCollector;
use crate::kernel::memory::MemoryProbe;
use crate::kernel::signal;
use log::{debug, error, info, warn};
use nix::sys::resource::{setrlimit, Resource};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Consecutive unreadable memory polls tolerated before the child is stopped
const MAX_UNKNOWN_POLLS: u32 = 3;

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub poll_interval: Duration,
    pub kill_grace: Duration,
    pub stderr_excerpt_bytes: usize,
    pub deny_on_unknown_memory: bool,
    pub env_passthrough: Vec<String>,
    /// RLIMIT_AS set in the child between fork and exec
    pub address_space_bytes: Option<u64>,
}

impl SupervisorSettings {
    pub fn from_config(config: &GovernorConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            kill_grace: config.kill_grace(),
            stderr_excerpt_bytes: config.stderr_excerpt_bytes,
            deny_on_unknown_memory: config.deny_on_unknown_memory,
            env_passthrough: config.env_passthrough.clone(),
            address_space_bytes: config.process_address_space_bytes,
        }
    }
}

/// One running child as the poll loop sees it
#[derive(Debug, Clone)]
pub struct SupervisedProcess {
    pub pid: u32,
    pub started_at: Instant,
    pub memory_ceiling_bytes: u64,
    pub timeout: Duration,
    pub last_poll: Option<Instant>,
    pub peak_rss_bytes: u64,
    unknown_polls: u32,
}

impl SupervisedProcess {
    pub fn new(pid: u32, memory_ceiling_bytes: u64, timeout: Duration) -> Self {
        Self {
            pid,
            started_at: Instant::now(),
            memory_ceiling_bytes,
            timeout,
            last_poll: None,
            peak_rss_bytes: 0,
            unknown_polls: 0,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.started_at + self.timeout
    }

    /// Check cancellation, wall time and tree RSS once. `Some` means the
    /// child has to be stopped for the returned reason.
    pub fn poll(
        &mut self,
        probe: &dyn MemoryProbe,
        cancel: &CancelToken,
        deny_on_unknown_memory: bool,
    ) -> Option<ProcessOutcome> {
        let now = Instant::now();
        self.last_poll = Some(now);

        if cancel.is_cancelled() {
            return Some(ProcessOutcome::Cancelled);
        }
        if now >= self.deadline() {
            return Some(ProcessOutcome::Timeout {
                limit: self.timeout,
            });
        }

        match probe.process_tree_rss(self.pid) {
            Ok(rss) => {
                self.unknown_polls = 0;
                self.peak_rss_bytes = self.peak_rss_bytes.max(rss);
                if rss > self.memory_ceiling_bytes {
                    return Some(ProcessOutcome::MemoryExceeded {
                        rss_bytes: rss,
                        ceiling_bytes: self.memory_ceiling_bytes,
                    });
                }
                None
            }
            Err(e) => {
                self.unknown_polls += 1;
                debug!(
                    "Memory of pid {} unreadable ({}): {}",
                    self.pid, self.unknown_polls, e
                );
                if deny_on_unknown_memory && self.unknown_polls >= MAX_UNKNOWN_POLLS {
                    Some(ProcessOutcome::MemoryUnknown)
                } else {
                    None
                }
            }
        }
    }
}

/// Spawns external tools and polices them for memory, wall time and
/// cancellation. The only component that signals a supervised child.
pub struct ProcessSupervisor {
    probe: Arc<dyn MemoryProbe>,
    settings: SupervisorSettings,
}

impl ProcessSupervisor {
    pub fn new(probe: Arc<dyn MemoryProbe>, settings: SupervisorSettings) -> Self {
        Self { probe, settings }
    }

    pub fn from_config(config: &GovernorConfig, probe: Arc<dyn MemoryProbe>) -> Self {
        Self::new(probe, SupervisorSettings::from_config(config))
    }

    pub fn run(
        &self,
        spec: &CommandSpec,
        memory_ceiling_bytes: u64,
        timeout: Duration,
    ) -> Result<ProcessResult> {
        self.run_with_cancel(spec, memory_ceiling_bytes, timeout, &CancelToken::new())
    }

    /// Run `spec` to completion or termination. Only a failure to start the
    /// process at all is an `Err`; every other ending is a `ProcessResult`.
    pub fn run_with_cancel(
        &self,
        spec: &CommandSpec,
        memory_ceiling_bytes: u64,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<ProcessResult> {
        let program = spec.program().to_string_lossy().into_owned();

        let mut command = Command::new(spec.program());
        command
            .args(spec.args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .env_clear()
            .process_group(0);
        for key in &self.settings.env_passthrough {
            if let Some(value) = std::env::var_os(key) {
                command.env(key, value);
            }
        }

        // Kernel backstop behind the polled ceiling
        if let Some(limit) = self.settings.address_space_bytes {
            unsafe {
                command.pre_exec(move || {
                    setrlimit(Resource::RLIMIT_AS, limit, limit)
                        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
                });
            }
        }

        let mut child = command.spawn().map_err(|e| {
            error!("Failed to spawn {}: {}", spec, e);
            JobError::SpawnFailed {
                program: program.clone(),
                reason: e.to_string(),
            }
        })?;
        let mut process = SupervisedProcess::new(child.id(), memory_ceiling_bytes, timeout);
        let pid = process.pid;
        info!(
            "Supervising pid {} ({}) ceiling={} bytes timeout={:?} rlimit_as={:?}",
            pid, program, memory_ceiling_bytes, timeout, self.settings.address_space_bytes
        );

        let stderr = child
            .stderr
            .take()
            .map(|stream| TailCollector::spawn(stream, self.settings.stderr_excerpt_bytes));

        let mut verdict: Option<ProcessOutcome> = None;
        let mut kill_report: Option<KillReport> = None;

        let status: Option<ExitStatus> = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("try_wait on pid {} failed: {}", pid, e);
                    kill_report = Some(signal::terminate_process_group(
                        &mut child,
                        self.settings.kill_grace,
                    ));
                    break None;
                }
            }

            let reason = process.poll(
                self.probe.as_ref(),
                cancel,
                self.settings.deny_on_unknown_memory,
            );
            if let Some(reason) = reason {
                warn!("Terminating pid {} ({}): {:?}", pid, program, reason);
                kill_report = Some(signal::terminate_process_group(
                    &mut child,
                    self.settings.kill_grace,
                ));
                verdict = Some(reason);
                break None;
            }

            std::thread::sleep(self.settings.poll_interval);
        };

        // Reap; terminate_process_group already waited, so this returns the cached status
        let status = match status {
            Some(status) => {
                signal::kill_leftovers(pid);
                Some(status)
            }
            None => child.wait().ok(),
        };

        // A descendant that left the group can still hold the pipe open
        let stderr_excerpt = match stderr {
            Some(collector) => {
                let (tail, closed) = collector.finish(self.settings.kill_grace);
                if !closed {
                    warn!(
                        "stderr of pid {} still open after {:?}, keeping partial excerpt",
                        pid, self.settings.kill_grace
                    );
                }
                tail.excerpt()
            }
            None => String::new(),
        };

        let outcome = match verdict {
            Some(outcome) => outcome,
            None => exit_outcome(status),
        };
        let wall_time = process.started_at.elapsed();
        info!(
            "pid {} finished: {:?} after {:?} (peak rss {} bytes)",
            pid, outcome, wall_time, process.peak_rss_bytes
        );

        Ok(ProcessResult {
            pid,
            program,
            outcome,
            wall_time,
            peak_rss_bytes: process.peak_rss_bytes,
            stderr_excerpt,
            kill_report,
        })
    }
}

fn exit_outcome(status: Option<ExitStatus>) -> ProcessOutcome {
    match status {
        Some(status) => match (status.code(), status.signal()) {
            (Some(code), _) => ProcessOutcome::Exited { code },
            (None, Some(sig)) => ProcessOutcome::Signaled { signal: sig },
            (None, None) => ProcessOutcome::Exited { code: -1 },
        },
        None => ProcessOutcome::Exited { code: -1 },
    }
}
