use crate::config::types::KillReport;
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;
/// Process-group termination and async-safe shutdown signalling
use std::process::Child;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Global shutdown flag (async-safe atomic)
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Global signal received (async-safe atomic)
static SIGNAL_RECEIVED: AtomicU32 = AtomicU32::new(0);

const REAP_POLL: Duration = Duration::from_millis(10);

/// Terminate a child and its process group: SIGTERM, wait up to `grace`
/// for it to exit, then SIGKILL. The child is reaped before returning.
pub fn terminate_process_group(child: &mut Child, grace: Duration) -> KillReport {
    let pid = child.id();
    let group = Pid::from_raw(pid as i32);
    let mut report = KillReport::default();
    let started = Instant::now();

    if let Ok(Some(_)) = child.try_wait() {
        report.notes.push("child already exited before termination".to_string());
        kill_leftovers(pid);
        return report;
    }

    match signal::killpg(group, Signal::SIGTERM) {
        Ok(()) => report.term_sent = true,
        Err(e) => {
            report.notes.push(format!("killpg SIGTERM failed: {}", e));
            if signal::kill(group, Signal::SIGTERM).is_ok() {
                report.term_sent = true;
            }
        }
    }

    let deadline = started + grace;
    let mut exited = false;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(_)) => {
                exited = true;
                break;
            }
            Ok(None) => std::thread::sleep(REAP_POLL),
            Err(e) => {
                report.notes.push(format!("try_wait failed: {}", e));
                break;
            }
        }
    }

    if !exited {
        warn!("pid {} ignored SIGTERM for {:?}, sending SIGKILL", pid, grace);
        match signal::killpg(group, Signal::SIGKILL) {
            Ok(()) => report.kill_sent = true,
            Err(e) => {
                report.notes.push(format!("killpg SIGKILL failed: {}", e));
                if child.kill().is_ok() {
                    report.kill_sent = true;
                }
            }
        }
        if let Err(e) = child.wait() {
            report.notes.push(format!("wait after SIGKILL failed: {}", e));
        }
    } else {
        // Leader is gone; workers that ignored SIGTERM must not outlive it
        kill_leftovers(pid);
    }

    report.waited_ms = started.elapsed().as_millis() as u64;
    report
}

/// SIGKILL whatever is left in a process group whose leader already exited.
/// Returns true if anything was still there.
pub fn kill_leftovers(pgid: u32) -> bool {
    match signal::killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        Ok(()) => {
            debug!("killed leftover members of process group {}", pgid);
            true
        }
        Err(Errno::ESRCH) => false,
        Err(e) => {
            debug!("killpg({}) failed: {}", pgid, e);
            false
        }
    }
}

/// Shutdown flag set from SIGINT/SIGTERM handlers
pub struct ShutdownSignal;

impl ShutdownSignal {
    /// Install handlers. Call early in main() before spawning threads.
    pub fn install() -> Result<Self, String> {
        let action = SigAction::new(
            SigHandler::Handler(Self::signal_handler),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        // SAFETY: the handler only stores into atomics, which is async-signal-safe
        unsafe {
            signal::sigaction(Signal::SIGINT, &action)
                .map_err(|e| format!("Failed to install SIGINT handler: {}", e))?;
            signal::sigaction(Signal::SIGTERM, &action)
                .map_err(|e| format!("Failed to install SIGTERM handler: {}", e))?;
        }

        info!("Signal handlers installed (SIGINT, SIGTERM)");
        Ok(Self)
    }

    /// Only atomic stores: no allocation, locks, or I/O
    extern "C" fn signal_handler(signal: nix::libc::c_int) {
        SIGNAL_RECEIVED.store(signal as u32, Ordering::SeqCst);
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
    }

    /// Signal that was received (0 if none)
    pub fn received(&self) -> u32 {
        SIGNAL_RECEIVED.load(Ordering::SeqCst)
    }
}
