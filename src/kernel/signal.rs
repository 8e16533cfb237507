use log::info;
use nix::errno::Errno;
use nix::sys::signal::{self, killpg, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;
/// Signal plumbing for boltbox
///
/// Two concerns live here: async-safe shutdown flags for the long-running
/// `serve` loop, and process-group termination for sandboxed commands.
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Global shutdown flag (async-safe atomic)
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Global signal received (async-safe atomic)
static SIGNAL_RECEIVED: AtomicU32 = AtomicU32::new(0);

/// Signal handler state
pub struct SignalHandler;

impl SignalHandler {
    /// Install handlers for SIGINT, SIGTERM and SIGHUP.
    /// Call early in main() before worker threads are spawned.
    pub fn init() -> Result<Self, String> {
        // No SA_RESTART: a blocking stdin read must return EINTR so the serve
        // loop notices the shutdown request.
        let sig_action = SigAction::new(
            SigHandler::Handler(Self::signal_handler),
            SaFlags::empty(),
            SigSet::empty(),
        );

        unsafe {
            signal::sigaction(Signal::SIGINT, &sig_action)
                .map_err(|e| format!("Failed to install SIGINT handler: {}", e))?;
            signal::sigaction(Signal::SIGTERM, &sig_action)
                .map_err(|e| format!("Failed to install SIGTERM handler: {}", e))?;
            signal::sigaction(Signal::SIGHUP, &sig_action)
                .map_err(|e| format!("Failed to install SIGHUP handler: {}", e))?;
        }

        info!("Signal handlers installed (SIGINT, SIGTERM, SIGHUP)");
        Ok(Self)
    }

    /// Only atomic stores: no allocations, no locks, no I/O
    extern "C" fn signal_handler(signal: libc::c_int) {
        SIGNAL_RECEIVED.store(signal as u32, Ordering::SeqCst);
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
    }

    /// Signal that was received (0 if none)
    pub fn get_signal(&self) -> u32 {
        SIGNAL_RECEIVED.load(Ordering::SeqCst)
    }
}

/// What happened while tearing down a process group
#[derive(Debug, Default, Clone)]
pub struct KillReport {
    pub term_sent: bool,
    pub kill_sent: bool,
    /// The group was already gone before SIGKILL was needed
    pub exited_after_term: bool,
    pub waited_ms: u64,
    pub notes: Vec<String>,
}

/// True while any process in group `pgid` exists
pub fn group_alive(pgid: Pid) -> bool {
    match killpg(pgid, None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// SIGTERM the group, give it `grace` to go, then SIGKILL whatever is left.
/// A zero grace goes straight to SIGKILL.
pub fn terminate_group(pgid: Pid, grace: Duration) -> KillReport {
    let mut report = KillReport::default();
    let start = Instant::now();

    if !grace.is_zero() {
        match killpg(pgid, Signal::SIGTERM) {
            Ok(()) => report.term_sent = true,
            Err(Errno::ESRCH) => {
                report.exited_after_term = true;
                return report;
            }
            Err(e) => report.notes.push(format!("group SIGTERM failed: {}", e)),
        }

        let deadline = start + grace;
        while Instant::now() < deadline {
            if !group_alive(pgid) {
                report.exited_after_term = true;
                report.waited_ms = start.elapsed().as_millis() as u64;
                return report;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) => report.kill_sent = true,
        Err(Errno::ESRCH) => report.exited_after_term = report.term_sent,
        Err(e) => {
            // Fall back to the leader alone.
            let _ = signal::kill(pgid, Signal::SIGKILL);
            report.kill_sent = true;
            report
                .notes
                .push(format!("group SIGKILL fallback used: {}", e));
        }
    }

    report.waited_ms = start.elapsed().as_millis() as u64;
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;
    use std::process::Command;

    #[test]
    fn test_signal_handler_init() {
        assert!(SignalHandler::init().is_ok());
    }

    #[test]
    fn test_terminate_group_kills_sleepers() {
        use std::os::unix::process::ExitStatusExt;

        let mut child = unsafe {
            Command::new("sh")
                .args(["-c", "trap '' TERM; sleep 30 & sleep 30"])
                .pre_exec(|| {
                    nix::unistd::setsid().map_err(std::io::Error::from)?;
                    Ok(())
                })
                .spawn()
                .unwrap()
        };
        let pgid = Pid::from_raw(child.id() as i32);
        assert!(group_alive(pgid));

        let report = terminate_group(pgid, Duration::from_millis(100));
        assert!(report.term_sent);
        assert!(report.kill_sent);

        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(libc::SIGKILL));
    }
}
