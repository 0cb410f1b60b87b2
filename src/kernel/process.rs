//! Process lifecycle primitives: fork, blocking reap, non-blocking crash query.

use crate::config::types::Result;
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

/// Termination status of a child as reported to the controller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrashStatus {
    /// The child terminated abnormally
    pub crashed: bool,
    /// The child is no longer running (and has been waited for)
    pub exited: bool,
}

/// Duplicate the calling process.
///
/// The child must restrict itself to work that is safe after fork in a
/// process that may have had other threads.
pub fn fork_process() -> Result<ForkResult> {
    // SAFETY: callers branch on the result immediately; the child only runs
    // single-threaded setup before returning control to its embedder.
    let result = unsafe { fork() }?;
    Ok(result)
}

/// Block until `pid` terminates and collect it
pub fn reap_blocking(pid: Pid) -> Result<WaitStatus> {
    loop {
        match waitpid(pid, None) {
            Ok(status @ WaitStatus::Exited(_, _)) | Ok(status @ WaitStatus::Signaled(_, _, _)) => {
                return Ok(status)
            }
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Query whether `pid` has terminated, without blocking.
///
/// A terminated child is collected by this call. Wait failures (for example
/// a pid that is not our child) are logged and reported as "still running",
/// since nothing better is known about it.
pub fn termination_status(pid: Pid) -> CrashStatus {
    let status = loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Err(Errno::EINTR) => continue,
            other => break other,
        }
    };

    match status {
        Ok(WaitStatus::Exited(_, code)) => CrashStatus {
            crashed: code != 0,
            exited: true,
        },
        Ok(WaitStatus::Signaled(_, signal, _)) => CrashStatus {
            crashed: is_crash_signal(signal),
            exited: true,
        },
        Ok(_) => CrashStatus::default(),
        Err(e) => {
            log::warn!("waitpid({}) failed: {}", pid, e);
            CrashStatus::default()
        }
    }
}

/// Exit code a shell would report for this wait status
pub fn exit_code(status: &WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(*code),
        WaitStatus::Signaled(_, signal, _) => Some(128 + *signal as i32),
        _ => None,
    }
}

fn is_crash_signal(signal: Signal) -> bool {
    matches!(
        signal,
        Signal::SIGSEGV | Signal::SIGILL | Signal::SIGABRT | Signal::SIGFPE | Signal::SIGBUS
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_exiting(code: i32) -> Pid {
        match fork_process().unwrap() {
            ForkResult::Child => unsafe { libc::_exit(code) },
            ForkResult::Parent { child } => child,
        }
    }

    #[test]
    fn test_clean_exit_is_not_a_crash() {
        let child = spawn_exiting(0);
        let status = reap_blocking(child).unwrap();
        assert_eq!(exit_code(&status), Some(0));
    }

    #[test]
    fn test_nonzero_exit_counts_as_crash() {
        let child = spawn_exiting(3);
        let status = loop {
            let status = termination_status(child);
            if status.exited {
                break status;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        };
        assert!(status.crashed);
    }

    #[test]
    fn test_unknown_pid_reports_not_exited() {
        let status = termination_status(Pid::from_raw(i32::MAX));
        assert_eq!(status, CrashStatus::default());
    }

    #[test]
    fn test_crash_signals() {
        assert!(is_crash_signal(Signal::SIGSEGV));
        assert!(is_crash_signal(Signal::SIGABRT));
        assert!(!is_crash_signal(Signal::SIGTERM));
        assert!(!is_crash_signal(Signal::SIGKILL));
    }
}
