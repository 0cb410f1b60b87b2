// Readiness wait over a small fixed set of descriptors

use crate::config::types::{Result, ZygoteError};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::time::Duration;

/// What the helper loop waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The parent's liveness pipe became readable or hung up
    Liveness,
    /// A worker request is waiting on the channel
    Request,
}

/// Waits until any registered descriptor is readable or hung up.
///
/// Each descriptor carries a caller-chosen tag that is handed back when it
/// becomes ready, in registration order.
#[derive(Debug)]
pub struct Multiplexer<'fd, E> {
    sources: Vec<(BorrowedFd<'fd>, E)>,
}

impl<'fd, E: Copy> Default for Multiplexer<'fd, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'fd, E: Copy> Multiplexer<'fd, E> {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
        }
    }

    pub fn register(&mut self, fd: BorrowedFd<'fd>, event: E) -> &mut Self {
        self.sources.push((fd, event));
        self
    }

    /// Block (or until `timeout`) for readiness.
    ///
    /// An interrupted wait is an `Io` error of kind `Interrupted`; a timeout
    /// is an empty list.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Vec<E>> {
        let mut pollfds: Vec<libc::pollfd> = self
            .sources
            .iter()
            .map(|(fd, _)| libc::pollfd {
                fd: fd.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();

        let timeout_ms = match timeout {
            Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
            None => -1,
        };

        // SAFETY: pollfds is a valid array of nfds initialized entries.
        let rc = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };

        if rc < 0 {
            return Err(ZygoteError::Io(std::io::Error::last_os_error()));
        }

        let ready = libc::POLLIN | libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;
        Ok(pollfds
            .iter()
            .zip(&self.sources)
            .filter(|(p, _)| p.revents & ready != 0)
            .map(|(_, (_, event))| *event)
            .collect())
    }
}

/// Whether a readiness-wait failure should be retried without counting it
pub fn is_interrupted(error: &ZygoteError) -> bool {
    matches!(error, ZygoteError::Io(e) if e.kind() == std::io::ErrorKind::Interrupted)
}

/// Counts consecutive failures against a limit
#[derive(Debug, Clone)]
pub struct FailureBudget {
    limit: u32,
    consecutive: u32,
}

impl FailureBudget {
    pub fn new(limit: u32) -> Self {
        Self {
            limit: limit.max(1),
            consecutive: 0,
        }
    }

    /// Record a failure; true once the limit is reached
    pub fn record_failure(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive >= self.limit
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::fd::pipe_pair;
    use std::os::fd::AsFd;

    #[test]
    fn test_timeout_reports_nothing() {
        let (r, _w) = pipe_pair().unwrap();
        let mut mux = Multiplexer::new();
        mux.register(r.as_fd(), Event::Request);
        assert!(mux.wait(Some(Duration::from_millis(10))).unwrap().is_empty());
    }

    #[test]
    fn test_hangup_and_data_are_ready() {
        let (live_r, live_w) = pipe_pair().unwrap();
        let (data_r, data_w) = pipe_pair().unwrap();
        nix::unistd::write(&data_w, b"x").unwrap();

        let mut mux = Multiplexer::new();
        mux.register(live_r.as_fd(), Event::Liveness)
            .register(data_r.as_fd(), Event::Request);
        assert_eq!(mux.wait(None).unwrap(), vec![Event::Request]);

        drop(live_w);
        assert_eq!(mux.wait(None).unwrap(), vec![Event::Liveness, Event::Request]);
    }

    #[test]
    fn test_failure_budget() {
        let mut budget = FailureBudget::new(3);
        assert!(!budget.record_failure());
        assert!(!budget.record_failure());
        budget.reset();
        assert!(!budget.record_failure());
        assert!(!budget.record_failure());
        assert!(budget.record_failure());
        assert_eq!(budget.consecutive(), 3);
    }

    #[test]
    fn test_interrupted_is_recognised() {
        let err = ZygoteError::Io(std::io::Error::from(std::io::ErrorKind::Interrupted));
        assert!(is_interrupted(&err));
        assert!(!is_interrupted(&ZygoteError::Eof));
    }
}
