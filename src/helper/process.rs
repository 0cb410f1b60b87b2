use crate::config::settings::ZygoteSettings;
use crate::config::types::{Result, ZygoteError};
use crate::helper::fonts::FontCatalog;
use crate::helper::multiplexer::{is_interrupted, Event, FailureBudget, Multiplexer};
use crate::ipc::channel::{Channel, ChannelLimits, Message};
use crate::ipc::protocol::{SandboxReply, SandboxRequest};
use crate::kernel::fd::{close_fds_except, pipe_pair};
use crate::kernel::process::{fork_process, reap_blocking};
use log::{debug, error, info, warn};
use nix::sys::wait::WaitStatus;
use nix::unistd::{getpid, ForkResult, Pid};
use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

/// Why the helper loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperExit {
    /// The liveness pipe hung up
    ParentGone,
    /// The worker closed its channel
    WorkerGone,
    /// Readiness waits kept failing
    MultiplexerFailed,
}

impl HelperExit {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::ParentGone | Self::WorkerGone => 0,
            Self::MultiplexerFailed => 1,
        }
    }
}

/// One request/response cycle on the helper side.
///
/// Holds the decoded request and, once dispatched, the reply together with
/// the file whose descriptor travels with it. Dropped after the reply is sent.
#[derive(Debug)]
pub struct PendingRequest {
    pub request: SandboxRequest,
    pub reply: Option<SandboxReply>,
    pub attachment: Option<File>,
}

impl PendingRequest {
    pub fn new(request: SandboxRequest) -> Self {
        Self {
            request,
            reply: None,
            attachment: None,
        }
    }

    /// Descriptors to attach to the reply
    pub fn reply_descriptors(&self) -> Vec<BorrowedFd<'_>> {
        self.attachment.iter().map(|f| f.as_fd()).collect()
    }
}

/// Serves one worker's requests until the parent or the worker goes away
pub struct HelperLoop<C> {
    liveness: OwnedFd,
    channel: Channel,
    catalog: C,
    limits: ChannelLimits,
    max_poll_failures: u32,
}

impl<C: FontCatalog> HelperLoop<C> {
    pub fn new(liveness: OwnedFd, channel: Channel, catalog: C, settings: &ZygoteSettings) -> Self {
        Self {
            liveness,
            channel,
            catalog,
            limits: settings.channel_limits(),
            max_poll_failures: settings.helper_max_poll_failures,
        }
    }

    pub fn run(&self) -> HelperExit {
        let request_fd = match self.channel.as_fd() {
            Ok(fd) => fd,
            Err(_) => return HelperExit::WorkerGone,
        };

        let mut mux = Multiplexer::new();
        mux.register(self.liveness.as_fd(), Event::Liveness)
            .register(request_fd, Event::Request);
        self.run_with(|| mux.wait(None))
    }

    /// Serve requests using `wait` as the readiness source.
    ///
    /// Failed waits and failed receives share one budget of consecutive
    /// failures; an interrupted wait is retried without counting.
    pub fn run_with(&self, mut wait: impl FnMut() -> Result<Vec<Event>>) -> HelperExit {
        let mut failures = FailureBudget::new(self.max_poll_failures);

        loop {
            let ready = match wait() {
                Ok(ready) => ready,
                Err(e) if is_interrupted(&e) => continue,
                Err(e) => {
                    if failures.record_failure() {
                        error!(
                            "Readiness wait failed {} times in a row: {}",
                            failures.consecutive(),
                            e
                        );
                        return HelperExit::MultiplexerFailed;
                    }
                    warn!("Readiness wait failed: {}", e);
                    continue;
                }
            };

            // Liveness first: a helper must not outlive its parent.
            if ready.contains(&Event::Liveness) {
                info!("Parent went away; helper {} exiting", getpid());
                return HelperExit::ParentGone;
            }

            if !ready.contains(&Event::Request) {
                failures.reset();
                continue;
            }

            match self.serve_one() {
                Ok(Some(exit)) => return exit,
                Ok(None) => failures.reset(),
                Err(e) => {
                    if failures.record_failure() {
                        error!(
                            "Request channel failed {} times in a row: {}",
                            failures.consecutive(),
                            e
                        );
                        return HelperExit::MultiplexerFailed;
                    }
                    warn!("Request channel failed: {}", e);
                }
            }
        }
    }

    /// Receive and answer one request.
    ///
    /// `Err` only for transport failures; dropped requests are `Ok(None)`.
    fn serve_one(&self) -> Result<Option<HelperExit>> {
        let mut pending = match self.receive() {
            Ok(Some(pending)) => pending,
            Ok(None) => return Ok(None),
            Err(ZygoteError::Eof) => {
                info!("Worker closed its channel; helper {} exiting", getpid());
                return Ok(Some(HelperExit::WorkerGone));
            }
            Err(ZygoteError::Truncated(what)) => {
                warn!("Dropping oversized sandbox request: {}", what);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        self.dispatch(&mut pending);
        if let Some(reply) = &pending.reply {
            if let Err(e) = self.channel.send(&reply.encode(), &pending.reply_descriptors()) {
                warn!("Failed to answer sandbox request: {}", e);
            }
        }
        Ok(None)
    }

    /// Read and decode one request; `Ok(None)` when it was dropped
    fn receive(&self) -> Result<Option<PendingRequest>> {
        let Message {
            payload,
            descriptors,
        } = self
            .channel
            .receive(self.limits.max_payload, self.limits.max_descriptors)?;

        match SandboxRequest::decode(&payload, descriptors.len()) {
            Ok(request) => Ok(Some(PendingRequest::new(request))),
            Err(e) => {
                warn!(
                    "Dropping malformed sandbox request (closing {} descriptors): {}",
                    descriptors.len(),
                    e
                );
                Ok(None)
            }
        }
    }

    /// Fill in the reply; a found file travels as the reply's descriptor
    pub fn dispatch(&self, pending: &mut PendingRequest) {
        debug!("Sandbox request {:?}", pending.request.method());

        let (reply, attachment) = match &pending.request {
            SandboxRequest::FontMatch(query) => {
                (SandboxReply::FontMatch(self.catalog.match_family(query)), None)
            }
            SandboxRequest::FontOpen { fileid } => match self.catalog.open(*fileid) {
                Some(file) => (SandboxReply::FontOpen { found: true }, Some(file)),
                None => (SandboxReply::FontOpen { found: false }, None),
            },
            SandboxRequest::FamilyForChars { chars } => (
                SandboxReply::FamilyForChars(self.catalog.family_for_chars(chars)),
                None,
            ),
        };
        pending.reply = Some(reply);
        pending.attachment = attachment;
    }
}

/// Controller handle on a forked sandbox helper
#[derive(Debug)]
pub struct HelperProcess {
    pid: Pid,
    liveness: Option<OwnedFd>,
    worker_channel: Option<Channel>,
}

impl HelperProcess {
    /// Fork a helper serving `catalog`.
    ///
    /// The helper keeps only stdio, its liveness read end and its channel
    /// end; it exits when either the caller or the worker goes away.
    pub fn spawn<C: FontCatalog>(settings: &ZygoteSettings, catalog: C) -> Result<Self> {
        let (liveness_read, liveness_write) = pipe_pair()?;
        let (helper_end, worker_end) = Channel::pair()?;
        let helper_fd = helper_end.as_fd()?.as_raw_fd();

        match fork_process()? {
            ForkResult::Child => {
                drop(liveness_write);
                drop(worker_end);

                if let Err(e) = close_fds_except(&[liveness_read.as_raw_fd(), helper_fd]) {
                    error!("Helper {} failed to close inherited descriptors: {}", getpid(), e);
                    std::process::exit(1);
                }

                let exit = HelperLoop::new(liveness_read, helper_end, catalog, settings).run();
                debug!("Helper {} finished: {:?}", getpid(), exit);
                std::process::exit(exit.exit_code());
            }
            ForkResult::Parent { child } => {
                drop(liveness_read);
                drop(helper_end);
                info!("Sandbox helper started as {}", child);

                Ok(Self {
                    pid: child,
                    liveness: Some(liveness_write),
                    worker_channel: Some(worker_end),
                })
            }
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The channel end destined for the worker; handed out once
    pub fn take_worker_channel(&mut self) -> Option<Channel> {
        self.worker_channel.take()
    }

    /// Hang up the liveness pipe and wait for the helper to exit
    pub fn shutdown(mut self) -> Result<WaitStatus> {
        self.liveness.take();
        self.worker_channel.take();
        let status = reap_blocking(self.pid)?;
        debug!("Helper {} reaped: {:?}", self.pid, status);
        Ok(status)
    }
}
