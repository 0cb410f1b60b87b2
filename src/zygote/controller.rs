use crate::config::types::{Result, ZygoteError};
use crate::ipc::channel::{Channel, ChannelLimits};
use crate::ipc::protocol::{ForkReply, ZygoteRequest};
use crate::kernel::process::{reap_blocking, CrashStatus};
use crate::zygote::descriptors::DescriptorMapping;
use log::{debug, info, warn};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::os::fd::BorrowedFd;

/// Liveness of a worker as far as the controller knows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    ReapRequested,
    Reaped,
}

/// Controller-side record of one spawned worker
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub pid: Pid,
    pub args: Vec<String>,
    pub state: WorkerState,
}

/// Where the control channel stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Connected,
    AwaitingForkReply,
    AwaitingCrashReply,
    /// The exchange broke or the zygote left; nothing more is sent
    Disconnected,
}

/// Trusted-side endpoint of the zygote control channel.
///
/// Every request takes `&mut self`, so at most one request is in flight and
/// replies are matched to requests by order alone.
#[derive(Debug)]
pub struct ZygoteController {
    channel: Channel,
    limits: ChannelLimits,
    state: ControlState,
    workers: HashMap<Pid, WorkerHandle>,
    zygote: Option<Pid>,
}

impl ZygoteController {
    pub fn new(channel: Channel, limits: ChannelLimits) -> Self {
        Self {
            channel,
            limits,
            state: ControlState::Connected,
            workers: HashMap::new(),
            zygote: None,
        }
    }

    /// Record the zygote as our child so [`shutdown`](Self::shutdown) can wait for it
    pub fn attached_to(mut self, zygote: Pid) -> Self {
        self.zygote = Some(zygote);
        self
    }

    pub fn zygote_pid(&self) -> Option<Pid> {
        self.zygote
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state != ControlState::Disconnected
    }

    pub fn worker(&self, pid: Pid) -> Option<&WorkerHandle> {
        self.workers.get(&pid)
    }

    pub fn workers(&self) -> impl Iterator<Item = &WorkerHandle> {
        self.workers.values()
    }

    /// Ask the zygote for a new worker running with `args` and `mapping`
    pub fn fork(&mut self, args: &[String], mapping: DescriptorMapping<'_>) -> Result<Pid> {
        self.ensure_connected()?;

        let request = ZygoteRequest::Fork {
            argv: args.to_vec(),
            keys: mapping.keys(),
        };

        let payload = request.encode();
        let descriptors = mapping.descriptors();
        if let Err(e) = self.limits.check_outgoing(&payload, descriptors.len()) {
            warn!("Refusing to send fork request with {} args: {}", args.len(), e);
            return Err(ZygoteError::SpawnFailed(e.to_string()));
        }

        self.state = ControlState::AwaitingForkReply;
        let reply = self.exchange(&payload, &descriptors)?;
        let reply = ForkReply::decode(&reply).map_err(|e| self.fail(e))?;
        self.state = ControlState::Connected;

        match reply {
            ForkReply::Spawned(pid) => {
                let pid = Pid::from_raw(pid);
                info!("Zygote spawned worker {} ({:?})", pid, args);
                self.workers.insert(
                    pid,
                    WorkerHandle {
                        pid,
                        args: args.to_vec(),
                        state: WorkerState::Running,
                    },
                );
                Ok(pid)
            }
            ForkReply::Failed(reason) => {
                warn!("Zygote could not spawn {:?}: {}", args, reason);
                Err(ZygoteError::SpawnFailed(reason))
            }
        }
    }

    /// Ask the zygote to wait for `pid`. No acknowledgement is awaited.
    ///
    /// A worker already collected, or already asked for, is not sent again:
    /// its pid may belong to an unrelated child by now.
    pub fn reap(&mut self, pid: Pid) -> Result<()> {
        self.ensure_connected()?;

        if let Some(handle) = self.workers.get(&pid) {
            if handle.state != WorkerState::Running {
                debug!("Worker {} is already {:?}", pid, handle.state);
                return Ok(());
            }
        }

        let request = ZygoteRequest::Reap { pid: pid.as_raw() };
        if let Err(e) = self.channel.send(&request.encode(), &[]) {
            return Err(self.fail(e));
        }

        if let Some(handle) = self.workers.get_mut(&pid) {
            handle.state = WorkerState::ReapRequested;
        }
        debug!("Reap requested for {}", pid);
        Ok(())
    }

    /// Query whether `pid` crashed or exited.
    ///
    /// An error means liveness is unknown, not "still running".
    pub fn did_process_crash(&mut self, pid: Pid) -> Result<CrashStatus> {
        self.ensure_connected()?;

        let request = ZygoteRequest::DidProcessCrash { pid: pid.as_raw() };
        self.state = ControlState::AwaitingCrashReply;
        let reply = self.exchange(&request.encode(), &[])?;
        let status = CrashStatus::decode(&reply).map_err(|e| self.fail(e))?;
        self.state = ControlState::Connected;

        if status.exited {
            if let Some(handle) = self.workers.get_mut(&pid) {
                handle.state = WorkerState::Reaped;
            }
        }

        Ok(status)
    }

    /// Drop the records of workers known to have been collected
    pub fn prune_reaped(&mut self) -> usize {
        let before = self.workers.len();
        self.workers.retain(|_, handle| handle.state != WorkerState::Reaped);
        before - self.workers.len()
    }

    /// Close the control channel and wait for the zygote to notice and exit
    pub fn shutdown(mut self) -> Result<()> {
        self.channel.close();
        self.state = ControlState::Disconnected;
        info!("Control channel closed");

        if let Some(zygote) = self.zygote.take() {
            let status = reap_blocking(zygote)?;
            debug!("Zygote {} finished: {:?}", zygote, status);
        }
        Ok(())
    }

    fn ensure_connected(&self) -> Result<()> {
        match self.state {
            ControlState::Disconnected => Err(ZygoteError::Eof),
            _ => Ok(()),
        }
    }

    fn exchange(&mut self, payload: &[u8], descriptors: &[BorrowedFd<'_>]) -> Result<Vec<u8>> {
        // Nothing was sent, so the channel is still in step.
        if let Err(e) = self.limits.check_outgoing(payload, descriptors.len()) {
            self.state = ControlState::Connected;
            return Err(ZygoteError::Protocol(e.to_string()));
        }

        if let Err(e) = self.channel.send(payload, descriptors) {
            return Err(self.fail(e));
        }

        match self.channel.receive(self.limits.max_payload, 0) {
            Ok(reply) => Ok(reply.payload),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Give up on the channel and classify the failure
    fn fail(&mut self, error: ZygoteError) -> ZygoteError {
        self.state = ControlState::Disconnected;
        match error {
            ZygoteError::Truncated(what) | ZygoteError::MalformedMessage(what) => {
                warn!("Unexpected reply from zygote: {}", what);
                ZygoteError::Protocol(what)
            }
            other => {
                warn!("Control channel failed: {}", other);
                other
            }
        }
    }
}
