use crate::config::types::{Result, ZygoteError};
use crate::ipc::channel::{Channel, ChannelLimits, Message};
use crate::ipc::protocol::{ForkReply, ZygoteRequest};
use crate::kernel::fd::close_fds_except;
use crate::kernel::process::{fork_process, reap_blocking, termination_status};
use crate::zygote::descriptors::WorkerDescriptors;
use crate::zygote::startup::WorkerStartup;
use log::{debug, error, info, warn};
use nix::unistd::{getpid, ForkResult, Pid};
use std::os::fd::{OwnedFd, RawFd};

/// Back-to-back transport failures tolerated before the zygote gives up
const MAX_CONSECUTIVE_IO_FAILURES: u32 = 3;

/// Result of cloning the zygote
#[derive(Debug)]
pub enum SpawnOutcome {
    /// Still the zygote; the new worker has this pid
    Parent(Pid),
    /// Now the worker; continue into worker start-up
    Child(WorkerStartup),
}

/// Why [`ZygoteServer::run`] returned
#[derive(Debug)]
pub enum ZygoteExit {
    /// This process is a freshly forked worker
    Worker(WorkerStartup),
    /// The controller closed the control channel
    ControllerGone,
}

/// Request loop of the zygote process
#[derive(Debug)]
pub struct ZygoteServer {
    channel: Channel,
    limits: ChannelLimits,
    preserved: Vec<RawFd>,
}

impl ZygoteServer {
    pub fn new(channel: Channel, limits: ChannelLimits) -> Self {
        Self {
            channel,
            limits,
            preserved: Vec::new(),
        }
    }

    /// Keep `fd` open in every worker (besides stdio and mapped descriptors)
    pub fn preserve_descriptor(&mut self, fd: RawFd) {
        if !self.preserved.contains(&fd) {
            self.preserved.push(fd);
        }
    }

    /// Serve requests until the controller leaves or this process becomes a worker
    pub fn run(mut self) -> Result<ZygoteExit> {
        info!("Zygote {} serving control channel", getpid());
        let mut io_failures = 0;

        loop {
            let message = match self
                .channel
                .receive(self.limits.max_payload, self.limits.max_descriptors)
            {
                Ok(message) => message,
                Err(ZygoteError::Eof) => {
                    info!("Controller closed the control channel; zygote exiting");
                    return Ok(ZygoteExit::ControllerGone);
                }
                Err(e @ ZygoteError::Truncated(_)) => {
                    warn!("Dropping request: {}", e);
                    continue;
                }
                Err(e) => {
                    io_failures += 1;
                    if io_failures >= MAX_CONSECUTIVE_IO_FAILURES {
                        error!("Failed to read from control channel: {}", e);
                        return Err(e);
                    }
                    warn!("Failed to read from control channel: {}", e);
                    continue;
                }
            };
            io_failures = 0;

            if let Some(startup) = self.handle_message(message) {
                return Ok(ZygoteExit::Worker(startup));
            }
        }
    }

    /// Entry point for an embedding program: returns only in a new worker.
    ///
    /// Exits the process with 0 when the controller goes away and 1 on a
    /// fatal channel error.
    pub fn run_until_worker(self) -> WorkerStartup {
        match self.run() {
            Ok(ZygoteExit::Worker(startup)) => startup,
            Ok(ZygoteExit::ControllerGone) => std::process::exit(0),
            Err(e) => {
                error!("Zygote stopped: {}", e);
                std::process::exit(1);
            }
        }
    }

    /// Clone this process into a worker.
    ///
    /// In the child the control channel is closed, `keys[i]` is bound to
    /// `descriptors[i]` and every other inherited descriptor except stdio and
    /// preserved ones is closed.
    pub fn spawn(
        &mut self,
        argv: Vec<String>,
        keys: Vec<u32>,
        descriptors: Vec<OwnedFd>,
    ) -> Result<SpawnOutcome> {
        if keys.len() != descriptors.len() {
            return Err(ZygoteError::malformed(format!(
                "{} keys for {} descriptors",
                keys.len(),
                descriptors.len()
            )));
        }

        match fork_process()? {
            ForkResult::Child => {
                self.channel.close();

                let descriptors = WorkerDescriptors::from_parts(keys, descriptors);
                let mut keep = descriptors.raw_fds();
                keep.extend_from_slice(&self.preserved);

                // A worker holding stray zygote descriptors must not start.
                if let Err(e) = close_fds_except(&keep) {
                    error!("Worker {} failed to close inherited descriptors: {}", getpid(), e);
                    std::process::exit(1);
                }

                Ok(SpawnOutcome::Child(WorkerStartup::new(argv, descriptors)))
            }
            ForkResult::Parent { child } => {
                drop(descriptors);
                info!("Spawned worker {} with args {:?}", child, argv);
                Ok(SpawnOutcome::Parent(child))
            }
        }
    }

    fn handle_message(&mut self, message: Message) -> Option<WorkerStartup> {
        let Message {
            payload,
            descriptors,
        } = message;

        let request = match ZygoteRequest::decode(&payload, descriptors.len()) {
            Ok(request) => request,
            Err(e) => {
                warn!(
                    "Dropping malformed request (closing {} descriptors): {}",
                    descriptors.len(),
                    e
                );
                return None;
            }
        };

        debug!("Zygote request {:?}", request.command());

        match request {
            ZygoteRequest::Fork { argv, keys } => self.handle_fork(argv, keys, descriptors),
            ZygoteRequest::Reap { pid } => {
                self.handle_reap(Pid::from_raw(pid));
                None
            }
            ZygoteRequest::DidProcessCrash { pid } => {
                self.handle_crash_check(Pid::from_raw(pid));
                None
            }
        }
    }

    fn handle_fork(
        &mut self,
        argv: Vec<String>,
        keys: Vec<u32>,
        descriptors: Vec<OwnedFd>,
    ) -> Option<WorkerStartup> {
        let reply = match self.spawn(argv, keys, descriptors) {
            Ok(SpawnOutcome::Child(startup)) => return Some(startup),
            Ok(SpawnOutcome::Parent(child)) => ForkReply::Spawned(child.as_raw()),
            Err(e) => {
                error!("Fork request failed: {}", e);
                ForkReply::Failed(e.to_string())
            }
        };

        self.reply("fork", &reply.encode());
        None
    }

    fn handle_reap(&self, pid: Pid) {
        match reap_blocking(pid) {
            Ok(status) => debug!("Reaped {}: {:?}", pid, status),
            Err(e) => warn!("Failed to reap {}: {}", pid, e),
        }
    }

    fn handle_crash_check(&self, pid: Pid) {
        let status = termination_status(pid);
        debug!("Crash check {}: {:?}", pid, status);
        self.reply("crash check", &status.encode());
    }

    fn reply(&self, what: &str, payload: &[u8]) {
        if let Err(e) = self.channel.send(payload, &[]) {
            warn!("Failed to send {} reply: {}", what, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::process::{exit_code, CrashStatus};
    use crate::zygote::descriptors::SANDBOX_IPC_CHANNEL;

    fn server_pair() -> (ZygoteServer, Channel) {
        let (server_end, controller_end) = Channel::pair().unwrap();
        (
            ZygoteServer::new(server_end, ChannelLimits::default()),
            controller_end,
        )
    }

    #[test]
    fn test_eof_ends_the_loop() {
        let (server, controller) = server_pair();
        drop(controller);
        assert!(matches!(server.run(), Ok(ZygoteExit::ControllerGone)));
    }

    #[test]
    fn test_malformed_request_is_dropped() {
        let (mut server, controller) = server_pair();
        let message = Message {
            payload: vec![1, 2, 3],
            descriptors: Vec::new(),
        };
        assert!(server.handle_message(message).is_none());

        // The loop keeps serving afterwards.
        let check = ZygoteRequest::DidProcessCrash { pid: i32::MAX };
        controller.send(&check.encode(), &[]).unwrap();
        let request = server.channel.receive(1024, 0).unwrap();
        assert!(server.handle_message(request).is_none());

        let reply = controller.receive(1024, 0).unwrap();
        assert_eq!(CrashStatus::decode(&reply.payload).unwrap(), CrashStatus::default());
    }

    #[test]
    fn test_fork_replies_with_child_pid() {
        let (mut server, controller) = server_pair();
        let (keep, mapped) = Channel::pair().unwrap();

        let request = ZygoteRequest::Fork {
            argv: vec!["--type=worker".to_string()],
            keys: vec![SANDBOX_IPC_CHANNEL],
        };
        controller
            .send(&request.encode(), &[mapped.as_fd().unwrap()])
            .unwrap();
        drop(mapped);

        let message = server.channel.receive(1024, 16).unwrap();
        match server.handle_message(message) {
            Some(startup) => {
                // Worker side: report what it was given through the mapped channel.
                let ok = startup.process_type() == Some("worker")
                    && startup.descriptors().get(SANDBOX_IPC_CHANNEL).is_some();
                if let Some(fd) = startup.descriptors().get(SANDBOX_IPC_CHANNEL) {
                    let channel = Channel::from_owned_fd(fd.try_clone_to_owned().unwrap());
                    let _ = channel.send(if ok { b"ok" } else { b"no" }, &[]);
                }
                unsafe { libc::_exit(if ok { 0 } else { 1 }) }
            }
            None => {
                let reply = controller.receive(1024, 0).unwrap();
                let pid = match ForkReply::decode(&reply.payload).unwrap() {
                    ForkReply::Spawned(pid) => Pid::from_raw(pid),
                    other => panic!("unexpected reply {other:?}"),
                };

                assert_eq!(keep.receive(16, 0).unwrap().payload, b"ok");
                let status = reap_blocking(pid).unwrap();
                assert_eq!(exit_code(&status), Some(0));
            }
        }
    }

    #[test]
    fn test_spawn_rejects_key_count_mismatch() {
        let (mut server, _controller) = server_pair();
        let err = server.spawn(vec![], vec![1], Vec::new()).unwrap_err();
        assert!(matches!(err, ZygoteError::MalformedMessage(_)));
    }
}
