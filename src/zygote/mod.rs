//! Fork server
//!
//! The zygote is forked early from the trusted process and then clones itself
//! on request, so each worker starts from a small, already-initialized image
//! without re-executing the binary.
//!
//! ```text
//!  controller ──Fork/Reap/DidProcessCrash──▶ zygote ──fork──▶ worker
//!             ◀──────────── replies ────────
//! ```

pub mod controller;
pub mod descriptors;
pub mod server;
pub mod startup;

pub use controller::{ControlState, WorkerHandle, WorkerState, ZygoteController};
pub use descriptors::{
    DescriptorMapping, WorkerDescriptors, PRIMARY_IPC_CHANNEL, SANDBOX_HANDSHAKE,
    SANDBOX_IPC_CHANNEL,
};
pub use server::{SpawnOutcome, ZygoteExit, ZygoteServer};
pub use startup::WorkerStartup;

use crate::config::settings::ZygoteSettings;
use crate::config::types::Result;
use crate::ipc::channel::Channel;
use crate::kernel::fd::close_fds_except;
use crate::kernel::process::fork_process;
use log::{error, info};
use nix::unistd::ForkResult;
use std::os::fd::{AsRawFd, RawFd};

/// Which side of [`launch`] this process ended up on
#[derive(Debug)]
pub enum Launch {
    Controller(ZygoteController),
    Zygote(ZygoteServer),
}

/// Fork the zygote off the current process.
///
/// Each side keeps only its own end of the control channel. The zygote also
/// closes every other inherited descriptor except stdio and the handshake
/// descriptor named by `handshake_env_var`, which its workers keep too.
pub fn launch(settings: &ZygoteSettings) -> Result<Launch> {
    settings.validate()?;
    let limits = settings.channel_limits();
    let (controller_end, zygote_end) = Channel::pair()?;
    let zygote_fd = zygote_end.as_fd()?.as_raw_fd();
    let handshake_fd = env_descriptor(&settings.handshake_env_var);

    match fork_process()? {
        ForkResult::Child => {
            drop(controller_end);

            let mut keep = vec![zygote_fd];
            keep.extend(handshake_fd);
            if let Err(e) = close_fds_except(&keep) {
                error!("Zygote failed to close inherited descriptors: {}", e);
                std::process::exit(1);
            }

            let mut server = ZygoteServer::new(zygote_end, limits);
            if let Some(fd) = handshake_fd {
                server.preserve_descriptor(fd);
            }
            Ok(Launch::Zygote(server))
        }
        ForkResult::Parent { child } => {
            drop(zygote_end);
            info!("Zygote started as {}", child);
            Ok(Launch::Controller(
                ZygoteController::new(controller_end, limits).attached_to(child),
            ))
        }
    }
}

fn env_descriptor(var: &str) -> Option<RawFd> {
    std::env::var(var).ok()?.trim().parse().ok().filter(|fd| *fd > 2)
}
