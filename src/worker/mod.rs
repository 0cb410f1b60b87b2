//! Worker start-up
//!
//! A worker is a process produced by the zygote. It first completes the
//! sandbox handshake, then talks to its sandbox helper for anything it can
//! no longer reach itself.

pub mod font_client;
pub mod handshake;

pub use font_client::FontClient;
pub use handshake::{
    acknowledge_chroot_request, ChrootConfirmed, ChrootRequested, SandboxHandshake,
    SandboxStatus, Unconfirmed,
};

use crate::config::settings::ZygoteSettings;
use crate::config::types::{Result, ZygoteError};
use crate::ipc::channel::Channel;
use crate::ipc::codec::{MessageReader, MessageWriter};
use crate::ipc::protocol::FontQuery;
use crate::kernel::confinement::ChrootJail;
use crate::zygote::{WorkerStartup, PRIMARY_IPC_CHANNEL, SANDBOX_HANDSHAKE, SANDBOX_IPC_CHANNEL};
use log::{info, warn};

/// What a worker tells the controller once it is up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub sandboxed: bool,
    /// Family the helper matched for `--family`, empty if none was asked or found
    pub family: String,
}

impl WorkerReport {
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = MessageWriter::new();
        writer
            .encode_bool(self.sandboxed)
            .encode_string(&self.family);
        writer.finish()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = MessageReader::new(payload)?;
        Ok(Self {
            sandboxed: reader.decode_bool()?,
            family: reader.decode_string()?,
        })
    }
}

/// Worker body: handshake, optional font lookup, report on the primary channel.
///
/// The handshake descriptor comes from the mapping when present, otherwise
/// from the environment variable named in `settings`.
pub fn run_worker(mut startup: WorkerStartup, settings: &ZygoteSettings) -> Result<WorkerReport> {
    let descriptors = startup.descriptors_mut();
    let handshake = match descriptors.take(SANDBOX_HANDSHAKE) {
        Some(fd) => SandboxHandshake::from_descriptor(Some(fd)),
        None => SandboxHandshake::from_env(&settings.handshake_env_var)?,
    };
    let helper = descriptors.take(SANDBOX_IPC_CHANNEL).map(Channel::from_owned_fd);
    let primary = descriptors.take(PRIMARY_IPC_CHANNEL).map(Channel::from_owned_fd);

    let status = handshake.complete(&ChrootJail::new(&settings.chroot_dir))?;

    let family = match (helper, startup.switch_value("family")) {
        (Some(channel), Some(family)) => {
            let client = FontClient::new(channel, settings.channel_limits());
            let query = FontQuery {
                family: family.to_string(),
                is_bold: startup.has_switch("bold"),
                is_italic: startup.has_switch("italic"),
                ..FontQuery::default()
            };
            match client.match_font(&query)? {
                Some(found) => found.family,
                None => String::new(),
            }
        }
        (None, Some(family)) => {
            warn!("No sandbox helper channel; cannot look up {:?}", family);
            String::new()
        }
        _ => String::new(),
    };

    let report = WorkerReport {
        sandboxed: status == SandboxStatus::Sandboxed,
        family,
    };
    info!("Worker ready: {:?}", report);

    match primary {
        Some(channel) => channel.send(&report.encode(), &[])?,
        None => {
            return Err(ZygoteError::Config(
                "worker has no primary channel to report on".to_string(),
            ))
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zygote::WorkerDescriptors;

    #[test]
    fn test_unsandboxed_worker_reports() {
        let (worker_end, controller_end) = Channel::pair().unwrap();
        let descriptors = WorkerDescriptors::from_parts(
            vec![PRIMARY_IPC_CHANNEL],
            vec![worker_end.into_owned_fd().unwrap()],
        );
        let startup = WorkerStartup::new(vec!["--type=worker".to_string()], descriptors);

        let settings = ZygoteSettings {
            handshake_env_var: "ZYGOTE_TEST_NO_SUCH_HANDSHAKE".to_string(),
            ..ZygoteSettings::default()
        };
        let report = run_worker(startup, &settings).unwrap();
        assert!(!report.sandboxed);
        assert!(report.family.is_empty());

        let message = controller_end.receive(1024, 0).unwrap();
        assert_eq!(WorkerReport::decode(&message.payload).unwrap(), report);
    }

    #[test]
    fn test_missing_primary_channel_is_an_error() {
        let settings = ZygoteSettings {
            handshake_env_var: "ZYGOTE_TEST_NO_SUCH_HANDSHAKE".to_string(),
            ..ZygoteSettings::default()
        };
        assert!(run_worker(WorkerStartup::default(), &settings).is_err());
    }
}
