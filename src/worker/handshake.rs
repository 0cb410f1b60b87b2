// Sandbox handshake
//
// A worker asks to be confined exactly once, right after it is spawned:
//
//   Unconfirmed --'C'--> ChrootRequested --'O' + confine--> ChrootConfirmed
//
// Every step consumes the previous state, so the exchange cannot be skipped
// ahead or replayed. Any failure consumes the handshake and the worker must
// not continue its start-up.

use crate::config::types::{Result, ZygoteError, MSG_CHROOT_ME, MSG_CHROOT_SUCCESSFUL};
use crate::kernel::confinement::Confinement;
use log::{debug, info, warn};
use std::io::{Read, Write};
use std::marker::PhantomData;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

/// Type-state marker: nothing has been sent yet
pub struct Unconfirmed;

/// Type-state marker: the confinement request was written
pub struct ChrootRequested;

/// Type-state marker: acknowledged and confined
pub struct ChrootConfirmed;

/// How the worker ended up after the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxStatus {
    Sandboxed,
    /// No handshake descriptor was provided
    Unsandboxed,
}

/// Worker end of the sandbox handshake
pub struct SandboxHandshake<S> {
    socket: Option<UnixStream>,
    _state: PhantomData<S>,
}

impl<S> std::fmt::Debug for SandboxHandshake<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxHandshake")
            .field("state", &std::any::type_name::<S>())
            .field("socket", &self.socket)
            .finish()
    }
}

impl SandboxHandshake<Unconfirmed> {
    /// Use a descriptor received through the zygote mapping, if any
    pub fn from_descriptor(fd: Option<OwnedFd>) -> Self {
        Self {
            socket: fd.map(UnixStream::from),
            _state: PhantomData,
        }
    }

    /// Use the descriptor whose number is stored in environment variable `var`
    pub fn from_env(var: &str) -> Result<Self> {
        let value = match std::env::var(var) {
            Ok(value) => value,
            Err(std::env::VarError::NotPresent) => return Ok(Self::from_descriptor(None)),
            Err(e) => {
                return Err(ZygoteError::Handshake(format!("{} is unreadable: {}", var, e)));
            }
        };

        let fd: RawFd = value.trim().parse().map_err(|_| {
            ZygoteError::Handshake(format!("{}={:?} is not a descriptor number", var, value))
        })?;

        // SAFETY: F_GETFD only inspects the descriptor table.
        if fd < 0 || unsafe { libc::fcntl(fd, libc::F_GETFD) } == -1 {
            return Err(ZygoteError::Handshake(format!(
                "{}={} does not name an open descriptor",
                var, fd
            )));
        }

        // SAFETY: the descriptor is open and was handed to this process for the handshake only.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self::from_descriptor(Some(fd)))
    }

    pub fn is_present(&self) -> bool {
        self.socket.is_some()
    }

    /// Tell the controller this worker is ready to be confined
    pub fn request_chroot(self) -> Result<SandboxHandshake<ChrootRequested>> {
        let mut socket = self
            .socket
            .ok_or_else(|| ZygoteError::Handshake("no handshake descriptor".to_string()))?;

        socket
            .write_all(&[MSG_CHROOT_ME])
            .map_err(|e| ZygoteError::Handshake(format!("Failed to request chroot: {}", e)))?;
        debug!("Chroot requested");

        Ok(SandboxHandshake {
            socket: Some(socket),
            _state: PhantomData,
        })
    }

    /// Run the whole exchange; without a descriptor the worker stays unsandboxed
    pub fn complete(self, confinement: &impl Confinement) -> Result<SandboxStatus> {
        if !self.is_present() {
            info!("No sandbox handshake descriptor; running unsandboxed");
            return Ok(SandboxStatus::Unsandboxed);
        }

        let confirmed = self.request_chroot()?.confirm(confinement)?;
        Ok(confirmed.status())
    }
}

impl SandboxHandshake<ChrootRequested> {
    /// Wait for the acknowledgement, then confine
    pub fn confirm(
        self,
        confinement: &impl Confinement,
    ) -> Result<SandboxHandshake<ChrootConfirmed>> {
        let mut socket = self
            .socket
            .ok_or_else(|| ZygoteError::Handshake("no handshake descriptor".to_string()))?;

        let mut reply = [0u8; 1];
        socket.read_exact(&mut reply).map_err(|e| {
            ZygoteError::Handshake(format!("No chroot acknowledgement: {}", e))
        })?;

        if reply[0] != MSG_CHROOT_SUCCESSFUL {
            warn!("Unexpected chroot acknowledgement byte {:#04x}", reply[0]);
            return Err(ZygoteError::Handshake(format!(
                "expected acknowledgement {:#04x}, got {:#04x}",
                MSG_CHROOT_SUCCESSFUL, reply[0]
            )));
        }

        confinement.confine()?;

        Ok(SandboxHandshake {
            socket: Some(socket),
            _state: PhantomData,
        })
    }
}

impl SandboxHandshake<ChrootConfirmed> {
    pub fn status(&self) -> SandboxStatus {
        SandboxStatus::Sandboxed
    }
}

/// Controller end: read the worker's request and acknowledge it
pub fn acknowledge_chroot_request<S: Read + Write>(stream: &mut S) -> Result<()> {
    let mut request = [0u8; 1];
    stream
        .read_exact(&mut request)
        .map_err(|e| ZygoteError::Handshake(format!("No chroot request: {}", e)))?;

    if request[0] != MSG_CHROOT_ME {
        return Err(ZygoteError::Handshake(format!(
            "expected chroot request {:#04x}, got {:#04x}",
            MSG_CHROOT_ME, request[0]
        )));
    }

    stream
        .write_all(&[MSG_CHROOT_SUCCESSFUL])
        .map_err(|e| ZygoteError::Handshake(format!("Failed to acknowledge chroot: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::os::fd::IntoRawFd;
    use std::thread;

    #[derive(Default)]
    struct RecordingJail {
        confined: Cell<u32>,
    }

    impl Confinement for RecordingJail {
        fn confine(&self) -> Result<()> {
            self.confined.set(self.confined.get() + 1);
            Ok(())
        }
    }

    fn handshake_pair() -> (SandboxHandshake<Unconfirmed>, UnixStream) {
        let (worker, controller) = UnixStream::pair().unwrap();
        (
            SandboxHandshake::from_descriptor(Some(OwnedFd::from(worker))),
            controller,
        )
    }

    #[test]
    fn test_acknowledged_handshake_confines() {
        let (handshake, mut controller) = handshake_pair();
        let peer = thread::spawn(move || acknowledge_chroot_request(&mut controller));

        let jail = RecordingJail::default();
        assert_eq!(handshake.complete(&jail).unwrap(), SandboxStatus::Sandboxed);
        assert_eq!(jail.confined.get(), 1);
        peer.join().unwrap().unwrap();
    }

    #[test]
    fn test_missing_descriptor_is_unsandboxed() {
        let jail = RecordingJail::default();
        let status = SandboxHandshake::from_descriptor(None).complete(&jail).unwrap();
        assert_eq!(status, SandboxStatus::Unsandboxed);
        assert_eq!(jail.confined.get(), 0);
    }

    #[test]
    fn test_wrong_acknowledgement_fails_without_confining() {
        let (handshake, mut controller) = handshake_pair();
        let requested = handshake.request_chroot().unwrap();

        let mut request = [0u8; 1];
        controller.read_exact(&mut request).unwrap();
        assert_eq!(request[0], MSG_CHROOT_ME);
        controller.write_all(b"X").unwrap();

        let jail = RecordingJail::default();
        assert!(matches!(
            requested.confirm(&jail).unwrap_err(),
            ZygoteError::Handshake(_)
        ));
        assert_eq!(jail.confined.get(), 0);
    }

    #[test]
    fn test_controller_gone_fails() {
        let (handshake, controller) = handshake_pair();
        drop(controller);

        let jail = RecordingJail::default();
        assert!(handshake.complete(&jail).is_err());
        assert_eq!(jail.confined.get(), 0);
    }

    #[test]
    fn test_workers_are_acknowledged_independently() {
        let (first, mut first_peer) = handshake_pair();
        let (second, mut second_peer) = handshake_pair();

        let first = first.request_chroot().unwrap();
        let second = second.request_chroot().unwrap();

        let mut byte = [0u8; 1];
        second_peer.read_exact(&mut byte).unwrap();
        drop(second_peer);
        acknowledge_chroot_request(&mut first_peer).unwrap();

        let jail = RecordingJail::default();
        assert!(first.confirm(&jail).is_ok());
        assert!(second.confirm(&jail).is_err());
        assert_eq!(jail.confined.get(), 1);
    }

    #[test]
    fn test_from_env_reads_descriptor_number() {
        let (worker, mut controller) = UnixStream::pair().unwrap();
        let raw = worker.into_raw_fd();
        std::env::set_var("ZYGOTE_TEST_HANDSHAKE_FD", raw.to_string());

        let handshake = SandboxHandshake::from_env("ZYGOTE_TEST_HANDSHAKE_FD").unwrap();
        assert!(handshake.is_present());

        let peer = thread::spawn(move || acknowledge_chroot_request(&mut controller));
        assert_eq!(
            handshake.complete(&RecordingJail::default()).unwrap(),
            SandboxStatus::Sandboxed
        );
        peer.join().unwrap().unwrap();
        std::env::remove_var("ZYGOTE_TEST_HANDSHAKE_FD");
    }

    #[test]
    fn test_from_env_rejects_garbage() {
        std::env::set_var("ZYGOTE_TEST_HANDSHAKE_BAD", "not-a-number");
        assert!(SandboxHandshake::from_env("ZYGOTE_TEST_HANDSHAKE_BAD").is_err());
        std::env::remove_var("ZYGOTE_TEST_HANDSHAKE_BAD");

        let handshake = SandboxHandshake::from_env("ZYGOTE_TEST_HANDSHAKE_UNSET").unwrap();
        assert!(!handshake.is_present());
    }

    #[test]
    fn test_acknowledge_rejects_unknown_request() {
        let (mut controller, mut worker) = UnixStream::pair().unwrap();
        worker.write_all(b"Z").unwrap();
        assert!(acknowledge_chroot_request(&mut controller).is_err());
    }
}
