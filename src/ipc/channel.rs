//! Framed-datagram transport.
//!
//! A [`Channel`] owns one end of a connected `AF_UNIX` `SOCK_SEQPACKET`
//! socketpair. Every [`Channel::send`] is delivered as exactly one datagram
//! together with its descriptors (`SCM_RIGHTS`); a closed peer is observed as
//! [`ZygoteError::Eof`].

use crate::config::types::{Result, ZygoteError, DEFAULT_MAX_MESSAGE_BYTES, MAX_DESCRIPTORS};
use crate::kernel::fd::seqpacket_pair;
use nix::errno::Errno;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

/// Kernel cap on descriptors per SCM_RIGHTS message. Sizing the control
/// buffer for it means MSG_CTRUNC never drops descriptors we cannot see.
const SCM_MAX_FD: usize = 253;

/// Size limits applied when receiving
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelLimits {
    pub max_payload: usize,
    pub max_descriptors: usize,
}

impl Default for ChannelLimits {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_MESSAGE_BYTES,
            max_descriptors: MAX_DESCRIPTORS,
        }
    }
}

impl ChannelLimits {
    /// Refuse a message the peer would have to drop as truncated.
    ///
    /// The peer discards oversized datagrams without answering, so a caller
    /// that waits for a reply must check before sending.
    pub fn check_outgoing(&self, payload: &[u8], descriptors: usize) -> Result<()> {
        if payload.len() > self.max_payload {
            return Err(ZygoteError::Truncated(format!(
                "message of {} bytes exceeds limit of {}",
                payload.len(),
                self.max_payload
            )));
        }
        if descriptors > self.max_descriptors {
            return Err(ZygoteError::Truncated(format!(
                "{} descriptors exceed limit of {}",
                descriptors, self.max_descriptors
            )));
        }
        Ok(())
    }
}

/// One received datagram. The descriptors belong to the receiver.
#[derive(Debug)]
pub struct Message {
    pub payload: Vec<u8>,
    pub descriptors: Vec<OwnedFd>,
}

/// One end of a connected datagram socket
#[derive(Debug)]
pub struct Channel {
    fd: Option<OwnedFd>,
}

impl Channel {
    /// Create both ends of a fresh channel
    pub fn pair() -> Result<(Channel, Channel)> {
        let (a, b) = seqpacket_pair()?;
        Ok((Channel::from_owned_fd(a), Channel::from_owned_fd(b)))
    }

    /// Wrap an already connected SOCK_SEQPACKET descriptor
    pub fn from_owned_fd(fd: OwnedFd) -> Self {
        Self { fd: Some(fd) }
    }

    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    /// Release the descriptor. Later operations fail; closing twice is a no-op.
    pub fn close(&mut self) {
        self.fd = None;
    }

    /// Give up the channel, returning its descriptor if still open
    pub fn into_owned_fd(self) -> Option<OwnedFd> {
        self.fd
    }

    pub fn as_fd(&self) -> Result<BorrowedFd<'_>> {
        use std::os::fd::AsFd;

        self.fd.as_ref().map(|fd| fd.as_fd()).ok_or_else(closed_error)
    }

    fn raw_fd(&self) -> Result<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd()).ok_or_else(closed_error)
    }

    /// Send `payload` and `descriptors` as one message.
    ///
    /// The descriptors stay owned by the caller; the peer receives duplicates.
    pub fn send(&self, payload: &[u8], descriptors: &[BorrowedFd<'_>]) -> Result<()> {
        let fd = self.raw_fd()?;

        // A zero-length datagram is what the receiver sees on EOF.
        if payload.is_empty() {
            return Err(ZygoteError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "refusing to send an empty payload",
            )));
        }

        if descriptors.len() > MAX_DESCRIPTORS {
            return Err(ZygoteError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "{} descriptors exceed the limit of {}",
                    descriptors.len(),
                    MAX_DESCRIPTORS
                ),
            )));
        }

        let raw: Vec<RawFd> = descriptors.iter().map(|d| d.as_raw_fd()).collect();
        let iov = [IoSlice::new(payload)];
        let rights = [ControlMessage::ScmRights(&raw)];
        let cmsgs: &[ControlMessage<'_>] = if raw.is_empty() { &[] } else { &rights };

        loop {
            match sendmsg::<()>(fd, &iov, cmsgs, MsgFlags::MSG_NOSIGNAL, None) {
                Ok(sent) if sent == payload.len() => {
                    log::trace!("sent {} bytes, {} fds on fd {}", sent, raw.len(), fd);
                    return Ok(());
                }
                Ok(sent) => {
                    return Err(ZygoteError::Io(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        format!("short datagram write: {} of {} bytes", sent, payload.len()),
                    )))
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Block until one message arrives.
    ///
    /// Oversized payloads or descriptor lists yield [`ZygoteError::Truncated`]
    /// after every received descriptor has been closed.
    pub fn receive(&self, max_payload: usize, max_descriptors: usize) -> Result<Message> {
        let fd = self.raw_fd()?;
        let mut payload = vec![0u8; max_payload];
        let mut cmsg_buffer = nix::cmsg_space!([RawFd; SCM_MAX_FD]);

        let (bytes, flags, raw_fds) = loop {
            let mut iov = [IoSliceMut::new(&mut payload)];
            match recvmsg::<()>(
                fd,
                &mut iov,
                Some(&mut cmsg_buffer),
                MsgFlags::MSG_CMSG_CLOEXEC,
            ) {
                Ok(msg) => {
                    let mut raw_fds: Vec<RawFd> = Vec::new();
                    match msg.cmsgs() {
                        Ok(cmsgs) => {
                            for cmsg in cmsgs {
                                if let ControlMessageOwned::ScmRights(fds) = cmsg {
                                    raw_fds.extend(fds);
                                }
                            }
                        }
                        Err(e) => log::warn!("unreadable control data on fd {}: {}", fd, e),
                    }
                    break (msg.bytes, msg.flags, raw_fds);
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECONNRESET) => return Err(ZygoteError::Eof),
                Err(e) => return Err(e.into()),
            }
        };

        // SAFETY: SCM_RIGHTS installed these descriptors into this process
        // for this call; nothing else refers to them yet.
        let descriptors: Vec<OwnedFd> = raw_fds
            .into_iter()
            .map(|raw| unsafe { OwnedFd::from_raw_fd(raw) })
            .collect();

        if flags.intersects(MsgFlags::MSG_TRUNC | MsgFlags::MSG_CTRUNC) {
            return Err(ZygoteError::Truncated(format!(
                "datagram larger than {} bytes (closed {} descriptors)",
                max_payload,
                descriptors.len()
            )));
        }

        if descriptors.len() > max_descriptors {
            return Err(ZygoteError::Truncated(format!(
                "{} descriptors exceed the limit of {} (all closed)",
                descriptors.len(),
                max_descriptors
            )));
        }

        if bytes == 0 && descriptors.is_empty() {
            return Err(ZygoteError::Eof);
        }

        payload.truncate(bytes);
        log::trace!("received {} bytes, {} fds on fd {}", bytes, descriptors.len(), fd);

        Ok(Message {
            payload,
            descriptors,
        })
    }
}

fn closed_error() -> ZygoteError {
    ZygoteError::Io(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "channel is closed",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_round_trip() {
        let (a, b) = Channel::pair().unwrap();
        a.send(b"hello zygote", &[]).unwrap();

        let message = b.receive(64, 0).unwrap();
        assert_eq!(message.payload, b"hello zygote");
        assert!(message.descriptors.is_empty());
    }

    #[test]
    fn test_datagram_boundaries_are_kept() {
        let (a, b) = Channel::pair().unwrap();
        a.send(b"one", &[]).unwrap();
        a.send(b"two", &[]).unwrap();

        assert_eq!(b.receive(64, 0).unwrap().payload, b"one");
        assert_eq!(b.receive(64, 0).unwrap().payload, b"two");
    }

    #[test]
    fn test_peer_close_is_eof() {
        let (a, b) = Channel::pair().unwrap();
        drop(a);

        let err = b.receive(64, 0).unwrap_err();
        assert!(err.is_eof());
    }

    #[test]
    fn test_oversized_payload_is_truncated() {
        let (a, b) = Channel::pair().unwrap();
        a.send(&[7u8; 128], &[]).unwrap();

        let err = b.receive(16, 0).unwrap_err();
        assert!(matches!(err, ZygoteError::Truncated(_)));
    }

    #[test]
    fn test_outgoing_limits() {
        let limits = ChannelLimits {
            max_payload: 8,
            max_descriptors: 1,
        };
        assert!(limits.check_outgoing(&[0u8; 8], 1).is_ok());
        assert!(matches!(
            limits.check_outgoing(&[0u8; 9], 0),
            Err(ZygoteError::Truncated(_))
        ));
        assert!(limits.check_outgoing(&[0u8; 4], 2).is_err());
    }

    #[test]
    fn test_closed_channel_rejects_operations() {
        let (mut a, _b) = Channel::pair().unwrap();
        a.close();
        a.close();

        assert!(!a.is_open());
        assert!(matches!(a.send(b"x", &[]), Err(ZygoteError::Io(_))));
        assert!(matches!(a.receive(8, 0), Err(ZygoteError::Io(_))));
    }

    #[test]
    fn test_empty_payload_rejected() {
        let (a, _b) = Channel::pair().unwrap();
        assert!(a.send(&[], &[]).is_err());
    }

    #[test]
    fn test_send_to_closed_peer_fails() {
        let (a, b) = Channel::pair().unwrap();
        drop(b);
        assert!(matches!(a.send(b"x", &[]), Err(ZygoteError::Io(_))));
    }
}
