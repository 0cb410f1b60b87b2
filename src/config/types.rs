//! Core types shared by every layer of the zygote system

use thiserror::Error;

/// Upper bound on descriptors carried by a single message.
pub const MAX_DESCRIPTORS: usize = 16;

/// Default upper bound on a message payload, header included.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 8192;

/// Byte a worker writes when it is ready to be confined.
pub const MSG_CHROOT_ME: u8 = b'C';

/// Byte the controller answers once confinement may proceed.
pub const MSG_CHROOT_SUCCESSFUL: u8 = b'O';

/// Custom error types for the zygote system
#[derive(Error, Debug)]
pub enum ZygoteError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Message truncated: {0}")]
    Truncated(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Spawn failed: {0}")]
    SpawnFailed(String),

    #[error("Peer closed the channel")]
    Eof,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Sandbox handshake failed: {0}")]
    Handshake(String),
}

impl From<nix::errno::Errno> for ZygoteError {
    fn from(errno: nix::errno::Errno) -> Self {
        ZygoteError::Io(std::io::Error::from(errno))
    }
}

impl ZygoteError {
    /// Whether the error means the peer is gone for good.
    pub fn is_eof(&self) -> bool {
        matches!(self, ZygoteError::Eof)
    }

    pub(crate) fn malformed(what: impl Into<String>) -> Self {
        ZygoteError::MalformedMessage(what.into())
    }
}

/// Result type for zygote operations
pub type Result<T> = std::result::Result<T, ZygoteError>;
