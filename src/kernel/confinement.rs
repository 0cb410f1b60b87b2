// Filesystem confinement for workers that completed the sandbox handshake

use crate::config::types::{Result, ZygoteError};
use std::path::{Path, PathBuf};

/// Something a worker applies to itself once the controller allows it
pub trait Confinement {
    fn confine(&self) -> Result<()>;
}

/// Change the filesystem root and mark the process non-dumpable
#[derive(Debug, Clone)]
pub struct ChrootJail {
    root: PathBuf,
}

impl ChrootJail {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Confinement for ChrootJail {
    fn confine(&self) -> Result<()> {
        nix::unistd::chroot(&self.root).map_err(|e| {
            ZygoteError::Handshake(format!("chroot({}) failed: {}", self.root.display(), e))
        })?;
        nix::unistd::chdir("/")
            .map_err(|e| ZygoteError::Handshake(format!("chdir(/) after chroot failed: {}", e)))?;

        set_non_dumpable()?;

        log::info!("Confined to {}", self.root.display());
        Ok(())
    }
}

/// Clear the dumpable flag (no core dumps, no ptrace attach from same uid)
pub fn set_non_dumpable() -> Result<()> {
    // SAFETY: PR_SET_DUMPABLE takes plain integer arguments.
    let result = unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0, 0, 0, 0) };

    if result != 0 {
        return Err(ZygoteError::Handshake(format!(
            "Failed to clear PR_SET_DUMPABLE: {}",
            std::io::Error::last_os_error()
        )));
    }

    log::debug!("Cleared PR_SET_DUMPABLE");
    Ok(())
}

/// Check the dumpable flag
pub fn is_dumpable() -> Result<bool> {
    // SAFETY: PR_GET_DUMPABLE takes no pointer arguments.
    let result = unsafe { libc::prctl(libc::PR_GET_DUMPABLE, 0, 0, 0, 0) };

    if result < 0 {
        return Err(ZygoteError::Io(std::io::Error::last_os_error()));
    }

    Ok(result == 1)
}
