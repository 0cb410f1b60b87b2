//! Descriptor creation, inventory and closure
//!
//! - socketpair/pipe creation returning owned descriptors (close-on-exec)
//! - open-descriptor inventory via /proc/self/fd
//! - closing every inherited descriptor except an explicit keep set

use crate::config::types::{Result, ZygoteError};
use std::fs;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use nix::unistd::close;

/// Create a connected AF_UNIX SOCK_SEQPACKET socketpair
pub fn seqpacket_pair() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds: [libc::c_int; 2] = [-1, -1];
    // SAFETY: fds points at two writable c_ints; the kernel fills both on success.
    let rc = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    if rc != 0 {
        return Err(ZygoteError::Io(std::io::Error::last_os_error()));
    }

    // SAFETY: both descriptors were just created and are owned by nobody else.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Create a close-on-exec pipe, returning (read end, write end)
pub fn pipe_pair() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds: [libc::c_int; 2] = [-1, -1];
    // SAFETY: fds points at two writable c_ints; the kernel fills both on success.
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(ZygoteError::Io(std::io::Error::last_os_error()));
    }

    // SAFETY: both descriptors were just created and are owned by nobody else.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Get list of open file descriptors
pub fn get_open_fds() -> Result<Vec<RawFd>> {
    let fd_dir = "/proc/self/fd";

    let entries = fs::read_dir(fd_dir).map_err(|e| {
        ZygoteError::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to read {}: {}", fd_dir, e),
        ))
    })?;

    let mut fds = Vec::new();

    for entry in entries.flatten() {
        if let Ok(file_name) = entry.file_name().into_string() {
            if let Ok(fd) = file_name.parse::<RawFd>() {
                fds.push(fd);
            }
        }
    }

    fds.sort();
    Ok(fds)
}

/// Close every descriptor above stderr that is not in `keep`.
///
/// Only for a freshly forked, single-threaded child: descriptors owned by
/// live Rust values in other threads would be closed underneath them.
/// Returns the number of descriptors closed.
pub fn close_fds_except(keep: &[RawFd]) -> Result<usize> {
    // The directory handle used for the listing is closed by the time
    // get_open_fds returns, so it shows up below as EBADF and is skipped.
    let open = get_open_fds()?;

    let mut closed_count = 0;
    let mut failed_closes = Vec::new();

    for fd in open {
        if fd <= libc::STDERR_FILENO || keep.contains(&fd) {
            continue;
        }

        match close(fd) {
            Ok(()) => closed_count += 1,
            Err(nix::errno::Errno::EBADF) => {}
            Err(e) => failed_closes.push((fd, e)),
        }
    }

    if !failed_closes.is_empty() {
        let error_msg = failed_closes
            .iter()
            .map(|(fd, err)| format!("fd {}: {}", fd, err))
            .collect::<Vec<_>>()
            .join(", ");

        return Err(ZygoteError::Io(std::io::Error::other(format!(
            "Failed to close {} FD(s): {}",
            failed_closes.len(),
            error_msg
        ))));
    }

    log::debug!("Closed {} inherited FDs", closed_count);
    Ok(closed_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;

    #[test]
    fn test_get_open_fds() {
        let fds = get_open_fds().unwrap();
        // Should at least have stdin, stdout, stderr
        assert!(fds.contains(&0));
        assert!(fds.contains(&1));
        assert!(fds.contains(&2));
    }

    #[test]
    fn test_pipe_pair_transfers_bytes() {
        let (read_end, write_end) = pipe_pair().unwrap();
        let mut writer = fs::File::from(write_end);
        writer.write_all(b"z").unwrap();
        drop(writer);

        let mut reader = fs::File::from(read_end);
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"z");
    }

    #[test]
    fn test_seqpacket_pair_is_cloexec() {
        let (a, b) = seqpacket_pair().unwrap();
        for fd in [&a, &b] {
            let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFD) };
            assert!(flags & libc::FD_CLOEXEC != 0);
        }
    }
}
