//! Integration tests for the datagram transport and wire protocol
//!
//! Nothing here forks, so descriptor counts in this process stay meaningful.

use sandbox_zygote::config::types::ZygoteError;
use sandbox_zygote::ipc::channel::Channel;
use sandbox_zygote::ipc::protocol::{SandboxReply, SandboxRequest, ZygoteRequest};
use sandbox_zygote::kernel::fd::pipe_pair;
use sandbox_zygote::zygote::{DescriptorMapping, WorkerDescriptors};
use std::os::fd::{AsFd, AsRawFd};

fn ignore_sigpipe() {
    // SAFETY: installing SIG_IGN has no preconditions.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

#[test]
fn test_descriptors_arrive_in_order_and_usable() {
    let (sender, receiver) = Channel::pair().unwrap();
    let pipes: Vec<_> = (0..3).map(|_| pipe_pair().unwrap()).collect();
    let write_ends: Vec<_> = pipes.iter().map(|(_, w)| w.as_fd()).collect();

    sender.send(b"three", &write_ends).unwrap();
    let message = receiver.receive(64, 8).unwrap();
    assert_eq!(message.payload, b"three");
    assert_eq!(message.descriptors.len(), 3);

    for (index, (fd, (read_end, _))) in message.descriptors.iter().zip(&pipes).enumerate() {
        let byte = [b'0' + index as u8];
        nix::unistd::write(fd, &byte).unwrap();
        let mut buf = [0u8; 1];
        nix::unistd::read(read_end.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(buf, byte);
    }
}

#[test]
fn test_too_many_descriptors_are_closed() {
    ignore_sigpipe();
    let (sender, receiver) = Channel::pair().unwrap();
    let (read_end, write_end) = pipe_pair().unwrap();

    sender.send(b"x", &[read_end.as_fd()]).unwrap();
    drop(read_end);

    let err = receiver.receive(64, 0).unwrap_err();
    assert!(matches!(err, ZygoteError::Truncated(_)));

    // The only remaining read end was the received copy; it must be gone.
    assert_eq!(
        nix::unistd::write(&write_end, b"y"),
        Err(nix::errno::Errno::EPIPE)
    );
}

#[test]
fn test_oversized_payload_closes_descriptors() {
    ignore_sigpipe();
    let (sender, receiver) = Channel::pair().unwrap();
    let (read_end, write_end) = pipe_pair().unwrap();

    sender.send(&[7u8; 256], &[read_end.as_fd()]).unwrap();
    drop(read_end);

    assert!(matches!(
        receiver.receive(16, 4).unwrap_err(),
        ZygoteError::Truncated(_)
    ));
    assert_eq!(
        nix::unistd::write(&write_end, b"y"),
        Err(nix::errno::Errno::EPIPE)
    );

    // The channel stays usable afterwards.
    sender.send(b"next", &[]).unwrap();
    assert_eq!(receiver.receive(16, 4).unwrap().payload, b"next");
}

#[test]
fn test_peer_close_is_eof() {
    let (sender, receiver) = Channel::pair().unwrap();
    drop(sender);
    assert!(receiver.receive(64, 4).unwrap_err().is_eof());
}

#[test]
fn test_fork_request_travels_with_its_descriptor() {
    let (controller, zygote) = Channel::pair().unwrap();
    let (read_end, write_end) = pipe_pair().unwrap();

    let mapping = DescriptorMapping::new().with(5, write_end.as_fd()).unwrap();
    let request = ZygoteRequest::Fork {
        argv: vec!["--type=worker".to_string()],
        keys: mapping.keys(),
    };
    controller
        .send(&request.encode(), &mapping.descriptors())
        .unwrap();

    let message = zygote.receive(1024, 16).unwrap();
    assert_eq!(message.descriptors.len(), 1);

    let ZygoteRequest::Fork { argv, keys } =
        ZygoteRequest::decode(&message.payload, message.descriptors.len()).unwrap()
    else {
        panic!("not a fork request");
    };
    assert_eq!(argv, vec!["--type=worker".to_string()]);
    assert_eq!(keys, vec![5]);

    let worker = WorkerDescriptors::from_parts(keys, message.descriptors);
    nix::unistd::write(worker.get(5).unwrap(), b"k").unwrap();
    let mut buf = [0u8; 1];
    nix::unistd::read(read_end.as_raw_fd(), &mut buf).unwrap();
    assert_eq!(&buf, b"k");
}

#[test]
fn test_sandbox_reply_requires_descriptor_when_found() {
    let found = SandboxReply::FontOpen { found: true }.encode();
    let method = SandboxRequest::FontOpen { fileid: 0 }.method();

    assert!(SandboxReply::decode(method, &found, 0).is_err());
    assert!(SandboxReply::decode(method, &found, 1).is_ok());
}
