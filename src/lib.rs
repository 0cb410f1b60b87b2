//! sandbox-zygote: a privilege-separated fork server and sandbox helper core
//!
//! # Architecture
//!
//! Four roles, each a separate process:
//!
//! - **controller**: the trusted process. Launches the zygote, asks it for
//!   workers and queries their exit status ([`zygote::ZygoteController`]).
//! - **zygote**: forked early, clones itself on request
//!   ([`zygote::ZygoteServer`]).
//! - **worker**: a zygote clone. Completes the one-shot sandbox handshake and
//!   then runs confined ([`worker`]).
//! - **sandbox helper**: unconfined process answering a worker's font lookups
//!   and exiting with whichever of its two peers leaves first ([`helper`]).
//!
//! ## Transport ([`ipc`])
//! - [`ipc::channel`]: SOCK_SEQPACKET datagrams with descriptor passing
//! - [`ipc::codec`]: aligned field encoding inside a datagram
//! - [`ipc::protocol`]: typed requests and replies
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::fd`]: socket pairs, pipes, descriptor closure
//! - [`kernel::process`]: fork, reap, crash status
//! - [`kernel::confinement`]: chroot and the dumpable flag
//!
//! ## Configuration ([`config`])
//! - [`config::types`]: error type and wire constants
//! - [`config::settings`]: JSON settings with environment overrides

// Configuration & errors
pub mod config;

// Kernel Primitives
pub mod kernel;

// Transport
pub mod ipc;

// Fork server
pub mod zygote;

// Worker start-up
pub mod worker;

// Sandbox helper
pub mod helper;

// CLI entrypoint for the zygote binary.
pub mod cli;

pub use config::settings::ZygoteSettings;
pub use config::types::{Result, ZygoteError};
