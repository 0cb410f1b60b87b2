use crate::config::types::{Result, ZygoteError, MAX_DESCRIPTORS};
use std::collections::BTreeMap;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

/// Key of the worker's primary channel back to the controller
pub const PRIMARY_IPC_CHANNEL: u32 = 0;
/// Key of the worker's channel to its sandbox helper
pub const SANDBOX_IPC_CHANNEL: u32 = 2;
/// Key of the worker's sandbox handshake socket
pub const SANDBOX_HANDSHAKE: u32 = 3;

/// How a new worker's descriptor table should be populated.
///
/// Built by the controller and consumed by one fork request. Entries travel
/// in ascending key order.
#[derive(Debug, Default)]
pub struct DescriptorMapping<'fd> {
    entries: BTreeMap<u32, BorrowedFd<'fd>>,
}

impl<'fd> DescriptorMapping<'fd> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Bind `key` to `fd` in the worker
    pub fn insert(&mut self, key: u32, fd: BorrowedFd<'fd>) -> Result<()> {
        if self.entries.contains_key(&key) {
            return Err(ZygoteError::Config(format!(
                "descriptor key {} mapped twice",
                key
            )));
        }

        if self.entries.len() >= MAX_DESCRIPTORS {
            return Err(ZygoteError::Config(format!(
                "descriptor mapping is limited to {} entries",
                MAX_DESCRIPTORS
            )));
        }

        self.entries.insert(key, fd);
        Ok(())
    }

    /// Builder form of [`insert`](Self::insert)
    pub fn with(mut self, key: u32, fd: BorrowedFd<'fd>) -> Result<Self> {
        self.insert(key, fd)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> Vec<u32> {
        self.entries.keys().copied().collect()
    }

    pub fn descriptors(&self) -> Vec<BorrowedFd<'fd>> {
        self.entries.values().copied().collect()
    }
}

/// Descriptors a worker received at spawn time, by logical key
#[derive(Debug, Default)]
pub struct WorkerDescriptors {
    entries: BTreeMap<u32, OwnedFd>,
}

impl WorkerDescriptors {
    /// Pair decoded keys with the descriptors that arrived alongside them
    pub fn from_parts(keys: Vec<u32>, descriptors: Vec<OwnedFd>) -> Self {
        Self {
            entries: keys.into_iter().zip(descriptors).collect(),
        }
    }

    pub fn get(&self, key: u32) -> Option<BorrowedFd<'_>> {
        self.entries.get(&key).map(|fd| fd.as_fd())
    }

    /// Take ownership of the descriptor bound to `key`
    pub fn take(&mut self, key: u32) -> Option<OwnedFd> {
        self.entries.remove(&key)
    }

    pub fn keys(&self) -> Vec<u32> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn raw_fds(&self) -> Vec<RawFd> {
        self.entries.values().map(|fd| fd.as_raw_fd()).collect()
    }
}
