//! Typed commands and replies carried over a [`Channel`](super::channel::Channel).
//!
//! Requests start with their command tag. Replies carry no tag: the side
//! that sent the request knows which reply shape to expect.

use crate::config::types::{Result, ZygoteError, MAX_DESCRIPTORS};
use crate::ipc::codec::{MessageReader, MessageWriter};
use crate::kernel::process::CrashStatus;

/// Controller -> zygote command tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ZygoteCommand {
    Fork = 0,
    Reap = 1,
    DidProcessCrash = 2,
}

impl TryFrom<i32> for ZygoteCommand {
    type Error = ZygoteError;

    fn try_from(tag: i32) -> Result<Self> {
        match tag {
            0 => Ok(Self::Fork),
            1 => Ok(Self::Reap),
            2 => Ok(Self::DidProcessCrash),
            other => Err(ZygoteError::malformed(format!("unknown zygote command {}", other))),
        }
    }
}

/// Worker -> helper method tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SandboxMethod {
    FontMatch = 0,
    FontOpen = 1,
    GetFontFamilyForChars = 2,
}

impl TryFrom<i32> for SandboxMethod {
    type Error = ZygoteError;

    fn try_from(tag: i32) -> Result<Self> {
        match tag {
            0 => Ok(Self::FontMatch),
            1 => Ok(Self::FontOpen),
            2 => Ok(Self::GetFontFamilyForChars),
            other => Err(ZygoteError::malformed(format!("unknown sandbox method {}", other))),
        }
    }
}

fn expect_no_descriptors(what: &str, descriptor_count: usize) -> Result<()> {
    if descriptor_count != 0 {
        return Err(ZygoteError::malformed(format!(
            "{} carries {} unexpected descriptors",
            what, descriptor_count
        )));
    }
    Ok(())
}

fn decode_pid(reader: &mut MessageReader<'_>) -> Result<i32> {
    let pid = reader.decode_int()?;
    if pid <= 0 {
        return Err(ZygoteError::malformed(format!("invalid process id {}", pid)));
    }
    Ok(pid)
}

/// A decoded controller request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZygoteRequest {
    /// Clone a worker; `keys[i]` names the i-th attached descriptor
    Fork { argv: Vec<String>, keys: Vec<u32> },
    Reap { pid: i32 },
    DidProcessCrash { pid: i32 },
}

impl ZygoteRequest {
    pub fn command(&self) -> ZygoteCommand {
        match self {
            Self::Fork { .. } => ZygoteCommand::Fork,
            Self::Reap { .. } => ZygoteCommand::Reap,
            Self::DidProcessCrash { .. } => ZygoteCommand::DidProcessCrash,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = MessageWriter::new();
        writer.encode_int(self.command() as i32);

        match self {
            Self::Fork { argv, keys } => {
                writer.encode_int(argv.len() as i32);
                for arg in argv {
                    writer.encode_string(arg);
                }
                writer.encode_descriptor_count(keys.len());
                for key in keys {
                    writer.encode_u32(*key);
                }
            }
            Self::Reap { pid } | Self::DidProcessCrash { pid } => {
                writer.encode_int(*pid);
            }
        }

        writer.finish()
    }

    /// Decode a request that arrived with `descriptor_count` descriptors
    pub fn decode(payload: &[u8], descriptor_count: usize) -> Result<Self> {
        let mut reader = MessageReader::new(payload)?;
        let command = ZygoteCommand::try_from(reader.decode_int()?)?;

        match command {
            ZygoteCommand::Fork => {
                let argc = reader.decode_count()?;
                let mut argv = Vec::with_capacity(argc);
                for _ in 0..argc {
                    argv.push(reader.decode_string()?);
                }

                let mapping_count = reader.decode_descriptor_count(MAX_DESCRIPTORS)?;
                if mapping_count != descriptor_count {
                    return Err(ZygoteError::malformed(format!(
                        "fork maps {} keys but carries {} descriptors",
                        mapping_count, descriptor_count
                    )));
                }

                let mut keys = Vec::with_capacity(mapping_count);
                for _ in 0..mapping_count {
                    let key = reader.decode_u32()?;
                    if keys.contains(&key) {
                        return Err(ZygoteError::malformed(format!(
                            "descriptor key {} mapped twice",
                            key
                        )));
                    }
                    keys.push(key);
                }

                Ok(Self::Fork { argv, keys })
            }
            ZygoteCommand::Reap => {
                expect_no_descriptors("reap", descriptor_count)?;
                Ok(Self::Reap {
                    pid: decode_pid(&mut reader)?,
                })
            }
            ZygoteCommand::DidProcessCrash => {
                expect_no_descriptors("crash check", descriptor_count)?;
                Ok(Self::DidProcessCrash {
                    pid: decode_pid(&mut reader)?,
                })
            }
        }
    }
}

/// Zygote answer to a fork request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForkReply {
    Spawned(i32),
    Failed(String),
}

impl ForkReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = MessageWriter::new();
        match self {
            Self::Spawned(pid) => {
                writer.encode_bool(true).encode_int(*pid);
            }
            Self::Failed(reason) => {
                writer.encode_bool(false).encode_string(reason);
            }
        }
        writer.finish()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = MessageReader::new(payload)?;
        if reader.decode_bool()? {
            Ok(Self::Spawned(decode_pid(&mut reader)?))
        } else {
            Ok(Self::Failed(reader.decode_string()?))
        }
    }
}

impl CrashStatus {
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = MessageWriter::new();
        writer.encode_bool(self.crashed).encode_bool(self.exited);
        writer.finish()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = MessageReader::new(payload)?;
        Ok(Self {
            crashed: reader.decode_bool()?,
            exited: reader.decode_bool()?,
        })
    }
}

/// Font lookup as issued by a worker
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FontQuery {
    /// Previously matched file the worker would like to keep using
    pub fileid: Option<u32>,
    pub is_bold: bool,
    pub is_italic: bool,
    pub family: String,
}

/// Successful font match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FontMatch {
    pub fileid: u32,
    pub family: String,
}

/// A decoded worker request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxRequest {
    FontMatch(FontQuery),
    FontOpen { fileid: u32 },
    FamilyForChars { chars: Vec<u32> },
}

impl SandboxRequest {
    pub fn method(&self) -> SandboxMethod {
        match self {
            Self::FontMatch(_) => SandboxMethod::FontMatch,
            Self::FontOpen { .. } => SandboxMethod::FontOpen,
            Self::FamilyForChars { .. } => SandboxMethod::GetFontFamilyForChars,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = MessageWriter::new();
        writer.encode_int(self.method() as i32);

        match self {
            Self::FontMatch(query) => {
                writer.encode_bool(query.fileid.is_some());
                if let Some(fileid) = query.fileid {
                    writer.encode_u32(fileid);
                }
                writer
                    .encode_bool(query.is_bold)
                    .encode_bool(query.is_italic)
                    .encode_string(&query.family);
            }
            Self::FontOpen { fileid } => {
                writer.encode_u32(*fileid);
            }
            Self::FamilyForChars { chars } => {
                writer.encode_int(chars.len() as i32);
                for code in chars {
                    writer.encode_u32(*code);
                }
            }
        }

        writer.finish()
    }

    pub fn decode(payload: &[u8], descriptor_count: usize) -> Result<Self> {
        let mut reader = MessageReader::new(payload)?;
        let method = SandboxMethod::try_from(reader.decode_int()?)?;
        expect_no_descriptors("sandbox request", descriptor_count)?;

        match method {
            SandboxMethod::FontMatch => {
                let fileid = if reader.decode_bool()? {
                    Some(reader.decode_u32()?)
                } else {
                    None
                };
                Ok(Self::FontMatch(FontQuery {
                    fileid,
                    is_bold: reader.decode_bool()?,
                    is_italic: reader.decode_bool()?,
                    family: reader.decode_string()?,
                }))
            }
            SandboxMethod::FontOpen => Ok(Self::FontOpen {
                fileid: reader.decode_u32()?,
            }),
            SandboxMethod::GetFontFamilyForChars => {
                let count = reader.decode_count()?;
                let mut chars = Vec::with_capacity(count);
                for _ in 0..count {
                    chars.push(reader.decode_u32()?);
                }
                Ok(Self::FamilyForChars { chars })
            }
        }
    }
}

/// Helper answer; its shape is fixed by the method of the pending request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxReply {
    FontMatch(Option<FontMatch>),
    /// When `found`, exactly one descriptor accompanies the reply
    FontOpen { found: bool },
    FamilyForChars(String),
}

impl SandboxReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = MessageWriter::new();

        match self {
            Self::FontMatch(None) => {
                writer.encode_bool(false);
            }
            Self::FontMatch(Some(found)) => {
                writer
                    .encode_bool(true)
                    .encode_u32(found.fileid)
                    .encode_string(&found.family);
            }
            Self::FontOpen { found } => {
                writer.encode_bool(*found);
            }
            Self::FamilyForChars(family) => {
                writer.encode_string(family);
            }
        }

        writer.finish()
    }

    pub fn decode(method: SandboxMethod, payload: &[u8], descriptor_count: usize) -> Result<Self> {
        let mut reader = MessageReader::new(payload)?;

        match method {
            SandboxMethod::FontMatch => {
                expect_no_descriptors("font match reply", descriptor_count)?;
                if !reader.decode_bool()? {
                    return Ok(Self::FontMatch(None));
                }
                Ok(Self::FontMatch(Some(FontMatch {
                    fileid: reader.decode_u32()?,
                    family: reader.decode_string()?,
                })))
            }
            SandboxMethod::FontOpen => {
                let found = reader.decode_bool()?;
                let expected = usize::from(found);
                if descriptor_count != expected {
                    return Err(ZygoteError::malformed(format!(
                        "font open reply (found={}) carries {} descriptors",
                        found, descriptor_count
                    )));
                }
                Ok(Self::FontOpen { found })
            }
            SandboxMethod::GetFontFamilyForChars => {
                expect_no_descriptors("family reply", descriptor_count)?;
                Ok(Self::FamilyForChars(reader.decode_string()?))
            }
        }
    }
}
