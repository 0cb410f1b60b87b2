use crate::config::types::{Result, ZygoteError};
use crate::ipc::channel::{Channel, ChannelLimits, Message};
use crate::ipc::protocol::{FontMatch, FontQuery, SandboxReply, SandboxRequest};
use log::debug;
use std::fs::File;

/// Worker-side caller of the sandbox helper's font methods.
///
/// One request at a time: each call sends and then blocks for the reply.
#[derive(Debug)]
pub struct FontClient {
    channel: Channel,
    limits: ChannelLimits,
}

impl FontClient {
    pub fn new(channel: Channel, limits: ChannelLimits) -> Self {
        Self { channel, limits }
    }

    /// Find the best font for `query`; `None` when nothing matches
    pub fn match_font(&self, query: &FontQuery) -> Result<Option<FontMatch>> {
        let request = SandboxRequest::FontMatch(query.clone());
        match self.call(&request)? {
            (SandboxReply::FontMatch(found), _) => Ok(found),
            (other, _) => Err(unexpected(&request, &other)),
        }
    }

    /// Open a previously matched font file
    pub fn open_font(&self, fileid: u32) -> Result<Option<File>> {
        let request = SandboxRequest::FontOpen { fileid };
        match self.call(&request)? {
            (SandboxReply::FontOpen { found: false }, _) => Ok(None),
            (SandboxReply::FontOpen { found: true }, mut descriptors) => {
                // Exactly one descriptor is guaranteed by the reply decoder.
                let fd = descriptors.pop().ok_or_else(|| {
                    ZygoteError::Protocol("font open reply lost its descriptor".to_string())
                })?;
                Ok(Some(File::from(fd)))
            }
            (other, _) => Err(unexpected(&request, &other)),
        }
    }

    /// Family able to render every code point in `chars`, empty if none
    pub fn family_for_chars(&self, chars: &[u32]) -> Result<String> {
        let request = SandboxRequest::FamilyForChars {
            chars: chars.to_vec(),
        };
        match self.call(&request)? {
            (SandboxReply::FamilyForChars(family), _) => Ok(family),
            (other, _) => Err(unexpected(&request, &other)),
        }
    }

    fn call(&self, request: &SandboxRequest) -> Result<(SandboxReply, Vec<std::os::fd::OwnedFd>)> {
        debug!("Sandbox request {:?}", request.method());
        let payload = request.encode();
        // The helper drops oversized requests without a reply.
        self.limits
            .check_outgoing(&payload, 0)
            .map_err(as_protocol)?;
        self.channel.send(&payload, &[])?;

        let Message {
            payload,
            descriptors,
        } = self
            .channel
            .receive(self.limits.max_payload, 1)
            .map_err(as_protocol)?;

        let reply = SandboxReply::decode(request.method(), &payload, descriptors.len())
            .map_err(as_protocol)?;
        Ok((reply, descriptors))
    }
}

fn as_protocol(error: ZygoteError) -> ZygoteError {
    match error {
        ZygoteError::Truncated(what) | ZygoteError::MalformedMessage(what) => {
            ZygoteError::Protocol(what)
        }
        other => other,
    }
}

fn unexpected(request: &SandboxRequest, reply: &SandboxReply) -> ZygoteError {
    ZygoteError::Protocol(format!(
        "{:?} answered with {:?}",
        request.method(),
        reply
    ))
}
