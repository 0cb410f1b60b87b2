//! Message codec.
//!
//! Layout: a 4-byte little-endian header with the body length, then fields
//! aligned to 4 bytes, decoded strictly in the order they were encoded.
//!
//! | field  | encoding                                   |
//! |--------|--------------------------------------------|
//! | int    | i32 LE                                     |
//! | u32    | u32 LE                                     |
//! | bool   | int, 0 or 1                                |
//! | string | u32 LE byte length, UTF-8 bytes, zero pad  |

use crate::config::types::{Result, ZygoteError};

const HEADER_BYTES: usize = 4;
const ALIGNMENT: usize = 4;

fn padded(len: usize) -> usize {
    (len + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

/// Builds one message payload
#[derive(Debug, Clone)]
pub struct MessageWriter {
    buf: Vec<u8>,
}

impl Default for MessageWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageWriter {
    pub fn new() -> Self {
        Self {
            buf: vec![0u8; HEADER_BYTES],
        }
    }

    pub fn encode_int(&mut self, value: i32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn encode_u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn encode_bool(&mut self, value: bool) -> &mut Self {
        self.encode_int(i32::from(value))
    }

    pub fn encode_string(&mut self, value: &str) -> &mut Self {
        let bytes = value.as_bytes();
        self.encode_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
        self.buf.resize(self.buf.len() + padded(bytes.len()) - bytes.len(), 0);
        self
    }

    /// Number of descriptors travelling with the message
    pub fn encode_descriptor_count(&mut self, count: usize) -> &mut Self {
        self.encode_u32(count as u32)
    }

    /// Fill in the header and hand out the payload
    pub fn finish(mut self) -> Vec<u8> {
        let body = (self.buf.len() - HEADER_BYTES) as u32;
        self.buf[..HEADER_BYTES].copy_from_slice(&body.to_le_bytes());
        self.buf
    }
}

/// Cursor over one received payload
#[derive(Debug, Clone)]
pub struct MessageReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> MessageReader<'a> {
    /// Validate the header and position the cursor on the first field
    pub fn new(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < HEADER_BYTES {
            return Err(ZygoteError::malformed(format!(
                "payload of {} bytes has no header",
                buf.len()
            )));
        }

        let declared = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let actual = buf.len() - HEADER_BYTES;
        if declared != actual {
            return Err(ZygoteError::malformed(format!(
                "header declares {} body bytes, found {}",
                declared, actual
            )));
        }

        Ok(Self {
            buf,
            pos: HEADER_BYTES,
        })
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(ZygoteError::malformed(format!(
                "buffer underrun reading {}: need {} bytes, {} left",
                what,
                len,
                self.remaining()
            )));
        }

        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_word(&mut self, what: &str) -> Result<[u8; 4]> {
        let bytes = self.take(4, what)?;
        Ok([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    pub fn decode_int(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take_word("int")?))
    }

    pub fn decode_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take_word("u32")?))
    }

    pub fn decode_bool(&mut self) -> Result<bool> {
        match self.decode_int()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ZygoteError::malformed(format!("invalid bool {}", other))),
        }
    }

    pub fn decode_string(&mut self) -> Result<String> {
        let len = self.decode_u32()? as usize;
        if len > self.remaining() {
            return Err(ZygoteError::malformed(format!(
                "string length {} exceeds the {} bytes left",
                len,
                self.remaining()
            )));
        }

        let bytes = self.take(len, "string")?;
        self.take(padded(len) - len, "string padding")?;

        String::from_utf8(bytes.to_vec())
            .map_err(|_| ZygoteError::malformed("string is not valid UTF-8"))
    }

    /// Descriptor count, rejected when above `limit`
    pub fn decode_descriptor_count(&mut self, limit: usize) -> Result<usize> {
        let count = self.decode_u32()? as usize;
        if count > limit {
            return Err(ZygoteError::malformed(format!(
                "descriptor count {} exceeds limit {}",
                count, limit
            )));
        }
        Ok(count)
    }

    /// Element count of a following list of 4-byte-or-larger fields.
    ///
    /// Bounded by what is left in the buffer so a hostile count cannot force
    /// a large allocation.
    pub fn decode_count(&mut self) -> Result<usize> {
        let count = self.decode_int()?;
        if count < 0 {
            return Err(ZygoteError::malformed(format!("negative count {}", count)));
        }

        let count = count as usize;
        if count > self.remaining() / ALIGNMENT {
            return Err(ZygoteError::malformed(format!(
                "count {} cannot fit in {} remaining bytes",
                count,
                self.remaining()
            )));
        }
        Ok(count)
    }
}
