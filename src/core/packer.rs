//! # Binary Packer / Unpacker
//!
//! Typed big-endian serialization used to build and parse every protocol payload.
//!
//! ## Encoding
//! - Integers: fixed width, big-endian (same byte order as the frame header)
//! - `bool`: one byte, `0` or `1`
//! - `string`: `uint32` byte length followed by UTF-8 bytes
//! - `blob`: `uint32` byte length followed by raw bytes
//!
//! The [`Unpacker`] only moves forward. Every read checks the remaining length
//! first and fails with [`ProtocolError::Underrun`] instead of panicking.

use crate::error::{constants, ProtocolError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Accumulates typed writes into a growing buffer.
#[derive(Debug, Default)]
pub struct Packer {
    buf: BytesMut,
}

impl Packer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.buf.put_u8(u8::from(value));
        self
    }

    pub fn write_i32(&mut self, value: i32) -> &mut Self {
        self.buf.put_i32(value);
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32(value);
        self
    }

    pub fn write_i64(&mut self, value: i64) -> &mut Self {
        self.buf.put_i64(value);
        self
    }

    /// Length-prefixed UTF-8 string.
    pub fn write_string(&mut self, value: &str) -> &mut Self {
        self.write_blob(value.as_bytes())
    }

    /// Length-prefixed raw bytes.
    pub fn write_blob(&mut self, value: &[u8]) -> &mut Self {
        self.buf.reserve(4 + value.len());
        self.buf.put_u32(value.len() as u32);
        self.buf.put_slice(value);
        self
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Yield the final immutable byte sequence.
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Forward-only cursor over an immutable payload.
#[derive(Debug, Clone)]
pub struct Unpacker {
    buf: Bytes,
}

impl Unpacker {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn is_empty(&self) -> bool {
        !self.buf.has_remaining()
    }

    #[inline]
    fn ensure(&self, needed: usize) -> Result<()> {
        let remaining = self.buf.remaining();
        if remaining < needed {
            return Err(ProtocolError::Underrun { needed, remaining });
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    /// Reads one byte; anything other than 0 or 1 is malformed.
    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtocolError::MalformedFrame(format!(
                "invalid boolean byte {other}"
            ))),
        }
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.ensure(4)?;
        Ok(self.buf.get_i32())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.ensure(8)?;
        Ok(self.buf.get_i64())
    }

    /// Length-prefixed raw bytes (zero-copy slice of the input).
    pub fn read_blob(&mut self) -> Result<Bytes> {
        let len = self.read_u32()? as usize;
        self.ensure(len)?;
        Ok(self.buf.split_to(len))
    }

    pub fn read_string(&mut self) -> Result<String> {
        let raw = self.read_blob()?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| ProtocolError::MalformedFrame(constants::ERR_INVALID_UTF8.into()))
    }

    /// Consume and return everything that is left.
    pub fn read_rest(&mut self) -> Bytes {
        let len = self.buf.remaining();
        self.buf.split_to(len)
    }

    /// Assert the payload was consumed completely.
    pub fn finish(&self) -> Result<()> {
        if self.buf.has_remaining() {
            return Err(ProtocolError::MalformedFrame(format!(
                "{} ({} bytes)",
                constants::ERR_TRAILING_BYTES,
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}
