use crate::error::{constants, ProtocolError, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Header size: `uint32 length | uint8 encryptedFlag`
pub const HEADER_LEN: usize = 5;

/// A single unit of wire transfer.
///
/// The length field is never stored; it is always derived from `payload`, so
/// the header can not disagree with the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub encrypted: bool,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(encrypted: bool, payload: impl Into<Bytes>) -> Self {
        Self {
            encrypted,
            payload: payload.into(),
        }
    }

    pub fn plain(payload: impl Into<Bytes>) -> Self {
        Self::new(false, payload)
    }

    /// Byte count of the payload (header excluded).
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Append the encoded frame to `dst`.
    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_LEN + self.payload.len());
        dst.put_u32(self.payload.len() as u32);
        dst.put_u8(u8::from(self.encrypted));
        dst.put_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        self.write_to(&mut buf);
        buf.to_vec()
    }

    /// Decode exactly one frame from a complete buffer.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(ProtocolError::Underrun {
                needed: HEADER_LEN,
                remaining: data.len(),
            });
        }
        let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let encrypted = decode_flag(data[4])?;
        let body = &data[HEADER_LEN..];
        if body.len() < length {
            return Err(ProtocolError::Underrun {
                needed: length,
                remaining: body.len(),
            });
        }
        if body.len() > length {
            return Err(ProtocolError::MalformedFrame(
                constants::ERR_TRAILING_BYTES.into(),
            ));
        }
        Ok(Self::new(encrypted, Bytes::copy_from_slice(body)))
    }
}

pub(crate) fn decode_flag(flag: u8) -> Result<bool> {
    match flag {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(ProtocolError::MalformedFrame(format!(
            "{} (got {other})",
            constants::ERR_INVALID_FLAG
        ))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let frame = Frame::new(true, vec![0xAA, 0xBB, 0xCC]);
        assert_eq!(frame.to_bytes(), vec![0, 0, 0, 3, 1, 0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn test_empty_payload_round_trip() {
        let frame = Frame::plain(Bytes::new());
        let bytes = frame.to_bytes();
        assert_eq!(bytes, vec![0, 0, 0, 0, 0]);
        assert_eq!(Frame::from_bytes(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_truncated_body_is_underrun() {
        let result = Frame::from_bytes(&[0, 0, 0, 4, 0, 1, 2]);
        assert!(matches!(result, Err(ProtocolError::Underrun { .. })));
    }

    #[test]
    fn test_invalid_flag_rejected() {
        let result = Frame::from_bytes(&[0, 0, 0, 1, 7, 0]);
        assert!(matches!(result, Err(ProtocolError::MalformedFrame(_))));
    }
}
