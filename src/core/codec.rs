//! # Frame Codec
//!
//! Tokio codec translating between a raw byte stream and discrete [`Frame`]s.
//!
//! Decoding is a two-state machine:
//! - `AwaitingHeader`: needs 5 bytes (length + encryption flag)
//! - `AwaitingBody`: needs `size` bytes of payload
//!
//! `FramedRead` calls [`Decoder::decode`] repeatedly until it yields `None`, so a
//! single readable-data event greedily produces every complete frame in the
//! buffer. Partial data stays in the buffer (and the state remembers a consumed
//! header) until more bytes arrive.

use crate::config::MAX_PAYLOAD_SIZE;
use crate::core::frame::{decode_flag, Frame, HEADER_LEN};
use crate::error::{ProtocolError, Result};
use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    AwaitingHeader,
    AwaitingBody { size: usize, encrypted: bool },
}

/// Length-prefixed frame codec with an upper bound on payload size.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    state: DecodeState,
    max_payload_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD_SIZE)
    }
}

impl FrameCodec {
    pub fn new(max_payload_size: usize) -> Self {
        Self {
            state: DecodeState::AwaitingHeader,
            max_payload_size,
        }
    }

    /// Whether a header has been consumed and its body is still outstanding.
    pub fn is_mid_frame(&self) -> bool {
        matches!(self.state, DecodeState::AwaitingBody { .. })
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        loop {
            match self.state {
                DecodeState::AwaitingHeader => {
                    if src.len() < HEADER_LEN {
                        return Ok(None);
                    }
                    let size = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
                    if size > self.max_payload_size {
                        return Err(ProtocolError::OversizedFrame(size));
                    }
                    let encrypted = decode_flag(src[4])?;
                    src.advance(HEADER_LEN);
                    src.reserve(size);
                    self.state = DecodeState::AwaitingBody { size, encrypted };
                }
                DecodeState::AwaitingBody { size, encrypted } => {
                    if src.len() < size {
                        return Ok(None);
                    }
                    let payload = src.split_to(size).freeze();
                    self.state = DecodeState::AwaitingHeader;
                    return Ok(Some(Frame { encrypted, payload }));
                }
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        if frame.payload.len() > self.max_payload_size {
            return Err(ProtocolError::OversizedFrame(frame.payload.len()));
        }
        frame.write_to(dst);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn encoded(frame: &Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::default().encode(frame.clone(), &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_partial_header_preserves_buffer() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&[0u8, 0, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);
        assert!(!codec.is_mid_frame());
    }

    #[test]
    fn test_partial_body_resumes_on_next_read() {
        let mut codec = FrameCodec::default();
        let full = encoded(&Frame::new(true, vec![1, 2, 3, 4, 5, 6]));

        let mut buf = BytesMut::from(&full[..8]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(codec.is_mid_frame());
        // Header consumed, partial body kept
        assert_eq!(buf.len(), 3);

        buf.extend_from_slice(&full[8..]);
        let frame = codec.decode(&mut buf).unwrap().expect("frame");
        assert!(frame.encrypted);
        assert_eq!(&frame.payload[..], &[1, 2, 3, 4, 5, 6]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_multiple_frames_in_one_read() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encoded(&Frame::plain(vec![1])));
        buf.extend_from_slice(&encoded(&Frame::plain(Bytes::new())));
        buf.extend_from_slice(&encoded(&Frame::new(true, vec![2, 3])));
        // Trailing partial header of a fourth frame
        buf.extend_from_slice(&[0, 0]);

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        let third = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&first.payload[..], &[1]);
        assert!(second.payload.is_empty());
        assert_eq!(&third.payload[..], &[2, 3]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_oversized_header_rejected_before_allocation() {
        let mut codec = FrameCodec::new(1024);
        let mut buf = BytesMut::from(&[0u8, 0, 0x10, 0, 0][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::OversizedFrame(4096))
        ));
    }

    #[test]
    fn test_bad_flag_rejected() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 1, 9, 0][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_encoder_refuses_oversized_payload() {
        let mut codec = FrameCodec::new(4);
        let mut buf = BytesMut::new();
        assert!(codec.encode(Frame::plain(vec![0; 5]), &mut buf).is_err());
        assert!(buf.is_empty());
    }
}
