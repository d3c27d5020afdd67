//! Ordered encryption / decryption stages.
//!
//! Each direction is a single stream consumed by a single task. Crypto work for
//! up to `depth` frames runs concurrently, but `buffered` yields results in
//! submission order, so frame N always leaves the stage before frame N+1 no
//! matter which operation finishes first. The two directions are independent.

use crate::core::frame::Frame;
use crate::error::{ProtocolError, Result};
use crate::utils::crypto::FrameCipher;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::sync::Arc;

/// A payload queued for writing.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub encrypted: bool,
    pub payload: Bytes,
}

/// Outbound stage: plaintext payloads in, wire frames out, FIFO.
pub fn outbound<S>(
    payloads: S,
    cipher: Option<Arc<dyn FrameCipher>>,
    depth: usize,
) -> impl Stream<Item = Result<Frame>>
where
    S: Stream<Item = Outbound>,
{
    payloads
        .map(move |item| {
            let cipher = cipher.clone();
            async move {
                if !item.encrypted {
                    return Ok(Frame::plain(item.payload));
                }
                let cipher = cipher.ok_or(ProtocolError::EncryptionFailure)?;
                let sealed = cipher.encrypt(item.payload).await?;
                Ok(Frame::new(true, sealed))
            }
        })
        .buffered(depth.max(1))
}

/// Inbound stage: wire frames in, plaintext frames out, FIFO.
///
/// Decrypted frames keep `encrypted = true` so the protocol layer can tell how
/// they arrived.
pub fn inbound<S>(
    frames: S,
    cipher: Option<Arc<dyn FrameCipher>>,
    depth: usize,
) -> impl Stream<Item = Result<Frame>>
where
    S: Stream<Item = Result<Frame>>,
{
    frames
        .map(move |item| {
            let cipher = cipher.clone();
            async move {
                let frame = item?;
                if !frame.encrypted {
                    return Ok(frame);
                }
                let cipher = cipher.ok_or(ProtocolError::DecryptionFailure)?;
                let plaintext = cipher.decrypt(frame.payload).await?;
                Ok(Frame::new(true, plaintext))
            }
        })
        .buffered(depth.max(1))
}
