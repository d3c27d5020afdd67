//! # Socket Session
//!
//! Drives one established TCP stream until it ends.
//!
//! The stream is split. The write half belongs to a writer task fed by the
//! outbound pipeline; the read half is consumed in place through the inbound
//! pipeline. Either side failing ends the session.
//!
//! ## Shutdown
//! On cancellation the writer flushes what is already encoded, half-closes the
//! socket, and exits. If that takes longer than the shutdown timeout the task
//! is aborted and the socket dropped.

use super::pipeline::{self, Outbound};
use super::Signals;
use crate::config::TransportConfig;
use crate::core::codec::FrameCodec;
use crate::error::DisconnectReason;
use crate::utils::crypto::FrameCipher;
use crate::utils::metrics::Metrics;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Per-session context shared by the reader and the writer.
#[derive(Clone)]
pub(crate) struct Link {
    pub cipher: Option<Arc<dyn FrameCipher>>,
    pub config: TransportConfig,
    pub metrics: Arc<Metrics>,
}

/// Run the session. Returns `None` when it ended because it was stopped
/// locally, otherwise the reason it failed.
pub(crate) async fn drive(
    stream: TcpStream,
    outbound: mpsc::Receiver<Outbound>,
    link: &Link,
    signals: &Signals,
    cancel: CancellationToken,
) -> Option<DisconnectReason> {
    let (read_half, write_half) = stream.into_split();

    let writer_cancel = cancel.child_token();
    let mut writer = tokio::spawn(write_loop(
        write_half,
        outbound,
        link.clone(),
        writer_cancel.clone(),
    ));
    let mut writer_done = false;

    let reader = FramedRead::new(read_half, FrameCodec::new(link.config.max_payload_size));
    let frames = pipeline::inbound(reader, link.cipher.clone(), link.config.pipeline_depth);
    tokio::pin!(frames);

    let outcome = loop {
        tokio::select! {
            _ = cancel.cancelled() => break None,
            joined = &mut writer => {
                writer_done = true;
                break match joined {
                    Ok(Ok(())) => None,
                    Ok(Err(reason)) => Some(reason),
                    Err(e) => Some(DisconnectReason::Io(e.to_string())),
                };
            }
            next = frames.next() => match next {
                Some(Ok(frame)) => {
                    link.metrics.frame_received(frame.len() as u64);
                    if !signals.frame(frame).await {
                        break None;
                    }
                }
                Some(Err(e)) => {
                    if e.is_protocol_fault() {
                        link.metrics.protocol_error();
                    }
                    break Some(e.to_disconnect_reason());
                }
                None => break Some(DisconnectReason::RemoteClosed),
            }
        }
    };

    if !writer_done {
        writer_cancel.cancel();
        if tokio::time::timeout(link.config.shutdown_timeout, &mut writer)
            .await
            .is_err()
        {
            warn!("Writer did not finish within shutdown timeout, aborting");
            writer.abort();
        }
    }

    outcome
}

async fn write_loop(
    write_half: OwnedWriteHalf,
    outbound: mpsc::Receiver<Outbound>,
    link: Link,
    cancel: CancellationToken,
) -> Result<(), DisconnectReason> {
    let mut sink = FramedWrite::new(write_half, FrameCodec::new(link.config.max_payload_size));
    let frames = pipeline::outbound(
        ReceiverStream::new(outbound),
        link.cipher.clone(),
        link.config.pipeline_depth,
    );
    tokio::pin!(frames);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = frames.next() => match next {
                Some(Ok(frame)) => {
                    let len = frame.len() as u64;
                    sink.send(frame)
                        .await
                        .map_err(|e| DisconnectReason::WriteFailed(e.to_string()))?;
                    link.metrics.frame_sent(len);
                }
                Some(Err(e)) => return Err(DisconnectReason::WriteFailed(e.to_string())),
                None => break,
            }
        }
    }

    // Graceful half-close; errors here only mean the peer is already gone
    if let Err(e) = sink.flush().await {
        debug!(error = %e, "Flush during shutdown failed");
    }
    let mut write_half = sink.into_inner();
    if let Err(e) = write_half.shutdown().await {
        debug!(error = %e, "Socket shutdown failed");
    }
    Ok(())
}
