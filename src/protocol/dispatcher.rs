use crate::config::{TransportConfig, DEFAULT_MAX_INBOUND_BUFFER, DEFAULT_MAX_INBOUND_TRANSFERS};
use crate::error::{ProtocolError, Result};
use crate::protocol::message::{Chunk, Event, Response};
use crate::protocol::pending::PendingRequests;
use crate::protocol::upload::ChunkAssembler;
use crate::protocol::wire::Inbound;
use crate::utils::metrics::Metrics;
use crate::utils::timeout::unix_millis;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Where a decoded inbound frame ended up.
#[derive(Debug)]
pub enum Routed {
    /// Consumed internally (matched response, partial transfer, pong, drop).
    Consumed,
    /// Unsolicited data for subscribers.
    Event(Event),
    /// Result of the connection's own authentication request.
    Authentication(Result<Response>),
}

/// Bounds on relay-pushed transfers held in memory at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadLimits {
    /// Transfers being reassembled concurrently.
    pub max_transfers: usize,
    /// Bytes buffered across all of them, the arriving chunk included.
    pub max_buffered: usize,
}

impl Default for DownloadLimits {
    fn default() -> Self {
        Self {
            max_transfers: DEFAULT_MAX_INBOUND_TRANSFERS,
            max_buffered: DEFAULT_MAX_INBOUND_BUFFER,
        }
    }
}

impl From<&TransportConfig> for DownloadLimits {
    fn from(config: &TransportConfig) -> Self {
        Self {
            max_transfers: config.max_inbound_transfers,
            max_buffered: config.max_inbound_buffer,
        }
    }
}

/// Routes decoded frames: responses to the pending table, everything else to
/// event subscribers. Owns the per-connection correlation state.
#[derive(Debug)]
pub struct Dispatcher {
    pub(crate) pending: PendingRequests,
    downloads: HashMap<u32, ChunkAssembler>,
    limits: DownloadLimits,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            pending: PendingRequests::new(),
            downloads: HashMap::new(),
            limits: DownloadLimits::default(),
            metrics,
        }
    }

    pub fn with_limits(mut self, limits: DownloadLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Transfers started by the relay but not finished yet.
    pub fn downloads_in_progress(&self) -> usize {
        self.downloads.len()
    }

    /// Route one frame. Errors are protocol faults for the connection.
    pub fn dispatch(&mut self, inbound: Inbound) -> Result<Routed> {
        match inbound {
            Inbound::Response { request_id, result } => match self.pending.take(request_id) {
                Some((completion, elapsed)) => {
                    self.metrics.response_matched();
                    debug!(request_id, elapsed = ?elapsed, ok = result.is_ok(), "Response matched");
                    Ok(completion
                        .complete(result)
                        .map_or(Routed::Consumed, Routed::Authentication))
                }
                None => {
                    // Late after a timeout or cancel; benign
                    self.metrics.response_dropped();
                    debug!(request_id, "Dropping response with no pending request");
                    Ok(Routed::Consumed)
                }
            },
            Inbound::Event(event) => Ok(Routed::Event(event)),
            Inbound::Chunk(chunk) => {
                let transfer_id = chunk.transfer_id;
                if let Err(e) = self.admit(&chunk) {
                    self.downloads.remove(&transfer_id);
                    return Err(e);
                }
                let assembler = self
                    .downloads
                    .entry(transfer_id)
                    .or_insert_with(|| ChunkAssembler::new(transfer_id));
                match assembler.push(chunk) {
                    Ok(Some(data)) => {
                        self.downloads.remove(&transfer_id);
                        debug!(transfer_id, bytes = data.len(), "Inbound transfer complete");
                        Ok(Routed::Event(Event::Attachment { transfer_id, data }))
                    }
                    Ok(None) => Ok(Routed::Consumed),
                    Err(e) => {
                        self.downloads.remove(&transfer_id);
                        Err(e)
                    }
                }
            }
            Inbound::Pong { sent_at } => {
                trace!(rtt_ms = unix_millis().saturating_sub(sent_at), "Pong");
                Ok(Routed::Consumed)
            }
        }
    }

    /// Refuse a chunk that would open one transfer too many or push the
    /// buffered total past the limit.
    fn admit(&self, chunk: &Chunk) -> Result<()> {
        let active = self.downloads.len();
        if active >= self.limits.max_transfers && !self.downloads.contains_key(&chunk.transfer_id) {
            return Err(ProtocolError::TransferLimit(format!(
                "{active} transfers already in progress"
            )));
        }
        let buffered: usize = self.downloads.values().map(ChunkAssembler::received).sum();
        if buffered + chunk.data.len() > self.limits.max_buffered {
            return Err(ProtocolError::TransferLimit(format!(
                "{} bytes would be buffered, limit is {}",
                buffered + chunk.data.len(),
                self.limits.max_buffered
            )));
        }
        Ok(())
    }

    /// Drop everything tied to the connection. Pending callers are failed with
    /// `ConnectionLost` and partial transfers are discarded.
    pub fn connection_lost(&mut self) -> usize {
        let failed = self.pending.fail_all();
        if !self.downloads.is_empty() {
            debug!(count = self.downloads.len(), "Discarding partial inbound transfers");
            self.downloads.clear();
        }
        self.metrics.requests_lost(failed as u64);
        failed
    }
}
