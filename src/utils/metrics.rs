//! Observability and Metrics
//!
//! Counters for connection lifecycle, frame traffic and request correlation.
//!
//! Uses atomic counters so the transport tasks and the connection driver can
//! record without locking. One [`Metrics`] instance is shared per connection
//! manager.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Metrics collector for one connection manager
#[derive(Debug)]
pub struct Metrics {
    /// Socket connect attempts (primary and fallback)
    pub connect_attempts: AtomicU64,
    /// Attempts that went to the fallback address
    pub fallback_attempts: AtomicU64,
    /// Sessions that reached the connected state
    pub connections_established: AtomicU64,
    /// Automatic reconnects scheduled
    pub reconnects_scheduled: AtomicU64,
    /// Frames written to the socket
    pub frames_sent: AtomicU64,
    /// Frames read from the socket
    pub frames_received: AtomicU64,
    /// Payload bytes written
    pub bytes_sent: AtomicU64,
    /// Payload bytes read
    pub bytes_received: AtomicU64,
    /// Correlated requests issued
    pub requests_sent: AtomicU64,
    /// Responses matched to a pending request
    pub responses_matched: AtomicU64,
    /// Responses without a pending request (late or duplicate)
    pub responses_dropped: AtomicU64,
    /// Requests failed by their deadline
    pub requests_timed_out: AtomicU64,
    /// Requests failed by connection loss
    pub requests_lost: AtomicU64,
    /// Unsolicited events delivered
    pub events_delivered: AtomicU64,
    /// Connections ended by a protocol fault
    pub protocol_errors: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connect_attempts: AtomicU64::new(0),
            fallback_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            reconnects_scheduled: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            requests_sent: AtomicU64::new(0),
            responses_matched: AtomicU64::new(0),
            responses_dropped: AtomicU64::new(0),
            requests_timed_out: AtomicU64::new(0),
            requests_lost: AtomicU64::new(0),
            events_delivered: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a socket connect attempt
    pub fn connect_attempt(&self, fallback: bool) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
        if fallback {
            self.fallback_attempts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnect_scheduled(&self) {
        self.reconnects_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame written to the socket
    pub fn frame_sent(&self, byte_count: u64) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a frame read from the socket
    pub fn frame_received(&self, byte_count: u64) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn request_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn response_matched(&self) {
        self.responses_matched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn response_dropped(&self) {
        self.responses_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_timed_out(&self) {
        self.requests_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests_lost(&self, count: u64) {
        self.requests_lost.fetch_add(count, Ordering::Relaxed);
    }

    pub fn event_delivered(&self) {
        self.events_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            fallback_attempts: self.fallback_attempts.load(Ordering::Relaxed),
            connections_established: self.connections_established.load(Ordering::Relaxed),
            reconnects_scheduled: self.reconnects_scheduled.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            responses_matched: self.responses_matched.load(Ordering::Relaxed),
            responses_dropped: self.responses_dropped.load(Ordering::Relaxed),
            requests_timed_out: self.requests_timed_out.load(Ordering::Relaxed),
            requests_lost: self.requests_lost.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connect_attempts = snapshot.connect_attempts,
            fallback_attempts = snapshot.fallback_attempts,
            connections_established = snapshot.connections_established,
            reconnects_scheduled = snapshot.reconnects_scheduled,
            frames_sent = snapshot.frames_sent,
            frames_received = snapshot.frames_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            requests_sent = snapshot.requests_sent,
            responses_matched = snapshot.responses_matched,
            responses_dropped = snapshot.responses_dropped,
            requests_timed_out = snapshot.requests_timed_out,
            requests_lost = snapshot.requests_lost,
            events_delivered = snapshot.events_delivered,
            protocol_errors = snapshot.protocol_errors,
            uptime_seconds = snapshot.uptime_seconds,
            "Relay client metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connect_attempts: u64,
    pub fallback_attempts: u64,
    pub connections_established: u64,
    pub reconnects_scheduled: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub requests_sent: u64,
    pub responses_matched: u64,
    pub responses_dropped: u64,
    pub requests_timed_out: u64,
    pub requests_lost: u64,
    pub events_delivered: u64,
    pub protocol_errors: u64,
    pub uptime_seconds: u64,
}
