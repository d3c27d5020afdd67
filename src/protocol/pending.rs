//! Pending request table.
//!
//! Every correlated request is registered here before it is transmitted and
//! leaves the table exactly once: matched by a response, cancelled, expired by
//! its deadline, or failed because the connection went away. Deadlines live in
//! a [`DelayQueue`] next to the map so expiry costs nothing while idle.

use super::message::Response;
use crate::error::{ProtocolError, Result};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::time::delay_queue::{DelayQueue, Key};

/// Who is waiting for a response.
#[derive(Debug)]
pub enum Completion {
    /// An application caller.
    Caller(oneshot::Sender<Result<Response>>),
    /// The connection's own authentication step.
    Authentication,
}

impl Completion {
    /// Deliver `result` to a caller. Returns the result back for the
    /// authentication step.
    pub fn complete(self, result: Result<Response>) -> Option<Result<Response>> {
        match self {
            Completion::Caller(reply) => {
                // The caller may have stopped waiting
                let _ = reply.send(result);
                None
            }
            Completion::Authentication => Some(result),
        }
    }
}

#[derive(Debug)]
struct PendingEntry {
    kind: &'static str,
    issued_at: Instant,
    deadline: Key,
    completion: Completion,
}

/// An entry removed by its deadline.
#[derive(Debug)]
pub struct Expired {
    pub request_id: u32,
    pub kind: &'static str,
    pub waited: Duration,
    pub completion: Completion,
}

#[derive(Debug, Default)]
pub struct PendingRequests {
    entries: HashMap<u32, PendingEntry>,
    deadlines: DelayQueue<u32>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, request_id: u32) -> bool {
        self.entries.contains_key(&request_id)
    }

    /// Register before transmitting. A duplicate id is refused and the
    /// completion handed back untouched. Needs the Tokio timer.
    pub fn register(
        &mut self,
        request_id: u32,
        kind: &'static str,
        timeout: Duration,
        completion: Completion,
    ) -> std::result::Result<(), Completion> {
        if self.entries.contains_key(&request_id) {
            return Err(completion);
        }
        let deadline = self.deadlines.insert(request_id, timeout);
        self.entries.insert(
            request_id,
            PendingEntry {
                kind,
                issued_at: Instant::now(),
                deadline,
                completion,
            },
        );
        Ok(())
    }

    /// Remove the entry for `request_id`, if it is still pending.
    pub fn take(&mut self, request_id: u32) -> Option<(Completion, Duration)> {
        let entry = self.entries.remove(&request_id)?;
        self.deadlines.remove(&entry.deadline);
        Some((entry.completion, entry.issued_at.elapsed()))
    }

    /// Resolve with `result`. Returns `false` when nothing was pending under
    /// that id (late or duplicate response).
    pub fn resolve(&mut self, request_id: u32, result: Result<Response>) -> bool {
        match self.take(request_id) {
            Some((completion, _)) => {
                completion.complete(result);
                true
            }
            None => false,
        }
    }

    pub fn cancel(&mut self, request_id: u32) -> bool {
        self.resolve(request_id, Err(ProtocolError::Cancelled))
    }

    /// Wait for the next deadline to pass. Resolves to `None` immediately
    /// when the table is empty, so guard the call with [`Self::is_empty`].
    pub async fn next_expired(&mut self) -> Option<Expired> {
        let expired = self.deadlines.next().await?;
        let request_id = expired.into_inner();
        let entry = self.entries.remove(&request_id)?;
        Some(Expired {
            request_id,
            kind: entry.kind,
            waited: entry.issued_at.elapsed(),
            completion: entry.completion,
        })
    }

    /// Fail every outstanding request with [`ProtocolError::ConnectionLost`].
    /// Returns how many callers were failed.
    pub fn fail_all(&mut self) -> usize {
        self.deadlines.clear();
        let mut failed = 0;
        for (_, entry) in self.entries.drain() {
            if entry.completion.complete(Err(ProtocolError::ConnectionLost)).is_none() {
                failed += 1;
            }
        }
        failed
    }
}

/// Source of request ids, shared by the connection handle and the driver.
///
/// Ids wrap around and never take the value 0.
#[derive(Debug)]
pub struct RequestIdGenerator {
    next: AtomicU32,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }

    pub fn next_id(&self) -> u32 {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn caller() -> (Completion, oneshot::Receiver<Result<Response>>) {
        let (tx, rx) = oneshot::channel();
        (Completion::Caller(tx), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_delivers_to_caller() {
        let mut table = PendingRequests::new();
        let (completion, rx) = caller();
        table
            .register(1, "mark_read", Duration::from_secs(5), completion)
            .unwrap();
        assert!(table.resolve(1, Ok(Response::Ack)));
        assert!(table.is_empty());
        assert_eq!(rx.await.unwrap().unwrap(), Response::Ack);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_id_refused() {
        let mut table = PendingRequests::new();
        let (first, _rx1) = caller();
        let (second, _rx2) = caller();
        table.register(3, "a", Duration::from_secs(1), first).unwrap();
        assert!(table.register(3, "b", Duration::from_secs(1), second).is_err());
        assert_eq!(table.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expires_entry_and_late_response_is_dropped() {
        let mut table = PendingRequests::new();
        let (completion, _rx) = caller();
        table
            .register(9, "fetch_messages", Duration::from_secs(2), completion)
            .unwrap();

        let expired = table.next_expired().await.expect("entry expires");
        assert_eq!(expired.request_id, 9);
        assert!(expired.waited >= Duration::from_secs(2));
        assert!(table.is_empty());
        assert!(!table.resolve(9, Ok(Response::Ack)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolved_entry_never_expires() {
        let mut table = PendingRequests::new();
        let (a, _rx_a) = caller();
        let (b, _rx_b) = caller();
        table.register(1, "a", Duration::from_secs(1), a).unwrap();
        table.register(2, "b", Duration::from_secs(3), b).unwrap();
        assert!(table.resolve(1, Ok(Response::Ack)));

        let expired = table.next_expired().await.unwrap();
        assert_eq!(expired.request_id, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_all_reports_connection_lost() {
        let mut table = PendingRequests::new();
        let (a, rx_a) = caller();
        let (b, rx_b) = caller();
        table.register(1, "a", Duration::from_secs(1), a).unwrap();
        table.register(2, "b", Duration::from_secs(1), b).unwrap();
        table
            .register(3, "authenticate", Duration::from_secs(1), Completion::Authentication)
            .unwrap();

        assert_eq!(table.fail_all(), 2);
        assert!(table.is_empty());
        assert!(matches!(rx_a.await.unwrap(), Err(ProtocolError::ConnectionLost)));
        assert!(matches!(rx_b.await.unwrap(), Err(ProtocolError::ConnectionLost)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() {
        let mut table = PendingRequests::new();
        let (completion, rx) = caller();
        table.register(4, "a", Duration::from_secs(1), completion).unwrap();
        assert!(table.cancel(4));
        assert!(!table.cancel(4));
        assert!(matches!(rx.await.unwrap(), Err(ProtocolError::Cancelled)));
    }

    #[test]
    fn test_ids_skip_zero_on_wrap() {
        let ids = RequestIdGenerator {
            next: AtomicU32::new(u32::MAX),
        };
        assert_eq!(ids.next_id(), u32::MAX);
        assert_eq!(ids.next_id(), 1);
    }
}
