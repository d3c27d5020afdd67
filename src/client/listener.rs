//! Connection listeners.
//!
//! Listeners are invoked in registration order. Delivery works on a snapshot
//! taken when the event starts, so a listener registered from inside a
//! callback is first invoked for the next event, and one removed from inside a
//! callback still receives the event in flight.

use crate::error::DisconnectReason;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Receives connection lifecycle callbacks. All methods default to no-ops.
pub trait ConnectionListener: Send + Sync + 'static {
    fn on_connecting(&self) {}

    fn on_open(&self) {}

    /// `reason` is `None` for an intentional disconnect.
    fn on_close(&self, _reason: Option<&DisconnectReason>) {}
}

/// Handle returned by [`ListenerRegistry::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn ConnectionListener>)>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<(ListenerId, Arc<dyn ConnectionListener>)>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(&self, listener: Arc<dyn ConnectionListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries().push((id, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<dyn ConnectionListener>> {
        self.entries()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect()
    }

    pub fn notify_connecting(&self) {
        for listener in self.snapshot() {
            listener.on_connecting();
        }
    }

    pub fn notify_open(&self) {
        for listener in self.snapshot() {
            listener.on_open();
        }
    }

    pub fn notify_close(&self, reason: Option<&DisconnectReason>) {
        for listener in self.snapshot() {
            listener.on_close(reason);
        }
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}
