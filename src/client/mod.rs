//! # Client Layer
//!
//! The surface applications use: [`ConnectionManager`] for the connection
//! lifecycle and requests, and [`ConnectionListener`] for lifecycle callbacks.

pub mod connection;
pub mod listener;

pub use connection::{ConnectionManager, ConnectionState, PendingCall};
pub use listener::{ConnectionListener, ListenerId, ListenerRegistry};
