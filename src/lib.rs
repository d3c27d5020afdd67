//! # relay-link
//!
//! Client-side network engine for relay-based messaging.
//!
//! The crate connects an application to a relay over a single byte stream and
//! makes that connection reliable and usable:
//!
//! - **Framing**: `[Length(4, big-endian)] [Encrypted(1)] [Payload]`, with an
//!   order-preserving encrypt/decrypt pipeline on each direction
//! - **Addressing**: a primary relay address with at most one fallback
//!   promotion per connection attempt (default port 1359)
//! - **Lifecycle**: a reconnection state machine with backoff, listener
//!   callbacks, and a caller-settable flag that suppresses reconnection
//! - **Protocol**: version negotiation (v1, v2), authentication, correlated
//!   requests with per-request timeouts, unsolicited event batches, and a
//!   chunked upload sub-protocol
//!
//! ## Layers
//! ```text
//! client     ConnectionManager, listeners, event subscription
//!   │
//! protocol   ProtocolManager, wire encoding, pending requests, uploads
//!   │
//! transport  Transport, pipelines, connect/fallback
//!   │
//! core       Packer/Unpacker, Frame, FrameCodec
//! ```
//!
//! ## Example
//! ```no_run
//! use relay_link::config::ClientConfig;
//! use relay_link::protocol::Request;
//! use relay_link::store::{MemoryStore, RELAY_ADDRESS_KEY, SHARED_SECRET_KEY};
//! use relay_link::ConnectionManager;
//! use std::sync::Arc;
//!
//! # async fn run() -> relay_link::Result<()> {
//! let store = MemoryStore::with_entries([
//!     (RELAY_ADDRESS_KEY, "relay.example.com"),
//!     (SHARED_SECRET_KEY, "correct horse"),
//! ]);
//! let manager = ConnectionManager::new(ClientConfig::default(), Arc::new(store))?;
//! manager.connect().await?;
//! manager.wait_for_state(|s| s.is_connected()).await?;
//!
//! let conversations = manager
//!     .request(Request::FetchConversations { limit: 20, offset: 0 })
//!     .await?;
//! println!("{conversations:?}");
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod store;
pub mod transport;
pub mod utils;

pub use client::{ConnectionListener, ConnectionManager, ConnectionState, PendingCall};
pub use error::{DisconnectReason, ProtocolError, Result};
pub use protocol::{Event, ProtocolVersion, Request, Response};
pub use transport::{Transport, TransportEvent};
