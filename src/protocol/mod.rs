//! # Protocol Layer
//!
//! Versioned command protocol spoken over the transport.
//!
//! ## Components
//! - **message**: request, response and event values
//! - **wire**: command discriminators and shared payload layouts
//! - **version / v1 / v2**: the closed set of protocol versions
//! - **handshake**: hello exchange and authentication digest
//! - **pending**: correlation table with per-request deadlines
//! - **upload**: chunk sequencing and reassembly
//! - **dispatcher**: routing of decoded frames
//! - **manager**: the per-connection state machine tying it together
//!
//! ## Guarantees
//! - The version is selected once per connection and never re-checked per call
//! - A request is registered before its payload is handed to the transport
//! - Responses are correlated by id, not by position
//! - A response with no pending entry is dropped, never fatal

pub mod dispatcher;
pub mod handshake;
pub mod manager;
pub mod message;
pub mod pending;
pub mod upload;
pub mod v1;
pub mod v2;
pub mod version;
pub mod wire;

pub use manager::{Dispatch, Outgoing, ProtocolManager};
pub use message::{
    ChatMessage, Chunk, Conversation, Event, Modifier, ModifierKind, Request, Response,
    UploadReceipt,
};
pub use version::ProtocolVersion;
