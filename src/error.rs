//! # Error Types
//!
//! Error handling for the relay client engine.
//!
//! Two families of errors live here:
//! - [`ProtocolError`]: returned from fallible operations (parsing, encoding,
//!   requests, configuration).
//! - [`DisconnectReason`]: the cloneable reason attached to
//!   `ConnectionState::Disconnected` and delivered to connection listeners.
//!
//! ## Error Categories
//! - **Addressing**: missing or unparseable relay address
//! - **Transport**: connect failure, unexpected close, write failure
//! - **Protocol**: version mismatch, malformed frame, unknown command. These are
//!   fatal for the connection and never trigger fallback or reconnection.
//! - **Request**: timeout, connection lost while pending, malformed response
//!
//! ## Example Usage
//! ```rust
//! use relay_link::error::{ProtocolError, Result};
//! use relay_link::core::packer::Unpacker;
//!
//! fn read_count(bytes: &[u8]) -> Result<i32> {
//!     let mut unpacker = Unpacker::new(bytes.to_vec().into());
//!     unpacker.read_i32()
//! }
//!
//! assert!(matches!(read_count(&[0, 1]), Err(ProtocolError::Underrun { .. })));
//! ```

use crate::transport::address::Address;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Framing errors
    pub const ERR_INVALID_FLAG: &str = "Encryption flag must be 0 or 1";
    pub const ERR_INVALID_UTF8: &str = "String field is not valid UTF-8";
    pub const ERR_EMPTY_PAYLOAD: &str = "Frame payload is empty";
    pub const ERR_TRAILING_BYTES: &str = "Unexpected trailing bytes after message";

    /// Connection errors
    pub const ERR_WRITER_CLOSED: &str = "Outbound queue is closed";

    /// Cryptographic errors
    pub const ERR_PLAINTEXT_AFTER_AUTH: &str =
        "Unencrypted frame received on an encrypted session";

    /// Handshake errors
    pub const ERR_UNEXPECTED_HANDSHAKE: &str = "Unexpected frame during version negotiation";
    pub const ERR_NO_SECRET: &str = "No shared secret configured";

    /// Address errors
    pub const ERR_EMPTY_ADDRESS: &str = "Address is empty";
}

/// ProtocolError is the primary error type for all client operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Buffer underrun: needed {needed} bytes, {remaining} remaining")]
    Underrun { needed: usize, remaining: usize },

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Frame too large: {0} bytes")]
    OversizedFrame(usize),

    #[error("Unknown command discriminator: 0x{0:02x}")]
    UnknownCommand(u8),

    #[error("Incompatible protocol version (client offers {offered:?}, relay supports {relay:?})")]
    IncompatibleVersion { offered: Vec<u8>, relay: Vec<u8> },

    #[error("Request '{request}' is not supported by protocol version {version}")]
    UnsupportedRequest { version: u8, request: &'static str },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("No relay address configured")]
    AddressMissing,

    #[error("Connection error: {0}")]
    Connection(DisconnectReason),

    #[error("Not connected to relay")]
    NotConnected,

    #[error("Connection lost while request was pending")]
    ConnectionLost,

    #[error("Request timed out")]
    Timeout,

    #[error("Transmission failed: {0}")]
    Transmission(String),

    #[error("Request id {0} is already pending")]
    DuplicateRequestId(u32),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Relay rejected request (code {code}): {message}")]
    Relay { code: i32, message: String },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Upload {upload_id} failed at chunk {sequence_index}: {source}")]
    Upload {
        upload_id: u32,
        sequence_index: u32,
        #[source]
        source: Box<ProtocolError>,
    },

    #[error("Chunk out of sequence: expected {expected}, got {got}")]
    ChunkSequence { expected: u32, got: u32 },

    #[error("Inbound transfer limit exceeded: {0}")]
    TransferLimit(String),

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Secure storage error: {0}")]
    Storage(String),

    #[error("Connection manager has shut down")]
    Shutdown,
}

impl ProtocolError {
    /// Faults that indicate a logic or compatibility problem rather than a
    /// transient network condition. They end the connection without fallback
    /// or reconnection.
    pub fn is_protocol_fault(&self) -> bool {
        matches!(
            self,
            ProtocolError::Underrun { .. }
                | ProtocolError::MalformedFrame(_)
                | ProtocolError::OversizedFrame(_)
                | ProtocolError::UnknownCommand(_)
                | ProtocolError::IncompatibleVersion { .. }
                | ProtocolError::ChunkSequence { .. }
                | ProtocolError::TransferLimit(_)
                | ProtocolError::DecryptionFailure
        )
    }

    /// Errors a caller may reasonably retry after reconnecting.
    pub fn is_transient(&self) -> bool {
        match self {
            ProtocolError::Io(_)
            | ProtocolError::NotConnected
            | ProtocolError::ConnectionLost
            | ProtocolError::Timeout
            | ProtocolError::Transmission(_) => true,
            ProtocolError::Connection(reason) => reason.is_transient(),
            ProtocolError::Upload { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Map an error that ended a connection onto the reason reported to listeners.
    pub fn to_disconnect_reason(&self) -> DisconnectReason {
        match self {
            ProtocolError::IncompatibleVersion { offered, relay } => {
                DisconnectReason::IncompatibleVersion {
                    offered: offered.clone(),
                    relay: relay.clone(),
                }
            }
            ProtocolError::AuthenticationFailed(msg) => {
                DisconnectReason::AuthenticationFailed(msg.clone())
            }
            ProtocolError::AddressMissing => DisconnectReason::AddressMissing,
            ProtocolError::InvalidAddress(msg) => DisconnectReason::InvalidAddress(msg.clone()),
            ProtocolError::Connection(reason) => reason.clone(),
            ProtocolError::Io(e) => DisconnectReason::Io(e.to_string()),
            ProtocolError::Transmission(msg) => DisconnectReason::WriteFailed(msg.clone()),
            other if other.is_protocol_fault() => {
                DisconnectReason::ProtocolViolation(other.to_string())
            }
            other => DisconnectReason::Io(other.to_string()),
        }
    }
}

/// Why a connection ended. Carried by `ConnectionState::Disconnected`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    #[error("No relay address configured")]
    AddressMissing,

    #[error("Invalid relay address: {0}")]
    InvalidAddress(String),

    #[error("Secure storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Failed to connect to {address}: {message}")]
    ConnectFailed { address: Address, message: String },

    #[error("Connection closed by relay")]
    RemoteClosed,

    #[error("Connection error: {0}")]
    Io(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("No traffic from relay for {0:?}")]
    IdleTimeout(Duration),

    #[error("Handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Incompatible protocol version (client offers {offered:?}, relay supports {relay:?})")]
    IncompatibleVersion { offered: Vec<u8>, relay: Vec<u8> },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
}

impl DisconnectReason {
    /// Whether automatic recovery (fallback promotion, reconnection) may be attempted.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DisconnectReason::ConnectFailed { .. }
                | DisconnectReason::RemoteClosed
                | DisconnectReason::Io(_)
                | DisconnectReason::WriteFailed(_)
                | DisconnectReason::IdleTimeout(_)
                | DisconnectReason::HandshakeTimeout(_)
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_faults_are_not_transient() {
        let faults = [
            ProtocolError::UnknownCommand(0x7f),
            ProtocolError::MalformedFrame("bad".into()),
            ProtocolError::IncompatibleVersion {
                offered: vec![2, 1],
                relay: vec![3],
            },
            ProtocolError::Underrun {
                needed: 4,
                remaining: 1,
            },
            ProtocolError::TransferLimit("9 transfers".into()),
        ];
        for fault in &faults {
            assert!(fault.is_protocol_fault(), "{fault} should be a protocol fault");
            assert!(!fault.is_transient(), "{fault} should not be transient");
            assert!(!fault.to_disconnect_reason().is_transient());
        }
    }

    #[test]
    fn test_version_mismatch_maps_to_distinct_reason() {
        let err = ProtocolError::IncompatibleVersion {
            offered: vec![2, 1],
            relay: vec![3],
        };
        assert_eq!(
            err.to_disconnect_reason(),
            DisconnectReason::IncompatibleVersion {
                offered: vec![2, 1],
                relay: vec![3]
            }
        );
    }

    #[test]
    fn test_upload_error_inherits_transience() {
        let err = ProtocolError::Upload {
            upload_id: 7,
            sequence_index: 2,
            source: Box::new(ProtocolError::ConnectionLost),
        };
        assert!(err.is_transient());
        assert!(err.to_string().contains("chunk 2"));
    }
}
