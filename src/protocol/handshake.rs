//! Version negotiation and authentication for a freshly opened connection.
//!
//! ## Flow
//! 1. Client sends HELLO (plaintext): the versions it speaks, most preferred first.
//! 2. Relay answers HELLO_ACK with the chosen version followed by a
//!    version-specific challenge, or VERSION_REJECTED listing what it speaks.
//! 3. Client sends AUTHENTICATE as a correlated request carrying a digest of
//!    the challenge nonce and the shared secret. The secret itself never
//!    crosses the wire.
//! 4. Relay answers AUTH_RESULT. The connection is usable once it is accepted.
//!
//! A version mismatch is reported as [`ProtocolError::IncompatibleVersion`],
//! never as a generic connection failure, so callers can tell the user to
//! upgrade instead of suggesting a retry.

use super::version::{NegotiatedProtocol, ProtocolVersion};
use super::wire;
use crate::core::packer::{Packer, Unpacker};
use crate::error::{constants, ProtocolError, Result};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use tracing::{debug, instrument};

/// Relay may push modifier events
pub const CAP_MODIFIERS: i32 = 0x01;
/// Relay may push chunked attachments
pub const CAP_ATTACHMENT_CHUNKS: i32 = 0x02;

/// Capabilities this client advertises (v2 and later)
pub const CLIENT_CAPABILITIES: i32 = CAP_MODIFIERS | CAP_ATTACHMENT_CHUNKS;

pub const AUTH_DOMAIN_V1: &[u8] = b"relay-link/auth/v1";
pub const AUTH_DOMAIN_V2: &[u8] = b"relay-link/auth/v2";

/// What the client proves its identity with.
#[derive(Clone)]
pub struct Credentials {
    pub client_name: String,
    pub client_version: String,
    secret: Option<Zeroizing<String>>,
}

impl Credentials {
    pub fn new(client_name: impl Into<String>, secret: Option<&str>) -> Self {
        Self {
            client_name: client_name.into(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            secret: secret.map(|s| Zeroizing::new(s.to_string())),
        }
    }

    pub fn secret(&self) -> Result<&str> {
        self.secret
            .as_deref()
            .map(String::as_str)
            .ok_or_else(|| ProtocolError::AuthenticationFailed(constants::ERR_NO_SECRET.into()))
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_name", &self.client_name)
            .field("client_version", &self.client_version)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// The opening frame of every connection.
pub fn hello(client_name: &str) -> Bytes {
    let versions = ProtocolVersion::supported_bytes();
    let mut packer = Packer::with_capacity(2 + versions.len() + 4 + client_name.len());
    packer.write_u8(wire::HELLO).write_u8(versions.len() as u8);
    for version in versions {
        packer.write_u8(version);
    }
    packer.write_string(client_name);
    packer.finish()
}

/// Read the relay's reply to HELLO.
///
/// On success returns the selected protocol and an [`Unpacker`] positioned at
/// the version-specific challenge.
#[instrument(skip(payload), fields(len = payload.len()))]
pub fn negotiate(payload: Bytes) -> Result<(NegotiatedProtocol, Unpacker)> {
    let mut unpacker = Unpacker::new(payload);
    match unpacker.read_u8()? {
        wire::HELLO_ACK => {
            let version = ProtocolVersion::try_from(unpacker.read_u8()?)?;
            debug!(%version, "Relay accepted protocol version");
            Ok((NegotiatedProtocol::new(version), unpacker))
        }
        wire::VERSION_REJECTED => {
            let count = unpacker.read_u8()?;
            let relay = (0..count)
                .map(|_| unpacker.read_u8())
                .collect::<Result<Vec<u8>>>()?;
            Err(ProtocolError::IncompatibleVersion {
                offered: ProtocolVersion::supported_bytes(),
                relay,
            })
        }
        _ => Err(ProtocolError::MalformedFrame(
            constants::ERR_UNEXPECTED_HANDSHAKE.into(),
        )),
    }
}

/// SHA-256 over a domain tag, length-prefixed context fields, the challenge
/// nonce and the secret.
pub fn auth_digest(domain: &[u8], context: &[&[u8]], nonce: &[u8], secret: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(domain);
    for field in context {
        hasher.update((field.len() as u32).to_be_bytes());
        hasher.update(field);
    }
    hasher.update((nonce.len() as u32).to_be_bytes());
    hasher.update(nonce);
    hasher.update(secret.as_bytes());
    hasher.finalize().into()
}
