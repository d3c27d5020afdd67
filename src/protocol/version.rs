//! # Protocol Versions
//!
//! The set of wire protocol versions is closed. Each version is a variant
//! implementing [`WireProtocol`]; the variant is chosen once during
//! negotiation and then fixed for the lifetime of the connection, so nothing
//! downstream branches on a version number.

use super::handshake::Credentials;
use super::message::Request;
use super::v1::V1;
use super::v2::V2;
use super::wire::Inbound;
use crate::core::packer::Unpacker;
use crate::error::{ProtocolError, Result};
use bytes::Bytes;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ProtocolVersion {
    V1 = 1,
    V2 = 2,
}

impl ProtocolVersion {
    /// Offered in order of preference.
    pub const SUPPORTED: [ProtocolVersion; 2] = [ProtocolVersion::V2, ProtocolVersion::V1];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn supported_bytes() -> Vec<u8> {
        Self::SUPPORTED.iter().map(|v| v.as_u8()).collect()
    }
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(ProtocolVersion::V1),
            2 => Ok(ProtocolVersion::V2),
            other => Err(ProtocolError::IncompatibleVersion {
                offered: Self::supported_bytes(),
                relay: vec![other],
            }),
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.as_u8())
    }
}

/// Version-specific encoding of everything after the hello exchange.
pub trait WireProtocol {
    fn version(&self) -> ProtocolVersion;

    /// Encode a correlated request, or refuse one this version can not express.
    fn encode_request(&self, request_id: u32, request: &Request) -> Result<Bytes>;

    fn decode_frame(&self, payload: Bytes) -> Result<Inbound>;

    fn ping(&self, sent_at: i64) -> Bytes;

    /// Build the authentication request from the rest of the hello-ack.
    ///
    /// `challenge` is positioned just after the negotiated version byte; what
    /// follows is version specific.
    fn authentication_request(
        &self,
        request_id: u32,
        challenge: &mut Unpacker,
        credentials: &Credentials,
    ) -> Result<Bytes>;
}

/// The protocol variant selected for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiatedProtocol {
    V1(V1),
    V2(V2),
}

impl NegotiatedProtocol {
    pub fn new(version: ProtocolVersion) -> Self {
        match version {
            ProtocolVersion::V1 => NegotiatedProtocol::V1(V1),
            ProtocolVersion::V2 => NegotiatedProtocol::V2(V2),
        }
    }

    fn inner(&self) -> &dyn WireProtocol {
        match self {
            NegotiatedProtocol::V1(v) => v,
            NegotiatedProtocol::V2(v) => v,
        }
    }
}

impl WireProtocol for NegotiatedProtocol {
    fn version(&self) -> ProtocolVersion {
        self.inner().version()
    }

    fn encode_request(&self, request_id: u32, request: &Request) -> Result<Bytes> {
        self.inner().encode_request(request_id, request)
    }

    fn decode_frame(&self, payload: Bytes) -> Result<Inbound> {
        self.inner().decode_frame(payload)
    }

    fn ping(&self, sent_at: i64) -> Bytes {
        self.inner().ping(sent_at)
    }

    fn authentication_request(
        &self,
        request_id: u32,
        challenge: &mut Unpacker,
        credentials: &Credentials,
    ) -> Result<Bytes> {
        self.inner()
            .authentication_request(request_id, challenge, credentials)
    }
}
