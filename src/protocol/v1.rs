//! Protocol version 1.
//!
//! Timestamps are `int32` unix seconds. The hello-ack challenge is a bare
//! nonce. Conversation listing has no offset and modifiers do not exist.

use super::handshake::{self, Credentials, AUTH_DOMAIN_V1};
use super::message::Request;
use super::version::{ProtocolVersion, WireProtocol};
use super::wire::{self, Inbound, TimestampFormat};
use crate::core::packer::Unpacker;
use crate::error::{ProtocolError, Result};
use bytes::Bytes;

const TIMESTAMPS: TimestampFormat = TimestampFormat::Seconds32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct V1;

impl V1 {
    fn unsupported(request: &Request) -> ProtocolError {
        ProtocolError::UnsupportedRequest {
            version: ProtocolVersion::V1.as_u8(),
            request: request.name(),
        }
    }
}

impl WireProtocol for V1 {
    fn version(&self) -> ProtocolVersion {
        ProtocolVersion::V1
    }

    fn encode_request(&self, request_id: u32, request: &Request) -> Result<Bytes> {
        match request {
            Request::SendModifier(_) => Err(Self::unsupported(request)),
            Request::FetchConversations { offset, .. } if *offset != 0 => {
                Err(Self::unsupported(request))
            }
            Request::FetchConversations { limit, .. } => {
                let mut p = wire::request_header(wire::FETCH_CONVERSATIONS, request_id);
                p.write_i32(*limit);
                Ok(p.finish())
            }
            other => Ok(wire::encode_request(request_id, other, TIMESTAMPS)),
        }
    }

    fn decode_frame(&self, payload: Bytes) -> Result<Inbound> {
        wire::decode_frame(payload, TIMESTAMPS, false)
    }

    fn ping(&self, sent_at: i64) -> Bytes {
        wire::ping(sent_at, TIMESTAMPS)
    }

    fn authentication_request(
        &self,
        request_id: u32,
        challenge: &mut Unpacker,
        credentials: &Credentials,
    ) -> Result<Bytes> {
        let nonce = challenge.read_blob()?;
        challenge.finish()?;

        let digest = handshake::auth_digest(AUTH_DOMAIN_V1, &[], &nonce, credentials.secret()?);
        let mut p = wire::request_header(wire::AUTHENTICATE, request_id);
        p.write_string(&credentials.client_name).write_blob(&digest);
        Ok(p.finish())
    }
}
