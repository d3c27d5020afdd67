//! Protocol version 2.
//!
//! Timestamps are `int64` unix milliseconds. The hello-ack challenge names the
//! relay and its capabilities before the nonce, and authentication reports the
//! client version and capabilities. Paged conversation listing and modifiers
//! are available.

use super::handshake::{self, Credentials, AUTH_DOMAIN_V2, CLIENT_CAPABILITIES};
use super::message::Request;
use super::version::{ProtocolVersion, WireProtocol};
use super::wire::{self, Inbound, TimestampFormat};
use crate::core::packer::Unpacker;
use crate::error::Result;
use bytes::Bytes;
use tracing::debug;

const TIMESTAMPS: TimestampFormat = TimestampFormat::Millis64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct V2;

impl WireProtocol for V2 {
    fn version(&self) -> ProtocolVersion {
        ProtocolVersion::V2
    }

    fn encode_request(&self, request_id: u32, request: &Request) -> Result<Bytes> {
        Ok(wire::encode_request(request_id, request, TIMESTAMPS))
    }

    fn decode_frame(&self, payload: Bytes) -> Result<Inbound> {
        wire::decode_frame(payload, TIMESTAMPS, true)
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
        let relay_name = challenge.read_string()?;
        let relay_capabilities = challenge.read_i32()?;
        let nonce = challenge.read_blob()?;
        challenge.finish()?;
        debug!(relay = %relay_name, capabilities = relay_capabilities, "Relay challenge received");

        let digest = handshake::auth_digest(
            AUTH_DOMAIN_V2,
            &[relay_name.as_bytes()],
            &nonce,
            credentials.secret()?,
        );
        let mut p = wire::request_header(wire::AUTHENTICATE, request_id);
        p.write_string(&credentials.client_name)
            .write_string(&credentials.client_version)
            .write_i32(CLIENT_CAPABILITIES)
            .write_blob(&digest);
        Ok(p.finish())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::packer::Packer;
    use crate::error::ProtocolError;

    #[test]
    fn test_authentication_body() {
        let mut challenge = Packer::new();
        challenge
            .write_string("relay-7")
            .write_i32(0x03)
            .write_blob(b"nonce-bytes");
        let mut challenge = Unpacker::new(challenge.finish());
        let credentials = Credentials::new("desk", Some("pw"));

        let bytes = V2.authentication_request(11, &mut challenge, &credentials).unwrap();
        let mut u = Unpacker::new(bytes);
        assert_eq!(u.read_u8().unwrap(), wire::AUTHENTICATE);
        assert_eq!(u.read_u32().unwrap(), 11);
        assert_eq!(u.read_string().unwrap(), "desk");
        assert_eq!(u.read_string().unwrap(), env!("CARGO_PKG_VERSION"));
        assert_eq!(u.read_i32().unwrap(), CLIENT_CAPABILITIES);
        let expected =
            handshake::auth_digest(AUTH_DOMAIN_V2, &[b"relay-7".as_slice()], b"nonce-bytes", "pw");
        assert_eq!(&u.read_blob().unwrap()[..], &expected);
    }

    #[test]
    fn test_truncated_challenge_is_underrun() {
        let mut challenge = Packer::new();
        challenge.write_string("relay-7");
        let mut challenge = Unpacker::new(challenge.finish());
        let credentials = Credentials::new("desk", Some("pw"));
        assert!(matches!(
            V2.authentication_request(1, &mut challenge, &credentials),
            Err(ProtocolError::Underrun { .. })
        ));
    }

    #[test]
    fn test_timestamps_in_millis() {
        let request = Request::FetchMessages {
            conversation_id: "c".into(),
            limit: 10,
            before: Some(1_700_000_000_123),
        };
        let bytes = V2.encode_request(1, &request).unwrap();
        // header(5) + "c"(5) + limit(4) + present(1) + i64(8)
        assert_eq!(bytes.len(), 23);
        assert_eq!(&bytes[15..], &1_700_000_000_123i64.to_be_bytes());
    }
}
