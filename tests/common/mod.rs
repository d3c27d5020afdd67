//! Scripted in-process relay for integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use relay_link::client::ConnectionState;
use relay_link::config::{ClientConfig, TransportConfig};
use relay_link::core::codec::FrameCodec;
use relay_link::core::frame::Frame;
use relay_link::core::packer::{Packer, Unpacker};
use relay_link::protocol::handshake::{auth_digest, AUTH_DOMAIN_V2};
use relay_link::protocol::wire;
use relay_link::store::{MemoryStore, RELAY_ADDRESS_KEY, SHARED_SECRET_KEY};
use relay_link::utils::crypto::Crypto;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

pub const SECRET: &str = "correct horse battery staple";
pub const RELAY_NAME: &str = "test-relay";
pub const NONCE: &[u8] = b"0123456789abcdef";
pub const STEP: Duration = Duration::from_secs(5);

/// Bound listener standing in for a relay.
pub struct FakeRelay {
    listener: TcpListener,
    secret: Option<String>,
}

impl FakeRelay {
    /// Relay that encrypts with [`SECRET`].
    pub async fn bind() -> Self {
        Self::bind_with(Some(SECRET)).await
    }

    /// Relay that speaks plaintext frames only.
    pub async fn bind_plaintext() -> Self {
        Self::bind_with(None).await
    }

    async fn bind_with(secret: Option<&str>) -> Self {
        Self {
            listener: TcpListener::bind("127.0.0.1:0").await.unwrap(),
            secret: secret.map(String::from),
        }
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }

    pub fn address(&self) -> String {
        format!("127.0.0.1:{}", self.port())
    }

    pub async fn accept(&self) -> RelaySession {
        let (socket, _) = tokio::time::timeout(STEP, self.listener.accept())
            .await
            .expect("client connected")
            .unwrap();
        RelaySession::new(socket, self.secret.as_deref())
    }

    /// `true` if a client connects within `wait`.
    pub async fn sees_connection_within(&self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.listener.accept()).await.is_ok()
    }

    /// Accept, then complete hello and authentication.
    pub async fn accept_authenticated(&self) -> RelaySession {
        let mut session = self.accept().await;
        assert!(session.handshake().await, "client authenticated");
        session
    }
}

/// Address of a port nothing listens on.
pub async fn dead_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("127.0.0.1:{port}")
}

/// A request as the relay sees it.
pub struct Received {
    pub command: u8,
    pub request_id: u32,
    pub body: Unpacker,
}

pub struct RelaySession {
    framed: Framed<TcpStream, FrameCodec>,
    crypto: Option<Crypto>,
}

impl RelaySession {
    fn new(socket: TcpStream, secret: Option<&str>) -> Self {
        Self {
            framed: Framed::new(socket, FrameCodec::default()),
            crypto: secret.map(Crypto::from_secret),
        }
    }

    /// Next frame payload, decrypted. `None` once the client closed.
    pub async fn try_recv(&mut self) -> Option<Bytes> {
        let frame = tokio::time::timeout(STEP, self.framed.next())
            .await
            .expect("frame from client")?
            .unwrap();
        if frame.encrypted {
            let crypto = self.crypto.as_ref().expect("relay holds the secret");
            Some(Bytes::from(crypto.open(&frame.payload).unwrap()))
        } else {
            Some(frame.payload)
        }
    }

    pub async fn recv(&mut self) -> Bytes {
        self.try_recv().await.expect("client still connected")
    }

    /// Next correlated request, skipping keepalive pings.
    pub async fn recv_request(&mut self) -> Received {
        loop {
            let mut body = Unpacker::new(self.recv().await);
            let command = body.read_u8().unwrap();
            if command == wire::PING {
                continue;
            }
            let request_id = body.read_u32().unwrap();
            return Received {
                command,
                request_id,
                body,
            };
        }
    }

    pub async fn send_plain(&mut self, payload: Bytes) {
        self.framed.send(Frame::plain(payload)).await.unwrap();
    }

    /// Send, encrypted when the relay holds a secret.
    pub async fn send(&mut self, payload: Bytes) {
        let frame = match &self.crypto {
            Some(crypto) => Frame::new(true, crypto.seal(&payload).unwrap()),
            None => Frame::plain(payload),
        };
        self.framed.send(frame).await.unwrap();
    }

    /// Read HELLO and answer with a v2 HELLO_ACK challenge.
    pub async fn accept_hello(&mut self) -> String {
        let mut hello = Unpacker::new(self.recv().await);
        assert_eq!(hello.read_u8().unwrap(), wire::HELLO);
        let count = hello.read_u8().unwrap();
        let offered: Vec<u8> = (0..count).map(|_| hello.read_u8().unwrap()).collect();
        assert!(offered.contains(&2), "client offers v2");
        let client_name = hello.read_string().unwrap();

        let mut ack = Packer::new();
        ack.write_u8(wire::HELLO_ACK)
            .write_u8(2)
            .write_string(RELAY_NAME)
            .write_i32(0x03)
            .write_blob(NONCE);
        self.send_plain(ack.finish()).await;
        client_name
    }

    /// Full v2 handshake. Returns whether the client's digest matched.
    pub async fn handshake(&mut self) -> bool {
        self.accept_hello().await;
        let mut auth = self.recv_request().await;
        assert_eq!(auth.command, wire::AUTHENTICATE);
        let _client_name = auth.body.read_string().unwrap();
        let _client_version = auth.body.read_string().unwrap();
        let _capabilities = auth.body.read_i32().unwrap();
        let digest = auth.body.read_blob().unwrap();

        let expected = auth_digest(AUTH_DOMAIN_V2, &[RELAY_NAME.as_bytes()], NONCE, SECRET);
        let accepted = digest[..] == expected[..];

        let mut reply = wire::request_header(wire::AUTH_RESULT, auth.request_id);
        reply
            .write_bool(accepted)
            .write_string(if accepted { "welcome" } else { "bad credentials" });
        self.send(reply.finish()).await;
        accepted
    }

    pub async fn respond_ok(&mut self, request_id: u32) {
        self.send(wire::request_header(wire::RESPONSE_OK, request_id).finish())
            .await;
    }

    pub async fn respond_error(&mut self, request_id: u32, code: i32, message: &str) {
        let mut p = wire::request_header(wire::RESPONSE_ERROR, request_id);
        p.write_i32(code).write_string(message);
        self.send(p.finish()).await;
    }

    /// Wait until the client closes its side.
    pub async fn expect_closed(&mut self) {
        loop {
            match self.try_recv().await {
                None => return,
                Some(payload) if payload.first() == Some(&wire::PING) => continue,
                Some(payload) => panic!("unexpected frame after close: {payload:?}"),
            }
        }
    }
}

/// Store pointing at `primary` (and optionally `fallback`) with [`SECRET`].
pub fn store(primary: &str, fallback: Option<&str>) -> Arc<MemoryStore> {
    store_with_secret(primary, fallback, SECRET)
}

pub fn store_with_secret(primary: &str, fallback: Option<&str>, secret: &str) -> Arc<MemoryStore> {
    let mut entries = vec![
        (RELAY_ADDRESS_KEY, primary.to_string()),
        (SHARED_SECRET_KEY, secret.to_string()),
    ];
    if let Some(fallback) = fallback {
        entries.push((relay_link::store::FALLBACK_ADDRESS_KEY, fallback.to_string()));
    }
    Arc::new(MemoryStore::with_entries(entries))
}

/// Short timeouts so failure paths finish quickly.
pub fn client_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.connection.client_name = "desk".into();
    config.connection.connect_timeout = Duration::from_secs(1);
    config.connection.handshake_timeout = Duration::from_secs(2);
    config.connection.response_timeout = Duration::from_secs(2);
    config.connection.reconnect_delay = Duration::from_millis(50);
    config.connection.max_reconnect_delay = Duration::from_millis(200);
    config
}

pub fn plaintext_config() -> ClientConfig {
    let mut config = client_config();
    config.transport = TransportConfig {
        encryption_enabled: false,
        ..TransportConfig::default()
    };
    config
}

/// Disconnected with a reason, as opposed to the idle initial state.
pub fn has_failed(state: &ConnectionState) -> bool {
    matches!(state, ConnectionState::Disconnected(Some(_)))
}
