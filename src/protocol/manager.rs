//! # Protocol Manager
//!
//! Per-connection protocol state: the hello exchange, authentication, request
//! encoding and inbound dispatch.
//!
//! The manager performs no I/O. Every operation returns the payload to write
//! (as an [`Outgoing`]) and the connection driver hands it to the transport.
//! This keeps the pending table mutated from a single owner and makes the
//! whole protocol testable without sockets.
//!
//! Request deadlines live in a `tokio_util` `DelayQueue`, so anything that
//! registers a request ([`ProtocolManager::handle_frame`] during
//! authentication, [`ProtocolManager::start_request`]) must run inside a
//! Tokio runtime with the time driver enabled.
//!
//! ## Phases
//! ```text
//! Idle ──begin_handshake──▶ AwaitingHelloAck ──HELLO_ACK──▶ Authenticating ──AUTH_RESULT(ok)──▶ Ready
//! ```
//! Any error returned from [`ProtocolManager::handle_frame`] is fatal for the
//! connection. [`ProtocolManager::connection_lost`] returns to `Idle`.

use super::dispatcher::{Dispatcher, DownloadLimits, Routed};
use super::handshake::{self, Credentials};
use super::message::{Event, Request, Response};
use super::pending::{Completion, Expired, RequestIdGenerator};
use super::version::{NegotiatedProtocol, ProtocolVersion, WireProtocol};
use crate::error::{constants, ProtocolError, Result};
use crate::utils::metrics::Metrics;
use crate::utils::timeout::unix_millis;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

const AUTHENTICATE: &str = "authenticate";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    AwaitingHelloAck,
    Authenticating,
    Ready,
}

/// A payload for the transport to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub payload: Bytes,
    pub encrypt: bool,
}

/// Outcome of handling one inbound frame.
#[derive(Debug)]
pub enum Dispatch {
    /// Write this reply (the authentication request).
    Send(Outgoing),
    /// Authentication succeeded; the connection is usable.
    Ready { version: ProtocolVersion },
    Event(Event),
    Handled,
}

#[derive(Debug)]
pub struct ProtocolManager {
    client_name: String,
    response_timeout: Duration,
    phase: Phase,
    protocol: Option<NegotiatedProtocol>,
    credentials: Option<Credentials>,
    encrypt: bool,
    dispatcher: Dispatcher,
    ids: Arc<RequestIdGenerator>,
    metrics: Arc<Metrics>,
}

impl ProtocolManager {
    pub fn new(
        client_name: impl Into<String>,
        response_timeout: Duration,
        ids: Arc<RequestIdGenerator>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            client_name: client_name.into(),
            response_timeout,
            phase: Phase::Idle,
            protocol: None,
            credentials: None,
            encrypt: false,
            dispatcher: Dispatcher::new(metrics.clone()),
            ids,
            metrics,
        }
    }

    /// Bound the relay-pushed transfers reassembled for this manager.
    pub fn with_download_limits(mut self, limits: DownloadLimits) -> Self {
        self.dispatcher = self.dispatcher.with_limits(limits);
        self
    }

    pub fn is_ready(&self) -> bool {
        self.phase == Phase::Ready
    }

    /// Version negotiated for the current connection.
    pub fn version(&self) -> Option<ProtocolVersion> {
        self.protocol.map(|p| p.version())
    }

    pub fn has_pending(&self) -> bool {
        !self.dispatcher.pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.dispatcher.pending.len()
    }

    /// Start a connection: remember how to authenticate and produce the HELLO.
    ///
    /// `encrypt` is whether the transport holds a cipher. HELLO itself is
    /// always plaintext; every later frame is encrypted when `encrypt` is set.
    pub fn begin_handshake(&mut self, secret: Option<&str>, encrypt: bool) -> Outgoing {
        self.connection_lost();
        self.credentials = Some(Credentials::new(self.client_name.clone(), secret));
        self.encrypt = encrypt;
        self.phase = Phase::AwaitingHelloAck;
        debug!(client = %self.client_name, encrypt, "Sending hello");
        Outgoing {
            payload: handshake::hello(&self.client_name),
            encrypt: false,
        }
    }

    /// Decode and route one inbound payload.
    ///
    /// The HELLO_ACK step registers the authentication request with a
    /// deadline, so this must be called within a Tokio runtime with time
    /// enabled.
    pub fn handle_frame(&mut self, encrypted: bool, payload: Bytes) -> Result<Dispatch> {
        match self.phase {
            Phase::Idle => Err(ProtocolError::MalformedFrame(
                constants::ERR_UNEXPECTED_HANDSHAKE.into(),
            )),
            Phase::AwaitingHelloAck => self.on_hello_reply(payload),
            Phase::Authenticating | Phase::Ready => {
                if self.encrypt && !encrypted {
                    return Err(ProtocolError::MalformedFrame(
                        constants::ERR_PLAINTEXT_AFTER_AUTH.into(),
                    ));
                }
                let protocol = self.protocol.ok_or_else(|| {
                    ProtocolError::MalformedFrame(constants::ERR_UNEXPECTED_HANDSHAKE.into())
                })?;
                let inbound = protocol.decode_frame(payload)?;
                match self.dispatcher.dispatch(inbound)? {
                    Routed::Consumed => Ok(Dispatch::Handled),
                    Routed::Event(event) => {
                        self.metrics.event_delivered();
                        Ok(Dispatch::Event(event))
                    }
                    Routed::Authentication(result) => self.on_auth_result(protocol, result),
                }
            }
        }
    }

    fn on_hello_reply(&mut self, payload: Bytes) -> Result<Dispatch> {
        let (protocol, mut challenge) = handshake::negotiate(payload)?;
        let credentials = self
            .credentials
            .as_ref()
            .ok_or_else(|| ProtocolError::AuthenticationFailed(constants::ERR_NO_SECRET.into()))?;

        let request_id = self.ids.next_id();
        let payload = protocol.authentication_request(request_id, &mut challenge, credentials)?;
        self.dispatcher
            .pending
            .register(
                request_id,
                AUTHENTICATE,
                self.response_timeout,
                Completion::Authentication,
            )
            .map_err(|_| ProtocolError::DuplicateRequestId(request_id))?;

        self.protocol = Some(protocol);
        self.phase = Phase::Authenticating;
        debug!(version = %protocol.version(), request_id, "Authenticating");
        Ok(Dispatch::Send(Outgoing {
            payload,
            encrypt: self.encrypt,
        }))
    }

    fn on_auth_result(
        &mut self,
        protocol: NegotiatedProtocol,
        result: Result<Response>,
    ) -> Result<Dispatch> {
        match result {
            Ok(Response::Authenticated { detail }) => {
                self.phase = Phase::Ready;
                info!(version = %protocol.version(), detail = %detail, "Authenticated with relay");
                Ok(Dispatch::Ready {
                    version: protocol.version(),
                })
            }
            Ok(other) => Err(ProtocolError::MalformedFrame(format!(
                "unexpected reply to authentication: {other:?}"
            ))),
            Err(ProtocolError::Relay { message, .. }) => {
                Err(ProtocolError::AuthenticationFailed(message))
            }
            Err(ProtocolError::MalformedResponse(msg)) => Err(ProtocolError::MalformedFrame(msg)),
            Err(e) => Err(e),
        }
    }

    /// Register and encode a caller's request.
    ///
    /// Returns `None` when the request already failed; the caller has been
    /// told why through `reply`. Registers a deadline timer, so it must be
    /// called within a Tokio runtime with time enabled.
    pub fn start_request(
        &mut self,
        request_id: u32,
        request: &Request,
        reply: oneshot::Sender<Result<Response>>,
    ) -> Option<Outgoing> {
        let fail = |reply: oneshot::Sender<Result<Response>>, err| {
            let _ = reply.send(Err(err));
            None
        };

        let protocol = match self.protocol {
            Some(protocol) if self.phase == Phase::Ready => protocol,
            _ => return fail(reply, ProtocolError::NotConnected),
        };
        let payload = match protocol.encode_request(request_id, request) {
            Ok(payload) => payload,
            Err(e) => return fail(reply, e),
        };
        if let Err(completion) = self.dispatcher.pending.register(
            request_id,
            request.name(),
            self.response_timeout,
            Completion::Caller(reply),
        ) {
            completion.complete(Err(ProtocolError::DuplicateRequestId(request_id)));
            return None;
        }

        self.metrics.request_sent();
        debug!(request_id, request = request.name(), "Request registered");
        Some(Outgoing {
            payload,
            encrypt: self.encrypt,
        })
    }

    /// The transport refused a registered request's payload.
    pub fn request_failed(&mut self, request_id: u32, error: ProtocolError) {
        if let Some((completion, _)) = self.dispatcher.pending.take(request_id) {
            completion.complete(Err(error));
        }
    }

    pub fn cancel(&mut self, request_id: u32) -> bool {
        let cancelled = self.dispatcher.pending.cancel(request_id);
        if cancelled {
            debug!(request_id, "Request cancelled");
        }
        cancelled
    }

    /// Keepalive frame.
    pub fn ping(&self) -> Result<Outgoing> {
        match self.protocol {
            Some(protocol) if self.phase == Phase::Ready => Ok(Outgoing {
                payload: protocol.ping(unix_millis()),
                encrypt: self.encrypt,
            }),
            _ => Err(ProtocolError::NotConnected),
        }
    }

    /// Next pending request whose deadline passed. Guard with [`Self::has_pending`].
    pub async fn next_expired(&mut self) -> Option<Expired> {
        self.dispatcher.pending.next_expired().await
    }

    /// Fail an expired request with [`ProtocolError::Timeout`]. An error return
    /// means the authentication request itself timed out.
    pub fn on_expired(&mut self, expired: Expired) -> Result<()> {
        self.metrics.request_timed_out();
        warn!(
            request_id = expired.request_id,
            request = expired.kind,
            waited = ?expired.waited,
            "Request timed out"
        );
        match expired.completion.complete(Err(ProtocolError::Timeout)) {
            None => Ok(()),
            Some(_) => Err(ProtocolError::Timeout),
        }
    }

    /// Forget the connection. Every pending caller gets `ConnectionLost`.
    pub fn connection_lost(&mut self) -> usize {
        let failed = self.dispatcher.connection_lost();
        if failed > 0 {
            warn!(failed, "Failed pending requests after connection loss");
        }
        self.phase = Phase::Idle;
        self.protocol = None;
        self.credentials = None;
        self.encrypt = false;
        failed
    }
}
