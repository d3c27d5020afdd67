//! # Connection Manager
//!
//! The application-facing handle to the relay connection.
//!
//! A [`ConnectionManager`] is a cheap, cloneable handle. All connection state
//! lives in one driver task that owns the [`Transport`] and the
//! [`ProtocolManager`]; handles talk to it over a command channel. The driver
//! is the only code that touches the pending-request table, the reconnect
//! timer and the transport, so no locks guard them.
//!
//! ## States
//! ```text
//! Disconnected ──connect()──▶ Connecting ──authenticated──▶ Connected
//!      ▲                          │                             │
//!      └────────── closed(reason) ┴─────────────────────────────┘
//! ```
//! A transient close schedules a reconnect with exponential backoff unless
//! reconnection is suppressed. Protocol faults and authentication failures
//! never do.

use super::listener::{ConnectionListener, ListenerId, ListenerRegistry};
use crate::config::{ClientConfig, ConnectionConfig};
use crate::error::{DisconnectReason, ProtocolError, Result};
use crate::protocol::dispatcher::DownloadLimits;
use crate::protocol::manager::{Dispatch, Outgoing, ProtocolManager};
use crate::protocol::message::{Event, Request, Response, UploadReceipt};
use crate::protocol::pending::{Expired, RequestIdGenerator};
use crate::protocol::upload::{self, UploadSession};
use crate::protocol::version::ProtocolVersion;
use crate::store::SecureStore;
use crate::transport::address::Endpoint;
use crate::transport::{Transport, TransportEvent};
use crate::utils::metrics::Metrics;
use crate::utils::timeout::{with_timeout_error, SHUTDOWN_TIMEOUT};
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, instrument, warn};

const COMMAND_QUEUE: usize = 64;
const EVENT_BUFFER: usize = 256;

/// Observable connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected. `None` after an intentional disconnect or before the
    /// first attempt.
    Disconnected(Option<DisconnectReason>),
    Connecting,
    /// Authenticated and ready for requests.
    Connected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, ConnectionState::Disconnected(_))
    }
}

enum Command {
    Connect,
    Disconnect {
        done: oneshot::Sender<()>,
    },
    Request {
        request_id: u32,
        request: Request,
        reply: oneshot::Sender<Result<Response>>,
    },
    Cancel {
        request_id: u32,
        reply: oneshot::Sender<bool>,
    },
    Ping {
        reply: oneshot::Sender<Result<()>>,
    },
    SuppressReconnect {
        suppressed: bool,
        done: oneshot::Sender<()>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// An in-flight request. Resolves to the correlated response, or to the
/// error that ended it (`Timeout`, `ConnectionLost`, `Cancelled`, ...).
#[derive(Debug)]
pub struct PendingCall {
    request_id: u32,
    rx: oneshot::Receiver<Result<Response>>,
}

impl PendingCall {
    pub fn request_id(&self) -> u32 {
        self.request_id
    }
}

impl Future for PendingCall {
    type Output = Result<Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(ProtocolError::Shutdown)))
    }
}

/// Handle to the relay connection.
#[derive(Clone)]
pub struct ConnectionManager {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<Event>,
    listeners: Arc<ListenerRegistry>,
    ids: Arc<RequestIdGenerator>,
    metrics: Arc<Metrics>,
    upload_chunk_size: usize,
}

impl ConnectionManager {
    /// Validate `config`, build the transport and spawn the driver.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: ClientConfig, store: Arc<dyn SecureStore>) -> Result<Self> {
        config.validate_strict()?;
        if !config.transport.encryption_enabled {
            warn!("Frame encryption is disabled");
        }
        let mut transport = Transport::new(config.transport.clone(), store)
            .with_connect_timeout(config.connection.connect_timeout);
        if let Some(primary) = &config.connection.relay_address {
            let endpoint = Endpoint::parse(primary, config.connection.fallback_address.as_deref())?;
            transport.configure(Some(endpoint));
        }
        Ok(Self::with_transport(config, transport))
    }

    /// Spawn the driver around an already-built transport. The transport's
    /// metrics become the manager's metrics.
    pub fn with_transport(config: ClientConfig, transport: Transport) -> Self {
        let metrics = transport.metrics();
        let ids = Arc::new(RequestIdGenerator::new());
        let listeners = Arc::new(ListenerRegistry::new());
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected(None));
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        let protocol = ProtocolManager::new(
            config.connection.client_name.clone(),
            config.connection.response_timeout,
            ids.clone(),
            metrics.clone(),
        )
        .with_download_limits(DownloadLimits::from(&config.transport));
        let driver = Driver {
            config: config.connection,
            transport,
            protocol,
            commands: commands_rx,
            state: state_tx,
            events: events.clone(),
            listeners: listeners.clone(),
            metrics: metrics.clone(),
            suppress_reconnect: false,
            reconnect_attempts: 0,
            reconnect_at: None,
            handshake_deadline: None,
            idle_deadline: None,
            heartbeat: None,
        };
        tokio::spawn(driver.run());

        Self {
            commands: commands_tx,
            state: state_rx,
            events,
            listeners,
            ids,
            metrics,
            upload_chunk_size: config.transport.upload_chunk_size,
        }
    }

    async fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ProtocolError::Shutdown)
    }

    /// Start connecting. No-op while connecting or connected.
    pub async fn connect(&self) -> Result<()> {
        self.command(Command::Connect).await
    }

    /// Close the connection on purpose. Never triggers fallback or reconnect.
    /// Returns once the driver has torn the session down.
    pub async fn disconnect(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.command(Command::Disconnect { done }).await?;
        rx.await.map_err(|_| ProtocolError::Shutdown)
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Wait until the state satisfies `predicate` and return it.
    pub async fn wait_for_state<F>(&self, predicate: F) -> Result<ConnectionState>
    where
        F: FnMut(&ConnectionState) -> bool,
    {
        let mut rx = self.state.clone();
        let state = rx
            .wait_for(predicate)
            .await
            .map_err(|_| ProtocolError::Shutdown)?;
        Ok(state.clone())
    }

    /// Send a request and wait for its correlated response.
    pub async fn request(&self, request: Request) -> Result<Response> {
        self.start_request(request, None).await?.await
    }

    /// Send a request and return the in-flight call. `request_id` picks the
    /// id explicitly; a collision with a pending id fails the call with
    /// `DuplicateRequestId`.
    pub async fn start_request(
        &self,
        request: Request,
        request_id: Option<u32>,
    ) -> Result<PendingCall> {
        let request_id = request_id.unwrap_or_else(|| self.ids.next_id());
        let (reply, rx) = oneshot::channel();
        self.command(Command::Request {
            request_id,
            request,
            reply,
        })
        .await?;
        Ok(PendingCall { request_id, rx })
    }

    /// Resolve a pending call with `Cancelled`. `false` if it was not pending.
    pub async fn cancel(&self, request_id: u32) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Cancel { request_id, reply }).await?;
        rx.await.map_err(|_| ProtocolError::Shutdown)
    }

    /// Send a keepalive ping now. Completes once the ping is queued.
    pub async fn ping(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Ping { reply }).await?;
        rx.await.map_err(|_| ProtocolError::Shutdown)?
    }

    /// Upload `data` as a chunked transfer using the configured chunk size.
    pub async fn upload(&self, data: Bytes) -> Result<UploadReceipt> {
        self.upload_with_chunk_size(data, self.upload_chunk_size)
            .await
    }

    /// Upload `data` in chunks of at most `chunk_size` bytes.
    ///
    /// Chunks are sent one at a time; each waits for the relay's reply before
    /// the next leaves. A failure is reported with the chunk it happened at.
    #[instrument(skip(self, data), fields(bytes = data.len()))]
    pub async fn upload_with_chunk_size(
        &self,
        data: Bytes,
        chunk_size: usize,
    ) -> Result<UploadReceipt> {
        let upload_id = self.ids.next_id();
        let mut session = UploadSession::new(upload_id);
        let parts = upload::split(&data, chunk_size);
        let total = parts.len();
        let mut attachment = None;

        for (index, part) in parts.into_iter().enumerate() {
            let is_final = index + 1 == total;
            let chunk = session.next_chunk(part, is_final)?;
            let sequence_index = chunk.sequence_index;
            let failed = move |source: ProtocolError| ProtocolError::Upload {
                upload_id,
                sequence_index,
                source: Box::new(source),
            };

            match self
                .request(Request::UploadChunk(chunk))
                .await
                .map_err(failed)?
            {
                Response::UploadProgress {
                    upload_id: id,
                    sequence_index: index,
                } if !is_final => {
                    if id != upload_id || index != sequence_index {
                        return Err(failed(ProtocolError::MalformedResponse(format!(
                            "progress for upload {id} chunk {index}"
                        ))));
                    }
                }
                Response::Ack if !is_final => {}
                Response::UploadComplete {
                    upload_id: id,
                    attachment_id,
                } if is_final => {
                    if id != upload_id {
                        return Err(failed(ProtocolError::MalformedResponse(format!(
                            "completion for upload {id}"
                        ))));
                    }
                    attachment = Some(attachment_id);
                }
                other => {
                    return Err(failed(ProtocolError::MalformedResponse(format!(
                        "unexpected reply to upload chunk: {other:?}"
                    ))))
                }
            }
        }

        let attachment_id = attachment.ok_or_else(|| {
            ProtocolError::MalformedResponse("upload finished without completion".into())
        })?;
        info!(upload_id, chunks = total, attachment_id = %attachment_id, "Upload complete");
        Ok(UploadReceipt {
            upload_id,
            attachment_id,
            chunks: session.next_index(),
            bytes: data.len() as u64,
        })
    }

    /// Subscribe to unsolicited relay events. A receiver that falls more than
    /// the buffer behind sees `Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// [`Self::subscribe`] as a `Stream`.
    pub fn events(&self) -> BroadcastStream<Event> {
        BroadcastStream::new(self.events.subscribe())
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// While set, a closed connection is never retried automatically. Setting
    /// it also cancels a reconnect that is already scheduled. Returns once the
    /// driver has applied it.
    pub async fn set_reconnect_suppressed(&self, suppressed: bool) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.command(Command::SuppressReconnect { suppressed, done })
            .await?;
        rx.await.map_err(|_| ProtocolError::Shutdown)
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Disconnect and stop the driver. Other handles see `Shutdown` afterwards.
    pub async fn shutdown(self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.command(Command::Shutdown { done }).await?;
        with_timeout_error(
            async { rx.await.map_err(|_| ProtocolError::Shutdown) },
            SHUTDOWN_TIMEOUT,
        )
        .await
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &*self.state.borrow())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Owns every piece of mutable connection state.
struct Driver {
    config: ConnectionConfig,
    transport: Transport,
    protocol: ProtocolManager,
    commands: mpsc::Receiver<Command>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<Event>,
    listeners: Arc<ListenerRegistry>,
    metrics: Arc<Metrics>,
    suppress_reconnect: bool,
    reconnect_attempts: u32,
    reconnect_at: Option<Instant>,
    handshake_deadline: Option<Instant>,
    idle_deadline: Option<Instant>,
    heartbeat: Option<Interval>,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl Driver {
    #[instrument(skip_all, name = "connection_driver", fields(client = %self.config.client_name))]
    async fn run(mut self) {
        loop {
            let has_pending = self.protocol.has_pending();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { done }) => {
                        self.disconnect();
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.on_command(command).await,
                    None => {
                        self.disconnect();
                        break;
                    }
                },
                event = self.transport.next_event() => self.on_transport_event(event).await,
                Some(expired) = self.protocol.next_expired(), if has_pending => self.on_expired(expired),
                _ = tick(&mut self.heartbeat) => self.on_heartbeat().await,
                _ = sleep_until_opt(self.idle_deadline) => {
                    let idle = self.config.idle_timeout;
                    self.fail(DisconnectReason::IdleTimeout(idle));
                }
                _ = sleep_until_opt(self.handshake_deadline) => {
                    let limit = self.config.handshake_timeout;
                    self.fail(DisconnectReason::HandshakeTimeout(limit));
                }
                _ = sleep_until_opt(self.reconnect_at) => {
                    self.reconnect_at = None;
                    info!(attempt = self.reconnect_attempts, "Reconnecting");
                    self.begin_connect();
                }
            }
        }
        self.metrics.log_metrics();
        debug!("Connection driver stopped");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                if !self.state.borrow().is_disconnected() {
                    debug!("Connect ignored; already connecting or connected");
                    return;
                }
                self.reconnect_at = None;
                self.reconnect_attempts = 0;
                self.begin_connect();
            }
            Command::Disconnect { done } => {
                self.disconnect();
                let _ = done.send(());
            }
            Command::Request {
                request_id,
                request,
                reply,
            } => {
                if let Some(out) = self.protocol.start_request(request_id, &request, reply) {
                    if let Err(e) = self.transport.send(out.payload, out.encrypt).await {
                        self.protocol.request_failed(request_id, e);
                    }
                }
            }
            Command::Cancel { request_id, reply } => {
                let _ = reply.send(self.protocol.cancel(request_id));
            }
            Command::Ping { reply } => {
                let result = match self.protocol.ping() {
                    Ok(out) => self.transport.send(out.payload, out.encrypt).await,
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::SuppressReconnect { suppressed, done } => {
                self.suppress_reconnect = suppressed;
                if suppressed && self.reconnect_at.take().is_some() {
                    debug!("Scheduled reconnect cancelled");
                }
                debug!(suppressed, "Automatic reconnection suppression changed");
                let _ = done.send(());
            }
            Command::Shutdown { done } => {
                self.disconnect();
                let _ = done.send(());
            }
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened { address } => {
                debug!(address = %address, "Socket open; starting handshake");
                let hello = self
                    .protocol
                    .begin_handshake(self.transport.secret(), self.transport.can_encrypt());
                self.handshake_deadline = Some(Instant::now() + self.config.handshake_timeout);
                self.send(hello).await;
            }
            TransportEvent::FrameReceived { encrypted, payload } => {
                if self.idle_deadline.is_some() {
                    self.idle_deadline = Some(Instant::now() + self.config.idle_timeout);
                }
                match self.protocol.handle_frame(encrypted, payload) {
                    Ok(Dispatch::Send(out)) => self.send(out).await,
                    Ok(Dispatch::Ready { version }) => self.on_ready(version),
                    Ok(Dispatch::Event(event)) => {
                        // No subscribers is not an error
                        let _ = self.events.send(event);
                    }
                    Ok(Dispatch::Handled) => {}
                    Err(e) => {
                        if e.is_protocol_fault() {
                            self.metrics.protocol_error();
                        }
                        warn!(error = %e, "Ending connection");
                        self.fail(e.to_disconnect_reason());
                    }
                }
            }
            TransportEvent::Closed { reason } => self.on_closed(reason),
        }
    }

    /// Write a connection-level frame; failure ends the connection.
    async fn send(&mut self, out: Outgoing) {
        if let Err(e) = self.transport.send(out.payload, out.encrypt).await {
            self.fail(e.to_disconnect_reason());
        }
    }

    fn on_ready(&mut self, version: ProtocolVersion) {
        let now = Instant::now();
        self.handshake_deadline = None;
        self.reconnect_attempts = 0;
        self.transport.mark_established();
        self.metrics.connection_established();

        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(now + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.heartbeat = Some(heartbeat);
        self.idle_deadline = Some(now + self.config.idle_timeout);

        info!(
            version = %version,
            address = ?self.transport.current_address().map(ToString::to_string),
            "Connected"
        );
        self.set_state(ConnectionState::Connected);
        self.listeners.notify_open();
    }

    async fn on_heartbeat(&mut self) {
        match self.protocol.ping() {
            Ok(out) => {
                if let Err(e) = self.transport.send(out.payload, out.encrypt).await {
                    debug!(error = %e, "Heartbeat not sent");
                }
            }
            Err(e) => debug!(error = %e, "Heartbeat skipped"),
        }
    }

    fn on_expired(&mut self, expired: Expired) {
        if self.protocol.on_expired(expired).is_err() {
            let limit = self.config.handshake_timeout;
            self.fail(DisconnectReason::HandshakeTimeout(limit));
        }
    }

    fn begin_connect(&mut self) {
        self.set_state(ConnectionState::Connecting);
        self.listeners.notify_connecting();
        self.transport.start();
    }

    /// Tear down a live session ourselves and report it as closed.
    fn fail(&mut self, reason: DisconnectReason) {
        self.transport.stop();
        self.on_closed(reason);
    }

    fn clear_session(&mut self) {
        self.protocol.connection_lost();
        self.handshake_deadline = None;
        self.idle_deadline = None;
        self.heartbeat = None;
    }

    fn on_closed(&mut self, reason: DisconnectReason) {
        self.clear_session();
        warn!(reason = %reason, "Disconnected");
        self.set_state(ConnectionState::Disconnected(Some(reason.clone())));
        self.listeners.notify_close(Some(&reason));
        self.schedule_reconnect(&reason);
    }

    fn schedule_reconnect(&mut self, reason: &DisconnectReason) {
        if !self.config.auto_reconnect || self.suppress_reconnect || !reason.is_transient() {
            return;
        }
        let max = self.config.max_reconnect_attempts;
        if max != 0 && self.reconnect_attempts >= max {
            warn!(attempts = self.reconnect_attempts, "Giving up on reconnecting");
            return;
        }
        let delay: Duration = self.config.backoff(self.reconnect_attempts);
        self.reconnect_attempts += 1;
        self.reconnect_at = Some(Instant::now() + delay);
        self.metrics.reconnect_scheduled();
        info!(attempt = self.reconnect_attempts, delay = ?delay, "Reconnect scheduled");
    }

    /// Intentional close: no fallback, no reconnect, listeners see no reason.
    fn disconnect(&mut self) {
        self.reconnect_at = None;
        self.transport.stop();
        self.clear_session();
        let was_live = !self.state.borrow().is_disconnected();
        if was_live {
            info!("Disconnected by request");
            self.set_state(ConnectionState::Disconnected(None));
            self.listeners.notify_close(None);
        }
    }

    fn set_state(&self, state: ConnectionState) {
        debug!(state = ?state, "Connection state");
        self.state.send_replace(state);
    }
}
