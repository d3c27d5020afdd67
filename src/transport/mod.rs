//! # Transport Layer
//!
//! Owns the socket to the relay: address resolution, connect with fallback,
//! framing, and the ordered encryption pipelines.
//!
//! ## Lifecycle
//! [`Transport::start`] spawns one connection run. A run resolves the endpoint
//! (explicit override, else the secure store), connects to the primary address,
//! and, if the primary fails before the session is marked established,
//! promotes to the fallback address exactly once. Events from the run are
//! surfaced through [`Transport::next_event`].
//!
//! [`Transport::stop`] cancels the run. Every run is tagged with an epoch; once
//! stopped, nothing the old run still emits is delivered, so a stopped session
//! never produces a `Closed` event and never triggers fallback.
//!
//! ## Components
//! - **address**: relay address parsing and the primary/fallback endpoint
//! - **pipeline**: order-preserving encrypt/decrypt stages
//! - **connection**: drives a single socket session

pub mod address;
pub(crate) mod connection;
pub mod pipeline;

use crate::config::TransportConfig;
use crate::core::frame::Frame;
use crate::error::{constants, DisconnectReason, ProtocolError, Result};
use crate::store::{SecureStore, FALLBACK_ADDRESS_KEY, RELAY_ADDRESS_KEY, SHARED_SECRET_KEY};
use crate::utils::crypto::{ChaChaCipher, FrameCipher, NONCE_LEN, TAG_LEN};
use crate::utils::metrics::Metrics;
use crate::utils::timeout::DEFAULT_TIMEOUT;
use address::{Address, Endpoint};
use bytes::Bytes;
use connection::Link;
use pipeline::Outbound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

/// Observable transport events, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A socket to `address` is open and writable.
    Opened { address: Address },
    /// One complete, already-decrypted frame.
    FrameReceived { encrypted: bool, payload: Bytes },
    /// The run ended on its own. Never emitted after [`Transport::stop`].
    Closed { reason: DisconnectReason },
}

enum SignalKind {
    Opened {
        address: Address,
        writer: mpsc::Sender<Outbound>,
        cipher: Option<Arc<dyn FrameCipher>>,
        secret: Option<Zeroizing<String>>,
    },
    Frame(Frame),
    Closed(DisconnectReason),
}

struct Signal {
    epoch: u64,
    kind: SignalKind,
}

/// Epoch-stamped sender used by a run to report back.
#[derive(Clone)]
pub(crate) struct Signals {
    epoch: u64,
    tx: mpsc::Sender<Signal>,
}

impl Signals {
    async fn emit(&self, kind: SignalKind) -> bool {
        self.tx
            .send(Signal {
                epoch: self.epoch,
                kind,
            })
            .await
            .is_ok()
    }

    pub(crate) async fn frame(&self, frame: Frame) -> bool {
        self.emit(SignalKind::Frame(frame)).await
    }

    async fn closed(&self, reason: DisconnectReason) -> bool {
        self.emit(SignalKind::Closed(reason)).await
    }
}

struct RunHandle {
    cancel: CancellationToken,
    stopping: Arc<AtomicBool>,
    established: Arc<AtomicBool>,
    _task: JoinHandle<()>,
}

/// Frame payload size after optional sealing (nonce and tag added).
fn sealed_len(plaintext_len: usize, encrypt: bool) -> usize {
    if encrypt {
        plaintext_len + NONCE_LEN + TAG_LEN
    } else {
        plaintext_len
    }
}

/// Everything a run needs, moved into its task.
struct RunContext {
    config: TransportConfig,
    connect_timeout: Duration,
    store: Arc<dyn SecureStore>,
    endpoint: Option<Endpoint>,
    cipher_override: Option<Arc<dyn FrameCipher>>,
    metrics: Arc<Metrics>,
    signals: Signals,
    cancel: CancellationToken,
    stopping: Arc<AtomicBool>,
    established: Arc<AtomicBool>,
}

/// Byte-stream connection to a relay.
pub struct Transport {
    config: TransportConfig,
    connect_timeout: Duration,
    store: Arc<dyn SecureStore>,
    endpoint: Option<Endpoint>,
    cipher_override: Option<Arc<dyn FrameCipher>>,
    metrics: Arc<Metrics>,
    signal_tx: mpsc::Sender<Signal>,
    signal_rx: mpsc::Receiver<Signal>,
    epoch: u64,
    run: Option<RunHandle>,
    writer: Option<mpsc::Sender<Outbound>>,
    cipher: Option<Arc<dyn FrameCipher>>,
    secret: Option<Zeroizing<String>>,
    address: Option<Address>,
}

impl Transport {
    pub fn new(config: TransportConfig, store: Arc<dyn SecureStore>) -> Self {
        let (signal_tx, signal_rx) = mpsc::channel(config.outbound_queue.max(1));
        Self {
            config,
            connect_timeout: DEFAULT_TIMEOUT,
            store,
            endpoint: None,
            cipher_override: None,
            metrics: Arc::new(Metrics::new()),
            signal_tx,
            signal_rx,
            epoch: 0,
            run: None,
            writer: None,
            cipher: None,
            secret: None,
            address: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Use `cipher` instead of one derived from the stored shared secret.
    /// Ignored when encryption is disabled.
    pub fn with_cipher(mut self, cipher: Arc<dyn FrameCipher>) -> Self {
        self.cipher_override = Some(cipher);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Pin the endpoint instead of reading it from the secure store on each start.
    pub fn configure(&mut self, endpoint: Option<Endpoint>) {
        self.endpoint = endpoint;
    }

    /// Begin a new connection run. Any run already in progress is stopped first.
    pub fn start(&mut self) {
        if self.run.is_some() {
            self.stop();
        }
        self.epoch = self.epoch.wrapping_add(1);

        let cancel = CancellationToken::new();
        let stopping = Arc::new(AtomicBool::new(false));
        let established = Arc::new(AtomicBool::new(false));
        let ctx = RunContext {
            config: self.config.clone(),
            connect_timeout: self.connect_timeout,
            store: self.store.clone(),
            endpoint: self.endpoint.clone(),
            cipher_override: self.cipher_override.clone(),
            metrics: self.metrics.clone(),
            signals: Signals {
                epoch: self.epoch,
                tx: self.signal_tx.clone(),
            },
            cancel: cancel.clone(),
            stopping: stopping.clone(),
            established: established.clone(),
        };
        let task = tokio::spawn(run(ctx));
        self.run = Some(RunHandle {
            cancel,
            stopping,
            established,
            _task: task,
        });
    }

    /// Stop the current run. The socket is shut down gracefully in the
    /// background; no further events from it are delivered.
    pub fn stop(&mut self) {
        if let Some(run) = self.run.take() {
            run.stopping.store(true, Ordering::SeqCst);
            run.cancel.cancel();
            debug!(epoch = self.epoch, "Transport run stopped");
        }
        self.epoch = self.epoch.wrapping_add(1);
        self.clear_session();
    }

    /// Whether a run is in progress (connecting or open).
    pub fn is_active(&self) -> bool {
        self.run.is_some()
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    /// Mark the current session as established. From here on a failure is
    /// reported as `Closed` instead of promoting to the fallback address.
    pub fn mark_established(&self) {
        if let Some(run) = &self.run {
            run.established.store(true, Ordering::SeqCst);
        }
    }

    /// Whether the open session can carry encrypted frames.
    pub fn can_encrypt(&self) -> bool {
        self.cipher.is_some()
    }

    /// Shared secret loaded for the open session.
    pub fn secret(&self) -> Option<&str> {
        self.secret.as_deref().map(String::as_str)
    }

    pub fn current_address(&self) -> Option<&Address> {
        self.address.as_ref()
    }

    /// Queue a payload for writing. Frames leave in call order.
    ///
    /// A payload whose frame would exceed `max_payload_size` is refused here
    /// with `OversizedFrame`; the session stays open.
    pub async fn send(&self, payload: Bytes, encrypt: bool) -> Result<()> {
        let writer = self.writer.as_ref().ok_or(ProtocolError::NotConnected)?;
        if encrypt && self.cipher.is_none() {
            return Err(ProtocolError::EncryptionFailure);
        }
        let framed_len = sealed_len(payload.len(), encrypt);
        if framed_len > self.config.max_payload_size {
            return Err(ProtocolError::OversizedFrame(framed_len));
        }
        writer
            .send(Outbound {
                encrypted: encrypt,
                payload,
            })
            .await
            .map_err(|_| ProtocolError::Transmission(constants::ERR_WRITER_CLOSED.into()))
    }

    /// Next event from the current run. Cancel-safe; pending forever while idle.
    pub async fn next_event(&mut self) -> TransportEvent {
        loop {
            let Some(signal) = self.signal_rx.recv().await else {
                return std::future::pending().await;
            };
            if signal.epoch != self.epoch || self.run.is_none() {
                continue;
            }
            match signal.kind {
                SignalKind::Opened {
                    address,
                    writer,
                    cipher,
                    secret,
                } => {
                    self.writer = Some(writer);
                    self.cipher = cipher;
                    self.secret = secret;
                    self.address = Some(address.clone());
                    return TransportEvent::Opened { address };
                }
                SignalKind::Frame(frame) => {
                    return TransportEvent::FrameReceived {
                        encrypted: frame.encrypted,
                        payload: frame.payload,
                    };
                }
                SignalKind::Closed(reason) => {
                    self.run = None;
                    self.clear_session();
                    return TransportEvent::Closed { reason };
                }
            }
        }
    }

    fn clear_session(&mut self) {
        self.writer = None;
        self.cipher = None;
        self.secret = None;
        self.address = None;
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(run) = self.run.take() {
            run.stopping.store(true, Ordering::SeqCst);
            run.cancel.cancel();
        }
    }
}

async fn resolve(
    store: &dyn SecureStore,
    endpoint: Option<Endpoint>,
) -> std::result::Result<(Endpoint, Option<Zeroizing<String>>), DisconnectReason> {
    let storage = |e: ProtocolError| DisconnectReason::StorageUnavailable(e.to_string());

    let endpoint = match endpoint {
        Some(endpoint) => endpoint,
        None => {
            let primary = store
                .get(RELAY_ADDRESS_KEY)
                .await
                .map_err(storage)?
                .filter(|value| !value.trim().is_empty())
                .ok_or(DisconnectReason::AddressMissing)?;
            let fallback = store.get(FALLBACK_ADDRESS_KEY).await.map_err(storage)?;
            Endpoint::parse(&primary, fallback.as_deref())
                .map_err(|e| DisconnectReason::InvalidAddress(e.to_string()))?
        }
    };
    let secret = store
        .get(SHARED_SECRET_KEY)
        .await
        .map_err(storage)?
        .map(Zeroizing::new);
    Ok((endpoint, secret))
}

#[instrument(skip_all, fields(epoch = ctx.signals.epoch))]
async fn run(ctx: RunContext) {
    let RunContext {
        config,
        connect_timeout,
        store,
        endpoint,
        cipher_override,
        metrics,
        signals,
        cancel,
        stopping,
        established,
    } = ctx;

    let (endpoint, secret) = match resolve(store.as_ref(), endpoint).await {
        Ok(resolved) => resolved,
        Err(reason) => {
            warn!(reason = %reason, "Cannot resolve relay endpoint");
            if !stopping.load(Ordering::SeqCst) {
                signals.closed(reason).await;
            }
            return;
        }
    };

    let cipher: Option<Arc<dyn FrameCipher>> = if config.encryption_enabled {
        cipher_override.or_else(|| {
            secret
                .as_ref()
                .map(|s| Arc::new(ChaChaCipher::from_secret(s)) as Arc<dyn FrameCipher>)
        })
    } else {
        None
    };
    if config.encryption_enabled && cipher.is_none() {
        debug!("{}; frames will be sent in plaintext", constants::ERR_NO_SECRET);
    }

    let link = Link {
        cipher: cipher.clone(),
        config: config.clone(),
        metrics: metrics.clone(),
    };

    let mut last_failure = None;
    for (index, address) in endpoint.candidates().enumerate() {
        if stopping.load(Ordering::SeqCst) {
            return;
        }
        let is_fallback = index > 0;
        if is_fallback {
            warn!(address = %address, "Promoting to fallback relay address");
        } else {
            info!(address = %address, "Connecting to relay");
        }
        metrics.connect_attempt(is_fallback);

        let connect = TcpStream::connect((address.host.as_str(), address.port));
        let stream = tokio::select! {
            _ = cancel.cancelled() => return,
            result = tokio::time::timeout(connect_timeout, connect) => match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    warn!(address = %address, error = %e, "Connect failed");
                    last_failure = Some(DisconnectReason::ConnectFailed {
                        address: address.clone(),
                        message: e.to_string(),
                    });
                    continue;
                }
                Err(_) => {
                    warn!(address = %address, timeout = ?connect_timeout, "Connect timed out");
                    last_failure = Some(DisconnectReason::ConnectFailed {
                        address: address.clone(),
                        message: format!("timed out after {connect_timeout:?}"),
                    });
                    continue;
                }
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        let (writer_tx, writer_rx) = mpsc::channel(config.outbound_queue.max(1));
        let opened = SignalKind::Opened {
            address: address.clone(),
            writer: writer_tx,
            cipher: cipher.clone(),
            secret: secret.clone(),
        };
        if !signals.emit(opened).await {
            return;
        }
        info!(address = %address, "Socket open");

        let Some(reason) = connection::drive(stream, writer_rx, &link, &signals, cancel.clone()).await
        else {
            return;
        };
        if stopping.load(Ordering::SeqCst) {
            return;
        }
        if established.load(Ordering::SeqCst) || !reason.is_transient() {
            info!(address = %address, reason = %reason, "Connection closed");
            signals.closed(reason).await;
            return;
        }
        warn!(address = %address, reason = %reason, "Connection failed before it was established");
        last_failure = Some(reason);
    }

    if !stopping.load(Ordering::SeqCst) {
        signals
            .closed(last_failure.unwrap_or(DisconnectReason::RemoteClosed))
            .await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::core::codec::FrameCodec;
    use crate::store::MemoryStore;
    use crate::utils::crypto::Crypto;
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_util::codec::Framed;

    fn plain_config() -> TransportConfig {
        TransportConfig {
            encryption_enabled: false,
            ..TransportConfig::default()
        }
    }

    async fn next(transport: &mut Transport) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), transport.next_event())
            .await
            .expect("transport event")
    }

    #[tokio::test]
    async fn test_missing_address_closes_with_reason() {
        let mut transport = Transport::new(plain_config(), Arc::new(MemoryStore::new()));
        transport.start();
        assert_eq!(
            next(&mut transport).await,
            TransportEvent::Closed {
                reason: DisconnectReason::AddressMissing
            }
        );
        assert!(!transport.is_active());
    }

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let relay = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(socket, FrameCodec::default());
            let frame = framed.next().await.unwrap().unwrap();
            framed.send(Frame::plain(frame.payload)).await.unwrap();
        });

        let mut transport = Transport::new(plain_config(), Arc::new(MemoryStore::new()));
        transport.configure(Some(Endpoint::new(Address::new("127.0.0.1", port))));
        transport.start();

        assert!(matches!(next(&mut transport).await, TransportEvent::Opened { .. }));
        assert!(transport.is_open());
        transport.send(Bytes::from_static(b"echo"), false).await.unwrap();
        assert_eq!(
            next(&mut transport).await,
            TransportEvent::FrameReceived {
                encrypted: false,
                payload: Bytes::from_static(b"echo")
            }
        );
        relay.await.unwrap();
    }

    #[tokio::test]
    async fn test_cipher_override_seals_outbound_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let relay = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(socket, FrameCodec::default());
            framed.next().await.unwrap().unwrap()
        });

        let metrics = Arc::new(Metrics::new());
        let mut transport = Transport::new(TransportConfig::default(), Arc::new(MemoryStore::new()))
            .with_cipher(Arc::new(ChaChaCipher::from_secret("override")))
            .with_metrics(metrics.clone());
        transport.configure(Some(Endpoint::new(Address::new("127.0.0.1", port))));
        transport.start();

        assert!(matches!(next(&mut transport).await, TransportEvent::Opened { .. }));
        assert!(transport.can_encrypt());
        assert_eq!(transport.secret(), None);
        transport.send(Bytes::from_static(b"sealed"), true).await.unwrap();

        let frame = relay.await.unwrap();
        assert!(frame.encrypted);
        let opened = Crypto::from_secret("override").open(&frame.payload).unwrap();
        assert_eq!(&opened[..], b"sealed");
        assert_eq!(metrics.snapshot().connect_attempts, 1);

        transport.stop();
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_oversized_payload_refused_without_closing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let relay = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(socket, FrameCodec::default());
            framed.next().await.unwrap().unwrap()
        });

        let config = TransportConfig {
            max_payload_size: 4096,
            ..TransportConfig::default()
        };
        let mut transport = Transport::new(config, Arc::new(MemoryStore::new()))
            .with_cipher(Arc::new(ChaChaCipher::from_secret("limit")));
        transport.configure(Some(Endpoint::new(Address::new("127.0.0.1", port))));
        transport.start();
        assert!(matches!(next(&mut transport).await, TransportEvent::Opened { .. }));

        // Fits in plaintext, but not once the nonce and tag are added
        let near_limit = Bytes::from(vec![1u8; 4090]);
        assert!(matches!(
            transport.send(near_limit.clone(), true).await,
            Err(ProtocolError::OversizedFrame(size)) if size == 4090 + NONCE_LEN + TAG_LEN
        ));
        assert!(matches!(
            transport.send(Bytes::from(vec![0u8; 5000]), false).await,
            Err(ProtocolError::OversizedFrame(5000))
        ));

        assert!(transport.is_open());
        transport.send(near_limit, false).await.unwrap();
        let frame = relay.await.unwrap();
        assert_eq!(frame.len(), 4090);
        assert!(!frame.encrypted);
    }

    #[tokio::test]
    async fn test_send_without_session_is_not_connected() {
        let transport = Transport::new(plain_config(), Arc::new(MemoryStore::new()));
        assert!(matches!(
            transport.send(Bytes::from_static(b"x"), false).await,
            Err(ProtocolError::NotConnected)
        ));
    }
}
