//! Relay client: one persistent registered WebSocket session.
//!
//! The client encapsulates an endpoint's registration with the relay server.
//! [`RelayClient::connect`] is idempotent and serialized by an internal
//! lock; transient failures retry with exponential backoff starting at the
//! configured initial value and doubling up to a 60-second cap. When
//! configured, a background watcher reopens the socket whenever it closes.
//!
//! The socket is shared: the peer manager and every peer connection send
//! through it, but only the manager's forwarder task reads from it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use ps_protocol::{RelayMessage, ServerRegistration, ServerResponse, decode, encode};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};
use uuid::Uuid;

use crate::task::spawn_guarded;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Ceiling for the exponential backoff between registration attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Error type for relay client operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayClientError {
    #[error("relay server address must start with ws:// or wss://, got {0}")]
    InvalidAddress(String),
    #[error("failed to build TLS configuration: {0}")]
    Tls(String),
    #[error("WebSocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("timed out {0}")]
    Timeout(&'static str),
    #[error("failed to register with relay server: {0}")]
    Registration(String),
    #[error("{0}")]
    Encode(#[from] ps_protocol::MessageEncodeError),
    #[error("{0}")]
    Decode(#[from] ps_protocol::MessageDecodeError),
    #[error("connection to relay server closed (clean: {clean})")]
    Disconnected { clean: bool },
    #[error("relay client is closed")]
    Closed,
}

impl RelayClientError {
    /// Whether a registration attempt hitting this error should back off and
    /// retry rather than surface to the caller.
    fn is_transient(&self) -> bool {
        matches!(
            self,
            RelayClientError::Ws(_)
                | RelayClientError::Timeout(_)
                | RelayClientError::Disconnected { .. }
        )
    }
}

/// Configuration for a [`RelayClient`].
#[derive(Clone)]
pub struct RelayClientConfig {
    /// Time to wait on the relay server during registration.
    pub timeout: Duration,
    /// First retry delay; doubles per attempt up to a 60 s cap.
    pub initial_backoff: Duration,
    /// Spawn a background task that reconnects when the socket closes.
    pub reconnect_task: bool,
    /// How often the reconnect watcher probes the socket with a ping. A
    /// failing probe is how closure is detected when no recv is in flight.
    pub keepalive_interval: Duration,
    /// Verify the relay server's TLS certificate (wss:// only).
    pub verify_certificate: bool,
    /// Custom TLS configuration; overrides `verify_certificate`.
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_secs(1),
            reconnect_task: true,
            keepalive_interval: Duration::from_secs(30),
            verify_certificate: true,
            tls_config: None,
        }
    }
}

struct ClientInner {
    address: String,
    uuid: Uuid,
    name: String,
    config: RelayClientConfig,
    tls_config: Option<Arc<rustls::ClientConfig>>,
    write: Mutex<Option<WsSink>>,
    read: Mutex<Option<WsSource>>,
    connect_lock: Mutex<()>,
    connected: watch::Sender<bool>,
    closed: AtomicBool,
    reconnect_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Client interface to a relay server.
///
/// Cheaply cloneable; all clones share one logical session.
#[derive(Clone)]
pub struct RelayClient {
    inner: Arc<ClientInner>,
}

impl RelayClient {
    /// Build a client for `address` registering as `uuid`/`name`.
    ///
    /// `wss://` addresses get a default verifying TLS context unless the
    /// config supplies one or disables verification. Any other scheme than
    /// `ws://`/`wss://` is rejected.
    pub fn new(
        address: impl Into<String>,
        uuid: Uuid,
        name: impl Into<String>,
        config: RelayClientConfig,
    ) -> Result<Self, RelayClientError> {
        let address = address.into();
        if !(address.starts_with("ws://") || address.starts_with("wss://")) {
            return Err(RelayClientError::InvalidAddress(address));
        }

        let tls_config = if address.starts_with("wss://") {
            match &config.tls_config {
                Some(tls) => Some(tls.clone()),
                // None means connect_async builds the default verifying
                // context from the native root store.
                None if config.verify_certificate => None,
                None => Some(Arc::new(insecure_tls_config()?)),
            }
        } else {
            None
        };

        let (connected, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(ClientInner {
                address,
                uuid,
                name: name.into(),
                config,
                tls_config,
                write: Mutex::new(None),
                read: Mutex::new(None),
                connect_lock: Mutex::new(()),
                connected,
                closed: AtomicBool::new(false),
                reconnect_task: std::sync::Mutex::new(None),
            }),
        })
    }

    /// UUID of the client as registered with the relay server.
    pub fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    /// Name of the client as registered with the relay server.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Relay server address this client registers with.
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Whether a registered socket is currently believed open.
    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Connect and register with the relay server.
    ///
    /// Returns immediately if an open registered socket exists. Otherwise a
    /// new connection is attempted with exponential backoff on transient
    /// failures; a rejecting relay surfaces a registration error without
    /// retry. After this returns the endpoint is registered under its fixed
    /// UUID and name, possibly having evicted a prior registration.
    pub async fn connect(&self) -> Result<(), RelayClientError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RelayClientError::Closed);
        }
        let _guard = self.inner.connect_lock.lock().await;
        if *self.inner.connected.borrow() {
            return Ok(());
        }

        let mut backoff = self.inner.config.initial_backoff;
        loop {
            match self.register_once().await {
                Ok((write, read)) => {
                    *self.inner.write.lock().await = Some(write);
                    *self.inner.read.lock().await = Some(read);
                    self.inner.connected.send_replace(true);
                    self.maybe_spawn_reconnect_task();
                    return Ok(());
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        address = %self.inner.address,
                        error = %e,
                        backoff_seconds = backoff.as_secs_f64(),
                        "registration with relay server failed; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Open a socket and perform the registration handshake once.
    async fn register_once(&self) -> Result<(WsSink, WsSource), RelayClientError> {
        let timeout = self.inner.config.timeout;
        let connector = self.inner.tls_config.clone().map(Connector::Rustls);
        let connecting = tokio_tungstenite::connect_async_tls_with_config(
            self.inner.address.as_str(),
            None,
            false,
            connector,
        );
        let (ws, _response) = tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| RelayClientError::Timeout("connecting to relay server"))??;
        let (mut write, mut read) = ws.split();

        let registration = RelayMessage::ServerRegistration(ServerRegistration {
            name: self.inner.name.clone(),
            uuid: self.inner.uuid,
        });
        write.send(Message::Text(encode(&registration)?.into())).await?;

        let reply = tokio::time::timeout(timeout, async {
            loop {
                match read.next().await {
                    None => return Err(RelayClientError::Disconnected { clean: false }),
                    Some(Err(e)) => return Err(RelayClientError::Ws(e)),
                    Some(Ok(Message::Text(text))) => return Ok(text),
                    Some(Ok(Message::Close(_))) => {
                        return Err(RelayClientError::Disconnected { clean: true });
                    }
                    Some(Ok(_)) => {}
                }
            }
        })
        .await
        .map_err(|_| RelayClientError::Timeout("waiting for registration response"))??;

        match decode(&reply) {
            Ok(RelayMessage::ServerResponse(ServerResponse { success: true, .. })) => {
                info!(
                    address = %self.inner.address,
                    uuid = %self.inner.uuid,
                    name = %self.inner.name,
                    "established client connection to relay server"
                );
                Ok((write, read))
            }
            Ok(RelayMessage::ServerResponse(response)) => Err(RelayClientError::Registration(
                response
                    .message
                    .unwrap_or_else(|| "relay server rejected registration".to_owned()),
            )),
            Ok(_) => Err(RelayClientError::Registration(
                "relay server replied with unexpected message type".to_owned(),
            )),
            Err(e) => Err(RelayClientError::Registration(format!(
                "unable to decode response from relay server: {e}"
            ))),
        }
    }

    fn maybe_spawn_reconnect_task(&self) {
        if !self.inner.config.reconnect_task {
            return;
        }
        let mut guard = self
            .inner
            .reconnect_task
            .lock()
            .expect("reconnect task lock poisoned");
        if guard.is_some() {
            return;
        }
        let client = self.clone();
        *guard = Some(spawn_guarded("relay-client-reconnect", async move {
            client.reconnect_on_close().await;
        }));
    }

    /// Wait for the socket to close and immediately reconnect.
    ///
    /// While the session is up the watcher probes it with pings at the
    /// keepalive interval; a failing probe marks the session closed. The
    /// receive path also flips the flag when it observes closure, whichever
    /// comes first.
    async fn reconnect_on_close(self) {
        let mut connected = self.inner.connected.subscribe();
        loop {
            while *connected.borrow_and_update() {
                tokio::select! {
                    changed = connected.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    () = tokio::time::sleep(self.inner.config.keepalive_interval) => {
                        if self.probe().await.is_err() {
                            self.mark_disconnected().await;
                        }
                    }
                }
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return;
            }
            if let Err(e) = self.connect().await {
                warn!(error = %e, "background reconnect to relay server failed");
                return;
            }
        }
    }

    /// Check socket liveness with a ping frame.
    async fn probe(&self) -> Result<(), RelayClientError> {
        let mut write = self.inner.write.lock().await;
        match write.as_mut() {
            Some(sink) => {
                sink.send(Message::Ping(bytes::Bytes::new())).await?;
                Ok(())
            }
            None => Err(RelayClientError::Disconnected { clean: false }),
        }
    }

    /// Send a control message, connecting first if necessary.
    pub async fn send(&self, message: &RelayMessage) -> Result<(), RelayClientError> {
        self.connect().await?;
        let frame = encode(message)?;
        let mut write = self.inner.write.lock().await;
        let Some(sink) = write.as_mut() else {
            return Err(RelayClientError::Disconnected { clean: false });
        };
        if let Err(e) = sink.send(Message::Text(frame.into())).await {
            drop(write);
            self.mark_disconnected().await;
            return Err(RelayClientError::Ws(e));
        }
        Ok(())
    }

    /// Receive the next control message, connecting first if necessary.
    ///
    /// A decode failure is returned without tearing down the socket; socket
    /// closure surfaces as [`RelayClientError::Disconnected`].
    pub async fn recv(&self) -> Result<RelayMessage, RelayClientError> {
        self.connect().await?;
        loop {
            let mut read = self.inner.read.lock().await;
            let Some(stream) = read.as_mut() else {
                return Err(RelayClientError::Disconnected { clean: false });
            };
            let frame = stream.next().await;
            drop(read);
            match frame {
                Some(Ok(Message::Text(text))) => return Ok(decode(&text)?),
                Some(Ok(Message::Ping(data))) => {
                    let mut write = self.inner.write.lock().await;
                    if let Some(sink) = write.as_mut() {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                }
                Some(Ok(Message::Close(_))) => {
                    self.mark_disconnected().await;
                    return Err(RelayClientError::Disconnected { clean: true });
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    self.mark_disconnected().await;
                    return Err(RelayClientError::Ws(e));
                }
                None => {
                    self.mark_disconnected().await;
                    return Err(RelayClientError::Disconnected { clean: false });
                }
            }
        }
    }

    /// Close the session: cancel the reconnect watcher and shut the socket.
    /// Idempotent.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        if let Some(task) = self
            .inner
            .reconnect_task
            .lock()
            .expect("reconnect task lock poisoned")
            .take()
        {
            task.abort();
        }
        let mut write = self.inner.write.lock().await;
        if let Some(sink) = write.as_mut() {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
        *write = None;
        drop(write);
        *self.inner.read.lock().await = None;
        self.inner.connected.send_replace(false);
    }

    async fn mark_disconnected(&self) {
        *self.inner.write.lock().await = None;
        *self.inner.read.lock().await = None;
        self.inner.connected.send_replace(false);
    }
}

// ---------------------------------------------------------------------------
// TLS without certificate verification (opt-in)
// ---------------------------------------------------------------------------

/// Certificate verifier that accepts anything. Useful against relays with
/// self-signed certificates; enabled only by `verify_certificate: false`.
#[derive(Debug)]
struct InsecureVerifier(rustls::crypto::CryptoProvider);

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn insecure_tls_config() -> Result<rustls::ClientConfig, RelayClientError> {
    let provider = rustls::crypto::ring::default_provider();
    let verifier = Arc::new(InsecureVerifier(provider.clone()));
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| RelayClientError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    Ok(config)
}
