//! One WebRTC association with a single remote endpoint.
//!
//! The offerer creates N data channels labelled `p2p-0 … p2p-(N-1)`, the
//! answerer accepts whatever arrives. Session descriptions travel through
//! the relay; ICE gathering completes before a description is sent, so
//! candidates ride inside the SDP and no trickle messages exist on the
//! wire. Payloads are chunked and round-robined across the channels as
//! binary frames; a per-connection task reassembles inbound chunks by
//! stream id and feeds the receive queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use ps_protocol::{
    Chunk, DescriptionType, Payload, PeerConnectionMessage, RelayMessage, chunkify, reconstruct,
};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::client::RelayClient;
use crate::task::spawn_guarded;

/// Max payload bytes per chunk for byte streams. Data-channel messages are
/// implementation-limited to roughly 64 KB.
pub const MAX_CHUNK_SIZE_BYTES: usize = 60_000;
/// Max payload bytes per chunk for text streams, which some stacks cap near
/// 16 KB.
pub const MAX_CHUNK_SIZE_STRING: usize = 15_000;

/// Error type for peer connection operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerConnectionError {
    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),
    #[error("relay client error: {0}")]
    Relay(#[from] crate::client::RelayClientError),
    #[error("invalid session description: {0}")]
    Description(#[from] serde_json::Error),
    #[error("failed to establish peer connection: {0}")]
    Connect(String),
    #[error("timeout waiting for peer connection to establish after {0:?}")]
    Timeout(Duration),
    #[error("peer connection is closed")]
    Closed,
    #[error("local session description missing after ICE gathering")]
    MissingDescription,
}

/// Mirror of the underlying WebRTC association state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Closed,
    Failed,
}

/// Configuration for a [`PeerConnection`].
#[derive(Debug, Clone)]
pub struct PeerConnectionConfig {
    /// Number of data channels the offerer opens. The answerer side accepts
    /// whatever the offerer created regardless of its own setting.
    pub channels: usize,
    /// STUN/TURN servers for ICE.
    pub ice_servers: Vec<String>,
    /// Capacity of the reassembled-message receive queue.
    pub queue_size: usize,
}

impl Default for PeerConnectionConfig {
    fn default() -> Self {
        Self {
            channels: 1,
            ice_servers: vec!["stun:stun.l.google.com:19302".to_owned()],
            queue_size: 256,
        }
    }
}

#[derive(Debug, Clone)]
enum ReadySignal {
    Pending,
    Ready,
    Failed(String),
}

struct ConnectionShared {
    /// Channel count the offerer committed to; zero on the answerer side,
    /// which becomes ready as soon as the first inbound channel opens.
    expected_channels: AtomicUsize,
    open_channels: AtomicUsize,
    channels: Mutex<Vec<Arc<RTCDataChannel>>>,
    ready: watch::Sender<ReadySignal>,
    chunk_tx: mpsc::UnboundedSender<Bytes>,
    peer: std::sync::Mutex<Option<(Uuid, String)>>,
    closed: AtomicBool,
    callback_fired: AtomicBool,
    on_close: std::sync::Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ConnectionShared {
    /// Resolve the ready-signal successfully, unless it already failed.
    fn mark_ready(&self) {
        self.ready.send_if_modified(|signal| {
            if matches!(signal, ReadySignal::Pending) {
                *signal = ReadySignal::Ready;
                true
            } else {
                false
            }
        });
    }

    /// Resolve the ready-signal with an error, unless it already resolved.
    fn fail(&self, reason: String) {
        self.ready.send_if_modified(|signal| {
            if matches!(signal, ReadySignal::Pending) {
                *signal = ReadySignal::Failed(reason);
                true
            } else {
                false
            }
        });
    }

    fn set_peer(&self, uuid: Uuid, name: &str) {
        let mut peer = self.peer.lock().expect("peer identity lock poisoned");
        if peer.is_none() {
            *peer = Some((uuid, name.to_owned()));
        }
    }

    /// Invoke the user close callback; at most once per connection.
    fn fire_close_callback(&self) {
        if self.callback_fired.swap(true, Ordering::AcqRel) {
            return;
        }
        let callback = self
            .on_close
            .lock()
            .expect("close callback lock poisoned")
            .take();
        if let Some(callback) = callback {
            callback();
        }
    }
}

/// Peer-to-peer connection over WebRTC data channels.
///
/// Applications should normally hold these through a
/// [`PeerManager`](crate::manager::PeerManager), which routes relay
/// signaling and pumps received messages.
pub struct PeerConnection {
    relay: RelayClient,
    config: PeerConnectionConfig,
    pc: Arc<RTCPeerConnection>,
    shared: Arc<ConnectionShared>,
    incoming: Mutex<mpsc::Receiver<Payload>>,
    stream_counter: AtomicU32,
    reassembly_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PeerConnection {
    /// Build the underlying WebRTC association and its reassembly task.
    ///
    /// No channels exist and no signaling happens until
    /// [`send_offer`](Self::send_offer) or an inbound offer arrives.
    pub async fn new(
        relay: RelayClient,
        config: PeerConnectionConfig,
    ) -> Result<Self, PeerConnectionError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(rtc_config).await?);

        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let (message_tx, message_rx) = mpsc::channel(config.queue_size);
        let (ready, _) = watch::channel(ReadySignal::Pending);

        let shared = Arc::new(ConnectionShared {
            expected_channels: AtomicUsize::new(0),
            open_channels: AtomicUsize::new(0),
            channels: Mutex::new(Vec::new()),
            ready,
            chunk_tx,
            peer: std::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
            callback_fired: AtomicBool::new(false),
            on_close: std::sync::Mutex::new(None),
        });

        let reassembly_task = spawn_guarded(
            "peer-connection-reassembly",
            reassemble(chunk_rx, message_tx),
        );

        // Answerer side: capture channels created by the remote offerer.
        let shared_dc = shared.clone();
        pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let shared = shared_dc.clone();
            Box::pin(async move {
                debug!(label = channel.label(), "received data channel from peer");
                install_channel(&shared, channel).await;
            })
        }));

        let shared_state = shared.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let shared = shared_state.clone();
            Box::pin(async move {
                debug!(?state, "peer connection state changed");
                match state {
                    RTCPeerConnectionState::Failed => {
                        shared.fail("peer connection transitioned to failed".to_owned());
                        shared.fire_close_callback();
                    }
                    RTCPeerConnectionState::Closed => shared.fire_close_callback(),
                    _ => {}
                }
            })
        }));

        Ok(Self {
            relay,
            config,
            pc,
            shared,
            incoming: Mutex::new(message_rx),
            stream_counter: AtomicU32::new(0),
            reassembly_task: std::sync::Mutex::new(Some(reassembly_task)),
        })
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        if self.shared.closed.load(Ordering::Acquire) {
            return ConnectionState::Closed;
        }
        match self.pc.connection_state() {
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Connecting | RTCPeerConnectionState::Disconnected => {
                ConnectionState::Connecting
            }
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
            RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
                ConnectionState::New
            }
        }
    }

    /// UUID of the remote endpoint, known after the first description
    /// exchange.
    pub fn peer_uuid(&self) -> Option<Uuid> {
        self.shared
            .peer
            .lock()
            .expect("peer identity lock poisoned")
            .as_ref()
            .map(|(uuid, _)| *uuid)
    }

    /// Name of the remote endpoint, known after the first description
    /// exchange.
    pub fn peer_name(&self) -> Option<String> {
        self.shared
            .peer
            .lock()
            .expect("peer identity lock poisoned")
            .as_ref()
            .map(|(_, name)| name.clone())
    }

    /// Register a callback invoked exactly once when the connection closes,
    /// whichever side initiates it.
    pub fn set_on_close(&self, callback: Box<dyn FnOnce() + Send>) {
        *self
            .shared
            .on_close
            .lock()
            .expect("close callback lock poisoned") = Some(callback);
    }

    /// Create the data channels and send an offer to `peer_uuid` through the
    /// relay.
    pub async fn send_offer(&self, peer_uuid: Uuid) -> Result<(), PeerConnectionError> {
        let count = self.config.channels.max(1);
        self.shared.expected_channels.store(count, Ordering::Release);
        for index in 0..count {
            let channel = self.pc.create_data_channel(&format!("p2p-{index}"), None).await?;
            install_channel(&self.shared, channel).await;
        }

        let offer = self.pc.create_offer(None).await?;
        let description = self.finalize_local_description(offer).await?;
        info!(peer = %peer_uuid, channels = count, "sending offer to peer");
        self.send_signal(peer_uuid, DescriptionType::Offer, description)
            .await
    }

    /// Send an answer to the peer that sent the initial offer.
    async fn send_answer(&self, peer_uuid: Uuid) -> Result<(), PeerConnectionError> {
        let answer = self.pc.create_answer(None).await?;
        let description = self.finalize_local_description(answer).await?;
        info!(peer = %peer_uuid, "sending answer to peer");
        self.send_signal(peer_uuid, DescriptionType::Answer, description)
            .await
    }

    /// Apply a local description and wait for ICE gathering so the encoded
    /// description carries the full candidate set.
    async fn finalize_local_description(
        &self,
        description: RTCSessionDescription,
    ) -> Result<String, PeerConnectionError> {
        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(description).await?;
        let _ = gathered.recv().await;
        let local = self
            .pc
            .local_description()
            .await
            .ok_or(PeerConnectionError::MissingDescription)?;
        Ok(serde_json::to_string(&local)?)
    }

    async fn send_signal(
        &self,
        peer_uuid: Uuid,
        description_type: DescriptionType,
        description: String,
    ) -> Result<(), PeerConnectionError> {
        let message = RelayMessage::PeerConnection(PeerConnectionMessage {
            source_uuid: self.relay.uuid(),
            source_name: self.relay.name().to_owned(),
            peer_uuid,
            description_type,
            description,
            error: None,
        });
        self.relay.send(&message).await?;
        Ok(())
    }

    /// Handle a relay-forwarded signaling message for this connection.
    ///
    /// A populated `error` resolves the ready-signal with a connection
    /// error. A description that is not a session description (the protocol
    /// never carries standalone ICE candidates, but be defensive) is logged
    /// and ignored.
    pub async fn handle_server_message(
        &self,
        message: &PeerConnectionMessage,
    ) -> Result<(), PeerConnectionError> {
        if let Some(error) = &message.error {
            self.shared
                .fail(format!("received error message from relay server: {error}"));
            return Ok(());
        }

        self.shared.set_peer(message.source_uuid, &message.source_name);

        let description = match serde_json::from_str::<RTCSessionDescription>(&message.description)
        {
            Ok(description) => description,
            Err(e) => {
                warn!(
                    source = %message.source_uuid,
                    error = %e,
                    "ignoring peer connection message that is not a session description"
                );
                return Ok(());
            }
        };

        match message.description_type {
            DescriptionType::Offer => {
                info!(source = %message.source_uuid, "received offer from peer");
                self.pc.set_remote_description(description).await?;
                self.send_answer(message.source_uuid).await?;
            }
            DescriptionType::Answer => {
                info!(source = %message.source_uuid, "received answer from peer");
                self.pc.set_remote_description(description).await?;
            }
        }
        Ok(())
    }

    /// Wait for every data channel to open.
    pub async fn ready(&self, timeout: Duration) -> Result<(), PeerConnectionError> {
        let mut signal = self.shared.ready.subscribe();
        let wait = async {
            loop {
                {
                    let current = signal.borrow_and_update();
                    match &*current {
                        ReadySignal::Ready => return Ok(()),
                        ReadySignal::Failed(reason) => {
                            return Err(PeerConnectionError::Connect(reason.clone()));
                        }
                        ReadySignal::Pending => {}
                    }
                }
                if signal.changed().await.is_err() {
                    return Err(PeerConnectionError::Closed);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| PeerConnectionError::Timeout(timeout))?
    }

    /// Chunk `payload` into a fresh stream and round-robin the chunks across
    /// the data channels.
    pub async fn send(
        &self,
        payload: Payload,
        timeout: Duration,
    ) -> Result<(), PeerConnectionError> {
        self.ready(timeout).await?;
        let stream_id = self.stream_counter.fetch_add(1, Ordering::SeqCst);
        let chunk_size = match payload {
            Payload::Bytes(_) => MAX_CHUNK_SIZE_BYTES,
            Payload::Text(_) => MAX_CHUNK_SIZE_STRING,
        };
        let channels = self.shared.channels.lock().await.clone();
        if channels.is_empty() {
            return Err(PeerConnectionError::Closed);
        }
        for (index, chunk) in chunkify(&payload, chunk_size, stream_id).enumerate() {
            let channel = &channels[index % channels.len()];
            channel.send(&chunk.to_bytes()).await?;
        }
        debug!(stream_id, "sent message to peer");
        Ok(())
    }

    /// Remove one reassembled message from the receive queue, waiting if it
    /// is empty. Returns `None` once the connection is closed.
    pub async fn recv(&self) -> Option<Payload> {
        self.incoming.lock().await.recv().await
    }

    /// Terminate the association and invoke the close callback. Idempotent.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("closing peer connection");
        if let Err(e) = self.pc.close().await {
            warn!(error = %e, "error closing peer connection");
        }
        self.shared.fire_close_callback();
        if let Some(task) = self
            .reassembly_task
            .lock()
            .expect("reassembly task lock poisoned")
            .take()
        {
            task.abort();
        }
    }
}

/// Wire a data channel into the connection: count it toward readiness and
/// forward its frames to the reassembly task.
async fn install_channel(shared: &Arc<ConnectionShared>, channel: Arc<RTCDataChannel>) {
    let chunk_tx = shared.chunk_tx.clone();
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        let chunk_tx = chunk_tx.clone();
        Box::pin(async move {
            let _ = chunk_tx.send(message.data);
        })
    }));

    let shared_open = shared.clone();
    let label = channel.label().to_owned();
    channel.on_open(Box::new(move || {
        let shared = shared_open.clone();
        let label = label.clone();
        Box::pin(async move {
            let open = shared.open_channels.fetch_add(1, Ordering::AcqRel) + 1;
            let expected = shared.expected_channels.load(Ordering::Acquire);
            debug!(label, open, expected, "data channel open");
            if open >= expected {
                shared.mark_ready();
            }
        })
    }));

    shared.channels.lock().await.push(channel);
}

/// Group inbound chunks by stream id and enqueue each completed message.
async fn reassemble(mut chunk_rx: mpsc::UnboundedReceiver<Bytes>, message_tx: mpsc::Sender<Payload>) {
    let mut pending: HashMap<u32, Vec<Chunk>> = HashMap::new();
    while let Some(frame) = chunk_rx.recv().await {
        let chunk = match Chunk::from_bytes(&frame) {
            Ok(chunk) => chunk,
            Err(e) => {
                error!(error = %e, "dropping undecodable chunk");
                continue;
            }
        };
        let stream_id = chunk.stream_id;
        let stream = pending.entry(stream_id).or_default();
        if stream.iter().any(|existing| existing.seq_id == chunk.seq_id) {
            warn!(stream_id, seq_id = chunk.seq_id, "dropping duplicate chunk");
            continue;
        }
        let seq_len = chunk.seq_len as usize;
        stream.push(chunk);
        if stream.len() == seq_len {
            let chunks = pending.remove(&stream_id).unwrap_or_default();
            match reconstruct(chunks) {
                Ok(payload) => {
                    debug!(stream_id, "reassembled message from peer");
                    if message_tx.send(payload).await.is_err() {
                        return;
                    }
                }
                Err(e) => error!(stream_id, error = %e, "failed to reassemble stream"),
            }
        }
    }
}
