//! Manager of many peer connections.
//!
//! Owns the peer map keyed by the unordered endpoint pair, routes
//! relay-forwarded signaling to the right connection (creating it lazily on
//! inbound offers), and merges every connection's received messages into one
//! queue. The peer-map lock is held only for map mutations, never across
//! I/O.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ps_protocol::{Payload, RelayMessage};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::client::{RelayClient, RelayClientError};
use crate::connection::{PeerConnection, PeerConnectionConfig, PeerConnectionError};
use crate::task::spawn_guarded;

/// Error type for peer manager operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerManagerError {
    #[error("relay client error: {0}")]
    Relay(#[from] RelayClientError),
    #[error("peer connection error: {0}")]
    Connection(#[from] PeerConnectionError),
    #[error("peer manager is closed")]
    Closed,
}

/// Unordered pair of endpoint UUIDs identifying one peer connection.
///
/// Canonicalized so both endpoints key the same connection with the same
/// value. A self-loop (`a == b`) is a valid pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerPair {
    first: Uuid,
    second: Uuid,
}

impl PeerPair {
    pub fn new(a: Uuid, b: Uuid) -> Self {
        if a <= b {
            Self { first: a, second: b }
        } else {
            Self { first: b, second: a }
        }
    }

    /// The member of the pair that is not `local` (or `local` itself for a
    /// self-loop).
    pub fn other(&self, local: Uuid) -> Uuid {
        if self.first == local {
            self.second
        } else {
            self.first
        }
    }
}

impl std::fmt::Display for PeerPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}", self.first, self.second)
    }
}

/// Configuration for a [`PeerManager`].
#[derive(Debug, Clone)]
pub struct PeerManagerConfig {
    /// Timeout for peer connections to become ready.
    pub timeout: Duration,
    /// Data channels per peer connection (offerer side).
    pub peer_channels: usize,
    /// STUN/TURN servers passed to each connection.
    pub ice_servers: Vec<String>,
    /// Per-connection receive queue capacity.
    pub queue_size: usize,
}

impl Default for PeerManagerConfig {
    fn default() -> Self {
        let connection = PeerConnectionConfig::default();
        Self {
            timeout: Duration::from_secs(30),
            peer_channels: connection.channels,
            ice_servers: connection.ice_servers,
            queue_size: connection.queue_size,
        }
    }
}

impl PeerManagerConfig {
    fn connection_config(&self) -> PeerConnectionConfig {
        PeerConnectionConfig {
            channels: self.peer_channels,
            ice_servers: self.ice_servers.clone(),
            queue_size: self.queue_size,
        }
    }
}

struct ManagerShared {
    uuid: Uuid,
    peers: Mutex<HashMap<PeerPair, Arc<PeerConnection>>>,
    pumps: std::sync::Mutex<HashMap<PeerPair, JoinHandle<()>>>,
    queue_tx: mpsc::UnboundedSender<(Uuid, Payload)>,
}

/// Peer connections manager.
///
/// ```no_run
/// # use ps_peer::{PeerManager, PeerManagerConfig, RelayClient};
/// # use ps_protocol::Payload;
/// # async fn example(relay_a: RelayClient, relay_b: RelayClient, uuid_b: uuid::Uuid)
/// # -> Result<(), Box<dyn std::error::Error>> {
/// let manager_a = PeerManager::connect(relay_a, PeerManagerConfig::default()).await?;
/// let manager_b = PeerManager::connect(relay_b, PeerManagerConfig::default()).await?;
///
/// manager_a
///     .send(uuid_b, Payload::from("hello hello"), std::time::Duration::from_secs(30))
///     .await?;
/// let (source, message) = manager_b.recv().await?;
/// # Ok(())
/// # }
/// ```
pub struct PeerManager {
    relay: RelayClient,
    config: PeerManagerConfig,
    shared: Arc<ManagerShared>,
    queue_rx: Mutex<mpsc::UnboundedReceiver<(Uuid, Payload)>>,
    forwarder: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PeerManager {
    /// Register `relay` with its relay server and start routing its
    /// messages.
    pub async fn connect(
        relay: RelayClient,
        config: PeerManagerConfig,
    ) -> Result<Self, PeerManagerError> {
        relay.connect().await?;

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ManagerShared {
            uuid: relay.uuid(),
            peers: Mutex::new(HashMap::new()),
            pumps: std::sync::Mutex::new(HashMap::new()),
            queue_tx,
        });

        let forwarder = spawn_guarded("peer-manager-forwarder", {
            let relay = relay.clone();
            let shared = shared.clone();
            let config = config.clone();
            async move {
                forward_relay_messages(relay, shared, config).await;
            }
        });

        info!(
            uuid = %relay.uuid(),
            name = relay.name(),
            "peer manager registered with relay server"
        );
        Ok(Self {
            relay,
            config,
            shared,
            queue_rx: Mutex::new(queue_rx),
            forwarder: std::sync::Mutex::new(Some(forwarder)),
        })
    }

    /// UUID of this endpoint.
    pub fn uuid(&self) -> Uuid {
        self.shared.uuid
    }

    /// Name of this endpoint as registered with the relay server.
    pub fn name(&self) -> &str {
        self.relay.name()
    }

    /// Relay client shared with the peer connections.
    pub fn relay_client(&self) -> &RelayClient {
        &self.relay
    }

    /// Get the connection to `peer_uuid`, dialing it (offer via the relay)
    /// if it does not exist yet.
    pub async fn get_connection(
        &self,
        peer_uuid: Uuid,
    ) -> Result<Arc<PeerConnection>, PeerManagerError> {
        let pair = PeerPair::new(self.shared.uuid, peer_uuid);
        let (connection, created) = ensure_connection(
            &self.relay,
            &self.shared,
            &self.config,
            pair,
            peer_uuid,
        )
        .await?;
        if created {
            info!(peer = %peer_uuid, "opening peer connection");
            connection.send_offer(peer_uuid).await?;
        }
        Ok(connection)
    }

    /// Send `payload` to `peer_uuid`, connecting first if necessary.
    pub async fn send(
        &self,
        peer_uuid: Uuid,
        payload: Payload,
        timeout: Duration,
    ) -> Result<(), PeerManagerError> {
        let connection = self.get_connection(peer_uuid).await?;
        connection.send(payload, timeout).await?;
        Ok(())
    }

    /// Receive the next message from any peer.
    pub async fn recv(&self) -> Result<(Uuid, Payload), PeerManagerError> {
        self.queue_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(PeerManagerError::Closed)
    }

    /// Tear down the connection for one peer pair, if it exists.
    pub async fn close_connection(&self, peers: PeerPair) {
        let connection = self.shared.peers.lock().await.remove(&peers);
        if let Some(connection) = connection {
            info!(pair = %peers, "closing connection between peers");
            connection.close().await;
        }
        let pump = self
            .shared
            .pumps
            .lock()
            .expect("pump lock poisoned")
            .remove(&peers);
        if let Some(pump) = pump {
            pump.abort();
        }
    }

    /// Tear down every peer connection, stop the background tasks, and close
    /// the relay client. Idempotent.
    pub async fn close(&self) {
        if let Some(task) = self
            .forwarder
            .lock()
            .expect("forwarder lock poisoned")
            .take()
        {
            task.abort();
        }
        let pumps: Vec<JoinHandle<()>> = self
            .shared
            .pumps
            .lock()
            .expect("pump lock poisoned")
            .drain()
            .map(|(_, task)| task)
            .collect();
        for pump in pumps {
            pump.abort();
        }
        let peers: Vec<Arc<PeerConnection>> = self
            .shared
            .peers
            .lock()
            .await
            .drain()
            .map(|(_, connection)| connection)
            .collect();
        for connection in peers {
            connection.close().await;
        }
        self.relay.close().await;
        info!(uuid = %self.shared.uuid, "peer manager closed");
    }
}

/// Look up or create the connection for `pair`. Returns the connection and
/// whether this call created it. Creation happens outside the map lock; a
/// racing creation is resolved by closing the redundant connection.
async fn ensure_connection(
    relay: &RelayClient,
    shared: &Arc<ManagerShared>,
    config: &PeerManagerConfig,
    pair: PeerPair,
    remote_uuid: Uuid,
) -> Result<(Arc<PeerConnection>, bool), PeerManagerError> {
    if let Some(existing) = shared.peers.lock().await.get(&pair) {
        return Ok((existing.clone(), false));
    }

    let connection = Arc::new(PeerConnection::new(relay.clone(), config.connection_config()).await?);
    {
        let mut peers = shared.peers.lock().await;
        if let Some(existing) = peers.get(&pair) {
            let existing = existing.clone();
            drop(peers);
            connection.close().await;
            return Ok((existing, false));
        }
        peers.insert(pair, connection.clone());
    }

    // Close callback removes the pair from the map; the weak handle keeps
    // connection and manager from owning each other.
    let weak = Arc::downgrade(shared);
    connection.set_on_close(Box::new(move || {
        if let Some(shared) = weak.upgrade() {
            tokio::spawn(async move {
                shared.peers.lock().await.remove(&pair);
                let pump = shared
                    .pumps
                    .lock()
                    .expect("pump lock poisoned")
                    .remove(&pair);
                if let Some(pump) = pump {
                    pump.abort();
                }
                debug!(pair = %pair, "removed closed peer connection");
            });
        }
    }));

    let pump = spawn_guarded("peer-connection-recv", {
        let connection = connection.clone();
        let queue_tx = shared.queue_tx.clone();
        let shared = Arc::downgrade(shared);
        let timeout = config.timeout;
        async move {
            pump_messages(connection, remote_uuid, queue_tx, timeout, pair, shared).await;
        }
    });
    shared
        .pumps
        .lock()
        .expect("pump lock poisoned")
        .insert(pair, pump);

    Ok((connection, true))
}

/// Wait for a connection to become ready, then push everything it receives
/// onto the manager queue.
async fn pump_messages(
    connection: Arc<PeerConnection>,
    peer_uuid: Uuid,
    queue_tx: mpsc::UnboundedSender<(Uuid, Payload)>,
    timeout: Duration,
    pair: PeerPair,
    shared: std::sync::Weak<ManagerShared>,
) {
    if let Err(e) = connection.ready(timeout).await {
        error!(peer = %peer_uuid, error = %e, "peer connection failed to become ready");
        if let Some(shared) = shared.upgrade() {
            let connection = shared.peers.lock().await.remove(&pair);
            if let Some(connection) = connection {
                connection.close().await;
            }
        }
        return;
    }
    info!(peer = %peer_uuid, "listening for messages from peer");
    while let Some(payload) = connection.recv().await {
        debug!(peer = %peer_uuid, "queueing message from peer");
        if queue_tx.send((peer_uuid, payload)).is_err() {
            break;
        }
    }
}

/// Read the relay client until the socket closes, routing signaling to the
/// per-pair connections.
async fn forward_relay_messages(
    relay: RelayClient,
    shared: Arc<ManagerShared>,
    config: PeerManagerConfig,
) {
    info!("listening for messages from relay server");
    loop {
        match relay.recv().await {
            Ok(RelayMessage::PeerConnection(message)) => {
                debug!(
                    source = %message.source_uuid,
                    "relay server forwarded peer connection message"
                );
                let pair = PeerPair::new(message.source_uuid, message.peer_uuid);
                let remote_uuid = pair.other(shared.uuid);
                let connection =
                    match ensure_connection(&relay, &shared, &config, pair, remote_uuid).await {
                        Ok((connection, _created)) => connection,
                        Err(e) => {
                            error!(pair = %pair, error = %e, "failed to create peer connection");
                            continue;
                        }
                    };
                if let Err(e) = connection.handle_server_message(&message).await {
                    error!(pair = %pair, error = %e, "failed to handle relay message");
                }
            }
            // The manager never sends the relay anything that warrants a
            // ServerResponse.
            Ok(RelayMessage::ServerResponse(response)) => {
                warn!(?response, "got unexpected server response from relay server");
            }
            Ok(RelayMessage::ServerRegistration(_)) => {
                error!("received unknown message type from relay server");
            }
            Err(RelayClientError::Decode(e)) => {
                error!(error = %e, "error decoding message from relay server; skipping");
            }
            Err(RelayClientError::Disconnected { clean }) => {
                info!(clean, "relay server connection closed; stopping forwarder");
                break;
            }
            Err(e) => {
                error!(error = %e, "relay client error; stopping forwarder");
                break;
            }
        }
    }
}
