// ps-test-utils: Shared fixtures for relay and endpoint integration tests.
//
// Each test spins up its own isolated relay on a random port; helpers build
// relay clients, peer managers, and endpoints already registered with it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ps_endpoint::{Endpoint, EndpointConfig, MemoryStorage};
use ps_peer::{PeerManager, PeerManagerConfig, RelayClient, RelayClientConfig};
use relay::RelayState;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// A relay server running in a background task for the duration of a test.
pub struct TestRelay {
    state: RelayState,
    addr: SocketAddr,
    task: Option<JoinHandle<()>>,
}

impl TestRelay {
    /// Start a relay on a random local port.
    pub async fn start() -> Self {
        Self::bind("127.0.0.1:0").await
    }

    /// Start a relay on a specific address (for restart scenarios).
    pub async fn bind(addr: &str) -> Self {
        let state = RelayState::new();
        let router = relay::build_router(state.clone());
        // After a shutdown the port can take a moment to free up; retry.
        let mut attempts = 0;
        let listener = loop {
            match tokio::net::TcpListener::bind(addr).await {
                Ok(listener) => break listener,
                Err(e) if attempts < 100 => {
                    attempts += 1;
                    let _ = e;
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => panic!("bind relay listener: {e}"),
            }
        };
        let addr = listener.local_addr().expect("relay local addr");
        let task = tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .expect("serve relay");
        });
        Self {
            state,
            addr,
            task: Some(task),
        }
    }

    /// WebSocket address clients should connect to.
    pub fn address(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// The relay's live client registry.
    pub fn state(&self) -> &RelayState {
        &self.state
    }

    /// Kill the relay, freeing its port. Returns the address it served on.
    ///
    /// Aborting the accept loop does not stop the per-connection handler
    /// tasks, so every live client socket is also closed.
    pub async fn shutdown(mut self) -> SocketAddr {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        self.state.disconnect_all().await;
        self.addr
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

/// Relay-client config tuned for tests: fast backoff and keepalive.
pub fn fast_client_config() -> RelayClientConfig {
    RelayClientConfig {
        timeout: Duration::from_secs(5),
        initial_backoff: Duration::from_millis(50),
        keepalive_interval: Duration::from_millis(200),
        ..RelayClientConfig::default()
    }
}

/// Build a relay client for the given relay, not yet connected.
pub fn relay_client(relay: &TestRelay, uuid: Uuid, name: &str) -> RelayClient {
    RelayClient::new(relay.address(), uuid, name, fast_client_config()).expect("relay client")
}

/// Build a peer manager registered with the given relay.
pub async fn peer_manager(relay: &TestRelay, name: &str) -> PeerManager {
    peer_manager_with_config(relay, name, PeerManagerConfig::default()).await
}

/// Build a peer manager registered with the given relay, with a custom
/// manager config. ICE servers are cleared so negotiation stays on loopback
/// host candidates and never waits on external STUN.
pub async fn peer_manager_with_config(
    relay: &TestRelay,
    name: &str,
    mut config: PeerManagerConfig,
) -> PeerManager {
    config.ice_servers = Vec::new();
    let client = relay_client(relay, Uuid::new_v4(), name);
    PeerManager::connect(client, config)
        .await
        .expect("peer manager")
}

/// Build an initialized endpoint with in-memory storage, registered with
/// the given relay. ICE servers are cleared as in
/// [`peer_manager_with_config`].
pub async fn endpoint(relay: &TestRelay, name: &str) -> Endpoint {
    let mut config = EndpointConfig {
        relay: fast_client_config(),
        ..EndpointConfig::peering(name, Uuid::new_v4(), relay.address())
    };
    config.peer.ice_servers = Vec::new();
    let mut endpoint = Endpoint::new(config, Arc::new(MemoryStorage::new()));
    endpoint.init().await.expect("init endpoint");
    endpoint
}

/// Deterministic payload of `len` bytes for transfer tests.
pub fn pattern_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
