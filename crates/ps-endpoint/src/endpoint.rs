//! Endpoint: endpoint-addressed key/value operations.
//!
//! Every operation takes an optional target endpoint UUID. Operations land
//! on the local storage collaborator when the target is unset, names this
//! endpoint, or the endpoint runs solo; otherwise the request is forwarded
//! to the named peer over a WebRTC data channel and the reply is matched to
//! the pending call by its correlation id.
//!
//! A request made to a remote only invokes the operation there and returns
//! the result; a remote `get` does not populate the local store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ps_peer::task::spawn_guarded;
use ps_peer::{
    PeerManager, PeerManagerConfig, PeerManagerError, RelayClient, RelayClientConfig,
    RelayClientError,
};
use ps_protocol::Payload;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::messages::{EndpointOp, EndpointRequest, MessageKind};
use crate::storage::{Storage, StorageError};

/// Error type for endpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("peering is not available; initialize the endpoint before addressing remote endpoints")]
    PeeringNotAvailable,
    #[error("peer request failed: {0}")]
    PeerRequest(String),
    #[error("relay client error: {0}")]
    Relay(#[from] RelayClientError),
    #[error("peer manager error: {0}")]
    Manager(#[from] PeerManagerError),
    #[error("failed to serialize endpoint message: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Whether the endpoint participates in the peer mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointMode {
    /// No relay configured; remote targets are served locally.
    Solo,
    /// Relay configured; remote targets are forwarded to peers.
    Peering,
}

/// Configuration for an [`Endpoint`].
#[derive(Clone)]
pub struct EndpointConfig {
    pub name: String,
    pub uuid: Uuid,
    /// Relay server address; `None` selects solo mode.
    pub relay_address: Option<String>,
    pub relay: RelayClientConfig,
    pub peer: PeerManagerConfig,
    /// Timeout for a single peer-to-peer request.
    pub peer_timeout: Duration,
}

impl EndpointConfig {
    /// Solo-mode endpoint: every operation is local.
    pub fn solo(name: impl Into<String>, uuid: Uuid) -> Self {
        Self {
            name: name.into(),
            uuid,
            relay_address: None,
            relay: RelayClientConfig::default(),
            peer: PeerManagerConfig::default(),
            peer_timeout: Duration::from_secs(30),
        }
    }

    /// Peering endpoint registered with the relay at `relay_address`.
    pub fn peering(
        name: impl Into<String>,
        uuid: Uuid,
        relay_address: impl Into<String>,
    ) -> Self {
        Self {
            relay_address: Some(relay_address.into()),
            ..Self::solo(name, uuid)
        }
    }
}

struct Peering {
    manager: Arc<PeerManager>,
    pending: Arc<Mutex<HashMap<Uuid, oneshot::Sender<EndpointRequest>>>>,
    handler: JoinHandle<()>,
}

/// A distributed blob-store endpoint.
///
/// Construct with [`Endpoint::new`], then call [`init`](Endpoint::init) to
/// bring up peering. Operations that address a remote endpoint before
/// `init` fail with [`EndpointError::PeeringNotAvailable`].
pub struct Endpoint {
    config: EndpointConfig,
    mode: EndpointMode,
    storage: Arc<dyn Storage>,
    peering: Option<Peering>,
}

impl Endpoint {
    /// Build an endpoint over an externally owned storage collaborator.
    ///
    /// The endpoint never closes the storage; its lifetime belongs to the
    /// caller.
    pub fn new(config: EndpointConfig, storage: Arc<dyn Storage>) -> Self {
        let mode = if config.relay_address.is_some() {
            EndpointMode::Peering
        } else {
            EndpointMode::Solo
        };
        Self {
            config,
            mode,
            storage,
            peering: None,
        }
    }

    /// Register with the relay server and start serving peer requests.
    ///
    /// A no-op in solo mode and when already initialized.
    pub async fn init(&mut self) -> Result<(), EndpointError> {
        if self.peering.is_some() {
            return Ok(());
        }
        let Some(address) = self.config.relay_address.clone() else {
            return Ok(());
        };

        let relay = RelayClient::new(
            address,
            self.config.uuid,
            self.config.name.clone(),
            self.config.relay.clone(),
        )?;
        let manager = Arc::new(PeerManager::connect(relay, self.config.peer.clone()).await?);
        let pending: Arc<Mutex<HashMap<Uuid, oneshot::Sender<EndpointRequest>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let handler = spawn_guarded("endpoint-peer-handler", {
            let manager = manager.clone();
            let storage = self.storage.clone();
            let pending = pending.clone();
            let send_timeout = self.config.peer_timeout;
            async move {
                handle_peer_requests(manager, storage, pending, send_timeout).await;
            }
        });

        info!(uuid = %self.config.uuid, name = %self.config.name, "endpoint peering enabled");
        self.peering = Some(Peering {
            manager,
            pending,
            handler,
        });
        Ok(())
    }

    pub fn uuid(&self) -> Uuid {
        self.config.uuid
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn mode(&self) -> EndpointMode {
        self.mode
    }

    /// Resolve where an operation should run: `Some(target)` for a remote
    /// peer, `None` for the local storage.
    fn peer_target(&self, endpoint: Option<Uuid>) -> Result<Option<Uuid>, EndpointError> {
        if self.mode == EndpointMode::Solo {
            return Ok(None);
        }
        match endpoint {
            None => Ok(None),
            Some(target) if target == self.config.uuid => Ok(None),
            Some(_) if self.peering.is_none() => Err(EndpointError::PeeringNotAvailable),
            Some(target) => Ok(Some(target)),
        }
    }

    /// Value associated with `key` on the addressed endpoint.
    pub async fn get(
        &self,
        key: &str,
        endpoint: Option<Uuid>,
    ) -> Result<Option<Vec<u8>>, EndpointError> {
        match self.peer_target(endpoint)? {
            Some(target) => {
                let request = EndpointRequest::request(EndpointOp::Get, key, None);
                let response = self.request_from_peer(target, request).await?;
                Ok(response.data)
            }
            None => Ok(self.storage.get(key).await?),
        }
    }

    /// Associate `data` with `key` on the addressed endpoint.
    pub async fn set(
        &self,
        key: &str,
        data: Vec<u8>,
        endpoint: Option<Uuid>,
    ) -> Result<(), EndpointError> {
        match self.peer_target(endpoint)? {
            Some(target) => {
                let request = EndpointRequest::request(EndpointOp::Set, key, Some(data));
                let response = self.request_from_peer(target, request).await?;
                if response.success == Some(false) {
                    return Err(EndpointError::PeerRequest(
                        "peer endpoint refused the set operation".to_owned(),
                    ));
                }
                Ok(())
            }
            None => Ok(self.storage.set(key, data).await?),
        }
    }

    /// Whether `key` exists on the addressed endpoint.
    pub async fn exists(
        &self,
        key: &str,
        endpoint: Option<Uuid>,
    ) -> Result<bool, EndpointError> {
        match self.peer_target(endpoint)? {
            Some(target) => {
                let request = EndpointRequest::request(EndpointOp::Exists, key, None);
                let response = self.request_from_peer(target, request).await?;
                Ok(response.exists.unwrap_or(false))
            }
            None => Ok(self.storage.exists(key).await?),
        }
    }

    /// Evict `key` from the addressed endpoint. Idempotent.
    pub async fn evict(&self, key: &str, endpoint: Option<Uuid>) -> Result<(), EndpointError> {
        match self.peer_target(endpoint)? {
            Some(target) => {
                let request = EndpointRequest::request(EndpointOp::Evict, key, None);
                self.request_from_peer(target, request).await?;
                Ok(())
            }
            None => Ok(self.storage.evict(key).await?),
        }
    }

    /// Send a request to a peer endpoint and await the correlated response.
    async fn request_from_peer(
        &self,
        target: Uuid,
        request: EndpointRequest,
    ) -> Result<EndpointRequest, EndpointError> {
        let Some(peering) = &self.peering else {
            return Err(EndpointError::PeeringNotAvailable);
        };
        let request_uuid = request.uuid;
        let (tx, rx) = oneshot::channel();
        peering.pending.lock().await.insert(request_uuid, tx);

        let frame = serde_json::to_string(&request)?;
        if let Err(e) = peering
            .manager
            .send(target, Payload::Text(frame), self.config.peer_timeout)
            .await
        {
            peering.pending.lock().await.remove(&request_uuid);
            return Err(EndpointError::PeerRequest(format!(
                "failed to send request to peer {target}: {e}"
            )));
        }

        let response = match tokio::time::timeout(self.config.peer_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(EndpointError::PeerRequest(
                    "endpoint shut down while waiting for a peer response".to_owned(),
                ));
            }
            Err(_) => {
                peering.pending.lock().await.remove(&request_uuid);
                return Err(EndpointError::PeerRequest(format!(
                    "timed out waiting for response from peer {target}"
                )));
            }
        };

        if let Some(error) = response.error {
            return Err(EndpointError::PeerRequest(error));
        }
        Ok(response)
    }

    /// Stop serving peers and close the peer manager and relay client. The
    /// storage collaborator is left untouched. Idempotent.
    pub async fn close(&mut self) {
        if let Some(peering) = self.peering.take() {
            peering.handler.abort();
            peering.manager.close().await;
            info!(uuid = %self.config.uuid, "endpoint closed");
        }
    }
}

/// Serve inbound peer traffic: execute requests against local storage and
/// resolve pending futures with responses.
async fn handle_peer_requests(
    manager: Arc<PeerManager>,
    storage: Arc<dyn Storage>,
    pending: Arc<Mutex<HashMap<Uuid, oneshot::Sender<EndpointRequest>>>>,
    send_timeout: Duration,
) {
    loop {
        let (source, payload) = match manager.recv().await {
            Ok(received) => received,
            Err(_) => {
                info!("peer manager closed; stopping peer request handler");
                return;
            }
        };
        let text = match payload {
            Payload::Text(text) => text,
            Payload::Bytes(_) => {
                error!(source = %source, "unsupported binary message from peer endpoint");
                continue;
            }
        };
        let message: EndpointRequest = match serde_json::from_str(&text) {
            Ok(message) => message,
            Err(e) => {
                error!(source = %source, error = %e, "undecodable message from peer endpoint");
                continue;
            }
        };

        match message.kind {
            MessageKind::Response => {
                let sender = pending.lock().await.remove(&message.uuid);
                match sender {
                    Some(sender) => {
                        let _ = sender.send(message);
                    }
                    None => warn!(
                        uuid = %message.uuid,
                        "dropping response that does not match a pending request"
                    ),
                }
            }
            MessageKind::Request => {
                let response = execute_request(storage.as_ref(), message).await;
                let frame = match serde_json::to_string(&response) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!(error = %e, "failed to serialize response");
                        continue;
                    }
                };
                if let Err(e) = manager
                    .send(source, Payload::Text(frame), send_timeout)
                    .await
                {
                    error!(source = %source, error = %e, "failed to send response to peer");
                }
            }
        }
    }
}

/// Run one request against local storage and build its response.
async fn execute_request(storage: &dyn Storage, request: EndpointRequest) -> EndpointRequest {
    let mut response = request.response();
    match request.op {
        EndpointOp::Get => match storage.get(&request.key).await {
            Ok(data) => response.data = data,
            Err(e) => response.error = Some(e.to_string()),
        },
        EndpointOp::Set => {
            match storage.set(&request.key, request.data.unwrap_or_default()).await {
                Ok(()) => response.success = Some(true),
                Err(e) => {
                    response.success = Some(false);
                    response.error = Some(e.to_string());
                }
            }
        }
        EndpointOp::Exists => match storage.exists(&request.key).await {
            Ok(exists) => response.exists = Some(exists),
            Err(e) => response.error = Some(e.to_string()),
        },
        EndpointOp::Evict => match storage.evict(&request.key).await {
            Ok(()) => response.success = Some(true),
            Err(e) => response.error = Some(e.to_string()),
        },
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn solo_endpoint() -> Endpoint {
        Endpoint::new(
            EndpointConfig::solo("ep", Uuid::new_v4()),
            Arc::new(MemoryStorage::new()),
        )
    }

    #[tokio::test]
    async fn solo_operations_use_local_storage() {
        let endpoint = solo_endpoint();
        assert_eq!(endpoint.get("k", None).await.expect("get"), None);
        endpoint.set("k", b"v".to_vec(), None).await.expect("set");
        assert!(endpoint.exists("k", None).await.expect("exists"));
        assert_eq!(
            endpoint.get("k", None).await.expect("get"),
            Some(b"v".to_vec())
        );
        endpoint.evict("k", None).await.expect("evict");
        assert!(!endpoint.exists("k", None).await.expect("exists"));
    }

    #[tokio::test]
    async fn solo_mode_serves_remote_targets_locally() {
        let endpoint = solo_endpoint();
        let other = Uuid::new_v4();
        endpoint
            .set("k", b"v".to_vec(), Some(other))
            .await
            .expect("set");
        assert_eq!(
            endpoint.get("k", Some(other)).await.expect("get"),
            Some(b"v".to_vec())
        );
    }

    #[tokio::test]
    async fn self_addressed_operations_are_local_in_peering_mode() {
        let uuid = Uuid::new_v4();
        let endpoint = Endpoint::new(
            EndpointConfig::peering("ep", uuid, "ws://localhost:1"),
            Arc::new(MemoryStorage::new()),
        );
        // Never initialized, but self-addressed ops stay local.
        endpoint
            .set("k", b"v".to_vec(), Some(uuid))
            .await
            .expect("set");
        assert_eq!(
            endpoint.get("k", Some(uuid)).await.expect("get"),
            Some(b"v".to_vec())
        );
    }

    #[tokio::test]
    async fn uninitialized_peering_endpoint_refuses_remote_targets() {
        let endpoint = Endpoint::new(
            EndpointConfig::peering("ep", Uuid::new_v4(), "ws://localhost:1"),
            Arc::new(MemoryStorage::new()),
        );
        let result = endpoint.get("k", Some(Uuid::new_v4())).await;
        assert!(matches!(result, Err(EndpointError::PeeringNotAvailable)));
    }

    #[tokio::test]
    async fn oversized_set_surfaces_storage_error() {
        let endpoint = Endpoint::new(
            EndpointConfig::solo("ep", Uuid::new_v4()),
            Arc::new(MemoryStorage::with_max_object_size(8)),
        );
        let result = endpoint.set("k", vec![0u8; 16], None).await;
        assert!(matches!(
            result,
            Err(EndpointError::Storage(StorageError::ObjectSizeExceeded { .. }))
        ));
    }

    #[tokio::test]
    async fn execute_request_builds_contracted_responses() {
        let storage = MemoryStorage::new();

        let get_missing =
            execute_request(&storage, EndpointRequest::request(EndpointOp::Get, "k", None)).await;
        assert_eq!(get_missing.kind, MessageKind::Response);
        assert_eq!(get_missing.data, None);

        let set = execute_request(
            &storage,
            EndpointRequest::request(EndpointOp::Set, "k", Some(b"v".to_vec())),
        )
        .await;
        assert_eq!(set.success, Some(true));

        let exists =
            execute_request(&storage, EndpointRequest::request(EndpointOp::Exists, "k", None))
                .await;
        assert_eq!(exists.exists, Some(true));

        let get = execute_request(&storage, EndpointRequest::request(EndpointOp::Get, "k", None))
            .await;
        assert_eq!(get.data, Some(b"v".to_vec()));

        // Evict is idempotent: success on absent keys too.
        let evict = execute_request(
            &storage,
            EndpointRequest::request(EndpointOp::Evict, "missing", None),
        )
        .await;
        assert_eq!(evict.success, Some(true));
    }

    #[tokio::test]
    async fn oversized_remote_set_reports_failure_in_the_response() {
        let storage = MemoryStorage::with_max_object_size(2);
        let response = execute_request(
            &storage,
            EndpointRequest::request(EndpointOp::Set, "k", Some(vec![0u8; 8])),
        )
        .await;
        assert_eq!(response.success, Some(false));
        assert!(response.error.expect("error").contains("max object size"));
    }
}
