//! Shared relay state: the registry of connected clients.
//!
//! Two invariants hold at all times:
//! - at most one client record per UUID;
//! - a record's `socket_id` identifies the handler task that owns it, so a
//!   handler only ever removes its own registration. An evicted handler
//!   cannot tear down the registration that superseded it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

/// Frame pushed to a client handler task from elsewhere in the relay.
#[derive(Debug)]
pub enum Outbound {
    /// A control-plane frame to transmit verbatim.
    Frame(String),
    /// This socket's registration was superseded; close with code 1001.
    Evict,
}

/// One registered client connection.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub name: String,
    pub uuid: Uuid,
    pub socket_id: u64,
    pub sender: mpsc::UnboundedSender<Outbound>,
    pub connected_at: DateTime<Utc>,
    pub remote_address: SocketAddr,
}

/// Snapshot row for the periodic client census log.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub uuid: Uuid,
    pub name: String,
    pub connected_at: DateTime<Utc>,
    pub remote_address: SocketAddr,
}

#[derive(Clone, Default)]
pub struct RelayState {
    inner: Arc<StateInner>,
}

#[derive(Default)]
struct StateInner {
    clients: Mutex<HashMap<Uuid, ClientRecord>>,
    next_socket_id: AtomicU64,
}

impl RelayState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out a fresh handler identity for a newly accepted socket.
    pub fn next_socket_id(&self) -> u64 {
        self.inner.next_socket_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert or replace the registration for `record.uuid`.
    ///
    /// If a different socket currently holds the UUID, that socket is told to
    /// close itself with code 1001 and the record is replaced. Returns true
    /// when an older registration was evicted.
    pub async fn register(&self, record: ClientRecord) -> bool {
        let mut clients = self.inner.clients.lock().await;
        let evicted = match clients.get(&record.uuid) {
            Some(existing) if existing.socket_id != record.socket_id => {
                let _ = existing.sender.send(Outbound::Evict);
                true
            }
            _ => false,
        };
        clients.insert(record.uuid, record);
        evicted
    }

    /// Remove the registration for `uuid` if it is still owned by
    /// `socket_id`. Returns true when a record was removed.
    pub async fn unregister(&self, uuid: Uuid, socket_id: u64) -> bool {
        let mut clients = self.inner.clients.lock().await;
        match clients.get(&uuid) {
            Some(record) if record.socket_id == socket_id => {
                clients.remove(&uuid);
                true
            }
            _ => false,
        }
    }

    /// Look up the outbound handle for a registered client.
    pub async fn sender_for(&self, uuid: Uuid) -> Option<mpsc::UnboundedSender<Outbound>> {
        let clients = self.inner.clients.lock().await;
        clients.get(&uuid).map(|record| record.sender.clone())
    }

    /// Current registrations, for the census log and for tests.
    pub async fn snapshot(&self) -> Vec<ClientInfo> {
        let clients = self.inner.clients.lock().await;
        clients
            .values()
            .map(|record| ClientInfo {
                uuid: record.uuid,
                name: record.name.clone(),
                connected_at: record.connected_at,
                remote_address: record.remote_address,
            })
            .collect()
    }

    pub async fn contains(&self, uuid: Uuid) -> bool {
        self.inner.clients.lock().await.contains_key(&uuid)
    }

    /// Drop every registration and tell each handler to close its socket
    /// with code 1001 (going away). Used when the relay shuts down.
    pub async fn disconnect_all(&self) {
        let mut clients = self.inner.clients.lock().await;
        for (_, record) in clients.drain() {
            let _ = record.sender.send(Outbound::Evict);
        }
    }
}
