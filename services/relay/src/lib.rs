// relay: Public WebSocket broker for peer-to-peer endpoint connections.
//
// The relay is the one publicly reachable component of the data plane. It
// authenticates clients by registration, keeps the UUID <-> socket registry,
// and forwards WebRTC session descriptions between endpoints. Object bytes
// never pass through it.

use std::time::Duration;

use axum::Router;
use axum::routing::get;
use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::info;

pub mod state;
pub mod ws;

pub use state::{ClientInfo, RelayState};

/// Default interval for the periodic connected-client census log.
pub const DEFAULT_CLIENT_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Build the relay router: a single WebSocket route at `/`.
pub fn build_router(state: RelayState) -> Router {
    Router::new().route("/", get(ws::ws_handler)).with_state(state)
}

/// Spawn the background task that periodically logs the connected clients.
///
/// Observability only; nothing reads the census. The task runs until
/// aborted.
pub fn spawn_client_logger(state: RelayState, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let clients = state.snapshot().await;
            info!(connected = clients.len(), "connected client census");
            for client in clients {
                let age = Utc::now() - client.connected_at;
                info!(
                    uuid = %client.uuid,
                    name = %client.name,
                    remote = %client.remote_address,
                    age_seconds = age.num_seconds(),
                    "connected client"
                );
            }
        }
    })
}
