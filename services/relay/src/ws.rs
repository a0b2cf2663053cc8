//! WebSocket handler: the per-socket relay state machine.
//!
//! A socket is unregistered until it delivers a valid `server_registration`.
//! Before that, any other control message is answered with an error response
//! and the socket stays unregistered. Once registered, `peer_connection`
//! messages are forwarded to the named peer; an unknown target echoes the
//! message back to the sender with `error` populated. The relay never
//! retries a forward and never reads object bytes.

use std::net::SocketAddr;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::State;
use axum::response::IntoResponse;
use chrono::Utc;
use ps_protocol::{
    PeerConnectionMessage, RelayMessage, ServerRegistration, ServerResponse, decode, encode,
};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::state::{ClientRecord, Outbound, RelayState};

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
}

fn error_frame(message: &str) -> Option<String> {
    encode(&RelayMessage::ServerResponse(ServerResponse {
        success: false,
        message: Some(message.to_owned()),
        error: Some(true),
    }))
    .ok()
}

async fn handle_socket(mut socket: WebSocket, state: RelayState, addr: SocketAddr) {
    let socket_id = state.next_socket_id();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
    let mut registered: Option<Uuid> = None;
    let mut clean_close = false;

    loop {
        tokio::select! {
            out = out_rx.recv() => match out {
                Some(Outbound::Frame(text)) => {
                    if socket.send(Message::Text(text)).await.is_err() {
                        error!(remote = %addr, "connection closed while attempting to send message");
                    }
                }
                Some(Outbound::Evict) => {
                    info!(remote = %addr, "closing client socket (going away)");
                    let _ = socket
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::AWAY,
                            reason: "going away".into(),
                        })))
                        .await;
                    // This handler no longer owns any registry record.
                    return;
                }
                // Unreachable while this task holds `out_tx`.
                None => break,
            },
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    handle_frame(&state, socket_id, &out_tx, addr, &mut registered, &text).await;
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = socket.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) => {
                    clean_close = true;
                    break;
                }
                // The control plane is text-only; stray binary frames are dropped.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(remote = %addr, error = %e, "WS error");
                    break;
                }
                None => break,
            }
        }
    }

    if let Some(uuid) = registered {
        if state.unregister(uuid, socket_id).await {
            let reason = if clean_close { "ok" } else { "unexpected" };
            info!(uuid = %uuid, remote = %addr, reason, "unregistered client");
        }
    }
}

async fn handle_frame(
    state: &RelayState,
    socket_id: u64,
    out_tx: &mpsc::UnboundedSender<Outbound>,
    addr: SocketAddr,
    registered: &mut Option<Uuid>,
    text: &str,
) {
    let message = match decode(text) {
        Ok(message) => message,
        Err(e) => {
            error!(remote = %addr, error = %e, "skipping undecodable message");
            return;
        }
    };

    match message {
        RelayMessage::ServerRegistration(request) => {
            register(state, socket_id, out_tx, addr, registered, request).await;
        }
        RelayMessage::PeerConnection(message) => {
            if registered.is_some() {
                forward(state, out_tx, addr, message).await;
            } else {
                info!(
                    remote = %addr,
                    source_uuid = %message.source_uuid,
                    "rejecting peer connection message from unregistered client"
                );
                if let Some(frame) = error_frame("client has not registered yet") {
                    let _ = out_tx.send(Outbound::Frame(frame));
                }
            }
        }
        RelayMessage::ServerResponse(_) => {
            let reply = if registered.is_some() {
                "unknown request type"
            } else {
                "client has not registered yet"
            };
            warn!(remote = %addr, "rejecting unexpected server response from client");
            if let Some(frame) = error_frame(reply) {
                let _ = out_tx.send(Outbound::Frame(frame));
            }
        }
    }
}

async fn register(
    state: &RelayState,
    socket_id: u64,
    out_tx: &mpsc::UnboundedSender<Outbound>,
    addr: SocketAddr,
    registered: &mut Option<Uuid>,
    request: ServerRegistration,
) {
    if let Some(uuid) = *registered {
        // Same socket registering again: return the previous registration.
        info!(uuid = %uuid, remote = %addr, "already registered socket reregistering");
    } else {
        let record = ClientRecord {
            name: request.name.clone(),
            uuid: request.uuid,
            socket_id,
            sender: out_tx.clone(),
            connected_at: Utc::now(),
            remote_address: addr,
        };
        let evicted = state.register(record).await;
        if evicted {
            info!(
                uuid = %request.uuid,
                "previously registered client reregistered; old socket evicted"
            );
        }
        *registered = Some(request.uuid);
        info!(uuid = %request.uuid, name = %request.name, remote = %addr, "registered client");
    }

    if let Ok(frame) = encode(&RelayMessage::ServerResponse(ServerResponse {
        success: true,
        message: None,
        error: None,
    })) {
        let _ = out_tx.send(Outbound::Frame(frame));
    }
}

async fn forward(
    state: &RelayState,
    out_tx: &mpsc::UnboundedSender<Outbound>,
    addr: SocketAddr,
    mut message: PeerConnectionMessage,
) {
    match state.sender_for(message.peer_uuid).await {
        Some(target) => {
            info!(
                source = %message.source_uuid,
                peer = %message.peer_uuid,
                "transmitting peer connection message"
            );
            match encode(&RelayMessage::PeerConnection(message)) {
                Ok(frame) => {
                    // Failures are logged by the target's handler; the relay
                    // never reports them to the sender and never retries.
                    let _ = target.send(Outbound::Frame(frame));
                }
                Err(e) => error!(error = %e, "failed to encode message"),
            }
        }
        None => {
            warn!(
                remote = %addr,
                source = %message.source_uuid,
                peer = %message.peer_uuid,
                "attempt to send message to unknown peer"
            );
            message.error = Some(format!(
                "cannot forward peer connection message to peer {} because this peer is unknown",
                message.peer_uuid
            ));
            match encode(&RelayMessage::PeerConnection(message)) {
                Ok(frame) => {
                    let _ = out_tx.send(Outbound::Frame(frame));
                }
                Err(e) => error!(error = %e, "failed to encode message"),
            }
        }
    }
}
