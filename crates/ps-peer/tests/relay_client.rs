// Relay client handshake and messaging against a live relay server.

use std::net::SocketAddr;
use std::time::Duration;

use ps_peer::{RelayClient, RelayClientConfig};
use ps_protocol::{DescriptionType, PeerConnectionMessage, RelayMessage};
use uuid::Uuid;

async fn start_relay() -> (relay::RelayState, SocketAddr, tokio::task::JoinHandle<()>) {
    let state = relay::RelayState::new();
    let router = relay::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let task = tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("serve");
    });
    (state, addr, task)
}

fn client(addr: SocketAddr, uuid: Uuid, name: &str) -> RelayClient {
    RelayClient::new(
        format!("ws://{addr}"),
        uuid,
        name,
        RelayClientConfig {
            timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_millis(50),
            reconnect_task: false,
            ..RelayClientConfig::default()
        },
    )
    .expect("client")
}

#[tokio::test]
async fn connect_registers_with_the_relay() {
    let (state, addr, _server) = start_relay().await;
    let uuid = Uuid::new_v4();
    let relay_client = client(addr, uuid, "ep-a");

    relay_client.connect().await.expect("connect");
    assert!(relay_client.is_connected());
    assert!(state.contains(uuid).await);

    relay_client.close().await;
}

#[tokio::test]
async fn connect_is_idempotent() {
    let (state, addr, _server) = start_relay().await;
    let relay_client = client(addr, Uuid::new_v4(), "ep-a");

    relay_client.connect().await.expect("first connect");
    relay_client.connect().await.expect("second connect");
    assert_eq!(state.snapshot().await.len(), 1);

    relay_client.close().await;
}

#[tokio::test]
async fn close_twice_is_a_noop() {
    let (_state, addr, _server) = start_relay().await;
    let relay_client = client(addr, Uuid::new_v4(), "ep-a");
    relay_client.connect().await.expect("connect");
    relay_client.close().await;
    relay_client.close().await;
    assert!(!relay_client.is_connected());
}

#[tokio::test]
async fn send_and_recv_route_through_the_relay() {
    let (_state, addr, _server) = start_relay().await;
    let uuid_a = Uuid::new_v4();
    let uuid_b = Uuid::new_v4();
    let client_a = client(addr, uuid_a, "ep-a");
    let client_b = client(addr, uuid_b, "ep-b");
    client_a.connect().await.expect("connect a");
    client_b.connect().await.expect("connect b");

    let message = RelayMessage::PeerConnection(PeerConnectionMessage {
        source_uuid: uuid_a,
        source_name: "ep-a".to_owned(),
        peer_uuid: uuid_b,
        description_type: DescriptionType::Offer,
        description: "{\"type\":\"offer\",\"sdp\":\"v=0\"}".to_owned(),
        error: None,
    });
    client_a.send(&message).await.expect("send");

    let received = tokio::time::timeout(Duration::from_secs(5), client_b.recv())
        .await
        .expect("recv timeout")
        .expect("recv");
    assert_eq!(received, message);

    client_a.close().await;
    client_b.close().await;
}

#[tokio::test]
async fn unknown_peer_error_is_echoed_back() {
    let (_state, addr, _server) = start_relay().await;
    let uuid = Uuid::new_v4();
    let relay_client = client(addr, uuid, "ep-a");
    relay_client.connect().await.expect("connect");

    let target = Uuid::new_v4();
    let message = RelayMessage::PeerConnection(PeerConnectionMessage {
        source_uuid: uuid,
        source_name: "ep-a".to_owned(),
        peer_uuid: target,
        description_type: DescriptionType::Offer,
        description: "{\"type\":\"offer\",\"sdp\":\"v=0\"}".to_owned(),
        error: None,
    });
    relay_client.send(&message).await.expect("send");

    let reply = tokio::time::timeout(Duration::from_secs(5), relay_client.recv())
        .await
        .expect("recv timeout")
        .expect("recv");
    match reply {
        RelayMessage::PeerConnection(echoed) => {
            assert!(echoed.error.expect("error populated").contains("unknown"));
        }
        other => panic!("expected echoed peer connection message, got {other:?}"),
    }

    relay_client.close().await;
}
