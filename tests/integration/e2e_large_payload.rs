// Chunked transfer: payloads far above the data-channel frame limit arrive
// intact.

use std::time::Duration;

use proxystore::protocol::Payload;
use ps_test_utils::{TestRelay, pattern_bytes, peer_manager, peer_manager_with_config};

const SEND_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::test]
async fn transfers_200kb_bytes_payload_intact() {
    let relay = TestRelay::start().await;
    let a = peer_manager(&relay, "a").await;
    let b = peer_manager(&relay, "b").await;

    let payload = pattern_bytes(200 * 1024);
    a.send(b.uuid(), Payload::from(payload.clone()), SEND_TIMEOUT)
        .await
        .expect("send");

    let (source, received) = tokio::time::timeout(SEND_TIMEOUT, b.recv())
        .await
        .expect("recv timeout")
        .expect("recv");
    assert_eq!(source, a.uuid());
    match received {
        Payload::Bytes(bytes) => assert_eq!(bytes.as_ref(), payload.as_slice()),
        Payload::Text(_) => panic!("expected bytes payload"),
    }

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn transfers_large_text_payload_intact() {
    let relay = TestRelay::start().await;
    let a = peer_manager(&relay, "a").await;
    let b = peer_manager(&relay, "b").await;

    let payload = "proxy".repeat(20_000);
    a.send(b.uuid(), Payload::from(payload.clone()), SEND_TIMEOUT)
        .await
        .expect("send");

    let (_, received) = tokio::time::timeout(SEND_TIMEOUT, b.recv())
        .await
        .expect("recv timeout")
        .expect("recv");
    assert_eq!(received, Payload::from(payload));

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn multi_channel_offerer_wins_and_payloads_survive_striping() {
    let relay = TestRelay::start().await;
    let config = proxystore::peer::PeerManagerConfig {
        peer_channels: 3,
        ..Default::default()
    };
    let a = peer_manager_with_config(&relay, "a", config).await;
    // B keeps the default single-channel config; the offerer's count wins.
    let b = peer_manager(&relay, "b").await;

    let payload = pattern_bytes(300 * 1024);
    a.send(b.uuid(), Payload::from(payload.clone()), SEND_TIMEOUT)
        .await
        .expect("send");

    let (_, received) = tokio::time::timeout(SEND_TIMEOUT, b.recv())
        .await
        .expect("recv timeout")
        .expect("recv");
    match received {
        Payload::Bytes(bytes) => assert_eq!(bytes.as_ref(), payload.as_slice()),
        Payload::Text(_) => panic!("expected bytes payload"),
    }

    a.close().await;
    b.close().await;
}
