// Forwarding to an unregistered peer echoes the message back with `error`
// populated naming the unknown UUID.

use std::time::Duration;

use proxystore::protocol::{DescriptionType, PeerConnectionMessage, RelayMessage};
use ps_test_utils::{TestRelay, relay_client};
use uuid::Uuid;

#[tokio::test]
async fn message_to_unregistered_peer_is_echoed_with_error() {
    let relay = TestRelay::start().await;
    let uuid = Uuid::new_v4();
    let client = relay_client(&relay, uuid, "a");
    client.connect().await.expect("connect");

    let unknown = Uuid::new_v4();
    let message = RelayMessage::PeerConnection(PeerConnectionMessage {
        source_uuid: uuid,
        source_name: "a".to_owned(),
        peer_uuid: unknown,
        description_type: DescriptionType::Offer,
        description: "{\"type\":\"offer\",\"sdp\":\"v=0\"}".to_owned(),
        error: None,
    });
    client.send(&message).await.expect("send");

    let reply = tokio::time::timeout(Duration::from_secs(5), client.recv())
        .await
        .expect("recv timeout")
        .expect("recv");
    match reply {
        RelayMessage::PeerConnection(echoed) => {
            assert_eq!(echoed.source_uuid, uuid);
            assert_eq!(echoed.peer_uuid, unknown);
            let error = echoed.error.expect("error populated");
            assert!(error.contains("unknown"));
            assert!(error.contains(&unknown.to_string()));
        }
        other => panic!("expected echoed peer connection message, got {other:?}"),
    }

    client.close().await;
}
