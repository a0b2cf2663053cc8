// Peer-connection timeout: an offer to a registered peer that never answers
// surfaces a timeout from `ready()`.

use std::time::Duration;

use futures_util::SinkExt;
use proxystore::peer::PeerConnectionError;
use proxystore::protocol::{RelayMessage, ServerRegistration, encode};
use ps_test_utils::{TestRelay, peer_manager};
use tokio_tungstenite::tungstenite::protocol::Message;
use uuid::Uuid;

#[tokio::test]
async fn unanswered_offer_times_out() {
    let relay = TestRelay::start().await;
    let a = peer_manager(&relay, "a").await;

    // Register a peer that swallows every forwarded message.
    let silent_uuid = Uuid::new_v4();
    let (mut silent, _) = tokio_tungstenite::connect_async(relay.address())
        .await
        .expect("connect silent peer");
    let registration = RelayMessage::ServerRegistration(ServerRegistration {
        name: "silent".to_owned(),
        uuid: silent_uuid,
    });
    silent
        .send(Message::Text(encode(&registration).expect("encode").into()))
        .await
        .expect("register silent peer");

    let connection = a
        .get_connection(silent_uuid)
        .await
        .expect("offer dispatched");
    let result = connection.ready(Duration::from_millis(100)).await;
    assert!(matches!(result, Err(PeerConnectionError::Timeout(_))));

    a.close().await;
}
