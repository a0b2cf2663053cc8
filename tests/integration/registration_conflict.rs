// Registration conflict: a second registration for a live UUID takes over
// and the older socket is closed with code 1001.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use proxystore::protocol::{RelayMessage, ServerRegistration, ServerResponse, decode, encode};
use ps_test_utils::{TestRelay, relay_client};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use uuid::Uuid;

#[tokio::test]
async fn second_registration_takes_over_and_first_socket_closes_with_1001() {
    let relay = TestRelay::start().await;
    let uuid = Uuid::new_v4();

    // First session: a raw socket so the close frame is observable.
    let (mut first, _) = tokio_tungstenite::connect_async(relay.address())
        .await
        .expect("connect first");
    let registration = RelayMessage::ServerRegistration(ServerRegistration {
        name: "a".to_owned(),
        uuid,
    });
    first
        .send(Message::Text(encode(&registration).expect("encode").into()))
        .await
        .expect("send registration");
    let reply = first.next().await.expect("reply").expect("ws");
    match reply {
        Message::Text(text) => match decode(&text).expect("decode") {
            RelayMessage::ServerResponse(ServerResponse { success: true, .. }) => {}
            other => panic!("expected success, got {other:?}"),
        },
        other => panic!("expected text reply, got {other:?}"),
    }

    // Second session registers the same UUID and succeeds.
    let second = relay_client(&relay, uuid, "a");
    second.connect().await.expect("second registration");

    // The first socket observes closure with code 1001.
    let frame = tokio::time::timeout(Duration::from_secs(5), first.next())
        .await
        .expect("close timeout")
        .expect("stream ended")
        .expect("ws error");
    match frame {
        Message::Close(Some(close)) => assert_eq!(close.code, CloseCode::Away),
        other => panic!("expected close frame, got {other:?}"),
    }

    // Only one record remains.
    assert_eq!(relay.state().snapshot().await.len(), 1);

    // Subsequent sends on the first socket fail once the close completes.
    let probe = RelayMessage::ServerRegistration(ServerRegistration {
        name: "a".to_owned(),
        uuid,
    });
    let mut send_failed = false;
    for _ in 0..10 {
        if first
            .send(Message::Text(encode(&probe).expect("encode").into()))
            .await
            .is_err()
        {
            send_failed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(send_failed, "sends on the evicted socket should fail");

    second.close().await;
}
