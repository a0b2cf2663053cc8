// Reconnect across a relay restart: the auto-reconnect task re-registers
// the client with the new server process under the original identity.

use std::time::Duration;

use ps_test_utils::{TestRelay, relay_client};
use uuid::Uuid;

#[tokio::test]
async fn client_reappears_in_the_restarted_relays_table() {
    let relay = TestRelay::start().await;
    let uuid = Uuid::new_v4();
    let client = relay_client(&relay, uuid, "a");
    client.connect().await.expect("connect");
    assert!(relay.state().contains(uuid).await);

    // Kill the relay and bring a fresh one up on the same port.
    let addr = relay.shutdown().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let restarted = TestRelay::bind(&addr.to_string()).await;

    // The keepalive probe notices the dead socket and the reconnect task
    // re-registers with backoff; well inside the backoff cap.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while tokio::time::Instant::now() < deadline {
        if restarted.state().contains(uuid).await {
            let record = restarted
                .state()
                .snapshot()
                .await
                .into_iter()
                .find(|client| client.uuid == uuid)
                .expect("record");
            assert_eq!(record.name, "a");
            client.close().await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("client did not re-register after relay restart");
}
