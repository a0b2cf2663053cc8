// Two endpoints, one relay: remote operations travel over WebRTC data
// channels while the relay only ever sees signaling.

use ps_test_utils::{TestRelay, endpoint};

#[tokio::test]
async fn remote_set_stores_on_the_target_only() {
    let relay = TestRelay::start().await;
    let mut a = endpoint(&relay, "a").await;
    let mut b = endpoint(&relay, "b").await;

    a.set("k", b"hello".to_vec(), Some(b.uuid()))
        .await
        .expect("remote set");

    // The value lives on B; nothing was cached on A.
    assert_eq!(
        b.get("k", None).await.expect("local get on b"),
        Some(b"hello".to_vec())
    );
    assert_eq!(a.get("k", None).await.expect("local get on a"), None);

    // A reads it back through the mesh.
    assert_eq!(
        a.get("k", Some(b.uuid())).await.expect("remote get"),
        Some(b"hello".to_vec())
    );

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn remote_exists_and_evict_round_trip() {
    let relay = TestRelay::start().await;
    let mut a = endpoint(&relay, "a").await;
    let mut b = endpoint(&relay, "b").await;
    let target = Some(b.uuid());

    assert!(!a.exists("k", target).await.expect("exists before set"));

    a.set("k", b"value".to_vec(), target).await.expect("set");
    assert!(a.exists("k", target).await.expect("exists after set"));

    a.evict("k", target).await.expect("evict");
    assert!(!a.exists("k", target).await.expect("exists after evict"));

    // Evicting an absent key succeeds.
    a.evict("k", target).await.expect("evict absent");

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn remote_get_of_missing_key_is_none() {
    let relay = TestRelay::start().await;
    let mut a = endpoint(&relay, "a").await;
    let mut b = endpoint(&relay, "b").await;

    assert_eq!(
        a.get("missing", Some(b.uuid())).await.expect("remote get"),
        None
    );

    a.close().await;
    b.close().await;
}
