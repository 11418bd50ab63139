//! tests/integration/topology.rs
//!
//! E2E tests for propagation across more than one hop: per-subscription
//! filtering in a star, and TTL spend-down along a line.

use crate::common::harness::{
    expect_no_message, wait_for_message, RawPeer, TestNode,
};
use std::time::Duration;
use test_log::test;

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_three_node_channel_filter() {
    // A is connected to both B and C. A and C care about #dev; B does not.
    let node_a = TestNode::spawn("alice").await.unwrap();
    let node_b = TestNode::spawn("bob").await.unwrap();
    let node_c = TestNode::spawn("carol").await.unwrap();
    node_a.connect_to(&node_b).await.unwrap();
    node_a.connect_to(&node_c).await.unwrap();

    node_a.handle.join_channel("#dev").await.unwrap();
    node_c.handle.join_channel("#dev").await.unwrap();

    let mut events_b = node_b.subscribe_events();
    let mut events_c = node_c.subscribe_events();

    let msg_id = node_a
        .handle
        .broadcast_message("standup in 5", "#dev")
        .await
        .unwrap();

    let message = wait_for_message(
        &mut events_c,
        |m| m.msg_id == msg_id,
        Duration::from_secs(5),
    )
    .await
    .expect("C subscribes to #dev and must receive");
    assert_eq!(message.content, "standup in 5");

    // B ignores the channel entirely: no callback, no stored row.
    expect_no_message(&mut events_b, Duration::from_millis(400))
        .await
        .expect("B must not surface a #dev message");
    let history_b = node_b.handle.load_channel_history("#dev", 10).await.unwrap();
    assert!(history_b.is_empty());

    node_a.handle.stop();
    node_b.handle.stop();
    node_c.handle.stop();
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_filter_leaves_seen_set_untouched() {
    // An envelope rejected by the subscription gate must be deliverable
    // later: the gate runs before dedup on purpose.
    let node_b = TestNode::spawn("bob").await.unwrap();
    let mut raw = RawPeer::connect(&node_b, "raw").await.unwrap();
    let mut events_b = node_b.subscribe_events();

    let envelope = raw
        .identity
        .sign_payload(meshchat::wire::Payload::chat("#dev", "early bird"), 3)
        .unwrap();

    // First delivery: B is not subscribed, nothing happens.
    raw.send_envelope(&envelope).await.unwrap();
    expect_no_message(&mut events_b, Duration::from_millis(400))
        .await
        .expect("unsubscribed channel is filtered");

    // Subscribe, then replay the *same* envelope.
    node_b.handle.join_channel("#dev").await.unwrap();
    raw.send_envelope(&envelope).await.unwrap();

    let message = wait_for_message(
        &mut events_b,
        |m| m.msg_id == envelope.msg_id,
        Duration::from_secs(5),
    )
    .await
    .expect("the replayed envelope must now be delivered");
    assert_eq!(message.content, "early bird");

    node_b.handle.stop();
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_ttl_spends_down_along_a_line() {
    // Line topology A - B - C, with a raw observer hanging off C.
    let node_a = TestNode::spawn("alice").await.unwrap();
    let node_b = TestNode::spawn("bob").await.unwrap();
    let node_c = TestNode::spawn("carol").await.unwrap();
    node_a.connect_to(&node_b).await.unwrap();
    node_b.connect_to(&node_c).await.unwrap();

    let mut events_c = node_c.subscribe_events();
    let mut observer = RawPeer::connect(&node_c, "observer").await.unwrap();

    let msg_id = node_a
        .handle
        .broadcast_message("two hops out", "#general")
        .await
        .unwrap();

    // C received through B.
    let message = wait_for_message(
        &mut events_c,
        |m| m.msg_id == msg_id,
        Duration::from_secs(5),
    )
    .await
    .expect("C receives across two hops");
    assert_eq!(message.content, "two hops out");

    // A emitted ttl=3, B forwarded 2, C forwards 1 to the observer.
    let forwarded = observer
        .recv_envelope(|e| e.msg_id == msg_id, Duration::from_secs(5))
        .await
        .expect("C forwards to its other peers");
    assert_eq!(forwarded.ttl, 1);
    assert!(forwarded.verify().is_ok(), "forwarding must not re-sign");

    node_a.handle.stop();
    node_b.handle.stop();
    node_c.handle.stop();
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_ttl_zero_is_not_forwarded() {
    // A raw peer hands B an envelope that has run out of hops. B must
    // deliver it locally but never pass it on.
    let node_b = TestNode::spawn("bob").await.unwrap();
    let mut injector = RawPeer::connect(&node_b, "injector").await.unwrap();
    let mut observer = RawPeer::connect(&node_b, "observer").await.unwrap();
    let mut events_b = node_b.subscribe_events();

    let envelope = injector
        .identity
        .sign_payload(meshchat::wire::Payload::chat("#general", "dead end"), 0)
        .unwrap();
    injector.send_envelope(&envelope).await.unwrap();

    wait_for_message(
        &mut events_b,
        |m| m.msg_id == envelope.msg_id,
        Duration::from_secs(5),
    )
    .await
    .expect("ttl=0 still delivers locally");

    observer
        .expect_no_envelope(|e| e.msg_id == envelope.msg_id, Duration::from_millis(400))
        .await
        .expect("ttl=0 must not be forwarded");

    node_b.handle.stop();
}
