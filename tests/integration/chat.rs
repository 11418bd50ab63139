//! tests/integration/chat.rs
//!
//! Happy-path end-to-end tests: public chat between real nodes, local echo,
//! and history replay from the persistent store.

use crate::common::harness::{expect_no_message, wait_for_message, TestNode};
use std::time::Duration;
use test_log::test;

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_two_node_public_chat() {
    let node_a = TestNode::spawn("alice").await.expect("spawn node A");
    let node_b = TestNode::spawn("bob").await.expect("spawn node B");
    node_a.connect_to(&node_b).await.expect("connect A to B");

    let mut events_b = node_b.subscribe_events();
    let msg_id = node_a
        .handle
        .broadcast_message("hello", "#general")
        .await
        .expect("broadcast");

    let message = wait_for_message(
        &mut events_b,
        |m| m.msg_id == msg_id,
        Duration::from_secs(5),
    )
    .await
    .expect("B should receive the message");
    assert_eq!(message.content, "hello");
    assert_eq!(message.channel_id, "#general");
    assert_eq!(message.sender_id, node_a.node_id.to_hex());
    assert!(!message.is_encrypted);

    // Exactly once: the mesh may echo, but the callback must not fire again.
    expect_no_message(&mut events_b, Duration::from_millis(400))
        .await
        .expect("no duplicate delivery");

    node_a.handle.stop();
    node_b.handle.stop();
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_sender_sees_local_echo_and_history() {
    let node_a = TestNode::spawn("alice").await.expect("spawn node A");
    let mut events_a = node_a.subscribe_events();

    let msg_id = node_a
        .handle
        .broadcast_message("note to self", "#general")
        .await
        .expect("broadcast with no peers is still stored");

    // The locally originated message surfaces immediately.
    let echoed = wait_for_message(
        &mut events_a,
        |m| m.msg_id == msg_id,
        Duration::from_secs(2),
    )
    .await
    .expect("local echo");
    assert_eq!(echoed.content, "note to self");

    let history = node_a
        .handle
        .load_channel_history("#general", 50)
        .await
        .expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].msg_id, msg_id);
    assert_eq!(history[0].content, "note to self");

    node_a.handle.stop();
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_history_survives_restart() {
    let node_a = TestNode::spawn("alice").await.expect("spawn node A");
    let node_id = node_a.node_id;
    node_a
        .handle
        .broadcast_message("before restart", "#general")
        .await
        .expect("broadcast");

    let node_a = node_a.restart().await.expect("restart");
    assert_eq!(node_a.node_id, node_id, "identity persists across restarts");

    let history = node_a
        .handle
        .load_channel_history("#general", 50)
        .await
        .expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].content, "before restart");

    node_a.handle.stop();
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_broadcast_preconditions_are_reported() {
    let node_a = TestNode::spawn("alice").await.expect("spawn node A");

    let err = node_a
        .handle
        .broadcast_message("hi", "#not-joined")
        .await
        .expect_err("unsubscribed channel must be rejected");
    assert!(matches!(err, meshchat::Error::NotSubscribed(_)));

    let err = node_a
        .handle
        .broadcast_message("hi", "nohash")
        .await
        .expect_err("channel ids start with '#'");
    assert!(matches!(err, meshchat::Error::InvalidId(_)));

    let err = node_a
        .handle
        .leave_channel("#general")
        .await
        .expect_err("#general cannot be left");
    assert!(matches!(err, meshchat::Error::ReservedChannel(_)));

    node_a.handle.stop();
}
