//! tests/integration/adversarial.rs
//!
//! Tests that feed the node hostile or broken input over the real wire:
//! tampered envelopes, duplicates, malformed and oversize frames. The node
//! must drop the bad input, keep the stream alive, and leave no trace in
//! its store or dedup window.

use crate::common::harness::{expect_no_message, wait_for_message, RawPeer, TestNode};
use meshchat::wire::Payload;
use std::time::Duration;
use test_log::test;

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_tampered_envelope_is_rejected_everywhere() {
    let node_b = TestNode::spawn("bob").await.unwrap();
    let mut raw = RawPeer::connect(&node_b, "mallory").await.unwrap();
    let mut events_b = node_b.subscribe_events();

    let honest = raw
        .identity
        .sign_payload(Payload::chat("#general", "pay alice 1 coin"), 3)
        .unwrap();
    let mut tampered = honest.clone();
    tampered.payload.content = Some("pay mallory 1 coin".to_string());

    raw.send_envelope(&tampered).await.unwrap();
    expect_no_message(&mut events_b, Duration::from_millis(400))
        .await
        .expect("tampered envelope must not surface");
    let history = node_b
        .handle
        .load_channel_history("#general", 10)
        .await
        .unwrap();
    assert!(history.is_empty(), "tampered envelope must not be stored");

    // The honest envelope still goes through afterwards: the msg_id was
    // never burned into the seen window by the forgery.
    raw.send_envelope(&honest).await.unwrap();
    let message = wait_for_message(
        &mut events_b,
        |m| m.msg_id == honest.msg_id,
        Duration::from_secs(5),
    )
    .await
    .expect("honest envelope is delivered");
    assert_eq!(message.content, "pay alice 1 coin");

    node_b.handle.stop();
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_duplicate_delivery_fires_callback_once() {
    let node_b = TestNode::spawn("bob").await.unwrap();
    let mut raw = RawPeer::connect(&node_b, "peer").await.unwrap();
    let mut events_b = node_b.subscribe_events();

    let envelope = raw
        .identity
        .sign_payload(Payload::chat("#general", "once only"), 3)
        .unwrap();

    raw.send_envelope(&envelope).await.unwrap();
    raw.send_envelope(&envelope).await.unwrap();
    raw.send_envelope(&envelope).await.unwrap();

    wait_for_message(
        &mut events_b,
        |m| m.msg_id == envelope.msg_id,
        Duration::from_secs(5),
    )
    .await
    .expect("first delivery");
    expect_no_message(&mut events_b, Duration::from_millis(400))
        .await
        .expect("duplicates are dropped");

    let history = node_b
        .handle
        .load_channel_history("#general", 10)
        .await
        .unwrap();
    assert_eq!(history.len(), 1, "one row per msg_id");

    node_b.handle.stop();
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_stream_survives_malformed_and_oversize_frames() {
    let node_b = TestNode::spawn("bob").await.unwrap();
    let mut raw = RawPeer::connect(&node_b, "peer").await.unwrap();
    let mut events_b = node_b.subscribe_events();

    // Garbage, valid JSON that is no frame, and a frame past the 64 KiB cap.
    raw.send_line("this is not json".to_string()).await.unwrap();
    raw.send_line(r#"{"surprise": true}"#.to_string()).await.unwrap();
    raw.send_line(format!(
        r#"{{"filler":"{}"}}"#,
        "x".repeat(80 * 1024)
    ))
    .await
    .unwrap();

    // The stream must still deliver honest traffic afterwards.
    let envelope = raw
        .identity
        .sign_payload(Payload::chat("#general", "still here"), 3)
        .unwrap();
    raw.send_envelope(&envelope).await.unwrap();

    let message = wait_for_message(
        &mut events_b,
        |m| m.msg_id == envelope.msg_id,
        Duration::from_secs(5),
    )
    .await
    .expect("stream survives bad frames");
    assert_eq!(message.content, "still here");

    node_b.handle.stop();
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_retargeted_channel_breaks_signature() {
    // Channel binding: moving a signed message into another channel is
    // exactly a tampered payload.
    let node_b = TestNode::spawn("bob").await.unwrap();
    node_b.handle.join_channel("#dev").await.unwrap();
    let mut raw = RawPeer::connect(&node_b, "mallory").await.unwrap();
    let mut events_b = node_b.subscribe_events();

    let mut envelope = raw
        .identity
        .sign_payload(Payload::chat("#dev", "dev only"), 3)
        .unwrap();
    envelope.payload.channel_id = "#general".to_string();

    raw.send_envelope(&envelope).await.unwrap();
    expect_no_message(&mut events_b, Duration::from_millis(400))
        .await
        .expect("retargeted envelope must be rejected");

    node_b.handle.stop();
}
