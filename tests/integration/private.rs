//! tests/integration/private.rs
//!
//! End-to-end tests for private channels: owner-controlled invites, sealed
//! key handoff, access control for key-less subscribers, and history
//! decryption after a restart and re-invite.

use crate::common::harness::{
    expect_no_message, wait_for_invite, wait_for_message, TestNode,
};
use meshchat::store::ChannelKind;
use std::time::Duration;
use test_log::test;

async fn invite(owner: &TestNode, target: &TestNode, channel: &str) {
    let target_info = target.handle.identity_info().await.unwrap();
    owner
        .handle
        .invite_peer_to_channel(channel, &target_info.node_id, &target_info.encryption_pub)
        .await
        .unwrap();
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_private_channel_access_control() {
    let node_a = TestNode::spawn("alice").await.unwrap();
    let node_b = TestNode::spawn("bob").await.unwrap();
    let node_c = TestNode::spawn("carol").await.unwrap();
    node_a.connect_to(&node_b).await.unwrap();
    node_a.connect_to(&node_c).await.unwrap();

    node_a
        .handle
        .create_channel("#secret", ChannelKind::Private)
        .await
        .unwrap();

    // B is invited; C merely joins the id speculatively.
    let mut events_b = node_b.subscribe_events();
    invite(&node_a, &node_b, "#secret").await;
    wait_for_invite(&mut events_b, "#secret", Duration::from_secs(5))
        .await
        .expect("B accepts the invite");
    node_c.handle.join_channel("#secret").await.unwrap();

    let mut events_c = node_c.subscribe_events();
    let msg_id = node_a
        .handle
        .broadcast_message("top secret", "#secret")
        .await
        .unwrap();

    // B holds the key and reads plaintext.
    let message = wait_for_message(
        &mut events_b,
        |m| m.msg_id == msg_id,
        Duration::from_secs(5),
    )
    .await
    .expect("B decrypts the message");
    assert_eq!(message.content, "top secret");
    assert!(message.is_encrypted);

    // C receives the envelope but can produce no plaintext and stores
    // nothing.
    expect_no_message(&mut events_c, Duration::from_millis(400))
        .await
        .expect("C must not surface the message");
    let history_c = node_c
        .handle
        .load_channel_history("#secret", 10)
        .await
        .unwrap();
    assert!(history_c.is_empty(), "C must not store the ciphertext");

    // B's stored row holds ciphertext, not plaintext.
    let history_b = node_b
        .handle
        .load_channel_history("#secret", 10)
        .await
        .unwrap();
    assert_eq!(history_b.len(), 1);
    assert_eq!(history_b[0].content, "top secret");

    node_a.handle.stop();
    node_b.handle.stop();
    node_c.handle.stop();
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_invite_preconditions() {
    let node_a = TestNode::spawn("alice").await.unwrap();
    let node_b = TestNode::spawn("bob").await.unwrap();
    node_a.connect_to(&node_b).await.unwrap();
    let info_b = node_b.handle.identity_info().await.unwrap();

    // Inviting into a channel we do not own.
    let err = node_a
        .handle
        .invite_peer_to_channel("#general", &info_b.node_id, &info_b.encryption_pub)
        .await
        .expect_err("only owners invite");
    assert!(matches!(err, meshchat::Error::NotOwner(_)));

    // Inviting a peer that is not connected.
    node_a
        .handle
        .create_channel("#secret", ChannelKind::Private)
        .await
        .unwrap();
    let stranger = meshchat::identity::Identity::generate("stranger");
    let err = node_a
        .handle
        .invite_peer_to_channel(
            "#secret",
            &stranger.node_id.to_hex(),
            &stranger.encryption_public_hex(),
        )
        .await
        .expect_err("target must be connected");
    assert!(matches!(err, meshchat::Error::NotConnected(_)));

    node_a.handle.stop();
    node_b.handle.stop();
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_reinvite_after_restart_unlocks_history() {
    let node_a = TestNode::spawn("alice").await.unwrap();
    let node_b = TestNode::spawn("bob").await.unwrap();
    node_a.connect_to(&node_b).await.unwrap();

    node_a
        .handle
        .create_channel("#x", ChannelKind::Private)
        .await
        .unwrap();
    let mut events_b = node_b.subscribe_events();
    invite(&node_a, &node_b, "#x").await;
    wait_for_invite(&mut events_b, "#x", Duration::from_secs(5))
        .await
        .unwrap();

    let msg_id = node_a.handle.broadcast_message("m1", "#x").await.unwrap();
    wait_for_message(&mut events_b, |m| m.msg_id == msg_id, Duration::from_secs(5))
        .await
        .expect("B reads m1 while holding the key");

    // Restart: the channel key lives only in memory and is gone; the
    // ciphertext row and the encryption keypair survive on disk.
    let node_b = node_b.restart().await.unwrap();
    let history = node_b.handle.load_channel_history("#x", 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_ne!(history[0].content, "m1", "without the key only ciphertext");

    // Fresh invite, identical channel key: history decrypts again. The
    // restarted node dials out so the stale stream entry on A is replaced.
    node_b.connect_to(&node_a).await.unwrap();
    let mut events_b = node_b.subscribe_events();
    invite(&node_a, &node_b, "#x").await;
    wait_for_invite(&mut events_b, "#x", Duration::from_secs(5))
        .await
        .expect("B accepts the re-invite");

    let history = node_b.handle.load_channel_history("#x", 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].msg_id, msg_id);
    assert_eq!(history[0].content, "m1");

    node_a.handle.stop();
    node_b.handle.stop();
}
