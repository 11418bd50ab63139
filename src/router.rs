//! src/router.rs
//!
//! The gossip router: the gatekeeper every envelope passes through, in and
//! out. It owns the dedup window and a live snapshot of the subscription
//! set, and it decides what gets dispatched and what gets passed along.
//!
//! Incoming envelopes run the pipeline verify → subscription filter →
//! dedup → forward. The filter runs *before* dedup deliberately: an
//! envelope for a channel we do not care about leaves no trace in the seen
//! window, so a node that subscribes later can still accept the message if
//! it propagates again.

use crate::{
    identity::Identity,
    transport::TransportCommand,
    wire::{Envelope, NodeId, Payload},
};
use std::collections::{HashSet, VecDeque};
use tokio::sync::{mpsc, watch};

/// Bounded FIFO of recently observed msg_ids.
struct SeenSet {
    capacity: usize,
    set: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenSet {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            set: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    fn contains(&self, msg_id: &str) -> bool {
        self.set.contains(msg_id)
    }

    /// Records an id. Returns false if it was already present. Evicts the
    /// oldest entry once the window is full.
    fn insert(&mut self, msg_id: &str) -> bool {
        if !self.set.insert(msg_id.to_string()) {
            return false;
        }
        self.order.push_back(msg_id.to_string());
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        true
    }
}

pub struct Router {
    seen: SeenSet,
    subscriptions: watch::Receiver<HashSet<String>>,
    transport_tx: mpsc::Sender<TransportCommand>,
    initial_ttl: u8,
}

impl Router {
    pub fn new(
        seen_capacity: usize,
        subscriptions: watch::Receiver<HashSet<String>>,
        transport_tx: mpsc::Sender<TransportCommand>,
        initial_ttl: u8,
    ) -> Self {
        Self {
            seen: SeenSet::new(seen_capacity),
            subscriptions,
            transport_tx,
            initial_ttl,
        }
    }

    /// Signs and floods a locally originated payload. The envelope is
    /// recorded in the seen window first so our own echoes are ignored, and
    /// returned so the orchestrator can store it and surface it immediately.
    pub async fn broadcast(
        &mut self,
        identity: &Identity,
        payload: Payload,
    ) -> crate::error::Result<Envelope> {
        let envelope = identity.sign_payload(payload, self.initial_ttl)?;
        self.seen.insert(&envelope.msg_id);
        let command = TransportCommand::Broadcast {
            envelope: envelope.clone(),
            except: None,
        };
        if let Err(e) = self.transport_tx.send(command).await {
            tracing::error!(error = %e, "Failed to hand broadcast to transport");
        }
        Ok(envelope)
    }

    /// Runs one incoming envelope through the pipeline. Returns the envelope
    /// when the orchestrator should dispatch it; `None` means it was
    /// rejected, filtered, or a duplicate. Forwarding (with one hop spent,
    /// skipping the peer it came from) happens here.
    pub async fn handle_incoming(
        &mut self,
        envelope: Envelope,
        from_peer: NodeId,
    ) -> Option<Envelope> {
        if envelope.verify().is_err() {
            tracing::warn!(
                msg_id = %envelope.msg_id,
                sender = %envelope.sender_id,
                "Envelope failed verification. Discarding."
            );
            return None;
        }

        // Subscription gate. No state change for foreign channels.
        let channel_id = envelope.payload.channel_id.clone();
        if !self.subscriptions.borrow().contains(&channel_id) {
            tracing::debug!(channel = %channel_id, msg_id = %envelope.msg_id, "Not subscribed; ignoring");
            return None;
        }

        if !self.seen.insert(&envelope.msg_id) {
            tracing::debug!(msg_id = %envelope.msg_id, "Duplicate envelope; ignoring");
            return None;
        }

        if envelope.ttl > 0 {
            let command = TransportCommand::Broadcast {
                envelope: envelope.forwarded(),
                except: Some(from_peer),
            };
            if let Err(e) = self.transport_tx.send(command).await {
                tracing::error!(error = %e, "Failed to hand forward to transport");
            }
        }

        Some(envelope)
    }
}

// --- Unit Tests ---
