//! src/node.rs
//!
//! The node orchestrator: one engine actor that owns the identity, the
//! store, the gossip router, and the channel key table, and wires the
//! discovery and transport services together. The UI side talks to it
//! through a `NodeHandle` (commands with oneshot replies) and consumes
//! node events from a broadcast channel.

use crate::{
    config::Config,
    discovery::{Discovery, DiscoveryEvent},
    error::{Error, Result},
    identity::Identity,
    membership::{validate_channel_id, Membership},
    router::Router,
    store::{ChannelKind, MessageRow, Store, StoreStats},
    transport::{PeerSnapshot, Transport, TransportCommand, TransportEvent},
    wire::{Envelope, MessageKind, NodeId, Payload, GENERAL_CHANNEL},
};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What the UI learns about this node's identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityInfo {
    pub node_id: String,
    pub display_name: String,
    pub encryption_pub: String,
}

/// A decoded message as surfaced to the UI and returned from history.
/// `content` is plaintext whenever the channel key is held; otherwise the
/// stored ciphertext is passed through with `is_encrypted` still set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub msg_id: String,
    pub channel_id: String,
    pub sender_id: String,
    pub timestamp: String,
    pub content: String,
    pub is_encrypted: bool,
}

/// Events pushed to the UI collaborator.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    MessageReceived(ChatMessage),
    PeerAppeared { node_id: NodeId, addr: SocketAddr },
    PeerDisappeared { node_id: NodeId },
    InviteAccepted { channel_id: String },
}

/// Commands the handle sends into the engine.
enum NodeCommand {
    IdentityInfo {
        reply: oneshot::Sender<IdentityInfo>,
    },
    BroadcastMessage {
        channel_id: String,
        content: String,
        reply: oneshot::Sender<Result<String>>,
    },
    CreateChannel {
        channel_id: String,
        kind: ChannelKind,
        reply: oneshot::Sender<Result<()>>,
    },
    JoinChannel {
        channel_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    LeaveChannel {
        channel_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    SubscribedChannels {
        reply: oneshot::Sender<HashSet<String>>,
    },
    InvitePeer {
        channel_id: String,
        target_node_id: String,
        target_encryption_pub: String,
        reply: oneshot::Sender<Result<()>>,
    },
    LoadHistory {
        channel_id: String,
        limit: u32,
        reply: oneshot::Sender<Result<Vec<ChatMessage>>>,
    },
    ConnectTo {
        peer_id: NodeId,
        addr: SocketAddr,
    },
    Peers {
        reply: oneshot::Sender<Vec<PeerSnapshot>>,
    },
    Stats {
        reply: oneshot::Sender<Result<StoreStats>>,
    },
}

/// Starts all node services and returns the handle the UI drives.
pub struct Node;

impl Node {
    pub fn start(config: Config) -> Result<NodeHandle> {
        let identity = Identity::load_or_create(&config.profile_path, &config.display_name)?;
        let node_id = identity.node_id;
        let store = Store::open(&config.db_path)?;

        tracing::info!(
            node_id = %node_id,
            display_name = %identity.display_name,
            "🚀 Starting node..."
        );

        // --- Create Communication Channels ---
        let (command_tx, command_rx) = mpsc::channel::<NodeCommand>(64);
        let (transport_command_tx, transport_command_rx) = mpsc::channel::<TransportCommand>(100);
        let (transport_event_tx, transport_event_rx) = mpsc::channel::<TransportEvent>(100);
        let (discovery_event_tx, discovery_event_rx) = mpsc::channel::<DiscoveryEvent>(100);
        let (event_tx, _) = broadcast::channel::<NodeEvent>(256);

        // Subscriptions survive restarts through the store; the reserved
        // channel is always present.
        let mut subscriptions: HashSet<String> =
            store.subscribed_channels()?.into_iter().collect();
        subscriptions.insert(GENERAL_CHANNEL.to_string());
        let (subs_tx, subs_rx) = watch::channel(subscriptions.clone());

        let shutdown_token = CancellationToken::new();

        // --- Instantiate and Spawn Services ---

        let transport = Transport::bind(
            config.bind_addr,
            node_id,
            config.max_frame_bytes,
            Duration::from_millis(config.connect_timeout_ms),
            transport_command_rx,
            transport_event_tx,
        )?;
        let local_addr = transport.local_addr();
        let transport_task = tokio::spawn(transport.run(shutdown_token.clone()));
        tracing::debug!("Transport service spawned.");

        // Discovery failure is degraded, not fatal: the node keeps running
        // and can still be peered manually.
        let discovery_task = match &config.discovery {
            Some(discovery_config) => {
                match Discovery::start(
                    discovery_config,
                    node_id,
                    local_addr.port(),
                    discovery_event_tx,
                ) {
                    Ok(discovery) => {
                        let task = tokio::spawn(discovery.run(shutdown_token.clone()));
                        tracing::debug!("Discovery service spawned.");
                        Some(task)
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Discovery unavailable; no new peers will be found");
                        None
                    }
                }
            }
            None => {
                tracing::info!("Discovery disabled by configuration.");
                None
            }
        };

        let router = Router::new(
            config.seen_capacity,
            subs_rx,
            transport_command_tx.clone(),
            config.initial_ttl,
        );
        let engine = Engine {
            identity,
            store,
            router,
            membership: Membership::new(),
            subscriptions,
            subs_tx,
            command_rx,
            transport_tx: transport_command_tx,
            transport_event_rx,
            discovery_event_rx,
            event_tx: event_tx.clone(),
            fullname_index: HashMap::new(),
            connected: HashSet::new(),
        };
        let engine_task = tokio::spawn(engine.run(shutdown_token.clone()));
        tracing::debug!("Engine service spawned.");

        let mut tasks = vec![transport_task, engine_task];
        if let Some(task) = discovery_task {
            tasks.push(task);
        }

        Ok(NodeHandle {
            node_id,
            local_addr,
            command_tx,
            event_tx,
            shutdown_token,
            tasks,
        })
    }
}

/// The UI-facing handle: every method is a command round-trip into the
/// engine actor.
pub struct NodeHandle {
    node_id: NodeId,
    local_addr: SocketAddr,
    command_tx: mpsc::Sender<NodeCommand>,
    event_tx: broadcast::Sender<NodeEvent>,
    shutdown_token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The bound TCP listen address (ephemeral port resolved).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Subscribes to the node's outbound event stream.
    pub fn subscribe_events(&self) -> broadcast::Receiver<NodeEvent> {
        self.event_tx.subscribe()
    }

    pub async fn identity_info(&self) -> Result<IdentityInfo> {
        self.request(|reply| NodeCommand::IdentityInfo { reply }).await
    }

    /// Signs, stores, and floods a message. Returns its msg_id.
    pub async fn broadcast_message(&self, content: &str, channel_id: &str) -> Result<String> {
        self.request(|reply| NodeCommand::BroadcastMessage {
            channel_id: channel_id.to_string(),
            content: content.to_string(),
            reply,
        })
        .await?
    }

    pub async fn create_channel(&self, channel_id: &str, kind: ChannelKind) -> Result<()> {
        self.request(|reply| NodeCommand::CreateChannel {
            channel_id: channel_id.to_string(),
            kind,
            reply,
        })
        .await?
    }

    pub async fn join_channel(&self, channel_id: &str) -> Result<()> {
        self.request(|reply| NodeCommand::JoinChannel {
            channel_id: channel_id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn leave_channel(&self, channel_id: &str) -> Result<()> {
        self.request(|reply| NodeCommand::LeaveChannel {
            channel_id: channel_id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn subscribed_channels(&self) -> Result<HashSet<String>> {
        self.request(|reply| NodeCommand::SubscribedChannels { reply }).await
    }

    pub async fn invite_peer_to_channel(
        &self,
        channel_id: &str,
        target_node_id: &str,
        target_encryption_pub: &str,
    ) -> Result<()> {
        self.request(|reply| NodeCommand::InvitePeer {
            channel_id: channel_id.to_string(),
            target_node_id: target_node_id.to_string(),
            target_encryption_pub: target_encryption_pub.to_string(),
            reply,
        })
        .await?
    }

    pub async fn load_channel_history(
        &self,
        channel_id: &str,
        limit: u32,
    ) -> Result<Vec<ChatMessage>> {
        self.request(|reply| NodeCommand::LoadHistory {
            channel_id: channel_id.to_string(),
            limit,
            reply,
        })
        .await?
    }

    /// Manual peering, used when discovery is unavailable (and by tests).
    pub async fn connect_to(&self, peer_id: NodeId, addr: SocketAddr) -> Result<()> {
        self.command_tx
            .send(NodeCommand::ConnectTo { peer_id, addr })
            .await
            .map_err(|_| Error::NodeStopped)
    }

    /// Snapshot of the currently connected peers.
    pub async fn peers(&self) -> Result<Vec<PeerSnapshot>> {
        self.request(|reply| NodeCommand::Peers { reply }).await
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.request(|reply| NodeCommand::Stats { reply }).await?
    }

    /// Initiates shutdown. Idempotent.
    pub fn stop(&self) {
        self.shutdown_token.cancel();
    }

    /// Stops the node and waits for every service task to unwind.
    pub async fn stop_and_wait(self) {
        self.shutdown_token.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = ?e, "Node service task failed");
            }
        }
        tracing::info!("👋 Node has shut down gracefully.");
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> NodeCommand) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| Error::NodeStopped)?;
        reply_rx.await.map_err(|_| Error::NodeStopped)
    }
}

/// The core application logic actor.
struct Engine {
    identity: Identity,
    store: Store,
    router: Router,
    membership: Membership,
    subscriptions: HashSet<String>,
    subs_tx: watch::Sender<HashSet<String>>,
    command_rx: mpsc::Receiver<NodeCommand>,
    transport_tx: mpsc::Sender<TransportCommand>,
    transport_event_rx: mpsc::Receiver<TransportEvent>,
    discovery_event_rx: mpsc::Receiver<DiscoveryEvent>,
    event_tx: broadcast::Sender<NodeEvent>,
    /// Advertisement name → node id, so a disappearance (which only names
    /// the advertisement) maps back to the peer in O(1).
    fullname_index: HashMap<String, NodeId>,
    connected: HashSet<NodeId>,
}

impl Engine {
    async fn run(mut self, shutdown_token: CancellationToken) {
        tracing::info!(node_id = %self.identity.node_id, "Engine service started");

        loop {
            // Biased: pending transport/discovery events are observed before
            // the API command that may depend on them (e.g. an invite right
            // after a connection is reported).
            tokio::select! {
                biased;
                _ = shutdown_token.cancelled() => {
                    tracing::info!("Engine service received shutdown signal.");
                    break;
                },
                Some(event) = self.transport_event_rx.recv() => {
                    self.handle_transport_event(event).await;
                },
                Some(event) = self.discovery_event_rx.recv() => {
                    self.handle_discovery_event(event).await;
                },
                Some(command) = self.command_rx.recv() => {
                    self.handle_command(command).await;
                },
                else => {
                    tracing::info!("Channel closed. Engine service shutting down.");
                    break;
                }
            }
        }
        // The store flushes and closes when the engine drops it.
    }

    async fn handle_command(&mut self, command: NodeCommand) {
        match command {
            NodeCommand::IdentityInfo { reply } => {
                let _ = reply.send(IdentityInfo {
                    node_id: self.identity.node_id.to_hex(),
                    display_name: self.identity.display_name.clone(),
                    encryption_pub: self.identity.encryption_public_hex(),
                });
            }
            NodeCommand::BroadcastMessage {
                channel_id,
                content,
                reply,
            } => {
                let _ = reply.send(self.broadcast_message(&channel_id, &content).await);
            }
            NodeCommand::CreateChannel {
                channel_id,
                kind,
                reply,
            } => {
                let result = self
                    .membership
                    .create_channel(&self.store, &self.identity, &channel_id, kind);
                if result.is_ok() {
                    self.subscribe(&channel_id);
                }
                let _ = reply.send(result);
            }
            NodeCommand::JoinChannel { channel_id, reply } => {
                let result = validate_channel_id(&channel_id).map(|_| {
                    self.subscribe(&channel_id);
                });
                let _ = reply.send(result);
            }
            NodeCommand::LeaveChannel { channel_id, reply } => {
                let _ = reply.send(self.leave(&channel_id));
            }
            NodeCommand::SubscribedChannels { reply } => {
                let _ = reply.send(self.subscriptions.clone());
            }
            NodeCommand::InvitePeer {
                channel_id,
                target_node_id,
                target_encryption_pub,
                reply,
            } => {
                let _ = reply.send(
                    self.invite_peer(&channel_id, &target_node_id, &target_encryption_pub)
                        .await,
                );
            }
            NodeCommand::LoadHistory {
                channel_id,
                limit,
                reply,
            } => {
                let _ = reply.send(self.load_history(&channel_id, limit));
            }
            NodeCommand::ConnectTo { peer_id, addr } => {
                let _ = self
                    .transport_tx
                    .send(TransportCommand::Connect { peer_id, addr })
                    .await;
            }
            NodeCommand::Peers { reply } => {
                // The transport owns the peer table; pass the caller's
                // reply straight through for a snapshot read.
                let _ = self
                    .transport_tx
                    .send(TransportCommand::Peers { reply })
                    .await;
            }
            NodeCommand::Stats { reply } => {
                let _ = reply.send(self.store.stats());
            }
        }
    }

    /// The send path: encrypt when the channel is private, sign, record in
    /// the store, flood, and surface locally.
    async fn broadcast_message(&mut self, channel_id: &str, content: &str) -> Result<String> {
        validate_channel_id(channel_id)?;
        if !self.subscriptions.contains(channel_id) {
            return Err(Error::NotSubscribed(channel_id.to_string()));
        }

        let meta = self.store.get_channel_info(channel_id)?;
        let is_private = meta
            .as_ref()
            .map(|m| m.kind == ChannelKind::Private)
            .unwrap_or(false);

        let payload = if is_private {
            let key = self
                .membership
                .key(channel_id)
                .ok_or_else(|| Error::NoKey(channel_id.to_string()))?;
            let (ciphertext, nonce) = crate::crypto::encrypt(key, content)?;
            Payload::encrypted_chat(channel_id, ciphertext, nonce)
        } else {
            // Joined-but-never-seen public channels get a row on first send.
            self.store
                .store_channel(channel_id, ChannelKind::Public, None)?;
            Payload::chat(channel_id, content)
        };

        let envelope = self.router.broadcast(&self.identity, payload).await?;
        self.store.store_message(&message_row(&envelope))?;

        // The sender's UI sees its own message immediately, decoded.
        let _ = self.event_tx.send(NodeEvent::MessageReceived(ChatMessage {
            msg_id: envelope.msg_id.clone(),
            channel_id: channel_id.to_string(),
            sender_id: envelope.sender_id.to_hex(),
            timestamp: envelope.payload.timestamp.clone(),
            content: content.to_string(),
            is_encrypted: envelope.payload.is_encrypted,
        }));

        Ok(envelope.msg_id)
    }

    async fn invite_peer(
        &mut self,
        channel_id: &str,
        target_node_id: &str,
        target_encryption_pub: &str,
    ) -> Result<()> {
        let target = NodeId::from_hex(target_node_id)?;
        if !self.connected.contains(&target) {
            return Err(Error::NotConnected(target_node_id.to_string()));
        }
        let payload = self.membership.build_invite(
            &self.store,
            &self.identity,
            channel_id,
            target_node_id,
            target_encryption_pub,
        )?;
        self.router.broadcast(&self.identity, payload).await?;
        tracing::info!(channel = %channel_id, target = %target, "Invite sent");
        Ok(())
    }

    fn load_history(&self, channel_id: &str, limit: u32) -> Result<Vec<ChatMessage>> {
        let rows = self.store.get_messages_for_channel(channel_id, limit)?;
        let key = self.membership.key(channel_id);
        Ok(rows.into_iter().map(|row| decode_row(row, key)).collect())
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PeerConnected { peer_id, addr } => {
                if self.connected.insert(peer_id) {
                    let _ = self.event_tx.send(NodeEvent::PeerAppeared {
                        node_id: peer_id,
                        addr,
                    });
                }
            }
            TransportEvent::PeerDisconnected { peer_id } => {
                if self.connected.remove(&peer_id) {
                    let _ = self
                        .event_tx
                        .send(NodeEvent::PeerDisappeared { node_id: peer_id });
                }
            }
            TransportEvent::Inbound { from, envelope } => {
                if let Some(envelope) = self.router.handle_incoming(envelope, from).await {
                    self.dispatch(envelope).await;
                }
            }
        }
    }

    /// An envelope that passed verification, the subscription gate, and
    /// dedup. Dispatch by kind.
    async fn dispatch(&mut self, envelope: Envelope) {
        match envelope.payload.kind.clone() {
            MessageKind::ChatMessage => self.handle_chat(envelope),
            MessageKind::Invite => {
                match self
                    .membership
                    .accept_invite(&self.store, &self.identity, &envelope)
                {
                    Ok(Some(channel_id)) => {
                        self.subscribe(&channel_id);
                        let _ = self.event_tx.send(NodeEvent::InviteAccepted { channel_id });
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, msg_id = %envelope.msg_id, "Invite processing failed");
                    }
                }
            }
            MessageKind::Other(kind) => {
                // Already forwarded by the router; nothing to do locally.
                tracing::debug!(kind = %kind, msg_id = %envelope.msg_id, "Unknown message kind");
            }
        }
    }

    fn handle_chat(&mut self, envelope: Envelope) {
        let payload = &envelope.payload;
        let Some(content) = payload.content.clone() else {
            tracing::debug!(msg_id = %envelope.msg_id, "Chat message without content; ignoring");
            return;
        };

        // Access control for private channels: without the key there is no
        // plaintext and no stored row; the envelope only transits.
        let decoded_content = if payload.is_encrypted {
            let Some(key) = self.membership.key(&payload.channel_id) else {
                tracing::debug!(
                    channel = %payload.channel_id,
                    msg_id = %envelope.msg_id,
                    "Encrypted message for a channel we hold no key for; ignoring"
                );
                return;
            };
            let Some(nonce) = payload.nonce.as_deref() else {
                tracing::debug!(msg_id = %envelope.msg_id, "Encrypted message without nonce; ignoring");
                return;
            };
            match crate::crypto::decrypt(key, &content, nonce) {
                Ok(plaintext) => plaintext,
                Err(_) => {
                    tracing::debug!(msg_id = %envelope.msg_id, "Message failed authentication; ignoring");
                    return;
                }
            }
        } else {
            content
        };

        // Rows reference channels; public channels we merely joined get a
        // metadata row on first message.
        if let Err(e) = self
            .store
            .store_channel(&payload.channel_id, ChannelKind::Public, None)
        {
            tracing::error!(error = %e, "Failed to record channel");
            return;
        }
        let was_new = match self.store.store_message(&message_row(&envelope)) {
            Ok(was_new) => was_new,
            Err(e) => {
                tracing::error!(error = %e, msg_id = %envelope.msg_id, "Failed to store message");
                return;
            }
        };
        if !was_new {
            return;
        }

        let _ = self.event_tx.send(NodeEvent::MessageReceived(ChatMessage {
            msg_id: envelope.msg_id.clone(),
            channel_id: payload.channel_id.clone(),
            sender_id: envelope.sender_id.to_hex(),
            timestamp: payload.timestamp.clone(),
            content: decoded_content,
            is_encrypted: payload.is_encrypted,
        }));
    }

    async fn handle_discovery_event(&mut self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::PeerAppeared {
                node_id,
                addr,
                fullname,
            } => {
                self.fullname_index.insert(fullname, node_id);
                let _ = self
                    .transport_tx
                    .send(TransportCommand::Connect {
                        peer_id: node_id,
                        addr,
                    })
                    .await;
            }
            DiscoveryEvent::PeerLost { fullname } => {
                if let Some(node_id) = self.fullname_index.remove(&fullname) {
                    let _ = self
                        .transport_tx
                        .send(TransportCommand::Disconnect { peer_id: node_id })
                        .await;
                }
            }
        }
    }

    fn subscribe(&mut self, channel_id: &str) {
        if self.subscriptions.insert(channel_id.to_string()) {
            if let Err(e) = self.store.set_subscribed(channel_id, true) {
                tracing::error!(error = %e, channel = %channel_id, "Failed to persist subscription");
            }
            let _ = self.subs_tx.send(self.subscriptions.clone());
            tracing::info!(channel = %channel_id, "Joined channel");
        }
    }

    /// Leaving drops the subscription only; a private channel's key stays
    /// in memory so history remains decryptable on rejoin.
    fn leave(&mut self, channel_id: &str) -> Result<()> {
        if channel_id == GENERAL_CHANNEL {
            return Err(Error::ReservedChannel(channel_id.to_string()));
        }
        if !self.subscriptions.remove(channel_id) {
            return Err(Error::NotSubscribed(channel_id.to_string()));
        }
        self.store.set_subscribed(channel_id, false)?;
        let _ = self.subs_tx.send(self.subscriptions.clone());
        tracing::info!(channel = %channel_id, "Left channel");
        Ok(())
    }
}

fn message_row(envelope: &Envelope) -> MessageRow {
    MessageRow {
        msg_id: envelope.msg_id.clone(),
        channel_id: envelope.payload.channel_id.clone(),
        sender_id: envelope.sender_id.to_hex(),
        timestamp: envelope.payload.timestamp.clone(),
        content: envelope.payload.content.clone().unwrap_or_default(),
        signature: envelope.signature.clone(),
        is_encrypted: envelope.payload.is_encrypted,
        nonce: envelope.payload.nonce.clone(),
    }
}

fn decode_row(row: MessageRow, key: Option<&crate::crypto::ChannelKey>) -> ChatMessage {
    let content = if row.is_encrypted {
        match (key, row.nonce.as_deref()) {
            (Some(key), Some(nonce)) => {
                crate::crypto::decrypt(key, &row.content, nonce).unwrap_or_else(|_| {
                    tracing::debug!(msg_id = %row.msg_id, "Stored ciphertext failed to decrypt");
                    row.content.clone()
                })
            }
            _ => row.content.clone(),
        }
    } else {
        row.content.clone()
    };
    ChatMessage {
        msg_id: row.msg_id,
        channel_id: row.channel_id,
        sender_id: row.sender_id,
        timestamp: row.timestamp,
        content,
        is_encrypted: row.is_encrypted,
    }
}
