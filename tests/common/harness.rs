//! tests/common/harness.rs
//!
//! A test harness for creating and managing small meshes of real nodes.
//! This module provides the building blocks for all integration tests,
//! abstracting away the boilerplate of:
//! - Creating temporary directories and configuration for each node.
//! - Spawning nodes with discovery disabled and wiring them together
//!   through manual peering.
//! - Restarting a node against its existing profile and store.
//! - Speaking the wire protocol directly (`RawPeer`) to observe and inject
//!   frames without a full node on the other end.

use anyhow::{bail, Context, Result};
use futures::{SinkExt, StreamExt};
use meshchat::{
    config::Config,
    identity::Identity,
    node::{ChatMessage, Node, NodeEvent, NodeHandle},
    wire::{Envelope, Frame, NodeId},
};
use std::net::SocketAddr;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LinesCodec};

/// A handle to a running node instance in a test environment.
pub struct TestNode {
    pub handle: NodeHandle,
    pub node_id: NodeId,
    pub addr: SocketAddr,
    config: Config,
    _temp_dir: TempDir,
}

impl TestNode {
    /// Configures and spawns a node in a fresh temporary directory.
    /// Discovery is disabled; tests wire the topology explicitly.
    pub async fn spawn(name: &str) -> Result<Self> {
        let temp_dir = tempdir().context("Failed to create temp dir")?;
        let config = Config {
            profile_path: temp_dir.path().join("profile.json"),
            db_path: temp_dir.path().join("meshchat.db"),
            display_name: name.to_string(),
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            connect_timeout_ms: 1000,
            discovery: None,
            ..Config::default()
        };
        Self::start(config, temp_dir)
    }

    fn start(config: Config, temp_dir: TempDir) -> Result<Self> {
        let handle = Node::start(config.clone()).context("Failed to start node")?;
        let node_id = handle.node_id();
        let addr = handle.local_addr();
        tracing::info!(node = %node_id, addr = %addr, "Spawned test node");
        Ok(Self {
            handle,
            node_id,
            addr,
            config,
            _temp_dir: temp_dir,
        })
    }

    /// Stops the node and brings it back up against the same profile and
    /// store. In-memory state (channel keys, subscriptions' watch) is
    /// rebuilt from scratch; the identity and message history survive.
    pub async fn restart(self) -> Result<Self> {
        let config = self.config.clone();
        let temp_dir = self._temp_dir;
        self.handle.stop_and_wait().await;
        Self::start(config, temp_dir)
    }

    /// Dials `other` and waits until both sides report the connection.
    pub async fn connect_to(&self, other: &TestNode) -> Result<()> {
        self.handle.connect_to(other.node_id, other.addr).await?;
        wait_for_peer(&self.handle, other.node_id).await?;
        wait_for_peer(&other.handle, self.node_id).await?;
        Ok(())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<NodeEvent> {
        self.handle.subscribe_events()
    }
}

/// Polls the peer table until `peer` shows up.
pub async fn wait_for_peer(handle: &NodeHandle, peer: NodeId) -> Result<()> {
    let deadline = Duration::from_secs(5);
    timeout(deadline, async {
        loop {
            let peers = handle.peers().await?;
            if peers.iter().any(|p| p.node_id == peer) {
                return Ok::<_, anyhow::Error>(());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .context("Timeout waiting for peer connection")?
}

/// Waits for a chat message matching `predicate` on an event stream.
pub async fn wait_for_message<F>(
    events: &mut broadcast::Receiver<NodeEvent>,
    predicate: F,
    wait: Duration,
) -> Result<ChatMessage>
where
    F: Fn(&ChatMessage) -> bool,
{
    timeout(wait, async {
        loop {
            match events.recv().await {
                Ok(NodeEvent::MessageReceived(message)) if predicate(&message) => {
                    return Ok(message)
                }
                Ok(_) => continue,
                Err(e) => bail!("event stream ended: {e}"),
            }
        }
    })
    .await
    .context("Timeout waiting for message")?
}

/// Asserts that no chat message arrives within `wait`.
pub async fn expect_no_message(
    events: &mut broadcast::Receiver<NodeEvent>,
    wait: Duration,
) -> Result<()> {
    let got = timeout(wait, async {
        loop {
            match events.recv().await {
                Ok(NodeEvent::MessageReceived(message)) => return Some(message),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    })
    .await;
    match got {
        Err(_elapsed) => Ok(()),
        Ok(None) => Ok(()),
        Ok(Some(message)) => bail!("unexpected message delivered: {message:?}"),
    }
}

/// Waits for the invite-accepted event for `channel_id`.
pub async fn wait_for_invite(
    events: &mut broadcast::Receiver<NodeEvent>,
    channel_id: &str,
    wait: Duration,
) -> Result<()> {
    timeout(wait, async {
        loop {
            match events.recv().await {
                Ok(NodeEvent::InviteAccepted { channel_id: accepted }) if accepted == channel_id => {
                    return Ok(())
                }
                Ok(_) => continue,
                Err(e) => bail!("event stream ended: {e}"),
            }
        }
    })
    .await
    .context("Timeout waiting for invite")?
}

/// A bare wire-protocol client: a TCP stream speaking newline-delimited
/// JSON frames, with its own identity. Used to observe forwarded frames
/// and to inject hand-crafted (including hostile) envelopes.
pub struct RawPeer {
    pub identity: Identity,
    framed: Framed<TcpStream, LinesCodec>,
}

impl RawPeer {
    /// Connects to a node and announces itself with a hello frame.
    pub async fn connect(node: &TestNode, name: &str) -> Result<Self> {
        let identity = Identity::generate(name);
        let stream = TcpStream::connect(node.addr)
            .await
            .context("RawPeer connect failed")?;
        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(1 << 20));
        let hello = Frame::hello(identity.node_id).to_line()?;
        framed.send(hello).await?;

        // The node registers the stream once the hello is processed.
        wait_for_peer(&node.handle, identity.node_id).await?;
        Ok(Self { identity, framed })
    }

    /// Sends one envelope as a single frame.
    pub async fn send_envelope(&mut self, envelope: &Envelope) -> Result<()> {
        self.framed.send(envelope.to_line()?).await?;
        Ok(())
    }

    /// Sends an arbitrary raw line (malformed or oversize on purpose).
    pub async fn send_line(&mut self, line: String) -> Result<()> {
        self.framed.send(line).await?;
        Ok(())
    }

    /// Reads frames until an envelope matching `predicate` arrives.
    pub async fn recv_envelope<F>(&mut self, predicate: F, wait: Duration) -> Result<Envelope>
    where
        F: Fn(&Envelope) -> bool,
    {
        timeout(wait, async {
            loop {
                let line = match self.framed.next().await {
                    Some(line) => line.context("raw stream read failed")?,
                    None => bail!("raw stream closed"),
                };
                if let Ok(Frame::Envelope(envelope)) = Frame::parse(&line) {
                    if predicate(&envelope) {
                        return Ok(*envelope);
                    }
                }
            }
        })
        .await
        .context("Timeout waiting for envelope")?
    }

    /// Asserts that no envelope matching `predicate` arrives within `wait`.
    pub async fn expect_no_envelope<F>(&mut self, predicate: F, wait: Duration) -> Result<()>
    where
        F: Fn(&Envelope) -> bool,
    {
        let got = timeout(wait, async {
            loop {
                let Some(Ok(line)) = self.framed.next().await else {
                    return None;
                };
                if let Ok(Frame::Envelope(envelope)) = Frame::parse(&line) {
                    if predicate(&envelope) {
                        return Some(envelope);
                    }
                }
            }
        })
        .await;
        match got {
            Err(_elapsed) => Ok(()),
            Ok(None) => Ok(()),
            Ok(Some(envelope)) => bail!("unexpected envelope forwarded: {}", envelope.msg_id),
        }
    }
}
