//! src/app.rs
//!
//! Defines the main `App` struct: the thinnest possible consumer of the
//! node API. It starts the node, logs node events until Ctrl+C, and shuts
//! down gracefully. Interactive UIs sit in front of the same `NodeHandle`.

use crate::{
    config::Config,
    error::Result,
    node::{Node, NodeEvent},
};
use tokio::sync::broadcast::error::RecvError;

pub struct App {
    config: Config,
}

impl App {
    /// Creates a new `App` from the given configuration.
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self { config })
    }

    /// Runs the node until Ctrl+C, echoing events into the log.
    pub async fn run(self) -> Result<()> {
        let node = Node::start(self.config)?;
        let mut events = node.subscribe_events();

        tracing::info!(
            node_id = %node.node_id(),
            listen_addr = %node.local_addr(),
            "Node is up"
        );

        loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    signal.expect("Failed to listen for Ctrl+C");
                    tracing::info!("Ctrl+C received. Initiating graceful shutdown...");
                    break;
                },
                event = events.recv() => {
                    match event {
                        Ok(event) => log_event(event),
                        Err(RecvError::Lagged(missed)) => {
                            tracing::warn!(missed, "Event stream lagged");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        }

        node.stop_and_wait().await;
        Ok(())
    }
}

fn log_event(event: NodeEvent) {
    match event {
        NodeEvent::MessageReceived(message) => {
            tracing::info!(
                channel = %message.channel_id,
                from = %message.sender_id,
                content = %message.content,
                "Message"
            );
        }
        NodeEvent::PeerAppeared { node_id, addr } => {
            tracing::info!(peer = %node_id, addr = %addr, "Peer appeared");
        }
        NodeEvent::PeerDisappeared { node_id } => {
            tracing::info!(peer = %node_id, "Peer disappeared");
        }
        NodeEvent::InviteAccepted { channel_id } => {
            tracing::info!(channel = %channel_id, "Joined private channel by invite");
        }
    }
}
