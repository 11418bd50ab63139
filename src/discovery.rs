//! src/discovery.rs
//!
//! Zero-configuration local-link discovery over mDNS. The node advertises
//! itself under a well-known service type and watches the same type for
//! other nodes appearing and disappearing.
//!
//! The mDNS daemon runs its own thread; its events surface through a channel
//! that this actor drains *on* the runtime and re-emits as typed
//! `DiscoveryEvent`s over a bounded mpsc. Node state is never touched from
//! the daemon thread.

use crate::config::DiscoveryConfig;
use crate::error::Result;
use crate::wire::{NodeId, PROTOCOL_VERSION};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What the discovery service reports to the node engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    PeerAppeared {
        node_id: NodeId,
        addr: SocketAddr,
        fullname: String,
    },
    /// Only the advertisement name is known at removal time; the engine
    /// keeps the reverse index.
    PeerLost { fullname: String },
}

/// The discovery actor: publishes our service record, then watches the
/// service type until shutdown.
pub struct Discovery {
    daemon: ServiceDaemon,
    service_type: String,
    fullname: String,
    node_id: NodeId,
    events_tx: mpsc::Sender<DiscoveryEvent>,
}

impl Discovery {
    /// Publishes the advertisement for this node. `port` is the actual TCP
    /// listen port (after ephemeral binding resolved).
    pub fn start(
        config: &DiscoveryConfig,
        node_id: NodeId,
        port: u16,
        events_tx: mpsc::Sender<DiscoveryEvent>,
    ) -> Result<Self> {
        let daemon = ServiceDaemon::new()?;

        let instance = format!("meshchat-{}", &node_id.to_hex()[..12]);
        let hostname = format!("{instance}.local.");
        let mut txt = HashMap::new();
        txt.insert("node_id".to_string(), node_id.to_hex());
        txt.insert("protocol_version".to_string(), PROTOCOL_VERSION.to_string());

        let info = ServiceInfo::new(&config.service_type, &instance, &hostname, "", port, txt)?
            .enable_addr_auto();
        let fullname = info.get_fullname().to_string();
        daemon.register(info)?;
        tracing::info!(fullname = %fullname, port, "Published discovery advertisement");

        Ok(Self {
            daemon,
            service_type: config.service_type.clone(),
            fullname,
            node_id,
            events_tx,
        })
    }

    /// The main run loop: browse the service type and forward peer events
    /// until shutdown, then withdraw our advertisement (best effort).
    pub async fn run(self, shutdown_token: CancellationToken) {
        let receiver = match self.daemon.browse(&self.service_type) {
            Ok(receiver) => receiver,
            Err(e) => {
                tracing::warn!(error = %e, "Discovery browse failed; no new peers will be found");
                shutdown_token.cancelled().await;
                self.withdraw();
                return;
            }
        };

        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    tracing::info!("Discovery service received shutdown signal.");
                    break;
                },
                event = receiver.recv_async() => {
                    match event {
                        Ok(event) => self.handle_event(event).await,
                        Err(_) => {
                            tracing::warn!("mDNS daemon channel closed. Discovery stopping.");
                            break;
                        }
                    }
                }
            }
        }
        self.withdraw();
    }

    async fn handle_event(&self, event: ServiceEvent) {
        match event {
            ServiceEvent::ServiceResolved(info) => {
                let fullname = info.get_fullname().to_string();
                let Some(node_id) = info
                    .get_property_val_str("node_id")
                    .and_then(|hex| NodeId::from_hex(hex).ok())
                else {
                    tracing::debug!(fullname = %fullname, "Advertisement without a node id; ignoring");
                    return;
                };
                // Our own advertisement comes back from the daemon too.
                if node_id == self.node_id {
                    return;
                }
                let version = info.get_property_val_str("protocol_version").unwrap_or("");
                if version != PROTOCOL_VERSION {
                    tracing::info!(peer = %node_id, version, "Peer speaks a different protocol version; ignoring");
                    return;
                }
                let Some(ip) = info.get_addresses().iter().next().copied() else {
                    tracing::debug!(fullname = %fullname, "Advertisement resolved without an address");
                    return;
                };
                let addr = SocketAddr::new(IpAddr::from(ip), info.get_port());
                tracing::debug!(peer = %node_id, addr = %addr, "Peer appeared");
                let _ = self
                    .events_tx
                    .send(DiscoveryEvent::PeerAppeared {
                        node_id,
                        addr,
                        fullname,
                    })
                    .await;
            }
            ServiceEvent::ServiceRemoved(_ty, fullname) => {
                if fullname == self.fullname {
                    return;
                }
                tracing::debug!(fullname = %fullname, "Peer advertisement removed");
                let _ = self
                    .events_tx
                    .send(DiscoveryEvent::PeerLost { fullname })
                    .await;
            }
            _ => {}
        }
    }

    fn withdraw(&self) {
        if let Err(e) = self.daemon.unregister(&self.fullname) {
            tracing::debug!(error = %e, "Failed to withdraw advertisement");
        }
        let _ = self.daemon.shutdown();
    }
}
