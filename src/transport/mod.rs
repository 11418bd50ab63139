//! src/transport/mod.rs
//!
//! The connection manager: a TCP actor that owns the peer table and every
//! stream. It accepts inbound connections, dials discovered peers, frames
//! envelopes as newline-terminated canonical JSON, and fans broadcasts out
//! to all connected peers.
//!
//! Streams are attributed to node ids through a `hello` first frame (see
//! `wire::Frame`); frames arriving on a stream that has not identified
//! itself are dropped. Any per-peer I/O failure tears down only that peer;
//! the node stays up.

use crate::{
    error::Result,
    wire::{Envelope, NodeId},
};
use socket2::{Domain, Protocol, Socket, Type};
use std::{collections::HashMap, collections::HashSet, net::SocketAddr, time::Duration};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

pub mod peer;

/// Commands that can be sent to the transport actor.
#[derive(Debug)]
pub enum TransportCommand {
    /// Idempotent: a no-op when the peer is already connected or a dial is
    /// in flight.
    Connect { peer_id: NodeId, addr: SocketAddr },
    Send { peer_id: NodeId, envelope: Envelope },
    Broadcast {
        envelope: Envelope,
        except: Option<NodeId>,
    },
    Disconnect { peer_id: NodeId },
    /// Snapshot read of the peer table.
    Peers {
        reply: oneshot::Sender<Vec<PeerSnapshot>>,
    },
}

/// Events reported to the node engine.
#[derive(Debug)]
pub enum TransportEvent {
    PeerConnected { peer_id: NodeId, addr: SocketAddr },
    PeerDisconnected { peer_id: NodeId },
    Inbound { from: NodeId, envelope: Envelope },
}

/// A cheap clone of one peer-table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub node_id: NodeId,
    pub addr: SocketAddr,
}

/// One connected peer: the active stream's writer plus the token that tears
/// the stream down.
struct PeerEntry {
    addr: SocketAddr,
    writer_tx: mpsc::Sender<String>,
    stream_id: u64,
    cancel: CancellationToken,
}

/// Internal notices from stream tasks back to the actor.
#[derive(Debug)]
pub(crate) enum StreamNotice {
    /// A stream became attributable to a peer: an outbound dial completed,
    /// or an inbound stream presented its hello.
    Ready {
        stream_id: u64,
        peer_id: NodeId,
        addr: SocketAddr,
        writer_tx: mpsc::Sender<String>,
        cancel: CancellationToken,
    },
    DialFailed { peer_id: NodeId },
    Closed { stream_id: u64 },
}

/// The P2P transport actor.
pub struct Transport {
    listener: TcpListener,
    local_addr: SocketAddr,
    self_id: NodeId,
    max_frame_bytes: usize,
    connect_timeout: Duration,
    command_rx: mpsc::Receiver<TransportCommand>,
    event_tx: mpsc::Sender<TransportEvent>,
    notice_tx: mpsc::Sender<StreamNotice>,
    notice_rx: mpsc::Receiver<StreamNotice>,
    peers: HashMap<NodeId, PeerEntry>,
    /// Peers with a dial in flight, to keep `Connect` idempotent.
    dialing: HashSet<NodeId>,
    next_stream_id: u64,
}

impl Transport {
    /// Binds the listener (ephemeral port resolved here) and builds the
    /// actor. The engine owns the command side; events flow to `event_tx`.
    pub fn bind(
        bind_addr: SocketAddr,
        self_id: NodeId,
        max_frame_bytes: usize,
        connect_timeout: Duration,
        command_rx: mpsc::Receiver<TransportCommand>,
        event_tx: mpsc::Sender<TransportEvent>,
    ) -> Result<Self> {
        let socket = Socket::new(
            Domain::for_address(bind_addr),
            Type::STREAM,
            Some(Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.bind(&bind_addr.into())?;
        socket.listen(128)?;
        let std_listener: std::net::TcpListener = socket.into();
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;
        let local_addr = listener.local_addr()?;

        let (notice_tx, notice_rx) = mpsc::channel(64);
        Ok(Self {
            listener,
            local_addr,
            self_id,
            max_frame_bytes,
            connect_timeout,
            command_rx,
            event_tx,
            notice_tx,
            notice_rx,
            peers: HashMap::new(),
            dialing: HashSet::new(),
            next_stream_id: 0,
        })
    }

    /// The address actually bound, for the discovery advertisement.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The main run loop for the transport actor.
    pub async fn run(mut self, shutdown_token: CancellationToken) {
        tracing::info!(listen_addr = %self.local_addr, "Transport service started");

        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    tracing::info!("Transport service received shutdown signal.");
                    break;
                },
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, remote)) => self.handle_accept(stream, remote),
                        Err(e) => tracing::warn!(error = %e, "Accept failed"),
                    }
                },
                Some(command) = self.command_rx.recv() => {
                    self.handle_command(command).await;
                },
                Some(notice) = self.notice_rx.recv() => {
                    self.handle_notice(notice).await;
                },
                else => {
                    tracing::info!("Command channel closed. Transport service shutting down.");
                    break;
                }
            }
        }

        // Accept loop is gone once we stop polling; now close every stream.
        for (peer_id, entry) in self.peers.drain() {
            tracing::debug!(peer = %peer_id, "Closing stream");
            entry.cancel.cancel();
        }
    }

    fn handle_accept(&mut self, stream: tokio::net::TcpStream, remote: SocketAddr) {
        tracing::debug!(remote = %remote, "Accepted inbound stream");
        let stream_id = self.next_stream_id();
        peer::spawn_inbound(
            stream,
            remote,
            stream_id,
            self.max_frame_bytes,
            self.notice_tx.clone(),
            self.event_tx.clone(),
        );
    }

    async fn handle_command(&mut self, command: TransportCommand) {
        match command {
            TransportCommand::Connect { peer_id, addr } => {
                if peer_id == self.self_id
                    || self.peers.contains_key(&peer_id)
                    || self.dialing.contains(&peer_id)
                {
                    return;
                }
                self.dialing.insert(peer_id);
                let stream_id = self.next_stream_id();
                peer::spawn_outbound(
                    peer_id,
                    addr,
                    self.self_id,
                    stream_id,
                    self.max_frame_bytes,
                    self.connect_timeout,
                    self.notice_tx.clone(),
                    self.event_tx.clone(),
                );
            }
            TransportCommand::Send { peer_id, envelope } => {
                let Some(entry) = self.peers.get(&peer_id) else {
                    tracing::debug!(peer = %peer_id, "Send to unconnected peer dropped");
                    return;
                };
                self.enqueue(entry, &envelope);
            }
            TransportCommand::Broadcast { envelope, except } => {
                for (peer_id, entry) in &self.peers {
                    if Some(*peer_id) == except {
                        continue;
                    }
                    self.enqueue(entry, &envelope);
                }
            }
            TransportCommand::Disconnect { peer_id } => {
                if let Some(entry) = self.peers.remove(&peer_id) {
                    tracing::debug!(peer = %peer_id, "Disconnecting");
                    entry.cancel.cancel();
                    let _ = self
                        .event_tx
                        .send(TransportEvent::PeerDisconnected { peer_id })
                        .await;
                }
            }
            TransportCommand::Peers { reply } => {
                let snapshot = self
                    .peers
                    .iter()
                    .map(|(node_id, entry)| PeerSnapshot {
                        node_id: *node_id,
                        addr: entry.addr,
                    })
                    .collect();
                let _ = reply.send(snapshot);
            }
        }
    }

    async fn handle_notice(&mut self, notice: StreamNotice) {
        match notice {
            StreamNotice::Ready {
                stream_id,
                peer_id,
                addr,
                writer_tx,
                cancel,
            } => {
                self.dialing.remove(&peer_id);
                let replaced = self.peers.insert(
                    peer_id,
                    PeerEntry {
                        addr,
                        writer_tx,
                        stream_id,
                        cancel,
                    },
                );
                match replaced {
                    Some(old) => {
                        // Newest stream wins; both ends converge on it.
                        tracing::debug!(peer = %peer_id, "Replacing existing stream");
                        old.cancel.cancel();
                    }
                    None => {
                        tracing::info!(peer = %peer_id, addr = %addr, "Peer connected");
                        let _ = self
                            .event_tx
                            .send(TransportEvent::PeerConnected { peer_id, addr })
                            .await;
                    }
                }
            }
            StreamNotice::DialFailed { peer_id } => {
                self.dialing.remove(&peer_id);
            }
            StreamNotice::Closed { stream_id } => {
                let closed_peer = self
                    .peers
                    .iter()
                    .find(|(_, entry)| entry.stream_id == stream_id)
                    .map(|(peer_id, _)| *peer_id);
                if let Some(peer_id) = closed_peer {
                    let entry = self.peers.remove(&peer_id).expect("looked up above");
                    entry.cancel.cancel();
                    tracing::info!(peer = %peer_id, "Peer stream closed");
                    let _ = self
                        .event_tx
                        .send(TransportEvent::PeerDisconnected { peer_id })
                        .await;
                }
            }
        }
    }

    /// Best-effort enqueue of one frame onto a peer's writer. A full queue
    /// drops the frame rather than stalling the actor.
    fn enqueue(&self, entry: &PeerEntry, envelope: &Envelope) {
        let line = match envelope.to_line() {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize envelope");
                return;
            }
        };
        if line.len() > self.max_frame_bytes {
            tracing::warn!(
                len = line.len(),
                max = self.max_frame_bytes,
                "Outbound frame exceeds cap; dropped"
            );
            return;
        }
        if let Err(e) = entry.writer_tx.try_send(line) {
            tracing::warn!(error = %e, "Peer write queue unavailable; frame dropped");
        }
    }

    fn next_stream_id(&mut self) -> u64 {
        self.next_stream_id += 1;
        self.next_stream_id
    }
}
