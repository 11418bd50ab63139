//! src/transport/peer.rs
//!
//! Per-stream tasks: dialing, the hello handshake, and the framed
//! reader/writer pair serving one TCP stream. Frames are newline-terminated
//! JSON with a hard length cap; an oversize or malformed frame is dropped
//! and the stream keeps going.

use crate::transport::{StreamNotice, TransportEvent};
use crate::wire::{Frame, NodeId};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{
    tcp::{OwnedReadHalf, OwnedWriteHalf},
    TcpStream,
};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

/// Queued frames per peer before sends start dropping.
const WRITE_QUEUE_DEPTH: usize = 64;

/// Dials a peer, announces ourselves, and hands the stream over to the
/// reader/writer tasks. The actor learns the outcome through a notice.
#[allow(clippy::too_many_arguments)]
pub(crate) fn spawn_outbound(
    peer_id: NodeId,
    addr: SocketAddr,
    self_id: NodeId,
    stream_id: u64,
    max_frame_bytes: usize,
    connect_timeout: Duration,
    notice_tx: mpsc::Sender<StreamNotice>,
    event_tx: mpsc::Sender<TransportEvent>,
) {
    tokio::spawn(async move {
        let stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::warn!(peer = %peer_id, addr = %addr, error = %e, "Dial failed");
                let _ = notice_tx.send(StreamNotice::DialFailed { peer_id }).await;
                return;
            }
            Err(_) => {
                tracing::warn!(peer = %peer_id, addr = %addr, "Dial timed out");
                let _ = notice_tx.send(StreamNotice::DialFailed { peer_id }).await;
                return;
            }
        };

        let (read_half, write_half) = stream.into_split();
        let cancel = CancellationToken::new();
        let (writer_tx, writer_rx) = mpsc::channel::<String>(WRITE_QUEUE_DEPTH);

        // First frame on every outbound stream: identify ourselves.
        let hello = match Frame::hello(self_id).to_line() {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize hello frame");
                let _ = notice_tx.send(StreamNotice::DialFailed { peer_id }).await;
                return;
            }
        };
        writer_tx.try_send(hello).expect("fresh queue has room");

        spawn_writer(
            write_half,
            writer_rx,
            stream_id,
            max_frame_bytes,
            notice_tx.clone(),
            cancel.clone(),
        );
        spawn_reader(
            read_half,
            Some(peer_id),
            stream_id,
            max_frame_bytes,
            notice_tx.clone(),
            event_tx,
            cancel.clone(),
        );

        let _ = notice_tx
            .send(StreamNotice::Ready {
                stream_id,
                peer_id,
                addr,
                writer_tx,
                cancel,
            })
            .await;
    });
}

/// Serves an accepted stream. The peer id is unknown until the dialer's
/// hello arrives; the reader sends the `Ready` notice itself once it does.
pub(crate) fn spawn_inbound(
    stream: TcpStream,
    remote: SocketAddr,
    stream_id: u64,
    max_frame_bytes: usize,
    notice_tx: mpsc::Sender<StreamNotice>,
    event_tx: mpsc::Sender<TransportEvent>,
) {
    let (read_half, write_half) = stream.into_split();
    let cancel = CancellationToken::new();
    let (writer_tx, writer_rx) = mpsc::channel::<String>(WRITE_QUEUE_DEPTH);

    spawn_writer(
        write_half,
        writer_rx,
        stream_id,
        max_frame_bytes,
        notice_tx.clone(),
        cancel.clone(),
    );

    tokio::spawn(async move {
        let mut framed = FramedRead::new(
            read_half,
            LinesCodec::new_with_max_length(max_frame_bytes),
        );
        let mut peer_id: Option<NodeId> = None;

        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => break,
                item = framed.next() => item,
            };
            match item {
                Some(Ok(line)) => match Frame::parse(&line) {
                    Ok(Frame::Hello { hello }) => {
                        if peer_id.is_some() {
                            continue;
                        }
                        tracing::debug!(peer = %hello.node_id, remote = %remote, "Inbound stream identified");
                        peer_id = Some(hello.node_id);
                        let _ = notice_tx
                            .send(StreamNotice::Ready {
                                stream_id,
                                peer_id: hello.node_id,
                                addr: remote,
                                writer_tx: writer_tx.clone(),
                                cancel: cancel.clone(),
                            })
                            .await;
                    }
                    Ok(Frame::Envelope(envelope)) => match peer_id {
                        Some(from) => {
                            let _ = event_tx
                                .send(TransportEvent::Inbound {
                                    from,
                                    envelope: *envelope,
                                })
                                .await;
                        }
                        None => {
                            tracing::warn!(remote = %remote, "Envelope on unidentified stream dropped");
                        }
                    },
                    Err(e) => {
                        tracing::warn!(remote = %remote, error = %e, "Malformed frame dropped");
                    }
                },
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    tracing::warn!(remote = %remote, "Oversize frame dropped");
                }
                Some(Err(e)) => {
                    tracing::debug!(remote = %remote, error = %e, "Stream read failed");
                    break;
                }
                None => break,
            }
        }
        let _ = notice_tx.send(StreamNotice::Closed { stream_id }).await;
    });
}

/// Reader for a stream whose peer is already known (outbound side).
fn spawn_reader(
    read_half: OwnedReadHalf,
    peer_id: Option<NodeId>,
    stream_id: u64,
    max_frame_bytes: usize,
    notice_tx: mpsc::Sender<StreamNotice>,
    event_tx: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut framed = FramedRead::new(
            read_half,
            LinesCodec::new_with_max_length(max_frame_bytes),
        );
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => break,
                item = framed.next() => item,
            };
            match item {
                Some(Ok(line)) => match Frame::parse(&line) {
                    Ok(Frame::Envelope(envelope)) => {
                        if let Some(from) = peer_id {
                            let _ = event_tx
                                .send(TransportEvent::Inbound {
                                    from,
                                    envelope: *envelope,
                                })
                                .await;
                        }
                    }
                    // A hello from the acceptor side carries no information.
                    Ok(Frame::Hello { .. }) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Malformed frame dropped");
                    }
                },
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    tracing::warn!("Oversize frame dropped");
                }
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "Stream read failed");
                    break;
                }
                None => break,
            }
        }
        let _ = notice_tx.send(StreamNotice::Closed { stream_id }).await;
    });
}

/// Drains the write queue onto the socket until the queue closes, the
/// stream dies, or the stream is cancelled.
fn spawn_writer(
    write_half: OwnedWriteHalf,
    mut writer_rx: mpsc::Receiver<String>,
    stream_id: u64,
    max_frame_bytes: usize,
    notice_tx: mpsc::Sender<StreamNotice>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut framed = FramedWrite::new(
            write_half,
            LinesCodec::new_with_max_length(max_frame_bytes),
        );
        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => break,
                line = writer_rx.recv() => line,
            };
            let Some(line) = line else { break };
            if let Err(e) = framed.send(line).await {
                tracing::debug!(error = %e, "Stream write failed");
                let _ = notice_tx.send(StreamNotice::Closed { stream_id }).await;
                break;
            }
        }
        // Flush whatever made it into the codec before dropping the socket.
        let _ = SinkExt::<String>::flush(&mut framed).await;
    });
}
