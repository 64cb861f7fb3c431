//! Peer transport layer
//!
//! [`Transport`] is the seam the node sends through. Two implementations:
//! - [`TcpTransport`]: length-prefixed frames over TCP with a Hello handshake
//! - [`MemoryTransport`]: in-process delivery through a shared [`MemoryNetwork`]
//!
//! Inbound traffic surfaces as [`TransportEvent`]s on an mpsc channel.

use crate::framing::{Frame, FrameCodec, FrameError, FrameType};
use crate::peer::{PeerId, PeerInfo};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

/// How long a new connection has to send its Hello
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),
    #[error("Already connected to peer: {0}")]
    AlreadyConnected(PeerId),
    #[error("Outbound queue full for peer: {0}")]
    QueueFull(PeerId),
    #[error("Handshake failed: {0}")]
    Handshake(String),
}

/// Event from the transport layer
#[derive(Debug)]
pub enum TransportEvent {
    /// New peer connected
    PeerConnected(PeerId),
    /// Peer disconnected
    PeerDisconnected(PeerId),
    /// Frame received from peer
    FrameReceived { from: PeerId, frame: Frame },
}

/// Outbound side of a peer transport.
///
/// Sends never block: a frame either lands in the peer's queue or the call
/// fails immediately.
pub trait Transport: Send + Sync {
    /// This node's id
    fn local_id(&self) -> &PeerId;

    /// Queue a frame for one peer
    fn send(&self, to: &PeerId, frame: Frame) -> Result<(), TransportError>;

    /// Currently reachable peers
    fn connected_peers(&self) -> Vec<PeerId>;

    /// Queue a frame for every connected peer; returns how many accepted it
    fn broadcast(&self, frame: Frame) -> usize {
        let mut delivered = 0;
        for peer in self.connected_peers() {
            match self.send(&peer, frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!("Broadcast to {} failed: {}", peer, e),
            }
        }
        delivered
    }
}

// =============================================================================
// TCP
// =============================================================================

/// Connection to a peer
struct Connection {
    /// Peer info
    peer: PeerInfo,
    /// Send channel drained by the writer task
    tx: mpsc::Sender<Frame>,
    /// Distinguishes reconnects under the same peer id
    serial: u64,
}

/// TCP transport managing one framed connection per peer
pub struct TcpTransport {
    /// Our peer ID
    local_id: PeerId,
    /// Connected peers
    connections: RwLock<HashMap<PeerId, Connection>>,
    /// Inbound event sink
    event_tx: mpsc::Sender<TransportEvent>,
    /// Per-connection outbound queue depth
    queue_depth: usize,
    next_serial: AtomicU64,
}

impl TcpTransport {
    /// Create a new transport
    pub fn new(local_id: PeerId, event_tx: mpsc::Sender<TransportEvent>) -> Arc<Self> {
        Arc::new(Self {
            local_id,
            connections: RwLock::new(HashMap::new()),
            event_tx,
            queue_depth: 256,
            next_serial: AtomicU64::new(1),
        })
    }

    /// Bind a listener and accept connections in the background.
    ///
    /// Returns the bound address (useful with port 0).
    pub async fn listen(self: &Arc<Self>, addr: SocketAddr) -> Result<SocketAddr, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        info!("Transport listening on {}", bound);

        let transport = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let transport = Arc::clone(&transport);
                        tokio::spawn(async move {
                            if let Err(e) = transport.establish(stream, remote).await {
                                debug!("Inbound connection from {} failed: {}", remote, e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });

        Ok(bound)
    }

    /// Dial a peer and complete the handshake
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> Result<PeerId, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        Arc::clone(self).establish(stream, addr).await
    }

    /// Get info for a connected peer
    pub fn get_peer(&self, id: &PeerId) -> Option<PeerInfo> {
        self.connections.read().get(id).map(|c| c.peer.clone())
    }

    /// Drop a connection; the reader/writer tasks wind down on their own
    pub fn disconnect(&self, id: &PeerId) -> bool {
        self.connections.write().remove(id).is_some()
    }

    async fn establish(
        self: Arc<Self>,
        stream: TcpStream,
        remote: SocketAddr,
    ) -> Result<PeerId, TransportError> {
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, FrameCodec::new());
        let mut writer = FramedWrite::new(write_half, FrameCodec::new());

        let hello = messages::Hello::new(self.local_id.clone());
        writer.send(hello.to_frame()?).await?;

        let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.next())
            .await
            .map_err(|_| TransportError::Handshake("timed out waiting for hello".into()))?
            .ok_or(TransportError::ConnectionClosed)??;
        let remote_hello = messages::Hello::from_frame(&first)?;

        if remote_hello.protocol_version != messages::PROTOCOL_VERSION {
            return Err(TransportError::Handshake(format!(
                "protocol version {} (expected {})",
                remote_hello.protocol_version,
                messages::PROTOCOL_VERSION
            )));
        }
        let peer_id = remote_hello.node_id;
        if peer_id == self.local_id {
            return Err(TransportError::Handshake("connected to self".into()));
        }

        let (tx, mut rx) = mpsc::channel::<Frame>(self.queue_depth);
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        {
            let mut connections = self.connections.write();
            if connections.contains_key(&peer_id) {
                return Err(TransportError::AlreadyConnected(peer_id));
            }
            connections.insert(
                peer_id.clone(),
                Connection {
                    peer: PeerInfo::new(peer_id.clone(), Some(remote)),
                    tx,
                    serial,
                },
            );
        }
        info!("Peer {} connected from {}", peer_id, remote);
        let _ = self
            .event_tx
            .send(TransportEvent::PeerConnected(peer_id.clone()))
            .await;

        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = writer.send(frame).await {
                    debug!("Write failed: {}", e);
                    break;
                }
            }
        });

        let transport = Arc::clone(&self);
        let reader_peer = peer_id.clone();
        tokio::spawn(async move {
            while let Some(result) = reader.next().await {
                match result {
                    Ok(frame) => {
                        if let Some(conn) = transport.connections.write().get_mut(&reader_peer) {
                            conn.peer.touch();
                        }
                        let event = TransportEvent::FrameReceived {
                            from: reader_peer.clone(),
                            frame,
                        };
                        if transport.event_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Read from {} failed: {}", reader_peer, e);
                        break;
                    }
                }
            }
            transport.connection_closed(&reader_peer, serial).await;
        });

        Ok(peer_id)
    }

    async fn connection_closed(&self, peer: &PeerId, serial: u64) {
        let removed = {
            let mut connections = self.connections.write();
            match connections.get(peer) {
                Some(conn) if conn.serial == serial => connections.remove(peer).is_some(),
                _ => false,
            }
        };
        if removed {
            info!("Peer {} disconnected", peer);
            let _ = self
                .event_tx
                .send(TransportEvent::PeerDisconnected(peer.clone()))
                .await;
        }
    }
}

impl Transport for TcpTransport {
    fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    fn send(&self, to: &PeerId, frame: Frame) -> Result<(), TransportError> {
        let connections = self.connections.read();
        let conn = connections
            .get(to)
            .ok_or_else(|| TransportError::PeerNotFound(to.clone()))?;
        conn.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull(to.clone()),
            mpsc::error::TrySendError::Closed(_) => TransportError::ConnectionClosed,
        })
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.connections.read().keys().cloned().collect();
        peers.sort();
        peers
    }
}

// =============================================================================
// IN-MEMORY
// =============================================================================

/// Shared medium for [`MemoryTransport`]s in one process.
///
/// Nodes can be isolated to simulate a network partition.
#[derive(Default)]
pub struct MemoryNetwork {
    inboxes: RwLock<HashMap<PeerId, mpsc::Sender<TransportEvent>>>,
    isolated: RwLock<HashSet<PeerId>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a node. Existing members see it connect.
    pub fn join(
        self: &Arc<Self>,
        id: PeerId,
        queue_depth: usize,
    ) -> (Arc<MemoryTransport>, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(queue_depth);
        let others: Vec<(PeerId, mpsc::Sender<TransportEvent>)> = {
            let mut inboxes = self.inboxes.write();
            let others = inboxes
                .iter()
                .map(|(peer, inbox)| (peer.clone(), inbox.clone()))
                .collect();
            inboxes.insert(id.clone(), tx.clone());
            others
        };
        for (peer, inbox) in others {
            if self.reachable(&id, &peer) {
                let _ = inbox.try_send(TransportEvent::PeerConnected(id.clone()));
                let _ = tx.try_send(TransportEvent::PeerConnected(peer));
            }
        }

        let transport = Arc::new(MemoryTransport {
            local_id: id,
            network: Arc::clone(self),
            sent: Mutex::new(Vec::new()),
        });
        (transport, rx)
    }

    /// Cut a node off from every other member
    pub fn isolate(&self, id: &PeerId) {
        if !self.isolated.write().insert(id.clone()) {
            return;
        }
        self.notify_link_change(id, false);
    }

    /// Reconnect an isolated node
    pub fn heal(&self, id: &PeerId) {
        if !self.isolated.write().remove(id) {
            return;
        }
        self.notify_link_change(id, true);
    }

    fn notify_link_change(&self, id: &PeerId, up: bool) {
        let inboxes = self.inboxes.read();
        let Some(own) = inboxes.get(id) else {
            return;
        };
        for (peer, inbox) in inboxes.iter() {
            if peer == id || self.isolated.read().contains(peer) {
                continue;
            }
            let (to_peer, to_self) = if up {
                (
                    TransportEvent::PeerConnected(id.clone()),
                    TransportEvent::PeerConnected(peer.clone()),
                )
            } else {
                (
                    TransportEvent::PeerDisconnected(id.clone()),
                    TransportEvent::PeerDisconnected(peer.clone()),
                )
            };
            let _ = inbox.try_send(to_peer);
            let _ = own.try_send(to_self);
        }
    }

    fn reachable(&self, a: &PeerId, b: &PeerId) -> bool {
        let isolated = self.isolated.read();
        a != b && !isolated.contains(a) && !isolated.contains(b)
    }
}

/// In-process transport; every accepted frame is also recorded for inspection
pub struct MemoryTransport {
    local_id: PeerId,
    network: Arc<MemoryNetwork>,
    sent: Mutex<Vec<(PeerId, Frame)>>,
}

impl MemoryTransport {
    /// A transport on its own private network with no peers
    pub fn standalone(id: PeerId) -> Arc<Self> {
        MemoryNetwork::new().join(id, 16).0
    }

    /// Drain the record of frames sent so far
    pub fn take_sent(&self) -> Vec<(PeerId, Frame)> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl Transport for MemoryTransport {
    fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    fn send(&self, to: &PeerId, frame: Frame) -> Result<(), TransportError> {
        if !self.network.reachable(&self.local_id, to) {
            return Err(TransportError::PeerNotFound(to.clone()));
        }
        let inbox = self
            .network
            .inboxes
            .read()
            .get(to)
            .cloned()
            .ok_or_else(|| TransportError::PeerNotFound(to.clone()))?;
        let event = TransportEvent::FrameReceived {
            from: self.local_id.clone(),
            frame: frame.clone(),
        };
        inbox.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull(to.clone()),
            mpsc::error::TrySendError::Closed(_) => TransportError::ConnectionClosed,
        })?;
        self.sent.lock().push((to.clone(), frame));
        Ok(())
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .network
            .inboxes
            .read()
            .keys()
            .filter(|peer| self.network.reachable(&self.local_id, peer))
            .cloned()
            .collect();
        peers.sort();
        peers
    }
}

// =============================================================================
// WIRE MESSAGES
// =============================================================================

/// Message serialization helpers
pub mod messages {
    use super::*;
    use relay_core::types::{Event, EventId, GossipEnvelope};
    use serde::{Deserialize, Serialize};

    /// Wire protocol version announced in [`Hello`]
    pub const PROTOCOL_VERSION: u16 = 1;

    macro_rules! wire_message {
        ($ty:ty, $frame_type:expr) => {
            impl $ty {
                pub fn to_frame(&self) -> Result<Frame, FrameError> {
                    let payload = postcard::to_allocvec(self)?;
                    Ok(Frame::new($frame_type, payload))
                }

                pub fn from_frame(frame: &Frame) -> Result<Self, FrameError> {
                    if frame.frame_type != $frame_type {
                        return Err(FrameError::Serialization(format!(
                            "expected {:?}, got {:?}",
                            $frame_type, frame.frame_type
                        )));
                    }
                    Ok(postcard::from_bytes(&frame.payload)?)
                }
            }
        };
    }

    /// Connection handshake
    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    pub struct Hello {
        pub node_id: PeerId,
        pub protocol_version: u16,
    }

    impl Hello {
        pub fn new(node_id: PeerId) -> Self {
            Self {
                node_id,
                protocol_version: PROTOCOL_VERSION,
            }
        }
    }

    /// Liveness heartbeat
    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    pub struct Heartbeat {
        /// Sender clock (unix millis)
        pub sent_at: u64,
        /// Number of events in the sender's DAG
        pub event_count: u64,
    }

    /// A batch of gossiped events
    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    pub struct EventBatch {
        pub envelopes: Vec<GossipEnvelope>,
    }

    /// Ask a peer for its recent DAG state during reconciliation
    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    pub struct StateRequest {
        pub request_id: u64,
        /// Only events the responder received at or after this (unix millis)
        pub since: u64,
        pub max_events: u32,
    }

    /// A peer's DAG state
    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    pub struct StateResponse {
        pub request_id: u64,
        pub events: Vec<Event>,
        pub tips: Vec<EventId>,
    }

    wire_message!(Hello, FrameType::Hello);
    wire_message!(Heartbeat, FrameType::Heartbeat);
    wire_message!(EventBatch, FrameType::EventGossip);
    wire_message!(StateRequest, FrameType::StateRequest);
    wire_message!(StateResponse, FrameType::StateResponse);
}
