//! Transport seam
//!
//! The pub/sub node assumes a transport that delivers frames between two live
//! nodes reliably and in order, and that reports peers coming and going. Both
//! [`crate::MemoryTransport`] and [`crate::TcpTransport`] implement it.

use crate::framing::{Frame, FrameError};
use crate::peer::PeerInfo;
use meshsub_core::NodeId;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;

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
    PeerNotFound(NodeId),
    #[error("Handshake failed: {0}")]
    Handshake(String),
}

/// Event from the transport layer
#[derive(Debug)]
pub enum TransportEvent {
    /// New peer connected
    PeerConnected(PeerInfo),
    /// Peer disconnected
    PeerDisconnected(NodeId),
    /// Frame received from peer
    FrameReceived { from: NodeId, frame: Frame },
}

/// Point-to-point, ordered, reliable delivery between live nodes.
///
/// `send` never blocks: frames are queued on the peer's outbound channel and
/// written in queue order.
pub trait Transport: Send + Sync + 'static {
    /// Our node identity
    fn local_id(&self) -> NodeId;

    /// Queue a frame for a connected peer
    fn send(&self, to: NodeId, frame: Frame) -> Result<(), TransportError>;

    /// Peers with an open connection
    fn connected_peers(&self) -> Vec<NodeId>;
}

/// Outbound half of a connection to a peer
#[derive(Debug)]
pub struct Connection {
    /// Peer info
    pub peer: PeerInfo,
    /// Node that opened the connection (used to break duplicate dials)
    pub initiator: NodeId,
    /// Send channel; `None` once closed, which lets the writer drain and exit
    tx: RwLock<Option<mpsc::UnboundedSender<Frame>>>,
}

impl Connection {
    pub fn new(peer: PeerInfo, initiator: NodeId, tx: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            peer,
            initiator,
            tx: RwLock::new(Some(tx)),
        }
    }

    /// Send a frame to this peer
    pub fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let tx = self.tx.read();
        tx.as_ref()
            .ok_or(TransportError::ConnectionClosed)?
            .send(frame)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Check if connection is open
    pub fn is_open(&self) -> bool {
        self.tx
            .read()
            .as_ref()
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    /// Close the connection
    pub fn close(&self) {
        self.tx.write().take();
    }
}
