//! TCP transport
//!
//! One framed TCP connection per peer pair. Each side sends [`Hello`] first;
//! when both nodes dial each other at once, the connection opened by the
//! smaller node id survives on both ends. Frames already written on the losing
//! connection are still read until the peer closes it.
//!
//! After the handshake each side sends the other a [`FrameType::PeerList`] of
//! its remaining peers, and dials the ones it is not connected to yet. Joining
//! through any seed therefore ends in a full mesh.

use crate::framing::{Frame, FrameCodec, FrameType};
use crate::peer::{Hello, KnownPeer, PeerInfo, PROTOCOL_VERSION};
use crate::transport::{Connection, Transport, TransportError, TransportEvent};
use futures::{SinkExt, StreamExt};
use meshsub_core::NodeId;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

/// How long the remote side has to send its handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a connection that lost a duplicate-dial race is read from
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport layer managing TCP connections
pub struct TcpTransport {
    hello: Hello,
    local_addr: SocketAddr,
    /// Connected peers
    connections: RwLock<HashMap<NodeId, Arc<Connection>>>,
    /// Discovered peers being dialed
    dialing: Mutex<HashSet<NodeId>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl TcpTransport {
    /// Bind the listener and start accepting connections.
    pub async fn bind(
        node: NodeId,
        name: impl Into<String>,
        listen: SocketAddr,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        let listener = TcpListener::bind(listen).await?;
        let local_addr = listener.local_addr()?;
        let (events, rx) = mpsc::unbounded_channel();

        let transport = Arc::new(Self {
            hello: Hello::new(node, name, Some(local_addr)),
            local_addr,
            connections: RwLock::new(HashMap::new()),
            dialing: Mutex::new(HashSet::new()),
            events,
        });

        info!("Transport listening on {}", local_addr);
        tokio::spawn(accept_loop(Arc::downgrade(&transport), listener));

        Ok((transport, rx))
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Check if connected to a peer
    pub fn is_connected(&self, id: &NodeId) -> bool {
        self.connections
            .read()
            .get(id)
            .map(|c| c.is_open())
            .unwrap_or(false)
    }

    /// Dial a peer and complete the handshake. Returns the peer's node id.
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> Result<NodeId, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        self.clone().establish(stream, addr, true).await
    }

    async fn establish(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        dialed: bool,
    ) -> Result<NodeId, TransportError> {
        let mut framed = Framed::new(stream, FrameCodec::new());
        framed.send(Frame::encode(FrameType::Hello, &self.hello)?).await?;

        let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next())
            .await
            .map_err(|_| TransportError::Handshake("timed out".into()))?
            .ok_or(TransportError::ConnectionClosed)??;
        if first.frame_type != FrameType::Hello {
            return Err(TransportError::Handshake(format!(
                "expected hello, got {:?}",
                first.frame_type
            )));
        }
        let hello: Hello = first.decode()?;
        if hello.protocol_version != PROTOCOL_VERSION {
            return Err(TransportError::Handshake(format!(
                "protocol version {} unsupported",
                hello.protocol_version
            )));
        }
        let our_id = self.hello.node;
        if hello.node == our_id {
            return Err(TransportError::Handshake("connected to self".into()));
        }

        let peer_id = hello.node;
        let initiator = if dialed { our_id } else { peer_id };
        let (tx, rx) = mpsc::unbounded_channel();
        let info = PeerInfo::from_hello(&hello, Some(addr));
        let conn = Arc::new(Connection::new(info.clone(), initiator, tx));

        {
            let mut connections = self.connections.write();
            if let Some(existing) = connections.get(&peer_id) {
                if existing.is_open() {
                    let preferred = our_id.min(peer_id);
                    if existing.initiator == preferred || initiator != preferred {
                        debug!("Dropping duplicate connection to {}", peer_id);
                        tokio::spawn(drain(self.clone(), peer_id, framed));
                        return Ok(peer_id);
                    }
                    existing.close();
                }
            }
            connections.insert(peer_id, conn.clone());
        }

        info!("Connected to {} ({}) at {}", hello.name, peer_id, addr);
        let _ = self.events.send(TransportEvent::PeerConnected(info));

        let known = self.known_peers(&peer_id);
        if !known.is_empty() {
            match Frame::encode(FrameType::PeerList, &known) {
                Ok(frame) => {
                    let _ = conn.send(frame);
                }
                Err(e) => warn!("Failed to encode peer list: {}", e),
            }
        }

        let (sink, stream) = framed.split();
        tokio::spawn(write_loop(sink, rx));
        tokio::spawn(read_loop(self, conn, stream));

        Ok(peer_id)
    }

    /// Open peers other than `except` that told us where they listen
    fn known_peers(&self, except: &NodeId) -> Vec<KnownPeer> {
        self.connections
            .read()
            .values()
            .filter(|c| c.is_open() && c.peer.id != *except)
            .filter_map(|c| {
                c.peer.advertised_addr().map(|listen_addr| KnownPeer {
                    node: c.peer.id,
                    listen_addr,
                })
            })
            .collect()
    }

    /// Dial peers we learned about and are not connected to
    fn discover(self: &Arc<Self>, peers: Vec<KnownPeer>) {
        for peer in peers {
            if peer.node == self.hello.node || self.is_connected(&peer.node) {
                continue;
            }
            if !self.dialing.lock().insert(peer.node) {
                continue;
            }
            let transport = self.clone();
            tokio::spawn(async move {
                debug!("Dialing discovered peer {} at {}", peer.node, peer.listen_addr);
                if let Err(e) = transport.connect(peer.listen_addr).await {
                    debug!("Discovered peer {} not reachable: {}", peer.node, e);
                }
                transport.dialing.lock().remove(&peer.node);
            });
        }
    }

    /// Handle a frame that is not connection housekeeping
    fn dispatch(self: &Arc<Self>, from: NodeId, frame: Frame) {
        if frame.frame_type == FrameType::PeerList {
            match frame.decode::<Vec<KnownPeer>>() {
                Ok(peers) => self.discover(peers),
                Err(e) => warn!("Bad peer list from {}: {}", from, e),
            }
            return;
        }
        let _ = self.events.send(TransportEvent::FrameReceived { from, frame });
    }

    fn remove_connection(&self, conn: &Arc<Connection>) {
        conn.close();
        let peer_id = conn.peer.id;
        let removed = {
            let mut connections = self.connections.write();
            match connections.get(&peer_id) {
                Some(current) if Arc::ptr_eq(current, conn) => {
                    connections.remove(&peer_id);
                    true
                }
                _ => false,
            }
        };
        if removed {
            info!("Disconnected from {}", peer_id);
            let _ = self.events.send(TransportEvent::PeerDisconnected(peer_id));
        }
    }
}

impl Transport for TcpTransport {
    fn local_id(&self) -> NodeId {
        self.hello.node
    }

    fn send(&self, to: NodeId, frame: Frame) -> Result<(), TransportError> {
        let conn = self
            .connections
            .read()
            .get(&to)
            .cloned()
            .ok_or(TransportError::PeerNotFound(to))?;
        conn.send(frame)
    }

    fn connected_peers(&self) -> Vec<NodeId> {
        self.connections
            .read()
            .iter()
            .filter(|(_, c)| c.is_open())
            .map(|(id, _)| *id)
            .collect()
    }
}

async fn accept_loop(transport: std::sync::Weak<TcpTransport>, listener: TcpListener) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Accept error: {}", e);
                continue;
            }
        };
        let Some(transport) = transport.upgrade() else {
            break;
        };
        debug!("Accepted connection from {}", addr);
        let _ = stream.set_nodelay(true);
        tokio::spawn(async move {
            if let Err(e) = transport.establish(stream, addr, false).await {
                warn!("Handshake with {} failed: {}", addr, e);
            }
        });
    }
}

type FrameSink = futures::stream::SplitSink<Framed<TcpStream, FrameCodec>, Frame>;
type FrameStream = futures::stream::SplitStream<Framed<TcpStream, FrameCodec>>;

async fn write_loop(mut sink: FrameSink, mut rx: mpsc::UnboundedReceiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = sink.send(frame).await {
            debug!("Write failed: {}", e);
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(transport: Arc<TcpTransport>, conn: Arc<Connection>, mut stream: FrameStream) {
    let peer_id = conn.peer.id;
    while let Some(result) = stream.next().await {
        let frame = match result {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Read error from {}: {}", peer_id, e);
                break;
            }
        };
        match frame.frame_type {
            FrameType::Ping => {
                let _ = conn.send(Frame::pong());
            }
            FrameType::Pong => {}
            FrameType::Hello => debug!("Ignoring repeated hello from {}", peer_id),
            _ => transport.dispatch(peer_id, frame),
        }
    }
    transport.remove_connection(&conn);
}

/// Read a connection that lost a duplicate-dial race until the peer closes it
async fn drain(transport: Arc<TcpTransport>, peer_id: NodeId, mut framed: Framed<TcpStream, FrameCodec>) {
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while let Some(Ok(frame)) = framed.next().await {
            match frame.frame_type {
                FrameType::Ping | FrameType::Pong | FrameType::Hello => {}
                _ => transport.dispatch(peer_id, frame),
            }
        }
    })
    .await;
    if drained.is_err() {
        debug!("Duplicate connection to {} still open after drain timeout", peer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(b: u8) -> NodeId {
        NodeId([b; 32])
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_connect_and_exchange_frames() {
        let localhost: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (a, mut rx_a) = TcpTransport::bind(node(1), "a", localhost).await.unwrap();
        let (b, mut rx_b) = TcpTransport::bind(node(2), "b", localhost).await.unwrap();

        let peer = a.connect(b.local_addr()).await.unwrap();
        assert_eq!(peer, node(2));

        assert!(matches!(next_event(&mut rx_a).await, TransportEvent::PeerConnected(p) if p.id == node(2)));
        assert!(matches!(next_event(&mut rx_b).await, TransportEvent::PeerConnected(p) if p.id == node(1)));

        for i in 0..5u8 {
            a.send(node(2), Frame::new(FrameType::Deliver, vec![i])).unwrap();
        }
        for i in 0..5u8 {
            match next_event(&mut rx_b).await {
                TransportEvent::FrameReceived { from, frame } => {
                    assert_eq!(from, node(1));
                    assert_eq!(frame.payload, vec![i]);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_peers_discovered_through_seed() {
        let localhost: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (seed, _rx_seed) = TcpTransport::bind(node(1), "seed", localhost).await.unwrap();
        let (b, _rx_b) = TcpTransport::bind(node(2), "b", localhost).await.unwrap();
        let (c, _rx_c) = TcpTransport::bind(node(3), "c", localhost).await.unwrap();

        b.connect(seed.local_addr()).await.unwrap();
        c.connect(seed.local_addr()).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !(b.is_connected(&node(3)) && c.is_connected(&node(2))) {
            assert!(tokio::time::Instant::now() < deadline, "leaves never connected");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        b.send(node(3), Frame::ping()).unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_connection_is_drained() {
        let localhost: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (a, mut rx_a) = TcpTransport::bind(node(1), "a", localhost).await.unwrap();
        let (b, _rx_b) = TcpTransport::bind(node(2), "b", localhost).await.unwrap();
        a.connect(b.local_addr()).await.unwrap();
        assert!(matches!(next_event(&mut rx_a).await, TransportEvent::PeerConnected(p) if p.id == node(2)));

        // node 2 dials back; its link loses to the one node 1 opened
        let stream = TcpStream::connect(a.local_addr()).await.unwrap();
        let mut framed = Framed::new(stream, FrameCodec::new());
        framed
            .send(Frame::encode(FrameType::Hello, &Hello::new(node(2), "b", None)).unwrap())
            .await
            .unwrap();
        let hello: Hello = framed.next().await.unwrap().unwrap().decode().unwrap();
        assert_eq!(hello.node, node(1));
        framed.send(Frame::new(FrameType::Deliver, vec![7])).await.unwrap();

        match next_event(&mut rx_a).await {
            TransportEvent::FrameReceived { from, frame } => {
                assert_eq!(from, node(2));
                assert_eq!(frame.payload, vec![7]);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(a.is_connected(&node(2)));
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails() {
        let localhost: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (a, _rx) = TcpTransport::bind(node(1), "a", localhost).await.unwrap();
        assert!(matches!(
            a.send(node(9), Frame::ping()),
            Err(TransportError::PeerNotFound(_))
        ));
    }
}
