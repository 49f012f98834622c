//! Peer identity and information

use meshsub_core::NodeId;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Instant;

/// Wire protocol version carried in the handshake
pub const PROTOCOL_VERSION: u16 = 1;

/// Handshake message sent first on every connection
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub node: NodeId,
    pub name: String,
    pub protocol_version: u16,
    /// Address the sender accepts connections on
    pub listen_addr: Option<SocketAddr>,
}

impl Hello {
    pub fn new(node: NodeId, name: impl Into<String>, listen_addr: Option<SocketAddr>) -> Self {
        Self {
            node,
            name: name.into(),
            protocol_version: PROTOCOL_VERSION,
            listen_addr,
        }
    }
}

/// A peer another node is connected to, as told in a peer list
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownPeer {
    pub node: NodeId,
    pub listen_addr: SocketAddr,
}

/// Information about a connected peer
#[derive(Clone, Debug)]
pub struct PeerInfo {
    /// Peer identifier
    pub id: NodeId,
    /// Human readable node name
    pub name: String,
    /// Remote socket address, if any
    pub addr: Option<SocketAddr>,
    /// Address the peer accepts connections on
    pub listen_addr: Option<SocketAddr>,
    /// When the connection was established
    pub connected_at: Instant,
}

impl PeerInfo {
    /// Create peer info from a received handshake
    pub fn from_hello(hello: &Hello, addr: Option<SocketAddr>) -> Self {
        Self {
            id: hello.node,
            name: hello.name.clone(),
            addr,
            listen_addr: hello.listen_addr,
            connected_at: Instant::now(),
        }
    }

    /// Where other nodes can dial this peer. A wildcard listen address is
    /// replaced by the address the peer was seen at.
    pub fn advertised_addr(&self) -> Option<SocketAddr> {
        let listen = self.listen_addr?;
        match self.addr {
            Some(seen) if listen.ip().is_unspecified() => Some(SocketAddr::new(seen.ip(), listen.port())),
            _ => Some(listen),
        }
    }
}
