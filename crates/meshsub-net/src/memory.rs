//! In-process transport
//!
//! Every joined node gets an unbounded inbox; sending a frame pushes it onto
//! the receiver's inbox, so frames between two nodes arrive in send order.
//! Links between pairs can be cut to simulate unreachable members.

use crate::framing::Frame;
use crate::peer::{Hello, PeerInfo};
use crate::transport::{Transport, TransportError, TransportEvent};
use meshsub_core::NodeId;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

struct Member {
    name: String,
    events: mpsc::UnboundedSender<TransportEvent>,
}

#[derive(Default)]
struct NetworkState {
    members: HashMap<NodeId, Member>,
    /// Severed links, stored with the smaller id first
    severed: HashSet<(NodeId, NodeId)>,
}

impl NetworkState {
    fn linked(&self, a: NodeId, b: NodeId) -> bool {
        !self.severed.contains(&link_key(a, b))
    }

    fn info(&self, id: NodeId) -> Option<PeerInfo> {
        self.members
            .get(&id)
            .map(|m| PeerInfo::from_hello(&Hello::new(id, m.name.clone(), None), None))
    }
}

fn link_key(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Shared in-process network hub
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<RwLock<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node. Existing members and the new node learn about each other.
    pub fn join(
        &self,
        id: NodeId,
        name: impl Into<String>,
    ) -> (MemoryTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.write();
        state.members.insert(
            id,
            Member {
                name: name.into(),
                events: tx,
            },
        );

        let others: Vec<NodeId> = state.members.keys().copied().filter(|m| *m != id).collect();
        for other in others {
            if state.linked(id, other) {
                announce(&state, id, other);
            }
        }

        (
            MemoryTransport {
                id,
                network: self.clone(),
            },
            rx,
        )
    }

    /// Detach a node; remaining members see it disconnect.
    pub fn leave(&self, id: NodeId) {
        let mut state = self.state.write();
        if state.members.remove(&id).is_none() {
            return;
        }
        for (other, member) in &state.members {
            if state.linked(id, *other) {
                let _ = member.events.send(TransportEvent::PeerDisconnected(id));
            }
        }
        debug!("Node {} left the memory network", id);
    }

    /// Cut the link between two nodes.
    pub fn sever(&self, a: NodeId, b: NodeId) {
        let mut state = self.state.write();
        if !state.severed.insert(link_key(a, b)) {
            return;
        }
        if let Some(m) = state.members.get(&a) {
            let _ = m.events.send(TransportEvent::PeerDisconnected(b));
        }
        if let Some(m) = state.members.get(&b) {
            let _ = m.events.send(TransportEvent::PeerDisconnected(a));
        }
    }

    /// Restore a severed link.
    pub fn heal(&self, a: NodeId, b: NodeId) {
        let mut state = self.state.write();
        if !state.severed.remove(&link_key(a, b)) {
            return;
        }
        if state.members.contains_key(&a) && state.members.contains_key(&b) {
            announce(&state, a, b);
        }
    }

    fn deliver(&self, from: NodeId, to: NodeId, frame: Frame) -> Result<(), TransportError> {
        let state = self.state.read();
        if !state.members.contains_key(&from) || !state.linked(from, to) {
            return Err(TransportError::PeerNotFound(to));
        }
        let member = state
            .members
            .get(&to)
            .ok_or(TransportError::PeerNotFound(to))?;
        member
            .events
            .send(TransportEvent::FrameReceived { from, frame })
            .map_err(|_| TransportError::ConnectionClosed)
    }

    fn peers_of(&self, id: NodeId) -> Vec<NodeId> {
        let state = self.state.read();
        state
            .members
            .keys()
            .copied()
            .filter(|other| *other != id && state.linked(id, *other))
            .collect()
    }
}

fn announce(state: &NetworkState, a: NodeId, b: NodeId) {
    if let (Some(ma), Some(info_b)) = (state.members.get(&a), state.info(b)) {
        let _ = ma.events.send(TransportEvent::PeerConnected(info_b));
    }
    if let (Some(mb), Some(info_a)) = (state.members.get(&b), state.info(a)) {
        let _ = mb.events.send(TransportEvent::PeerConnected(info_a));
    }
}

/// A node's handle on the [`MemoryNetwork`]. Dropping it leaves the network.
pub struct MemoryTransport {
    id: NodeId,
    network: MemoryNetwork,
}

impl Transport for MemoryTransport {
    fn local_id(&self) -> NodeId {
        self.id
    }

    fn send(&self, to: NodeId, frame: Frame) -> Result<(), TransportError> {
        self.network.deliver(self.id, to, frame)
    }

    fn connected_peers(&self) -> Vec<NodeId> {
        self.network.peers_of(self.id)
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.network.leave(self.id);
    }
}
