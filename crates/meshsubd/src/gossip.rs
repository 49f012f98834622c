//! Gossip protocol
//!
//! Two mechanisms keep replicas converging:
//! - push: every round, our own origin's changes since the last round go to
//!   every reachable peer as a [`GossipDelta`]
//! - anti-entropy: every round one random peer gets our version vectors as a
//!   [`GossipStatus`] and answers with whatever we lack. A peer that finds
//!   itself behind sends its own status back so the exchange runs both ways.
//!   The status also lists removed members, which is how removals reach nodes
//!   that never had a direct link to the removed one.

use crate::label_map::{LabelDelta, LabelMap};
use crate::topic_map::{TopicDelta, TopicMap};
use meshsub_core::{NodeId, VersionVectorEntry};
use meshsub_net::{Frame, FrameError, FrameType};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Version vectors of both replicated maps and the removed members
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipStatus {
    pub topics: Vec<VersionVectorEntry>,
    pub labels: Vec<VersionVectorEntry>,
    pub removed: Vec<NodeId>,
}

/// Replica changes, per origin
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipDelta {
    pub topics: Vec<TopicDelta>,
    pub labels: Vec<LabelDelta>,
}

impl GossipStatus {
    pub fn of(topics: &TopicMap, labels: &LabelMap, removed: Vec<NodeId>) -> Self {
        Self {
            topics: topics.version_vector(),
            labels: labels.version_vector(),
            removed,
        }
    }

    pub fn to_frame(&self) -> Result<Frame, FrameError> {
        Frame::encode(FrameType::GossipStatus, self)
    }
}

impl GossipDelta {
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty() && self.labels.is_empty()
    }

    pub fn to_frame(&self) -> Result<Frame, FrameError> {
        Frame::encode(FrameType::GossipDelta, self)
    }
}

/// Anti-entropy state for a peer
#[derive(Debug, Default)]
pub struct PeerGossipState {
    /// Number of status exchanges
    pub exchanges: u64,
    /// Consecutive send failures
    pub failures: u32,
}

/// Gossip manager
#[derive(Debug, Default)]
pub struct GossipManager {
    peers: HashMap<NodeId, PeerGossipState>,
    /// Local versions already pushed to every peer
    pushed_topics: u64,
    pushed_labels: u64,
    rounds: u64,
}

impl GossipManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer for gossip
    pub fn register_peer(&mut self, peer_id: NodeId) {
        self.peers.entry(peer_id).or_default();
    }

    /// Remove a peer from gossip
    pub fn unregister_peer(&mut self, peer_id: &NodeId) {
        self.peers.remove(peer_id);
    }

    pub fn peers(&self) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = self.peers.keys().copied().collect();
        peers.sort();
        peers
    }

    /// Start a round: our own changes since the previous round, if any
    pub fn next_push(&mut self, topics: &TopicMap, labels: &LabelMap) -> Option<GossipDelta> {
        self.rounds += 1;
        let delta = GossipDelta {
            topics: topics.local_delta_since(self.pushed_topics).into_iter().collect(),
            labels: labels.local_delta_since(self.pushed_labels).into_iter().collect(),
        };
        self.pushed_topics = topics.replica().local_version();
        self.pushed_labels = labels.replica().local_version();
        (!delta.is_empty()).then_some(delta)
    }

    /// Peer to run anti-entropy with this round
    pub fn choose_peer<R: Rng>(&self, rng: &mut R) -> Option<NodeId> {
        self.peers().choose(rng).copied()
    }

    /// Answer a peer's status. Returns what the peer lacks and whether the
    /// peer holds versions we have not seen.
    pub fn answer_status(
        &mut self,
        from: NodeId,
        status: &GossipStatus,
        topics: &TopicMap,
        labels: &LabelMap,
    ) -> (GossipDelta, bool) {
        if let Some(state) = self.peers.get_mut(&from) {
            state.exchanges += 1;
            state.failures = 0;
        }
        let delta = GossipDelta {
            topics: topics.deltas_for(&status.topics),
            labels: labels.deltas_for(&status.labels),
        };
        let behind =
            topics.replica().is_behind(&status.topics) || labels.replica().is_behind(&status.labels);
        (delta, behind)
    }

    /// Mark a send to the peer as failed
    pub fn mark_failure(&mut self, peer_id: &NodeId) {
        if let Some(state) = self.peers.get_mut(peer_id) {
            state.failures += 1;
        }
    }

    pub fn stats(&self) -> GossipStats {
        GossipStats {
            peer_count: self.peers.len(),
            rounds: self.rounds,
            exchanges: self.peers.values().map(|s| s.exchanges).sum(),
            failing_peers: self.peers.values().filter(|s| s.failures > 0).count(),
        }
    }
}

/// Gossip statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GossipStats {
    pub peer_count: usize,
    pub rounds: u64,
    pub exchanges: u64,
    /// Peers whose last send failed
    pub failing_peers: usize,
}
