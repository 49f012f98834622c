//! Cluster membership
//!
//! Tracks peers as the transport reports them. A peer that disconnects is
//! unreachable; if it stays unreachable past the removal margin it is removed
//! for good. Removed ids never come back: a restarted node joins with a fresh
//! incarnation id.
//!
//! Removals are gossiped, so a node learns that an origin it only ever heard
//! about through a relay is gone.

use meshsub_core::NodeId;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Member status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberStatus {
    Up,
    Unreachable { since: Instant },
}

/// Member information
#[derive(Debug, Clone)]
pub struct Member {
    pub id: NodeId,
    pub name: String,
    pub status: MemberStatus,
    /// When the member was first seen
    pub joined_at: Instant,
}

/// Membership changes the node reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipEvent {
    Up(NodeId),
    Unreachable(NodeId),
    Removed(NodeId),
}

/// Membership manager
#[derive(Debug)]
pub struct MembershipManager {
    local: NodeId,
    members: HashMap<NodeId, Member>,
    /// Removed members (permanent)
    removed: HashSet<NodeId>,
    removal_margin: Duration,
}

impl MembershipManager {
    pub fn new(local: NodeId, removal_margin: Duration) -> Self {
        Self {
            local,
            members: HashMap::new(),
            removed: HashSet::new(),
            removal_margin,
        }
    }

    /// A connection to `id` is open
    pub fn peer_up(&mut self, id: NodeId, name: &str) -> Option<MembershipEvent> {
        if id == self.local || self.removed.contains(&id) {
            debug!("Ignoring connection from removed member {}", id);
            return None;
        }
        let now = Instant::now();
        let member = self.members.entry(id).or_insert_with(|| Member {
            id,
            name: name.to_string(),
            status: MemberStatus::Unreachable { since: now },
            joined_at: now,
        });
        if member.status == MemberStatus::Up {
            return None;
        }
        member.status = MemberStatus::Up;
        info!("Member {} ({}) is up", member.name, id);
        Some(MembershipEvent::Up(id))
    }

    /// The connection to `id` was lost
    pub fn peer_unreachable(&mut self, id: NodeId) -> Option<MembershipEvent> {
        let member = self.members.get_mut(&id)?;
        if member.status != MemberStatus::Up {
            return None;
        }
        member.status = MemberStatus::Unreachable {
            since: Instant::now(),
        };
        info!("Member {} ({}) is unreachable", member.name, id);
        Some(MembershipEvent::Unreachable(id))
    }

    /// Remove a member immediately
    pub fn remove(&mut self, id: NodeId) -> Option<MembershipEvent> {
        if id == self.local || !self.removed.insert(id) {
            return None;
        }
        let name = self
            .members
            .remove(&id)
            .map(|m| m.name)
            .unwrap_or_default();
        info!("Member {} ({}) removed", name, id);
        Some(MembershipEvent::Removed(id))
    }

    /// Remove members unreachable for longer than the removal margin
    pub fn expire(&mut self) -> Vec<MembershipEvent> {
        let now = Instant::now();
        let expired: Vec<NodeId> = self
            .members
            .values()
            .filter_map(|m| match m.status {
                MemberStatus::Unreachable { since }
                    if now.duration_since(since) >= self.removal_margin =>
                {
                    Some(m.id)
                }
                _ => None,
            })
            .collect();
        expired.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Apply removals reported by a peer
    pub fn merge_removed(&mut self, removed: &[NodeId]) -> Vec<MembershipEvent> {
        removed.iter().filter_map(|id| self.remove(*id)).collect()
    }

    /// Removed members, sorted
    pub fn removed(&self) -> Vec<NodeId> {
        let mut removed: Vec<NodeId> = self.removed.iter().copied().collect();
        removed.sort();
        removed
    }

    /// True if we know of removals missing from `removed`
    pub fn knows_more_removals(&self, removed: &[NodeId]) -> bool {
        self.removed.iter().any(|id| !removed.contains(id))
    }

    pub fn is_up(&self, id: &NodeId) -> bool {
        self.members
            .get(id)
            .map(|m| m.status == MemberStatus::Up)
            .unwrap_or(false)
    }

    pub fn is_removed(&self, id: &NodeId) -> bool {
        self.removed.contains(id)
    }

    /// Members currently up
    pub fn up_members(&self) -> Vec<NodeId> {
        let mut up: Vec<NodeId> = self
            .members
            .values()
            .filter(|m| m.status == MemberStatus::Up)
            .map(|m| m.id)
            .collect();
        up.sort();
        up
    }

    pub fn stats(&self) -> MembershipStats {
        MembershipStats {
            up: self
                .members
                .values()
                .filter(|m| m.status == MemberStatus::Up)
                .count(),
            unreachable: self
                .members
                .values()
                .filter(|m| matches!(m.status, MemberStatus::Unreachable { .. }))
                .count(),
            removed: self.removed.len(),
        }
    }
}

/// Membership statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MembershipStats {
    pub up: usize,
    pub unreachable: usize,
    pub removed: usize,
}
