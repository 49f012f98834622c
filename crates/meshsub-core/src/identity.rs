//! Identity derivations for meshsub
//!
//! All derivations use BLAKE3 with domain separation prefixes.

use crate::types::*;
use blake3::Hasher;

/// Domain prefix for NodeId derivation
pub const DOMAIN_NODE: &[u8] = b"meshsub-node-v1";

/// Derive a NodeId from a node name and an incarnation number.
///
/// `NodeId = BLAKE3("meshsub-node-v1" || len(name) || name || incarnation)`
///
/// A restarted node picks a fresh incarnation, so it never inherits the
/// replicated state (or the removal quarantine) of its previous life.
pub fn derive_node_id(name: &str, incarnation: u64) -> NodeId {
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_NODE);
    hasher.update(&(name.len() as u64).to_le_bytes());
    hasher.update(name.as_bytes());
    hasher.update(&incarnation.to_le_bytes());
    NodeId(*hasher.finalize().as_bytes())
}

/// Derive a NodeId with a random incarnation.
pub fn fresh_node_id(name: &str) -> NodeId {
    derive_node_id(name, rand::random())
}
