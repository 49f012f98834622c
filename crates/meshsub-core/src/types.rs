//! Core value types for meshsub
//!
//! Everything here is replicated or transported, so every type derives serde
//! and encodes deterministically via postcard. Ordered collections
//! (`BTreeMap`/`BTreeSet`) are used wherever iteration order reaches the wire.

use crate::label::AckLabel;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// 32-byte fixed-size array used for identifiers.
pub type Bytes32 = [u8; 32];

/// Topics are opaque; nothing inspects their structure.
pub type Topic = String;

/// Header carrying the comma-separated acknowledgement labels a publisher
/// requests for a message.
pub const REQUESTED_ACKS_HEADER: &str = "requested-acks";

// =============================================================================
// IDENTITY TYPES (newtypes for type safety)
// =============================================================================

/// Cluster node identifier: BLAKE3("node" || name || incarnation)
///
/// Ordering is lexicographic over the bytes and is the primary key of the
/// label ownership tie-break, so every node must compare ids identically.
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub Bytes32);

impl NodeId {
    /// Get as bytes
    pub fn as_bytes(&self) -> &Bytes32 {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

/// Subscriber handle identity: hosting node plus a node-local sequence number.
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId {
    pub node: NodeId,
    pub local: u64,
}

impl SubscriberId {
    pub fn new(node: NodeId, local: u64) -> Self {
        Self { node, local }
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/sub-{}", self.node, self.local)
    }
}

impl fmt::Debug for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriberId({})", self)
    }
}

/// Publisher identity, used as the sender of envelopes and as the ordering key
/// for per-publisher FIFO delivery.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublisherId {
    pub node: NodeId,
    pub local: u64,
}

impl fmt::Display for PublisherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/pub-{}", self.node, self.local)
    }
}

// =============================================================================
// SUBSCRIPTION FILTER
// =============================================================================

/// Restricts a subscription to messages of the listed categories.
///
/// A filtered subscription never matches an uncategorized message.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CategoryFilter(pub BTreeSet<String>);

impl CategoryFilter {
    pub fn new<I, S>(categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(categories.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, category: Option<&str>) -> bool {
        category.map(|c| self.0.contains(c)).unwrap_or(false)
    }
}

/// True when `filter` admits a message of `category`. No filter admits all.
pub fn filter_admits(filter: Option<&CategoryFilter>, category: Option<&str>) -> bool {
    filter.map(|f| f.matches(category)).unwrap_or(true)
}

// =============================================================================
// MESSAGES
// =============================================================================

/// A topic-addressed message. The payload is opaque.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    pub topic: Topic,
    pub category: Option<String>,
    pub sender: PublisherId,
    pub headers: BTreeMap<String, String>,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(topic: impl Into<Topic>, sender: PublisherId) -> Self {
        Self {
            topic: topic.into(),
            category: None,
            sender,
            headers: BTreeMap::new(),
            payload: Vec::new(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Request acknowledgements by label (stored in [`REQUESTED_ACKS_HEADER`]).
    pub fn with_requested_acks<'a, I>(self, labels: I) -> Self
    where
        I: IntoIterator<Item = &'a AckLabel>,
    {
        let joined = labels
            .into_iter()
            .map(AckLabel::as_str)
            .collect::<Vec<_>>()
            .join(",");
        self.with_header(REQUESTED_ACKS_HEADER, joined)
    }

    pub fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }
}

// =============================================================================
// ACKNOWLEDGEMENTS
// =============================================================================

/// A single acknowledgement for one label.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Acknowledgement {
    pub label: AckLabel,
    pub entity_id: String,
    /// Synthesized by the publisher on behalf of a declared subscriber that was
    /// not addressed by the message.
    pub weak: bool,
    /// The declaring subscriber this acknowledgement speaks for.
    pub on_behalf_of: Option<SubscriberId>,
}

impl Acknowledgement {
    pub fn weak(label: AckLabel, entity_id: impl Into<String>, owner: SubscriberId) -> Self {
        Self {
            label,
            entity_id: entity_id.into(),
            weak: true,
            on_behalf_of: Some(owner),
        }
    }

    pub fn is_weak(&self) -> bool {
        self.weak
    }
}

/// Aggregated acknowledgements for one published message.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Acknowledgements {
    pub entity_id: String,
    acks: BTreeMap<AckLabel, Acknowledgement>,
}

impl Acknowledgements {
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            acks: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, ack: Acknowledgement) {
        self.acks.insert(ack.label.clone(), ack);
    }

    pub fn get(&self, label: &AckLabel) -> Option<&Acknowledgement> {
        self.acks.get(label)
    }

    pub fn len(&self) -> usize {
        self.acks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Acknowledgement> {
        self.acks.values()
    }
}

// =============================================================================
// REPLICATION
// =============================================================================

/// Version vector entry: highest version of `origin` known to the holder.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionVectorEntry {
    pub origin: NodeId,
    pub counter: u64,
}
