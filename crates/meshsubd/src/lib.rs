//! meshsubd - brokerless cluster pub/sub
//!
//! This crate provides:
//! - Replicated topic and acknowledgement label maps with per-origin versions
//! - A single-writer coordinator per node
//! - Delta push and anti-entropy gossip over any [`meshsub_net::Transport`]
//! - Publisher, subscriber and label registry handles
//! - Membership tracking with removal of departed nodes

pub mod config;
pub mod coordinator;
pub mod error;
pub mod gossip;
pub mod label_map;
pub mod membership;
pub mod node;
pub mod publisher;
pub mod pubsub;
pub mod replica;
pub mod subscriber;
pub mod topic_map;


pub use config::{Config, NodeSettings};
pub use coordinator::{SubAck, SubRequest};
pub use error::{PubSubError, Result};
pub use label_map::DeclaredAcks;
pub use node::{Node, NodeStats, PubSub};
pub use publisher::{AckExtractor, DistributedPub, HeaderAckExtractor};
pub use pubsub::{DistributedAcks, DistributedSub};
pub use subscriber::{Delivery, Inbox, SubscriberRef};
