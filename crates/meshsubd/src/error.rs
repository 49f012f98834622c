//! Pub/sub errors

use meshsub_core::{AckLabel, NodeId, SubscriberId};
use meshsub_net::{FrameError, TransportError};
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PubSubError>;

/// Errors surfaced by the pub/sub handles
#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("Invalid acknowledgement label {label:?}: {reason}")]
    LabelInvalid { label: String, reason: String },
    #[error("Acknowledgement label {label} is already declared by {owner}")]
    LabelNotUnique { label: AckLabel, owner: SubscriberId },
    #[error("Subscriber {subscriber} is not hosted on node {node}")]
    ForeignSubscriber { subscriber: SubscriberId, node: NodeId },
    #[error("Request not completed within {0:?}")]
    Timeout(Duration),
    #[error("Node stopped")]
    NodeStopped,
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<meshsub_core::Error> for PubSubError {
    fn from(e: meshsub_core::Error) -> Self {
        match e {
            meshsub_core::Error::LabelInvalid { label, reason } => {
                Self::LabelInvalid { label, reason }
            }
            other => Self::Serialization(other.to_string()),
        }
    }
}
