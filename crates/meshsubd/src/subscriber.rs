//! Subscriber handles
//!
//! A subscriber is an inbox owned by application code plus any number of
//! [`SubscriberRef`] clones the node keeps for delivery. Dropping the
//! [`Inbox`] terminates the subscriber; the node notices through
//! [`SubscriberRef::terminated`] and prunes its subscriptions and labels.

use meshsub_core::{AckLabel, Envelope, SubscriberId};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Something delivered to a subscriber
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// A published message
    Message(Arc<Envelope>),
    /// The subscriber's label declaration lost a concurrent conflict and was
    /// withdrawn
    LabelNotUnique { label: AckLabel, owner: SubscriberId },
}

/// Delivery address of a subscriber hosted on this node
#[derive(Clone, Debug)]
pub struct SubscriberRef {
    id: SubscriberId,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl SubscriberRef {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Push a delivery. Returns false once the subscriber has terminated.
    pub fn deliver(&self, delivery: Delivery) -> bool {
        self.tx.send(delivery).is_ok()
    }

    /// Resolves when the subscriber's inbox is dropped
    pub async fn terminated(&self) {
        self.tx.closed().await
    }
}

impl PartialEq for SubscriberRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SubscriberRef {}

/// Receiving side of a subscriber
#[derive(Debug)]
pub struct Inbox {
    id: SubscriberId,
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Inbox {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }

    /// Next published message, skipping label notifications
    pub async fn next_message(&mut self) -> Option<Arc<Envelope>> {
        loop {
            match self.rx.recv().await? {
                Delivery::Message(envelope) => return Some(envelope),
                Delivery::LabelNotUnique { .. } => continue,
            }
        }
    }
}

/// Create a subscriber with the given identity
pub fn channel(id: SubscriberId) -> (SubscriberRef, Inbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SubscriberRef { id, tx }, Inbox { id, rx })
}
