//! Subscriber and acknowledgement label facades
//!
//! Thin wrappers that turn calls into coordinator commands. The `_with_ack`
//! variants complete once the local replica has applied the request, bounded
//! by the node's request timeout; the plain variants only enqueue.

use crate::coordinator::{self, Command, SubAck, SubRequest};
use crate::error::{PubSubError, Result};
use crate::label_map::{DeclaredAcks, LabelSet};
use crate::node::Shared;
use crate::subscriber::SubscriberRef;
use meshsub_core::{AckLabel, CategoryFilter, SubscriberId, Topic};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Subscribers live on the node that created them
fn ensure_hosted(shared: &Shared, subscriber: &SubscriberRef) -> Result<()> {
    let id = subscriber.id();
    if id.node != shared.node {
        return Err(PubSubError::ForeignSubscriber {
            subscriber: id,
            node: shared.node,
        });
    }
    Ok(())
}

fn topic_set<I, T>(topics: I) -> BTreeSet<Topic>
where
    I: IntoIterator<Item = T>,
    T: Into<Topic>,
{
    topics.into_iter().map(Into::into).collect()
}

/// Subscription handle
#[derive(Clone)]
pub struct DistributedSub {
    shared: Arc<Shared>,
}

impl DistributedSub {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.shared
            .commands
            .send(command)
            .map_err(|_| PubSubError::NodeStopped)
    }

    /// Subscribe without waiting for the local replica
    pub fn subscribe<I, T>(&self, topics: I, subscriber: &SubscriberRef, filter: Option<CategoryFilter>) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<Topic>,
    {
        ensure_hosted(&self.shared, subscriber)?;
        self.send(Command::Subscribe {
            topics: topic_set(topics),
            subscriber: subscriber.clone(),
            filter,
            reply: None,
        })
    }

    /// Subscribe to `topics`. Subscribing again replaces the filter of topics
    /// already joined.
    pub async fn subscribe_with_ack<I, T>(
        &self,
        topics: I,
        subscriber: &SubscriberRef,
        filter: Option<CategoryFilter>,
    ) -> Result<SubAck>
    where
        I: IntoIterator<Item = T>,
        T: Into<Topic>,
    {
        ensure_hosted(&self.shared, subscriber)?;
        let topics = topic_set(topics);
        coordinator::request(&self.shared.commands, self.shared.settings.request_timeout, |reply| {
            Command::Subscribe {
                topics,
                subscriber: subscriber.clone(),
                filter,
                reply: Some(reply),
            }
        })
        .await
    }

    pub fn unsubscribe<I, T>(&self, topics: I, subscriber: SubscriberId) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<Topic>,
    {
        self.send(Command::Unsubscribe {
            topics: topic_set(topics),
            subscriber,
            reply: None,
        })
    }

    /// Leave `topics`. Leaving a topic never joined is a no-op.
    pub async fn unsubscribe_with_ack<I, T>(&self, topics: I, subscriber: SubscriberId) -> Result<SubAck>
    where
        I: IntoIterator<Item = T>,
        T: Into<Topic>,
    {
        let topics = topic_set(topics);
        coordinator::request(&self.shared.commands, self.shared.settings.request_timeout, |reply| {
            Command::Unsubscribe {
                topics,
                subscriber,
                reply: Some(reply),
            }
        })
        .await
    }

    /// Drop every subscription of `subscriber`
    pub fn remove_subscriber(&self, subscriber: SubscriberId) -> Result<()> {
        self.send(Command::RemoveSubscriber(subscriber))
    }

    /// Subscribers of `topic` known to this node, regardless of filters
    pub fn get_subscribers(&self, topic: &str) -> Vec<SubscriberId> {
        self.shared.view.borrow().subscribers(topic)
    }
}

/// Acknowledgement label registry handle
#[derive(Clone)]
pub struct DistributedAcks {
    shared: Arc<Shared>,
}

impl DistributedAcks {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// False when the node runs without a label registry
    pub fn is_enabled(&self) -> bool {
        self.shared.settings.acks_enabled
    }

    /// Declare `labels` for `subscriber`, replacing its previous declaration.
    ///
    /// Fails with [`PubSubError::LabelNotUnique`] when another subscriber
    /// already holds one of the labels in this node's replica. A declaration
    /// that succeeds here can still lose to a concurrent one made elsewhere;
    /// the subscriber is then told through its inbox.
    ///
    /// # Panics
    ///
    /// Panics if a label still contains placeholders.
    pub async fn declare_acknowledgement_labels<I>(&self, labels: I, subscriber: &SubscriberRef) -> Result<SubAck>
    where
        I: IntoIterator<Item = AckLabel>,
    {
        let labels: LabelSet = labels.into_iter().collect();
        if let Some(unresolved) = labels.iter().find(|l| !l.is_fully_resolved()) {
            panic!("acknowledgement label {} has unresolved placeholders", unresolved);
        }
        ensure_hosted(&self.shared, subscriber)?;
        if labels.is_empty() || !self.is_enabled() {
            return Ok(SubAck {
                subscriber: subscriber.id(),
                request: SubRequest::Declare(labels),
                version: 0,
            });
        }
        coordinator::request(&self.shared.commands, self.shared.settings.request_timeout, |reply| {
            Command::Declare {
                labels,
                subscriber: subscriber.clone(),
                reply,
            }
        })
        .await?
    }

    /// Parse and declare labels given as strings
    pub async fn declare_labels<S: AsRef<str>>(&self, labels: &[S], subscriber: &SubscriberRef) -> Result<SubAck> {
        let parsed = labels
            .iter()
            .map(|l| AckLabel::parse(l.as_ref()))
            .collect::<meshsub_core::Result<Vec<_>>>()?;
        self.declare_acknowledgement_labels(parsed, subscriber).await
    }

    /// Withdraw the labels of `subscriber`
    pub fn remove_acknowledgement_label_declaration(&self, subscriber: SubscriberId) -> Result<()> {
        self.shared
            .commands
            .send(Command::RemoveDeclaration(subscriber))
            .map_err(|_| PubSubError::NodeStopped)
    }

    /// Snapshots of the declarations hosted on this node: one now, one per
    /// change and one per gossip round. Dropping the receiver unregisters it.
    pub fn receive_local_declared_acks(&self) -> Result<mpsc::UnboundedReceiver<Arc<DeclaredAcks>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .commands
            .send(Command::ReceiveLocalDeclaredAcks(tx))
            .map_err(|_| PubSubError::NodeStopped)?;
        Ok(rx)
    }

    /// Snapshots of every declaration this node knows: one now and one per
    /// change. Dropping the receiver unregisters it.
    pub fn receive_distributed_declared_acks(&self) -> Result<mpsc::UnboundedReceiver<Arc<DeclaredAcks>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .commands
            .send(Command::ReceiveDistributedDeclaredAcks(tx))
            .map_err(|_| PubSubError::NodeStopped)?;
        Ok(rx)
    }
}
