//! Publisher facade
//!
//! Publishing never goes through the node's event loop: the publisher reads
//! the latest [`RoutingView`] snapshot, hands local recipients the message
//! directly and sends one [`DeliverMessage`] frame per remote hosting node.
//! Both paths are FIFO, so messages of one publisher reach each subscriber in
//! publish order.

use crate::coordinator::Registry;
use crate::error::Result;
use crate::label_map::LabelMap;
use crate::node::Shared;
use crate::subscriber::Delivery;
use crate::topic_map::TopicMap;
use meshsub_core::{
    filter_admits, AckLabel, Acknowledgement, Acknowledgements, CategoryFilter, Envelope, NodeId,
    PublisherId, SubscriberId, Topic, REQUESTED_ACKS_HEADER,
};
use meshsub_net::{Frame, FrameType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Read-only routing snapshot published by the coordinator after each change
#[derive(Debug, Default)]
pub struct RoutingView {
    topics: HashMap<Topic, Vec<(SubscriberId, Option<CategoryFilter>)>>,
    owners: BTreeMap<AckLabel, SubscriberId>,
}

impl RoutingView {
    pub fn new(topics: &TopicMap, labels: &LabelMap) -> Self {
        Self {
            topics: topics.index(),
            owners: labels.owners(),
        }
    }

    /// Subscribers of `topic` whose filter admits `category`
    pub fn recipients(&self, topic: &str, category: Option<&str>) -> Vec<SubscriberId> {
        self.topics
            .get(topic)
            .map(|subs| {
                subs.iter()
                    .filter(|(_, filter)| filter_admits(filter.as_ref(), category))
                    .map(|(sub, _)| *sub)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All subscribers of `topic`, regardless of filter
    pub fn subscribers(&self, topic: &str) -> Vec<SubscriberId> {
        self.topics
            .get(topic)
            .map(|subs| subs.iter().map(|(sub, _)| *sub).collect())
            .unwrap_or_default()
    }

    pub fn owner(&self, label: &AckLabel) -> Option<SubscriberId> {
        self.owners.get(label).copied()
    }
}

/// A published message addressed to subscribers hosted on the receiving node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverMessage {
    pub recipients: Vec<SubscriberId>,
    pub envelope: Envelope,
}

impl DeliverMessage {
    pub fn to_frame(&self) -> std::result::Result<Frame, meshsub_net::FrameError> {
        Frame::encode(FrameType::Deliver, self)
    }
}

/// Hand a message to local subscribers. Returns how many were reached.
pub fn deliver_local(registry: &Registry, recipients: &[SubscriberId], envelope: Arc<Envelope>) -> usize {
    let registry = registry.read();
    recipients
        .iter()
        .filter_map(|id| registry.get(id))
        .filter(|sub| sub.deliver(Delivery::Message(envelope.clone())))
        .count()
}

/// Determines which acknowledgements a message requests
pub trait AckExtractor: Send + Sync {
    fn requested_acks(&self, envelope: &Envelope) -> Vec<AckLabel>;

    /// Entity the acknowledgements are about
    fn entity_id(&self, envelope: &Envelope) -> String {
        envelope.topic.clone()
    }
}

/// Reads the comma-separated `requested-acks` header. Unparseable labels are
/// skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderAckExtractor;

/// Header naming the entity a message is about
pub const ENTITY_ID_HEADER: &str = "entity-id";

impl AckExtractor for HeaderAckExtractor {
    fn requested_acks(&self, envelope: &Envelope) -> Vec<AckLabel> {
        let Some(header) = envelope.headers.get(REQUESTED_ACKS_HEADER) else {
            return Vec::new();
        };
        header
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter_map(|s| match AckLabel::parse(s) {
                Ok(label) => Some(label),
                Err(e) => {
                    debug!("Skipping requested ack: {}", e);
                    None
                }
            })
            .collect()
    }

    fn entity_id(&self, envelope: &Envelope) -> String {
        envelope
            .headers
            .get(ENTITY_ID_HEADER)
            .cloned()
            .unwrap_or_else(|| envelope.topic.clone())
    }
}

impl<F> AckExtractor for F
where
    F: Fn(&Envelope) -> Vec<AckLabel> + Send + Sync,
{
    fn requested_acks(&self, envelope: &Envelope) -> Vec<AckLabel> {
        self(envelope)
    }
}

/// Publishing handle with its own publisher identity
#[derive(Clone)]
pub struct DistributedPub {
    id: PublisherId,
    shared: Arc<Shared>,
}

impl DistributedPub {
    pub(crate) fn new(id: PublisherId, shared: Arc<Shared>) -> Self {
        Self { id, shared }
    }

    pub fn id(&self) -> PublisherId {
        self.id
    }

    /// An empty message on `topic` sent by this publisher
    pub fn envelope(&self, topic: impl Into<Topic>) -> Envelope {
        Envelope::new(topic, self.id)
    }

    /// Deliver to every subscriber of the envelope's topic whose filter admits
    /// its category. Returns the addressed subscribers.
    pub fn publish(&self, envelope: Envelope) -> Result<Vec<SubscriberId>> {
        let recipients = self
            .shared
            .view
            .borrow()
            .recipients(&envelope.topic, envelope.category());
        if recipients.is_empty() {
            return Ok(recipients);
        }

        let local = self.shared.node;
        let mut by_node: BTreeMap<NodeId, Vec<SubscriberId>> = BTreeMap::new();
        for sub in &recipients {
            by_node.entry(sub.node).or_default().push(*sub);
        }

        let envelope = Arc::new(envelope);
        for (node, subs) in by_node {
            if node == local {
                deliver_local(&self.shared.registry, &subs, envelope.clone());
                continue;
            }
            let frame = DeliverMessage {
                recipients: subs,
                envelope: (*envelope).clone(),
            }
            .to_frame()?;
            if let Err(e) = self.shared.transport.send(node, frame) {
                warn!("Dropping message on {} for {}: {}", envelope.topic, node, e);
            }
        }
        Ok(recipients)
    }

    /// Publish, then synthesize weak acknowledgements for every requested
    /// label whose owner was not among the recipients. Labels nobody declared
    /// produce nothing. The future is ready once the message was handed to
    /// local inboxes and remote links.
    pub async fn publish_with_acks(
        &self,
        envelope: Envelope,
        extractor: &dyn AckExtractor,
    ) -> Result<Acknowledgements> {
        let requested = extractor.requested_acks(&envelope);
        let entity_id = extractor.entity_id(&envelope);
        let recipients = self.publish(envelope)?;

        let view = self.shared.view.borrow().clone();
        let mut acks = Acknowledgements::new(entity_id.clone());
        for label in requested {
            match view.owner(&label) {
                Some(owner) if !recipients.contains(&owner) => {
                    acks.insert(Acknowledgement::weak(label, entity_id.clone(), owner));
                }
                _ => {}
            }
        }
        Ok(acks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn node(b: u8) -> NodeId {
        NodeId([b; 32])
    }

    fn sender() -> PublisherId {
        PublisherId { node: node(1), local: 1 }
    }

    #[test]
    fn test_view_filters_by_category() {
        let mut topics = TopicMap::new(node(1));
        let plain = SubscriberId::new(node(1), 1);
        let filtered = SubscriberId::new(node(1), 2);
        let t: BTreeSet<Topic> = ["t".to_string()].into();
        topics.subscribe(plain, &t, None);
        topics.subscribe(filtered, &t, Some(&CategoryFilter::new(["things"])));

        let view = RoutingView::new(&topics, &LabelMap::new(node(1)));
        assert_eq!(view.recipients("t", Some("things")), vec![plain, filtered]);
        assert_eq!(view.recipients("t", Some("policies")), vec![plain]);
        assert_eq!(view.recipients("t", None), vec![plain]);
        assert_eq!(view.subscribers("t"), vec![plain, filtered]);
        assert!(view.recipients("other", None).is_empty());
    }

    #[test]
    fn test_header_extractor() {
        let lorem = AckLabel::parse("lorem").unwrap();
        let ipsum = AckLabel::parse("ipsum").unwrap();
        let envelope = Envelope::new("t", sender())
            .with_requested_acks([&lorem, &ipsum])
            .with_header(ENTITY_ID_HEADER, "thing:1");

        assert_eq!(HeaderAckExtractor.requested_acks(&envelope), vec![lorem, ipsum]);
        assert_eq!(HeaderAckExtractor.entity_id(&envelope), "thing:1");
    }

    #[test]
    fn test_header_extractor_skips_invalid() {
        let envelope = Envelope::new("t", sender()).with_header(REQUESTED_ACKS_HEADER, "lorem, x,,a b c");
        let acks = HeaderAckExtractor.requested_acks(&envelope);
        assert_eq!(acks, vec![AckLabel::parse("lorem").unwrap()]);
        assert_eq!(HeaderAckExtractor.entity_id(&envelope), "t");
    }

    #[test]
    fn test_closure_extractor() {
        let extractor = |_: &Envelope| vec![AckLabel::parse("lorem").unwrap()];
        let envelope = Envelope::new("t", sender());
        assert_eq!(extractor.requested_acks(&envelope).len(), 1);
        assert_eq!(extractor.entity_id(&envelope), "t");
    }

    #[test]
    fn test_deliver_message_frame() {
        let msg = DeliverMessage {
            recipients: vec![SubscriberId::new(node(2), 1)],
            envelope: Envelope::new("t", sender()).with_payload(b"hi".to_vec()),
        };
        let frame = msg.to_frame().unwrap();
        assert_eq!(frame.frame_type, FrameType::Deliver);
        assert_eq!(frame.decode::<DeliverMessage>().unwrap(), msg);
    }
}
