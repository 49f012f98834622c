//! Replicated topic map
//!
//! One replicated entry per subscriber: the topics it joined and the category
//! filter of each. Subscribers only ever live on their own node, so a
//! subscriber's entry is always written by the origin that hosts it.

use crate::replica::{MergeOutcome, OriginDelta, ReplicatedMap};
use meshsub_core::{CategoryFilter, NodeId, SubscriberId, Topic, VersionVectorEntry};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Topics of one subscriber, each with an optional filter
pub type SubscriberTopics = BTreeMap<Topic, Option<CategoryFilter>>;

pub type TopicDelta = OriginDelta<SubscriberId, SubscriberTopics>;

/// Replica of `subscriber -> topics` across the cluster
#[derive(Clone, Debug)]
pub struct TopicMap {
    map: ReplicatedMap<SubscriberId, SubscriberTopics>,
}

impl TopicMap {
    pub fn new(local: NodeId) -> Self {
        Self {
            map: ReplicatedMap::new(local),
        }
    }

    /// Add topics for a local subscriber, replacing the filter of topics it
    /// already joined. Returns the new local version if anything changed.
    pub fn subscribe(
        &mut self,
        subscriber: SubscriberId,
        topics: &BTreeSet<Topic>,
        filter: Option<&CategoryFilter>,
    ) -> Option<u64> {
        let mut entry = self.map.get_local(&subscriber).cloned().unwrap_or_default();
        for topic in topics {
            entry.insert(topic.clone(), filter.cloned());
        }
        if entry.is_empty() {
            return None;
        }
        self.map.upsert(subscriber, entry)
    }

    /// Drop topics for a local subscriber. A subscriber left with no topics is
    /// removed entirely.
    pub fn unsubscribe(&mut self, subscriber: SubscriberId, topics: &BTreeSet<Topic>) -> Option<u64> {
        let mut entry = self.map.get_local(&subscriber)?.clone();
        let before = entry.len();
        entry.retain(|topic, _| !topics.contains(topic));
        if entry.len() == before {
            return None;
        }
        if entry.is_empty() {
            self.map.remove(&subscriber)
        } else {
            self.map.upsert(subscriber, entry)
        }
    }

    pub fn remove_subscriber(&mut self, subscriber: &SubscriberId) -> Option<u64> {
        self.map.remove(subscriber)
    }

    pub fn has_local(&self, subscriber: &SubscriberId) -> bool {
        self.map.get_local(subscriber).is_some()
    }

    /// Topic index used by the publisher snapshot
    pub fn index(&self) -> HashMap<Topic, Vec<(SubscriberId, Option<CategoryFilter>)>> {
        let mut index: HashMap<Topic, Vec<(SubscriberId, Option<CategoryFilter>)>> = HashMap::new();
        for (_, sub, topics) in self.map.iter() {
            for (topic, filter) in topics {
                index.entry(topic.clone()).or_default().push((*sub, filter.clone()));
            }
        }
        for subscribers in index.values_mut() {
            subscribers.sort_by_key(|(sub, _)| *sub);
        }
        index
    }

    pub fn topic_count(&self) -> usize {
        self.map
            .iter()
            .flat_map(|(_, _, topics)| topics.keys())
            .collect::<BTreeSet<_>>()
            .len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.map.len()
    }

    pub fn replica(&self) -> &ReplicatedMap<SubscriberId, SubscriberTopics> {
        &self.map
    }

    pub fn version_vector(&self) -> Vec<VersionVectorEntry> {
        self.map.version_vector()
    }

    pub fn local_delta_since(&self, since: u64) -> Option<TopicDelta> {
        self.map.local_delta_since(since)
    }

    pub fn deltas_for(&self, peer_vector: &[VersionVectorEntry]) -> Vec<TopicDelta> {
        self.map.deltas_for(peer_vector)
    }

    pub fn merge(&mut self, delta: TopicDelta) -> MergeOutcome {
        self.map.merge(delta)
    }

    pub fn purge_origin(&mut self, origin: NodeId) -> usize {
        self.map.purge_origin(origin)
    }

    pub fn compact(&mut self, max_tombstones: usize) -> usize {
        self.map.compact(max_tombstones)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label_map::LabelMap;
    use crate::publisher::RoutingView;

    fn node(b: u8) -> NodeId {
        NodeId([b; 32])
    }

    fn topics(names: &[&str]) -> BTreeSet<Topic> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn recipients(map: &TopicMap, topic: &str, category: Option<&str>) -> Vec<SubscriberId> {
        RoutingView::new(map, &LabelMap::new(map.replica().local_id())).recipients(topic, category)
    }

    #[test]
    fn test_subscribe_and_resolve() {
        let mut map = TopicMap::new(node(1));
        let sub = SubscriberId::new(node(1), 1);
        assert!(map.subscribe(sub, &topics(&["hello", "world"]), None).is_some());

        assert_eq!(recipients(&map, "hello", None), vec![sub]);
        assert_eq!(recipients(&map, "world", Some("any")), vec![sub]);
        assert!(recipients(&map, "other", None).is_empty());
        assert_eq!(map.topic_count(), 2);
    }

    #[test]
    fn test_resubscribe_replaces_filter() {
        let mut map = TopicMap::new(node(1));
        let sub = SubscriberId::new(node(1), 1);
        let things = CategoryFilter::new(["things"]);
        let policies = CategoryFilter::new(["policies"]);

        map.subscribe(sub, &topics(&["t"]), Some(&things));
        assert_eq!(recipients(&map, "t", Some("things")), vec![sub]);

        map.subscribe(sub, &topics(&["t"]), Some(&policies));
        assert!(recipients(&map, "t", Some("things")).is_empty());
        assert_eq!(recipients(&map, "t", Some("policies")), vec![sub]);

        // same subscription again is not a change
        assert!(map.subscribe(sub, &topics(&["t"]), Some(&policies)).is_none());
    }

    #[test]
    fn test_filtered_subscription_skips_uncategorized() {
        let mut map = TopicMap::new(node(1));
        let sub = SubscriberId::new(node(1), 1);
        map.subscribe(sub, &topics(&["t"]), Some(&CategoryFilter::new(["things"])));
        assert!(recipients(&map, "t", None).is_empty());
    }

    #[test]
    fn test_unsubscribe_prunes_empty_subscriber() {
        let mut map = TopicMap::new(node(1));
        let sub = SubscriberId::new(node(1), 1);
        map.subscribe(sub, &topics(&["a", "b"]), None);

        assert!(map.unsubscribe(sub, &topics(&["never-joined"])).is_none());
        assert!(map.unsubscribe(sub, &topics(&["a"])).is_some());
        assert!(map.has_local(&sub));
        assert!(map.unsubscribe(sub, &topics(&["b"])).is_some());
        assert!(!map.has_local(&sub));
        assert_eq!(map.subscriber_count(), 0);
    }

    #[test]
    fn test_remove_subscriber_idempotent() {
        let mut map = TopicMap::new(node(1));
        let sub = SubscriberId::new(node(1), 1);
        map.subscribe(sub, &topics(&["a"]), None);
        assert!(map.remove_subscriber(&sub).is_some());
        assert!(map.remove_subscriber(&sub).is_none());
    }

    #[test]
    fn test_index_merges_origins() {
        let mut a = TopicMap::new(node(1));
        let mut b = TopicMap::new(node(2));
        let sa = SubscriberId::new(node(1), 1);
        let sb = SubscriberId::new(node(2), 1);
        a.subscribe(sa, &topics(&["t"]), None);
        b.subscribe(sb, &topics(&["t"]), None);

        for delta in b.deltas_for(&a.version_vector()) {
            a.merge(delta);
        }
        let index = a.index();
        let subs: Vec<_> = index["t"].iter().map(|(s, _)| *s).collect();
        assert_eq!(subs, vec![sa, sb]);
    }
}
