//! Replicated acknowledgement label map
//!
//! Each subscriber declares a set of labels; the declaration is written by the
//! subscriber's own node and replicated like the topic map. Declaring is
//! checked against the local replica first, but two nodes can still accept
//! the same label before either sees the other's write. Once both
//! declarations are visible every node resolves them the same way: walking
//! declarations in ascending `(origin, subscriber)` order, a declaration is
//! accepted unless one of its labels is already held by an accepted one. The
//! hosting node of every rejected declaration retracts it, which never
//! changes what was accepted.

use crate::replica::{MergeOutcome, OriginDelta, ReplicatedMap};
use meshsub_core::{AckLabel, NodeId, SubscriberId, VersionVectorEntry};
use std::collections::{BTreeMap, BTreeSet};

pub type LabelSet = BTreeSet<AckLabel>;

pub type LabelDelta = OriginDelta<SubscriberId, LabelSet>;

/// A local declaration that lost a label to another subscriber
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LostLabel {
    pub subscriber: SubscriberId,
    pub label: AckLabel,
    pub owner: SubscriberId,
}

/// Snapshot of label declarations handed to declared-acks receivers
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeclaredAcks {
    declarations: BTreeMap<SubscriberId, LabelSet>,
}

impl DeclaredAcks {
    pub fn new(declarations: BTreeMap<SubscriberId, LabelSet>) -> Self {
        Self { declarations }
    }

    /// Winner of `label` among the declarations in this snapshot
    pub fn owner(&self, label: &AckLabel) -> Option<SubscriberId> {
        resolve_owners(&self.declarations).get(label).copied()
    }

    pub fn labels_of(&self, subscriber: &SubscriberId) -> Option<&LabelSet> {
        self.declarations.get(subscriber)
    }

    pub fn labels(&self) -> BTreeSet<&AckLabel> {
        self.declarations.values().flatten().collect()
    }

    pub fn is_declared(&self, label: &AckLabel) -> bool {
        self.declarations.values().any(|labels| labels.contains(label))
    }

    pub fn subscribers(&self) -> impl Iterator<Item = &SubscriberId> {
        self.declarations.keys()
    }

    pub fn len(&self) -> usize {
        self.declarations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }
}

/// Resolve every label to its owner. Declarations are accepted whole, in
/// ascending subscriber id order (hosting node first), and only when none of
/// their labels is held by a declaration accepted before them.
pub fn resolve_owners<'a, I>(declarations: I) -> BTreeMap<AckLabel, SubscriberId>
where
    I: IntoIterator<Item = (&'a SubscriberId, &'a LabelSet)>,
{
    let mut ordered: Vec<_> = declarations.into_iter().collect();
    ordered.sort_by_key(|(sub, _)| **sub);

    let mut owners: BTreeMap<AckLabel, SubscriberId> = BTreeMap::new();
    for (sub, labels) in ordered {
        if labels.iter().any(|label| owners.contains_key(label)) {
            continue;
        }
        for label in labels {
            owners.insert(label.clone(), *sub);
        }
    }
    owners
}

/// Replica of `subscriber -> declared labels` across the cluster
#[derive(Clone, Debug)]
pub struct LabelMap {
    map: ReplicatedMap<SubscriberId, LabelSet>,
}

impl LabelMap {
    pub fn new(local: NodeId) -> Self {
        Self {
            map: ReplicatedMap::new(local),
        }
    }

    /// First label of `labels` already declared by another subscriber
    pub fn conflict(&self, labels: &LabelSet, subscriber: SubscriberId) -> Option<(AckLabel, SubscriberId)> {
        labels.iter().find_map(|label| {
            self.map
                .iter()
                .filter(|(_, other, declared)| **other != subscriber && declared.contains(label))
                .map(|(_, other, _)| *other)
                .min()
                .map(|owner| (label.clone(), owner))
        })
    }

    /// Record a local declaration, replacing the subscriber's previous one.
    /// An empty set removes the declaration.
    pub fn declare(&mut self, subscriber: SubscriberId, labels: LabelSet) -> Option<u64> {
        if labels.is_empty() {
            return self.map.remove(&subscriber);
        }
        self.map.upsert(subscriber, labels)
    }

    pub fn remove_declaration(&mut self, subscriber: &SubscriberId) -> Option<u64> {
        self.map.remove(subscriber)
    }

    pub fn has_local(&self, subscriber: &SubscriberId) -> bool {
        self.map.get_local(subscriber).is_some()
    }

    pub fn labels_of(&self, subscriber: &SubscriberId) -> Option<&LabelSet> {
        self.map.get(&subscriber.node, subscriber)
    }

    /// Owner of every declared label
    pub fn owners(&self) -> BTreeMap<AckLabel, SubscriberId> {
        resolve_owners(self.map.iter().map(|(_, sub, labels)| (sub, labels)))
    }

    /// Local declarations that were not accepted, each with the first label
    /// it lost and that label's owner
    pub fn local_losers(&self) -> Vec<LostLabel> {
        let owners = self.owners();
        let local = self.map.local_id();
        self.map
            .iter_origin(&local)
            .filter_map(|(sub, labels)| {
                labels.iter().find_map(|label| match owners.get(label) {
                    Some(owner) if owner != sub => Some(LostLabel {
                        subscriber: *sub,
                        label: label.clone(),
                        owner: *owner,
                    }),
                    _ => None,
                })
            })
            .collect()
    }

    /// Declarations of subscribers hosted on this node
    pub fn local_snapshot(&self) -> DeclaredAcks {
        let local = self.map.local_id();
        DeclaredAcks::new(
            self.map
                .iter_origin(&local)
                .map(|(sub, labels)| (*sub, labels.clone()))
                .collect(),
        )
    }

    /// Declarations of the whole cluster as far as this replica knows
    pub fn snapshot(&self) -> DeclaredAcks {
        DeclaredAcks::new(
            self.map
                .iter()
                .map(|(_, sub, labels)| (*sub, labels.clone()))
                .collect(),
        )
    }

    pub fn label_count(&self) -> usize {
        self.map
            .iter()
            .flat_map(|(_, _, labels)| labels.iter())
            .collect::<BTreeSet<_>>()
            .len()
    }

    pub fn version_vector(&self) -> Vec<VersionVectorEntry> {
        self.map.version_vector()
    }

    pub fn local_delta_since(&self, since: u64) -> Option<LabelDelta> {
        self.map.local_delta_since(since)
    }

    pub fn deltas_for(&self, peer_vector: &[VersionVectorEntry]) -> Vec<LabelDelta> {
        self.map.deltas_for(peer_vector)
    }

    pub fn replica(&self) -> &ReplicatedMap<SubscriberId, LabelSet> {
        &self.map
    }

    pub fn merge(&mut self, delta: LabelDelta) -> MergeOutcome {
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

    fn node(b: u8) -> NodeId {
        NodeId([b; 32])
    }

    fn labels(names: &[&str]) -> LabelSet {
        names.iter().map(|s| AckLabel::parse(*s).unwrap()).collect()
    }

    fn sync(from: &LabelMap, to: &mut LabelMap) {
        for delta in from.deltas_for(&to.version_vector()) {
            to.merge(delta);
        }
    }

    #[test]
    fn test_local_conflict_detected() {
        let mut map = LabelMap::new(node(1));
        let first = SubscriberId::new(node(1), 1);
        let second = SubscriberId::new(node(1), 2);
        map.declare(first, labels(&["lorem", "ipsum"]));

        let (label, owner) = map.conflict(&labels(&["dolor", "ipsum"]), second).unwrap();
        assert_eq!(label.as_str(), "ipsum");
        assert_eq!(owner, first);

        // redeclaring by the same subscriber is not a conflict
        assert!(map.conflict(&labels(&["ipsum"]), first).is_none());
    }

    #[test]
    fn test_removed_declaration_frees_labels() {
        let mut map = LabelMap::new(node(1));
        let first = SubscriberId::new(node(1), 1);
        let second = SubscriberId::new(node(1), 2);
        map.declare(first, labels(&["lorem"]));
        map.remove_declaration(&first);
        assert!(map.conflict(&labels(&["lorem"]), second).is_none());
        assert!(map.remove_declaration(&first).is_none());
    }

    #[test]
    fn test_concurrent_declarations_resolve_identically() {
        let mut a = LabelMap::new(node(1));
        let mut b = LabelMap::new(node(2));
        let sa = SubscriberId::new(node(1), 7);
        let sb = SubscriberId::new(node(2), 1);

        a.declare(sa, labels(&["shared", "only-a"]));
        b.declare(sb, labels(&["shared"]));
        sync(&a, &mut b);
        sync(&b, &mut a);

        assert_eq!(a.owners(), b.owners());
        assert_eq!(a.owners()[&AckLabel::parse("shared").unwrap()], sa);

        assert!(a.local_losers().is_empty());
        let lost = b.local_losers();
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].subscriber, sb);
        assert_eq!(lost[0].owner, sa);
    }

    #[test]
    fn test_rejected_declaration_does_not_block_others() {
        let w = SubscriberId::new(node(1), 1);
        let x = SubscriberId::new(node(2), 1);
        let y = SubscriberId::new(node(3), 1);
        let mut maps = vec![LabelMap::new(node(1)), LabelMap::new(node(2)), LabelMap::new(node(3))];
        maps[0].declare(w, labels(&["aaa"]));
        maps[1].declare(x, labels(&["aaa", "bbb"]));
        maps[2].declare(y, labels(&["bbb"]));

        let sync_all = |maps: &mut Vec<LabelMap>| {
            for i in 0..maps.len() {
                for j in 0..maps.len() {
                    if i != j {
                        let from = maps[i].clone();
                        sync(&from, &mut maps[j]);
                    }
                }
            }
        };
        sync_all(&mut maps);

        assert!(maps[0].local_losers().is_empty());
        assert!(maps[2].local_losers().is_empty());
        let lost = maps[1].local_losers();
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].subscriber, x);
        assert_eq!(lost[0].owner, w);

        for map in maps.iter_mut() {
            for lost in map.local_losers() {
                map.remove_declaration(&lost.subscriber);
            }
        }
        sync_all(&mut maps);

        let aaa = AckLabel::parse("aaa").unwrap();
        let bbb = AckLabel::parse("bbb").unwrap();
        for map in &maps {
            assert_eq!(map.owners().get(&aaa), Some(&w));
            assert_eq!(map.owners().get(&bbb), Some(&y));
            assert!(map.local_losers().is_empty());
        }
        assert_eq!(maps[1].snapshot().owner(&bbb), Some(y));
    }

    #[test]
    fn test_snapshots() {
        let mut a = LabelMap::new(node(1));
        let mut b = LabelMap::new(node(2));
        let sa = SubscriberId::new(node(1), 1);
        let sb = SubscriberId::new(node(2), 1);
        a.declare(sa, labels(&["lorem"]));
        b.declare(sb, labels(&["ipsum"]));
        sync(&b, &mut a);

        let local = a.local_snapshot();
        assert_eq!(local.len(), 1);
        assert!(local.labels_of(&sa).is_some());

        let all = a.snapshot();
        assert_eq!(all.len(), 2);
        assert_eq!(all.owner(&AckLabel::parse("ipsum").unwrap()), Some(sb));
        assert_eq!(a.label_count(), 2);
    }

    #[test]
    fn test_empty_declaration_removes() {
        let mut map = LabelMap::new(node(1));
        let sub = SubscriberId::new(node(1), 1);
        assert!(map.declare(sub, LabelSet::new()).is_none());
        map.declare(sub, labels(&["lorem"]));
        assert!(map.declare(sub, LabelSet::new()).is_some());
        assert!(!map.has_local(&sub));
    }
}
