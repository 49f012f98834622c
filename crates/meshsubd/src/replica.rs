//! Versioned per-origin replicated map
//!
//! Every entry belongs to exactly one origin node, and only that origin writes
//! it. Each local write bumps the origin's counter and stamps the entry (or its
//! tombstone) with the new version, so replicas merge by per-key version
//! comparison: a removal only wins over an entry when the origin's version
//! says so, and a stale peer can never resurrect a removed key.
//!
//! Deltas cover a half-open version range `(since, version]` of one origin. A
//! delta whose `since` is ahead of the receiver's counter would leave a gap and
//! is rejected; anti-entropy fills it later. When tombstones were compacted
//! past the receiver's counter the sender ships a full slice instead.

use meshsub_core::{NodeId, VersionVectorEntry};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// A value stamped with the origin version that wrote it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned<V> {
    pub version: u64,
    pub value: V,
}

/// Changes of one origin in the version range `(since, version]`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginDelta<K, V> {
    pub origin: NodeId,
    pub since: u64,
    pub version: u64,
    /// Replaces the receiver's slice wholesale
    pub full: bool,
    pub upserts: Vec<(K, Versioned<V>)>,
    pub removals: Vec<(K, u64)>,
}

/// Outcome of merging one delta
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// State changed
    Applied,
    /// Nothing newer than what we hold
    Stale,
    /// Delta starts past our counter for the origin
    Gap,
    /// Origin was removed from the cluster
    Quarantined,
}

#[derive(Clone, Debug)]
struct OriginSlice<K, V> {
    version: u64,
    /// Tombstones at or below this version have been compacted away
    floor: u64,
    entries: BTreeMap<K, Versioned<V>>,
    tombstones: BTreeMap<K, u64>,
}

impl<K: Ord, V> Default for OriginSlice<K, V> {
    fn default() -> Self {
        Self {
            version: 0,
            floor: 0,
            entries: BTreeMap::new(),
            tombstones: BTreeMap::new(),
        }
    }
}

impl<K, V> OriginSlice<K, V>
where
    K: Ord + Clone,
    V: Clone + PartialEq,
{
    fn newest_of(&self, key: &K) -> u64 {
        let entry = self.entries.get(key).map(|e| e.version).unwrap_or(0);
        let tomb = self.tombstones.get(key).copied().unwrap_or(0);
        entry.max(tomb)
    }

    fn apply_upsert(&mut self, key: K, value: Versioned<V>) -> bool {
        if value.version <= self.newest_of(&key) {
            return false;
        }
        self.tombstones.remove(&key);
        self.entries.insert(key, value);
        true
    }

    fn apply_removal(&mut self, key: K, version: u64) -> bool {
        if version <= self.newest_of(&key) {
            return false;
        }
        let had_entry = self.entries.remove(&key).is_some();
        self.tombstones.insert(key, version);
        had_entry
    }

    fn delta_since(&self, origin: NodeId, since: u64) -> Option<OriginDelta<K, V>> {
        if self.version <= since {
            return None;
        }
        if since < self.floor {
            return Some(OriginDelta {
                origin,
                since: 0,
                version: self.version,
                full: true,
                upserts: self
                    .entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                removals: Vec::new(),
            });
        }
        Some(OriginDelta {
            origin,
            since,
            version: self.version,
            full: false,
            upserts: self
                .entries
                .iter()
                .filter(|(_, v)| v.version > since)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            removals: self
                .tombstones
                .iter()
                .filter(|(_, v)| **v > since)
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        })
    }
}

/// A map replicated across the cluster, partitioned by origin node
#[derive(Clone, Debug)]
pub struct ReplicatedMap<K, V> {
    local: NodeId,
    origins: HashMap<NodeId, OriginSlice<K, V>>,
    /// Origins purged after leaving the cluster
    quarantined: HashSet<NodeId>,
}

impl<K, V> ReplicatedMap<K, V>
where
    K: Ord + Clone,
    V: Clone + PartialEq,
{
    pub fn new(local: NodeId) -> Self {
        Self {
            local,
            origins: HashMap::new(),
            quarantined: HashSet::new(),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local
    }

    /// Our own origin's current version
    pub fn local_version(&self) -> u64 {
        self.version_of(&self.local)
    }

    pub fn version_of(&self, origin: &NodeId) -> u64 {
        self.origins.get(origin).map(|s| s.version).unwrap_or(0)
    }

    /// Write a value under our own origin. Returns the new version, or `None`
    /// if the value was already present unchanged.
    pub fn upsert(&mut self, key: K, value: V) -> Option<u64> {
        let slice = self.origins.entry(self.local).or_default();
        if slice.entries.get(&key).map(|e| &e.value) == Some(&value) {
            return None;
        }
        slice.version += 1;
        let version = slice.version;
        slice.tombstones.remove(&key);
        slice.entries.insert(key, Versioned { version, value });
        Some(version)
    }

    /// Remove a key from our own origin. Removing an absent key is a no-op.
    pub fn remove(&mut self, key: &K) -> Option<u64> {
        let slice = self.origins.get_mut(&self.local)?;
        slice.entries.remove(key)?;
        slice.version += 1;
        let version = slice.version;
        slice.tombstones.insert(key.clone(), version);
        Some(version)
    }

    pub fn get_local(&self, key: &K) -> Option<&V> {
        self.get(&self.local, key)
    }

    pub fn get(&self, origin: &NodeId, key: &K) -> Option<&V> {
        self.origins
            .get(origin)
            .and_then(|s| s.entries.get(key))
            .map(|e| &e.value)
    }

    /// All live entries, every origin
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &K, &V)> + '_ {
        self.origins
            .iter()
            .flat_map(|(origin, slice)| slice.entries.iter().map(move |(k, v)| (*origin, k, &v.value)))
    }

    /// Live entries of one origin
    pub fn iter_origin(&self, origin: &NodeId) -> impl Iterator<Item = (&K, &V)> + '_ {
        self.origins
            .get(origin)
            .into_iter()
            .flat_map(|slice| slice.entries.iter().map(|(k, v)| (k, &v.value)))
    }

    pub fn len(&self) -> usize {
        self.origins.values().map(|s| s.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Origins holding at least one live entry
    pub fn origins(&self) -> Vec<NodeId> {
        self.origins
            .iter()
            .filter(|(_, s)| !s.entries.is_empty())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Current version vector
    pub fn version_vector(&self) -> Vec<VersionVectorEntry> {
        let mut vector: Vec<_> = self
            .origins
            .iter()
            .map(|(origin, slice)| VersionVectorEntry {
                origin: *origin,
                counter: slice.version,
            })
            .collect();
        vector.sort_by_key(|e| e.origin);
        vector
    }

    /// Delta of our own origin since `since`
    pub fn local_delta_since(&self, since: u64) -> Option<OriginDelta<K, V>> {
        self.origins
            .get(&self.local)
            .and_then(|s| s.delta_since(self.local, since))
    }

    /// Everything the holder of `peer_vector` lacks, across all origins
    pub fn deltas_for(&self, peer_vector: &[VersionVectorEntry]) -> Vec<OriginDelta<K, V>> {
        let known: HashMap<NodeId, u64> = peer_vector.iter().map(|e| (e.origin, e.counter)).collect();
        let mut deltas: Vec<_> = self
            .origins
            .iter()
            .filter_map(|(origin, slice)| {
                slice.delta_since(*origin, known.get(origin).copied().unwrap_or(0))
            })
            .collect();
        deltas.sort_by_key(|d| d.origin);
        deltas
    }

    /// True when `peer_vector` holds a version we have not seen
    pub fn is_behind(&self, peer_vector: &[VersionVectorEntry]) -> bool {
        peer_vector.iter().any(|e| {
            !self.quarantined.contains(&e.origin) && e.counter > self.version_of(&e.origin)
        })
    }

    /// Merge a remote delta. Deltas for our own origin are ignored: nobody
    /// else writes it.
    pub fn merge(&mut self, delta: OriginDelta<K, V>) -> MergeOutcome {
        if self.quarantined.contains(&delta.origin) {
            return MergeOutcome::Quarantined;
        }
        if delta.origin == self.local {
            return MergeOutcome::Stale;
        }

        let slice = self.origins.entry(delta.origin).or_default();
        if delta.version <= slice.version {
            return MergeOutcome::Stale;
        }

        if delta.full {
            let entries: BTreeMap<K, Versioned<V>> = delta.upserts.into_iter().collect();
            *slice = OriginSlice {
                version: delta.version,
                floor: delta.version,
                entries,
                tombstones: BTreeMap::new(),
            };
            return MergeOutcome::Applied;
        }

        if delta.since > slice.version {
            return MergeOutcome::Gap;
        }

        for (key, value) in delta.upserts {
            slice.apply_upsert(key, value);
        }
        for (key, version) in delta.removals {
            slice.apply_removal(key, version);
        }
        slice.version = delta.version;
        MergeOutcome::Applied
    }

    /// Drop every entry of a departed origin and refuse it from now on
    pub fn purge_origin(&mut self, origin: NodeId) -> usize {
        if origin == self.local {
            return 0;
        }
        self.quarantined.insert(origin);
        self.origins
            .remove(&origin)
            .map(|s| s.entries.len())
            .unwrap_or(0)
    }

    pub fn is_quarantined(&self, origin: &NodeId) -> bool {
        self.quarantined.contains(origin)
    }

    /// Bound our own tombstones, keeping the newest `max_tombstones`
    pub fn compact(&mut self, max_tombstones: usize) -> usize {
        let Some(slice) = self.origins.get_mut(&self.local) else {
            return 0;
        };
        let excess = slice.tombstones.len().saturating_sub(max_tombstones);
        if excess == 0 {
            return 0;
        }
        let mut by_version: Vec<(u64, K)> = slice
            .tombstones
            .iter()
            .map(|(k, v)| (*v, k.clone()))
            .collect();
        by_version.sort_by_key(|(v, _)| *v);
        for (version, key) in by_version.into_iter().take(excess) {
            slice.tombstones.remove(&key);
            slice.floor = slice.floor.max(version);
        }
        excess
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(b: u8) -> NodeId {
        NodeId([b; 32])
    }

    type Map = ReplicatedMap<String, u32>;

    fn sync(from: &Map, to: &mut Map) {
        for delta in from.deltas_for(&to.version_vector()) {
            to.merge(delta);
        }
    }

    fn values(map: &Map) -> Vec<(String, u32)> {
        let mut v: Vec<_> = map.iter().map(|(_, k, v)| (k.clone(), *v)).collect();
        v.sort();
        v
    }

    #[test]
    fn test_local_writes_bump_version() {
        let mut map = Map::new(node(1));
        assert_eq!(map.upsert("a".into(), 1), Some(1));
        assert_eq!(map.upsert("a".into(), 1), None);
        assert_eq!(map.upsert("a".into(), 2), Some(2));
        assert_eq!(map.remove(&"a".into()), Some(3));
        assert_eq!(map.remove(&"a".into()), None);
        assert_eq!(map.local_version(), 3);
    }

    #[test]
    fn test_replication_and_removal() {
        let mut a = Map::new(node(1));
        let mut b = Map::new(node(2));

        a.upsert("x".into(), 1);
        a.upsert("y".into(), 2);
        sync(&a, &mut b);
        assert_eq!(values(&b), vec![("x".into(), 1), ("y".into(), 2)]);

        a.remove(&"x".into());
        sync(&a, &mut b);
        assert_eq!(values(&b), vec![("y".into(), 2)]);
    }

    #[test]
    fn test_stale_peer_cannot_resurrect() {
        let mut a = Map::new(node(1));
        let mut b = Map::new(node(2));
        let mut c = Map::new(node(3));

        a.upsert("x".into(), 1);
        sync(&a, &mut b);
        sync(&a, &mut c);

        a.remove(&"x".into());
        sync(&a, &mut b);
        assert!(b.is_empty());

        // c still holds the old entry and gossips it to b
        sync(&c, &mut b);
        assert!(b.is_empty());
    }

    #[test]
    fn test_merge_is_idempotent_and_order_independent() {
        let mut a = Map::new(node(1));
        a.upsert("x".into(), 1);
        let first = a.local_delta_since(0).unwrap();
        a.upsert("y".into(), 2);
        a.remove(&"x".into());
        let second = a.local_delta_since(1).unwrap();

        let mut b = Map::new(node(2));
        assert_eq!(b.merge(first.clone()), MergeOutcome::Applied);
        assert_eq!(b.merge(first.clone()), MergeOutcome::Stale);
        assert_eq!(b.merge(second.clone()), MergeOutcome::Applied);
        assert_eq!(b.merge(second), MergeOutcome::Stale);
        assert_eq!(b.merge(first), MergeOutcome::Stale);
        assert_eq!(values(&b), vec![("y".into(), 2)]);
    }

    #[test]
    fn test_gapped_delta_rejected() {
        let mut a = Map::new(node(1));
        a.upsert("x".into(), 1);
        a.upsert("y".into(), 2);
        let gapped = a.local_delta_since(1).unwrap();

        let mut b = Map::new(node(2));
        assert_eq!(b.merge(gapped), MergeOutcome::Gap);
        assert_eq!(b.version_of(&node(1)), 0);

        sync(&a, &mut b);
        assert_eq!(values(&b), vec![("x".into(), 1), ("y".into(), 2)]);
    }

    #[test]
    fn test_compaction_forces_full_delta() {
        let mut a = Map::new(node(1));
        let mut b = Map::new(node(2));
        a.upsert("x".into(), 1);
        a.upsert("y".into(), 1);
        sync(&a, &mut b);

        a.remove(&"x".into());
        a.upsert("z".into(), 3);
        assert_eq!(a.compact(0), 1);

        let delta = a.deltas_for(&b.version_vector()).pop().unwrap();
        assert!(delta.full);
        b.merge(delta);
        assert_eq!(values(&b), vec![("y".into(), 1), ("z".into(), 3)]);

        // peers that are already current still get incremental deltas
        a.upsert("w".into(), 4);
        let delta = a.deltas_for(&b.version_vector()).pop().unwrap();
        assert!(!delta.full);
    }

    #[test]
    fn test_purge_quarantines_origin() {
        let mut a = Map::new(node(1));
        let mut b = Map::new(node(2));
        let mut c = Map::new(node(3));
        a.upsert("x".into(), 1);
        sync(&a, &mut b);
        sync(&a, &mut c);

        assert_eq!(b.purge_origin(node(1)), 1);
        assert!(b.is_empty());

        // c has not seen the removal yet and relays a's slice
        sync(&c, &mut b);
        assert!(b.is_empty());
        assert!(b.is_quarantined(&node(1)));
    }

    #[test]
    fn test_own_origin_never_overwritten_by_peers() {
        let mut a = Map::new(node(1));
        a.upsert("x".into(), 1);
        let forged = OriginDelta {
            origin: node(1),
            since: 0,
            version: 10,
            full: true,
            upserts: vec![],
            removals: vec![],
        };
        assert_eq!(a.merge(forged), MergeOutcome::Stale);
        assert_eq!(a.get_local(&"x".into()), Some(&1));
    }

    #[test]
    fn test_is_behind() {
        let mut a = Map::new(node(1));
        let b = Map::new(node(2));
        a.upsert("x".into(), 1);
        assert!(b.is_behind(&a.version_vector()));
        assert!(!a.is_behind(&b.version_vector()));
    }
}
