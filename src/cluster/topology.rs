//! Immutable value types describing a cluster.
//!
//! A [`ClusterTopology`] is rebuilt wholesale on every membership or shard
//! change and published as an `Arc` snapshot. Nothing in here is mutated in
//! place once published; [`NodeInfo`] transitions return new values.
//!
//! # Leader Rule
//!
//! The leader is the node with the smallest registration `timestamp`, ties
//! broken by the smallest node id. It is recomputed from the node set every
//! time a topology is built, so a departing leader is replaced without any
//! other node re-registering.

use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroU32;

use serde::{Deserialize, Serialize};

use super::error::{ClusterError, ClusterResult};

/// Small integer identifying a cluster member (see the node-id allocator).
pub type NodeId = u16;

/// Shard number in `[0, max_shards)`.
pub type ShardId = u32;

const WORD_BITS: u32 = 64;

/// Compact ordered set of shard numbers bounded by `max_shards`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ShardSet {
    max_shards: u32,
    words: Vec<u64>,
}

impl ShardSet {
    /// Create an empty set for shards `[0, max_shards)`.
    pub fn new(max_shards: u32) -> Self {
        let words = max_shards.div_ceil(WORD_BITS) as usize;
        Self {
            max_shards,
            words: vec![0; words],
        }
    }

    /// Create a set containing every shard in `[0, max_shards)`.
    pub fn full(max_shards: u32) -> Self {
        let mut set = Self::new(max_shards);
        for word in set.words.iter_mut() {
            *word = u64::MAX;
        }
        set.mask_tail();
        set
    }

    /// Build a set from shard numbers, rejecting any outside `[0, max_shards)`.
    pub fn from_shards<I>(max_shards: u32, shards: I) -> ClusterResult<Self>
    where
        I: IntoIterator<Item = ShardId>,
    {
        let mut set = Self::new(max_shards);
        for shard in shards {
            set.insert(shard)?;
        }
        Ok(set)
    }

    /// Upper bound (exclusive) of shard numbers this set can hold.
    #[inline]
    pub fn max_shards(&self) -> u32 {
        self.max_shards
    }

    /// Membership test. Out-of-range shards are never members.
    #[inline]
    pub fn contains(&self, shard: ShardId) -> bool {
        if shard >= self.max_shards {
            return false;
        }
        let (word, bit) = Self::position(shard);
        self.words[word] & (1u64 << bit) != 0
    }

    /// Add a shard. Returns whether it was newly inserted.
    pub fn insert(&mut self, shard: ShardId) -> ClusterResult<bool> {
        if shard >= self.max_shards {
            return Err(ClusterError::InvalidShard {
                shard,
                max_shards: self.max_shards,
            });
        }
        let (word, bit) = Self::position(shard);
        let mask = 1u64 << bit;
        let inserted = self.words[word] & mask == 0;
        self.words[word] |= mask;
        Ok(inserted)
    }

    /// Remove a shard. Returns whether it was present.
    pub fn remove(&mut self, shard: ShardId) -> bool {
        if shard >= self.max_shards {
            return false;
        }
        let (word, bit) = Self::position(shard);
        let mask = 1u64 << bit;
        let present = self.words[word] & mask != 0;
        self.words[word] &= !mask;
        present
    }

    /// Number of shards in the set.
    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Iterate shard numbers in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = ShardId> + '_ {
        self.words
            .iter()
            .enumerate()
            .flat_map(|(index, &word)| BitIter { word }.map(move |bit| index as u32 * WORD_BITS + bit))
    }

    /// Shards in `self` or `other` (bounded by `self.max_shards`).
    pub fn union(&self, other: &ShardSet) -> ShardSet {
        self.combine(other, |a, b| a | b)
    }

    /// Shards in `self` but not in `other`.
    pub fn difference(&self, other: &ShardSet) -> ShardSet {
        self.combine(other, |a, b| a & !b)
    }

    /// Shards in both sets.
    pub fn intersection(&self, other: &ShardSet) -> ShardSet {
        self.combine(other, |a, b| a & b)
    }

    pub fn is_disjoint(&self, other: &ShardSet) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .all(|(a, b)| a & b == 0)
    }

    pub fn to_vec(&self) -> Vec<ShardId> {
        self.iter().collect()
    }

    fn combine(&self, other: &ShardSet, op: impl Fn(u64, u64) -> u64) -> ShardSet {
        let mut out = self.clone();
        for (index, word) in out.words.iter_mut().enumerate() {
            let rhs = other.words.get(index).copied().unwrap_or(0);
            *word = op(*word, rhs);
        }
        out.mask_tail();
        out
    }

    fn mask_tail(&mut self) {
        let tail = self.max_shards % WORD_BITS;
        if tail == 0 {
            return;
        }
        if let Some(last) = self.words.last_mut() {
            *last &= (1u64 << tail) - 1;
        }
    }

    #[inline]
    fn position(shard: ShardId) -> (usize, u32) {
        ((shard / WORD_BITS) as usize, shard % WORD_BITS)
    }
}

struct BitIter {
    word: u64,
}

impl Iterator for BitIter {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.word == 0 {
            return None;
        }
        let bit = self.word.trailing_zeros();
        self.word &= self.word - 1;
        Some(bit)
    }
}

impl fmt::Debug for ShardSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for ShardSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, shard) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", shard)?;
        }
        write!(f, "}}")
    }
}

/// Per-node registration data.
///
/// Invariant: `shards` and `shards_stopping` are disjoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    timestamp: i64,
    shards: ShardSet,
    shards_stopping: ShardSet,
    attributes: BTreeMap<String, String>,
}

/// Stored representation of a [`NodeInfo`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodeRecord {
    timestamp: i64,
    #[serde(default)]
    shards: Vec<ShardId>,
    #[serde(default)]
    stopping: Vec<ShardId>,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
}

impl NodeInfo {
    /// A freshly registering node: no shards, no attributes.
    pub fn new(timestamp: i64, max_shards: u32) -> Self {
        Self {
            timestamp,
            shards: ShardSet::new(max_shards),
            shards_stopping: ShardSet::new(max_shards),
            attributes: BTreeMap::new(),
        }
    }

    /// Build from parts, checking the disjointness invariant.
    pub fn from_parts(
        timestamp: i64,
        shards: ShardSet,
        shards_stopping: ShardSet,
        attributes: BTreeMap<String, String>,
    ) -> ClusterResult<Self> {
        if !shards.is_disjoint(&shards_stopping) {
            return Err(ClusterError::Config(format!(
                "shards {} overlap stopping shards {}",
                shards, shards_stopping
            )));
        }
        Ok(Self {
            timestamp,
            shards,
            shards_stopping,
            attributes,
        })
    }

    #[inline]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Shards owned and actively served.
    #[inline]
    pub fn shards(&self) -> &ShardSet {
        &self.shards
    }

    /// Shards being relinquished but not yet confirmed stopped.
    #[inline]
    pub fn shards_stopping(&self) -> &ShardSet {
        &self.shards_stopping
    }

    #[inline]
    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Merge attributes into the existing map (existing keys are overwritten,
    /// absent keys are kept).
    pub fn with_attributes<I, K, V>(&self, attributes: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut next = self.clone();
        for (key, value) in attributes {
            next.attributes.insert(key.into(), value.into());
        }
        next
    }

    /// Start serving `shards`. They leave `shards_stopping` if present there.
    pub fn with_started(&self, shards: &ShardSet) -> Self {
        let mut next = self.clone();
        next.shards = next.shards.union(shards);
        next.shards_stopping = next.shards_stopping.difference(shards);
        next
    }

    /// Stop routing `shards` here: they move from `shards` to `shards_stopping`.
    ///
    /// Only shards currently owned move; others are ignored.
    pub fn with_stopping(&self, shards: &ShardSet) -> Self {
        let mut next = self.clone();
        let moving = self.shards.intersection(shards);
        next.shards = next.shards.difference(&moving);
        next.shards_stopping = next.shards_stopping.union(&moving);
        next
    }

    /// Clear acknowledged shards from `shards_stopping`.
    pub fn with_stop_acknowledged(&self, shards: &ShardSet) -> Self {
        let mut next = self.clone();
        next.shards_stopping = next.shards_stopping.difference(shards);
        next
    }

    /// Encode for storage in the node's registration entry.
    pub fn to_bytes(&self) -> ClusterResult<Vec<u8>> {
        let record = NodeRecord {
            timestamp: self.timestamp,
            shards: self.shards.to_vec(),
            stopping: self.shards_stopping.to_vec(),
            attributes: self.attributes.clone(),
        };
        Ok(serde_json::to_vec(&record)?)
    }

    /// Decode a registration entry for a cluster with `max_shards` shards.
    pub fn from_bytes(bytes: &[u8], max_shards: u32) -> ClusterResult<Self> {
        let record: NodeRecord = serde_json::from_slice(bytes)?;
        Self::from_parts(
            record.timestamp,
            ShardSet::from_shards(max_shards, record.shards)?,
            ShardSet::from_shards(max_shards, record.stopping)?,
            record.attributes,
        )
    }
}

/// Maps an entity id to its shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardResolver {
    max_shards: NonZeroU32,
}

impl ShardResolver {
    pub fn new(max_shards: NonZeroU32) -> Self {
        Self { max_shards }
    }

    /// Create a resolver, rejecting zero shards.
    pub fn with_max_shards(max_shards: u32) -> ClusterResult<Self> {
        NonZeroU32::new(max_shards)
            .map(Self::new)
            .ok_or_else(|| ClusterError::Config("max_shards must be positive".to_string()))
    }

    #[inline]
    pub fn max_shards(&self) -> u32 {
        self.max_shards.get()
    }

    /// Shard owning entity `id` (`id mod max_shards`, never negative).
    #[inline]
    pub fn shard(&self, id: i64) -> ShardId {
        id.rem_euclid(i64::from(self.max_shards.get())) as ShardId
    }
}

/// Serialized cluster metadata stored at the cluster's root path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMetadata {
    pub max_shards: u32,
}

impl ClusterMetadata {
    pub fn to_bytes(&self) -> ClusterResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> ClusterResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Immutable snapshot of a cluster's members, shard ownership and leader.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterTopology {
    version: u64,
    nodes: BTreeMap<NodeId, NodeInfo>,
    leader: Option<NodeId>,
    resolver: Option<ShardResolver>,
}

impl ClusterTopology {
    /// Build a topology and elect its leader.
    pub fn new(nodes: BTreeMap<NodeId, NodeInfo>, resolver: Option<ShardResolver>) -> Self {
        let leader = elect_leader(&nodes);
        Self {
            version: 0,
            nodes,
            leader,
            resolver,
        }
    }

    /// Topology of a cluster with no known members.
    pub fn empty(resolver: Option<ShardResolver>) -> Self {
        Self::new(BTreeMap::new(), resolver)
    }

    /// Stamp the publisher's version counter.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Copy with one node added or replaced.
    pub fn with_node(&self, node_id: NodeId, info: NodeInfo) -> Self {
        let mut nodes = self.nodes.clone();
        nodes.insert(node_id, info);
        Self::new(nodes, self.resolver).with_version(self.version)
    }

    /// Copy with one node removed.
    pub fn without_node(&self, node_id: NodeId) -> Self {
        let mut nodes = self.nodes.clone();
        nodes.remove(&node_id);
        Self::new(nodes, self.resolver).with_version(self.version)
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[inline]
    pub fn nodes(&self) -> &BTreeMap<NodeId, NodeInfo> {
        &self.nodes
    }

    pub fn node(&self, node_id: NodeId) -> Option<&NodeInfo> {
        self.nodes.get(&node_id)
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.nodes.contains_key(&node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Leader id, `None` iff the node set is empty.
    #[inline]
    pub fn leader_node_id(&self) -> Option<NodeId> {
        self.leader
    }

    pub fn is_leader(&self, node_id: NodeId) -> bool {
        self.leader == Some(node_id)
    }

    #[inline]
    pub fn shard_resolver(&self) -> Option<&ShardResolver> {
        self.resolver.as_ref()
    }

    pub fn max_shards(&self) -> Option<u32> {
        self.resolver.map(|r| r.max_shards())
    }

    /// Shard for entity `id`, if the cluster's shard count is known.
    pub fn shard_for(&self, id: i64) -> Option<ShardId> {
        self.resolver.map(|r| r.shard(id))
    }

    /// Node currently routing-active for `shard`.
    ///
    /// During a handoff window only the new owner has the shard in `shards`,
    /// so this always points at the new owner.
    pub fn owner_of(&self, shard: ShardId) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|(_, info)| info.shards().contains(shard))
            .map(|(id, _)| *id)
    }

    /// Shards that no node currently serves.
    pub fn unassigned_shards(&self) -> Option<ShardSet> {
        let max_shards = self.max_shards()?;
        let assigned = self
            .nodes
            .values()
            .fold(ShardSet::new(max_shards), |acc, info| acc.union(info.shards()));
        Some(ShardSet::full(max_shards).difference(&assigned))
    }

    /// Shards that appear in more than one node's active set.
    pub fn overlapping_shards(&self) -> Option<ShardSet> {
        let max_shards = self.max_shards()?;
        let mut seen = ShardSet::new(max_shards);
        let mut overlap = ShardSet::new(max_shards);
        for info in self.nodes.values() {
            overlap = overlap.union(&seen.intersection(info.shards()));
            seen = seen.union(info.shards());
        }
        Some(overlap)
    }
}

/// Elect the leader: smallest timestamp, then smallest id.
pub fn elect_leader(nodes: &BTreeMap<NodeId, NodeInfo>) -> Option<NodeId> {
    nodes
        .iter()
        .min_by_key(|(id, info)| (info.timestamp(), **id))
        .map(|(id, _)| *id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn set(max: u32, shards: &[ShardId]) -> ShardSet {
        ShardSet::from_shards(max, shards.iter().copied()).unwrap()
    }

    fn node(ts: i64, shards: &[ShardId]) -> NodeInfo {
        NodeInfo::new(ts, 4).with_started(&set(4, shards))
    }

    // ========================================================================
    // ShardSet
    // ========================================================================

    #[test]
    fn test_shard_set_basic_ops() {
        let mut s = ShardSet::new(130);
        assert!(s.is_empty());
        assert!(s.insert(0).unwrap());
        assert!(s.insert(64).unwrap());
        assert!(s.insert(129).unwrap());
        assert!(!s.insert(64).unwrap());
        assert_eq!(s.len(), 3);
        assert!(s.contains(129));
        assert!(!s.contains(1));
        assert_eq!(s.to_vec(), vec![0, 64, 129]);
        assert!(s.remove(64));
        assert!(!s.remove(64));
        assert_eq!(s.to_vec(), vec![0, 129]);
    }

    #[test]
    fn test_shard_set_rejects_out_of_range() {
        let mut s = ShardSet::new(4);
        let err = s.insert(4).unwrap_err();
        assert!(matches!(
            err,
            ClusterError::InvalidShard {
                shard: 4,
                max_shards: 4
            }
        ));
        assert!(!s.contains(4));
        assert!(ShardSet::from_shards(4, [1, 7]).is_err());
    }

    #[test]
    fn test_shard_set_full_masks_tail() {
        let s = ShardSet::full(70);
        assert_eq!(s.len(), 70);
        assert!(s.contains(69));
        assert!(!s.contains(70));
        assert_eq!(ShardSet::full(64).len(), 64);
        assert!(ShardSet::full(0).is_empty());
    }

    #[test]
    fn test_shard_set_algebra() {
        let a = set(8, &[0, 1, 2, 3]);
        let b = set(8, &[2, 3, 4]);
        assert_eq!(a.union(&b).to_vec(), vec![0, 1, 2, 3, 4]);
        assert_eq!(a.difference(&b).to_vec(), vec![0, 1]);
        assert_eq!(a.intersection(&b).to_vec(), vec![2, 3]);
        assert!(!a.is_disjoint(&b));
        assert!(set(8, &[0]).is_disjoint(&set(8, &[1])));
    }

    #[test]
    fn test_shard_set_display() {
        assert_eq!(set(8, &[1, 5]).to_string(), "{1,5}");
        assert_eq!(format!("{:?}", set(8, &[2])), "{2}");
    }

    // ========================================================================
    // NodeInfo
    // ========================================================================

    #[test]
    fn test_node_info_handoff_transitions() {
        let a = node(100, &[0, 1, 2, 3]);
        let stopping = a.with_stopping(&set(4, &[2, 3]));
        assert_eq!(stopping.shards().to_vec(), vec![0, 1]);
        assert_eq!(stopping.shards_stopping().to_vec(), vec![2, 3]);
        assert!(stopping.shards().is_disjoint(stopping.shards_stopping()));

        let acked = stopping.with_stop_acknowledged(&set(4, &[2]));
        assert_eq!(acked.shards_stopping().to_vec(), vec![3]);

        // duplicate ack is a no-op
        assert_eq!(acked.with_stop_acknowledged(&set(4, &[2])), acked);
    }

    #[test]
    fn test_node_info_stopping_ignores_unowned() {
        let a = node(1, &[0]);
        let next = a.with_stopping(&set(4, &[0, 3]));
        assert_eq!(next.shards_stopping().to_vec(), vec![0]);
    }

    #[test]
    fn test_node_info_from_parts_rejects_overlap() {
        let result = NodeInfo::from_parts(1, set(4, &[1]), set(4, &[1]), BTreeMap::new());
        assert!(result.is_err());
    }

    #[test]
    fn test_node_info_attributes_merge() {
        let a = NodeInfo::new(1, 4).with_attributes([("zone", "a"), ("host", "h1")]);
        let b = a.with_attributes([("zone", "b")]);
        assert_eq!(b.attribute("zone"), Some("b"));
        assert_eq!(b.attribute("host"), Some("h1"));
    }

    #[test]
    fn test_node_info_bytes() {
        let info = node(42, &[1, 3])
            .with_stopping(&set(4, &[3]))
            .with_attributes([("k", "v")]);
        let bytes = info.to_bytes().unwrap();
        let decoded = NodeInfo::from_bytes(&bytes, 4).unwrap();
        assert_eq!(decoded, info);
        assert!(NodeInfo::from_bytes(&bytes, 2).is_err());
        assert!(NodeInfo::from_bytes(b"not json", 4).is_err());
    }

    // ========================================================================
    // ShardResolver
    // ========================================================================

    #[test]
    fn test_shard_resolver() {
        let r = ShardResolver::with_max_shards(4).unwrap();
        assert_eq!(r.shard(0), 0);
        assert_eq!(r.shard(9), 1);
        assert_eq!(r.shard(-1), 3);
        assert_eq!(r, ShardResolver::with_max_shards(4).unwrap());
        assert_ne!(r, ShardResolver::with_max_shards(8).unwrap());
        assert!(ShardResolver::with_max_shards(0).is_err());
    }

    // ========================================================================
    // ClusterTopology
    // ========================================================================

    #[test]
    fn test_empty_topology_has_no_leader() {
        let t = ClusterTopology::empty(None);
        assert_eq!(t.leader_node_id(), None);
        assert!(t.is_empty());
        assert_eq!(t.shard_for(7), None);
    }

    #[test]
    fn test_leader_handoff_without_reregistration() {
        let resolver = ShardResolver::with_max_shards(4).ok();
        let t = ClusterTopology::empty(resolver)
            .with_node(1, node(100, &[]))
            .with_node(2, node(200, &[]));
        assert_eq!(t.leader_node_id(), Some(1));

        let t = t.without_node(1);
        assert_eq!(t.leader_node_id(), Some(2));
        assert!(t.is_leader(2));
    }

    #[test]
    fn test_leader_tie_broken_by_id() {
        let t = ClusterTopology::empty(None)
            .with_node(9, node(100, &[]))
            .with_node(8, node(100, &[]));
        assert_eq!(t.leader_node_id(), Some(8));
    }

    #[test]
    fn test_owner_lookup_and_invariants() {
        let resolver = ShardResolver::with_max_shards(4).ok();
        let t = ClusterTopology::empty(resolver)
            .with_node(1, node(1, &[0, 1]).with_stopping(&set(4, &[1])))
            .with_node(2, node(2, &[1, 2]));
        assert_eq!(t.owner_of(0), Some(1));
        assert_eq!(t.owner_of(1), Some(2));
        assert_eq!(t.owner_of(3), None);
        assert_eq!(t.unassigned_shards().unwrap().to_vec(), vec![3]);
        assert!(t.overlapping_shards().unwrap().is_empty());
        assert_eq!(t.shard_for(6), Some(2));
    }

    #[test]
    fn test_cluster_metadata_bytes() {
        let meta = ClusterMetadata { max_shards: 16 };
        let decoded = ClusterMetadata::from_bytes(&meta.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, meta);
    }

    proptest! {
        #[test]
        fn prop_leader_is_oldest_live_node(
            events in proptest::collection::vec((any::<bool>(), 0u16..16, 0i64..8), 1..64)
        ) {
            let mut topology = ClusterTopology::empty(None);
            for (add, id, ts) in events {
                topology = if add {
                    topology.with_node(id, NodeInfo::new(ts, 4))
                } else {
                    topology.without_node(id)
                };

                let expected = topology
                    .nodes()
                    .iter()
                    .map(|(id, info)| (info.timestamp(), *id))
                    .min()
                    .map(|(_, id)| id);
                prop_assert_eq!(topology.leader_node_id(), expected);
                prop_assert_eq!(topology.leader_node_id().is_none(), topology.is_empty());
                let leaders = topology.nodes().keys().filter(|id| topology.is_leader(**id)).count();
                prop_assert_eq!(leaders, usize::from(!topology.is_empty()));
            }
        }

        #[test]
        fn prop_shard_set_matches_btreeset(
            shards in proptest::collection::vec(0u32..200, 0..100)
        ) {
            let set = ShardSet::from_shards(200, shards.iter().copied()).unwrap();
            let reference: std::collections::BTreeSet<u32> = shards.into_iter().collect();
            prop_assert_eq!(set.len(), reference.len());
            prop_assert_eq!(set.to_vec(), reference.into_iter().collect::<Vec<_>>());
        }
    }
}
