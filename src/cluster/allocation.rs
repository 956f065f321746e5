//! Shard allocation strategies.
//!
//! A strategy is a pure function from the current per-node shard state to a
//! [`RebalancePlan`]. The leader's registry runs it on every topology change
//! and applies non-empty plans in one transaction.
//!
//! # Handoff
//!
//! Moving a shard is two-phase. The plan lists it in `to_stop` for the old
//! owner and `to_start` for the new one. Once applied, the old owner holds it
//! in `shards_stopping` until it acknowledges the stop. A shard is never
//! started on a node that still has it in `shards_stopping`.

use std::collections::BTreeMap;
use std::fmt;

use tracing::debug;

use super::topology::{NodeId, NodeInfo, ShardId, ShardSet};
use crate::constants::DEPARTING_ATTRIBUTE;

/// Shard moves needed to restore the target distribution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalancePlan {
    to_stop: BTreeMap<NodeId, ShardSet>,
    to_start: BTreeMap<NodeId, ShardSet>,
}

impl RebalancePlan {
    /// A plan that changes nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.to_stop.values().all(ShardSet::is_empty) && self.to_start.values().all(ShardSet::is_empty)
    }

    /// Shards each node must stop serving.
    pub fn to_stop(&self) -> &BTreeMap<NodeId, ShardSet> {
        &self.to_stop
    }

    /// Shards each node must start serving.
    pub fn to_start(&self) -> &BTreeMap<NodeId, ShardSet> {
        &self.to_start
    }

    /// Add `shard` to the stop set of `node_id`.
    pub fn stop(&mut self, node_id: NodeId, shard: ShardId, max_shards: u32) {
        let set = self
            .to_stop
            .entry(node_id)
            .or_insert_with(|| ShardSet::new(max_shards));
        // Callers only pass shards taken from a ShardSet of the same bound.
        let _ = set.insert(shard);
    }

    /// Add `shard` to the start set of `node_id`.
    pub fn start(&mut self, node_id: NodeId, shard: ShardId, max_shards: u32) {
        let set = self
            .to_start
            .entry(node_id)
            .or_insert_with(|| ShardSet::new(max_shards));
        let _ = set.insert(shard);
    }

    /// Node ids touched by this plan, ascending.
    pub fn affected_nodes(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .to_stop
            .iter()
            .chain(self.to_start.iter())
            .filter(|(_, set)| !set.is_empty())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Number of shard starts in the plan.
    pub fn started_count(&self) -> usize {
        self.to_start.values().map(ShardSet::len).sum()
    }

    /// Number of shard stops in the plan.
    pub fn stopped_count(&self) -> usize {
        self.to_stop.values().map(ShardSet::len).sum()
    }

    /// Node info for `node_id` after this plan is applied.
    ///
    /// Stopped shards leave `shards` and join `shards_stopping`; started
    /// shards join `shards`.
    pub fn apply_to(&self, node_id: NodeId, info: &NodeInfo) -> NodeInfo {
        let mut next = info.clone();
        if let Some(stop) = self.to_stop.get(&node_id) {
            next = next.with_stopping(stop);
        }
        if let Some(start) = self.to_start.get(&node_id) {
            next = next.with_started(start);
        }
        next
    }

    /// Apply the plan to every affected node in `nodes`.
    ///
    /// Returns only the nodes that changed.
    pub fn apply(&self, nodes: &BTreeMap<NodeId, NodeInfo>) -> BTreeMap<NodeId, NodeInfo> {
        self.affected_nodes()
            .into_iter()
            .filter_map(|id| nodes.get(&id).map(|info| (id, self.apply_to(id, info))))
            .collect()
    }
}

impl fmt::Display for RebalancePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stop[")?;
        for (i, (id, set)) in self.to_stop.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:04x}:{}", id, set)?;
        }
        write!(f, "] start[")?;
        for (i, (id, set)) in self.to_start.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:04x}:{}", id, set)?;
        }
        write!(f, "]")
    }
}

/// Computes shard moves from the current cluster state.
///
/// Implementations must be deterministic and cheap when no change is needed:
/// the leader calls them on every topology mutation.
pub trait ShardAllocationStrategy: Send + Sync + fmt::Debug {
    /// Plan the moves for `nodes` in a cluster of `max_shards` shards.
    ///
    /// Implementations must never place a shard in `to_start` for a node whose
    /// `shards_stopping` already contains it.
    fn rebalance(&self, nodes: &BTreeMap<NodeId, NodeInfo>, max_shards: u32) -> RebalancePlan;
}

/// Splits shards evenly across live, non-departing nodes.
///
/// Each eligible node gets `max_shards / n` shards; the remainder goes to the
/// nodes currently holding the most shards (ties by smallest id) so that a
/// balanced cluster is never churned. Over-target nodes give up their
/// highest-numbered shards. Unowned and released shards go to under-target
/// nodes in ascending id order.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvenShardAllocationStrategy;

impl EvenShardAllocationStrategy {
    pub fn new() -> Self {
        Self
    }

    fn is_departing(info: &NodeInfo) -> bool {
        info.attribute(DEPARTING_ATTRIBUTE)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    /// Target shard count per eligible node.
    fn targets(
        eligible: &[NodeId],
        owned: &BTreeMap<NodeId, ShardSet>,
        max_shards: u32,
    ) -> BTreeMap<NodeId, usize> {
        let n = eligible.len();
        let base = max_shards as usize / n;
        let extra = max_shards as usize % n;

        let mut ranked: Vec<NodeId> = eligible.to_vec();
        ranked.sort_by_key(|id| {
            let held = owned.get(id).map(ShardSet::len).unwrap_or(0);
            (std::cmp::Reverse(held), *id)
        });

        ranked
            .into_iter()
            .enumerate()
            .map(|(rank, id)| (id, if rank < extra { base + 1 } else { base }))
            .collect()
    }
}

impl ShardAllocationStrategy for EvenShardAllocationStrategy {
    fn rebalance(&self, nodes: &BTreeMap<NodeId, NodeInfo>, max_shards: u32) -> RebalancePlan {
        let eligible: Vec<NodeId> = nodes
            .iter()
            .filter(|(_, info)| !Self::is_departing(info))
            .map(|(id, _)| *id)
            .collect();

        if eligible.is_empty() || max_shards == 0 {
            return RebalancePlan::empty();
        }

        let mut plan = RebalancePlan::empty();

        // Resolve duplicate ownership: the smallest id keeps the shard.
        let mut claimed = ShardSet::new(max_shards);
        let mut owned: BTreeMap<NodeId, ShardSet> = BTreeMap::new();
        for (id, info) in nodes {
            let duplicates = info.shards().intersection(&claimed);
            for shard in duplicates.iter() {
                plan.stop(*id, shard, max_shards);
            }
            let kept = info.shards().difference(&duplicates);
            claimed = claimed.union(&kept);
            owned.insert(*id, kept);
        }

        let targets = Self::targets(&eligible, &owned, max_shards);
        let unassigned = ShardSet::full(max_shards).difference(&claimed);

        // Fast path: balanced, nothing unowned, nothing duplicated.
        if plan.is_empty()
            && unassigned.is_empty()
            && owned.iter().all(|(id, set)| {
                targets.get(id).copied().unwrap_or(0) == set.len()
            })
        {
            return plan;
        }

        // Release shards from departing and over-target nodes.
        let mut pool = unassigned;
        for (id, set) in &owned {
            let target = targets.get(id).copied().unwrap_or(0);
            let surplus = set.len().saturating_sub(target);
            if surplus == 0 {
                continue;
            }
            let mut held = set.to_vec();
            for shard in held.split_off(held.len() - surplus) {
                plan.stop(*id, shard, max_shards);
                let _ = pool.insert(shard);
            }
        }

        // Fill under-target nodes.
        let mut deficits: Vec<(NodeId, usize)> = eligible
            .iter()
            .map(|id| {
                let held = owned.get(id).map(ShardSet::len).unwrap_or(0);
                let target = targets.get(id).copied().unwrap_or(0);
                (*id, target.saturating_sub(held))
            })
            .filter(|(_, deficit)| *deficit > 0)
            .collect();

        for shard in pool.iter() {
            let slot = deficits.iter_mut().find(|(id, deficit)| {
                *deficit > 0
                    && !nodes
                        .get(id)
                        .map(|info| info.shards_stopping().contains(shard) || info.shards().contains(shard))
                        .unwrap_or(false)
            });
            match slot {
                Some((id, deficit)) => {
                    plan.start(*id, shard, max_shards);
                    *deficit -= 1;
                }
                None => {
                    debug!(shard, "No eligible node for shard, waiting for stop acknowledgment");
                }
            }
        }

        debug!(
            nodes = nodes.len(),
            eligible = eligible.len(),
            stops = plan.stopped_count(),
            starts = plan.started_count(),
            "Computed rebalance plan"
        );

        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn set(max: u32, shards: &[ShardId]) -> ShardSet {
        ShardSet::from_shards(max, shards.iter().copied()).unwrap()
    }

    fn node(max: u32, ts: i64, shards: &[ShardId]) -> NodeInfo {
        NodeInfo::new(ts, max).with_started(&set(max, shards))
    }

    fn apply_and_ack(nodes: &BTreeMap<NodeId, NodeInfo>, plan: &RebalancePlan) -> BTreeMap<NodeId, NodeInfo> {
        let mut next = nodes.clone();
        next.extend(plan.apply(nodes));
        next.into_iter()
            .map(|(id, info)| {
                let stopping = info.shards_stopping().clone();
                (id, info.with_stop_acknowledged(&stopping))
            })
            .collect()
    }

    fn assert_partitioned(nodes: &BTreeMap<NodeId, NodeInfo>, max: u32) {
        for shard in 0..max {
            let owners = nodes.values().filter(|n| n.shards().contains(shard)).count();
            assert_eq!(owners, 1, "shard {} has {} owners", shard, owners);
        }
    }

    // ========================================================================
    // Plan mechanics
    // ========================================================================

    #[test]
    fn test_empty_plan() {
        let plan = RebalancePlan::empty();
        assert!(plan.is_empty());
        assert!(plan.affected_nodes().is_empty());
        assert_eq!(plan.to_string(), "stop[] start[]");
    }

    #[test]
    fn test_plan_apply_moves_to_stopping() {
        let mut nodes = BTreeMap::new();
        nodes.insert(1, node(4, 100, &[0, 1, 2, 3]));
        nodes.insert(2, node(4, 200, &[]));

        let mut plan = RebalancePlan::empty();
        plan.stop(1, 2, 4);
        plan.stop(1, 3, 4);
        plan.start(2, 2, 4);
        plan.start(2, 3, 4);

        let applied = plan.apply(&nodes);
        assert_eq!(applied[&1].shards().to_vec(), vec![0, 1]);
        assert_eq!(applied[&1].shards_stopping().to_vec(), vec![2, 3]);
        assert_eq!(applied[&2].shards().to_vec(), vec![2, 3]);
        assert_eq!(plan.affected_nodes(), vec![1, 2]);
    }

    // ========================================================================
    // Even strategy
    // ========================================================================

    #[test]
    fn test_single_node_takes_everything() {
        let mut nodes = BTreeMap::new();
        nodes.insert(8, NodeInfo::new(100, 4));

        let plan = EvenShardAllocationStrategy.rebalance(&nodes, 4);
        assert!(plan.to_stop().is_empty());
        assert_eq!(plan.to_start()[&8].to_vec(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_second_node_receives_upper_half() {
        let mut nodes = BTreeMap::new();
        nodes.insert(8, node(4, 100, &[0, 1, 2, 3]));
        nodes.insert(9, NodeInfo::new(200, 4));

        let plan = EvenShardAllocationStrategy.rebalance(&nodes, 4);
        assert_eq!(plan.to_stop()[&8].to_vec(), vec![2, 3]);
        assert_eq!(plan.to_start()[&9].to_vec(), vec![2, 3]);
        assert!(!plan.to_start().contains_key(&8));
    }

    #[test]
    fn test_balanced_cluster_yields_empty_plan() {
        let mut nodes = BTreeMap::new();
        nodes.insert(1, node(5, 1, &[0, 1, 2]));
        nodes.insert(2, node(5, 2, &[3, 4]));

        assert!(EvenShardAllocationStrategy.rebalance(&nodes, 5).is_empty());
    }

    #[test]
    fn test_remainder_stays_with_current_holder() {
        let mut nodes = BTreeMap::new();
        nodes.insert(1, node(5, 1, &[0, 1]));
        nodes.insert(2, node(5, 2, &[2, 3, 4]));

        assert!(EvenShardAllocationStrategy.rebalance(&nodes, 5).is_empty());
    }

    #[test]
    fn test_no_nodes_yields_empty_plan() {
        assert!(EvenShardAllocationStrategy.rebalance(&BTreeMap::new(), 4).is_empty());
    }

    #[test]
    fn test_shard_in_stopping_waits_for_ack() {
        // Node 2 still drains shard 3 while it is unowned; node 2 is the only
        // under-target node, so shard 3 must stay unassigned this cycle.
        let mut nodes = BTreeMap::new();
        nodes.insert(1, node(4, 1, &[0, 1]));
        nodes.insert(
            2,
            node(4, 2, &[2, 3]).with_stopping(&set(4, &[3])),
        );

        let plan = EvenShardAllocationStrategy.rebalance(&nodes, 4);
        assert!(plan.is_empty());

        let acked: BTreeMap<_, _> = nodes
            .into_iter()
            .map(|(id, info)| (id, info.with_stop_acknowledged(&set(4, &[3]))))
            .collect();
        let plan = EvenShardAllocationStrategy.rebalance(&acked, 4);
        assert_eq!(plan.to_start()[&2].to_vec(), vec![3]);
    }

    #[test]
    fn test_duplicate_owner_is_stopped() {
        let mut nodes = BTreeMap::new();
        nodes.insert(1, node(4, 1, &[0, 1]));
        nodes.insert(2, node(4, 2, &[1, 2, 3]));

        let plan = EvenShardAllocationStrategy.rebalance(&nodes, 4);
        assert_eq!(plan.to_stop()[&2].to_vec(), vec![1]);
        assert!(plan.to_start().values().all(|s| !s.contains(1)));
    }

    #[test]
    fn test_departing_node_is_drained() {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            1,
            node(4, 1, &[0, 1]).with_attributes([(DEPARTING_ATTRIBUTE, "true")]),
        );
        nodes.insert(2, node(4, 2, &[2, 3]));

        let plan = EvenShardAllocationStrategy.rebalance(&nodes, 4);
        assert_eq!(plan.to_stop()[&1].to_vec(), vec![0, 1]);
        assert_eq!(plan.to_start()[&2].to_vec(), vec![0, 1]);
    }

    #[test]
    fn test_all_departing_leaves_shards_in_place() {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            1,
            node(4, 1, &[0, 1, 2, 3]).with_attributes([(DEPARTING_ATTRIBUTE, "true")]),
        );
        assert!(EvenShardAllocationStrategy.rebalance(&nodes, 4).is_empty());
    }

    #[test]
    fn test_converges_after_node_leaves() {
        let mut nodes = BTreeMap::new();
        nodes.insert(1, node(6, 1, &[0, 1]));
        nodes.insert(3, node(6, 3, &[4, 5]));

        let plan = EvenShardAllocationStrategy.rebalance(&nodes, 6);
        let nodes = apply_and_ack(&nodes, &plan);
        assert_partitioned(&nodes, 6);
        assert!(EvenShardAllocationStrategy.rebalance(&nodes, 6).is_empty());
    }

    fn arb_nodes() -> impl Strategy<Value = (u32, BTreeMap<NodeId, NodeInfo>)> {
        (1u32..40).prop_flat_map(|max| {
            let info = (
                0i64..5,
                proptest::collection::vec(0..max, 0..12),
                proptest::collection::vec(0..max, 0..4),
                any::<bool>(),
            )
                .prop_map(move |(ts, shards, stopping, departing)| {
                    let shards = ShardSet::from_shards(max, shards).unwrap();
                    let stopping = ShardSet::from_shards(max, stopping).unwrap().difference(&shards);
                    let mut attributes = BTreeMap::new();
                    if departing {
                        attributes.insert(DEPARTING_ATTRIBUTE.to_string(), "true".to_string());
                    }
                    NodeInfo::from_parts(ts, shards, stopping, attributes).unwrap()
                });
            (Just(max), proptest::collection::btree_map(0u16..20, info, 1..6))
        })
    }

    proptest! {
        #[test]
        fn prop_never_starts_a_stopping_shard((max, nodes) in arb_nodes()) {
            let plan = EvenShardAllocationStrategy.rebalance(&nodes, max);
            for (id, start) in plan.to_start() {
                let info = &nodes[id];
                prop_assert!(start.is_disjoint(info.shards_stopping()));
                prop_assert!(start.is_disjoint(info.shards()));
            }
        }

        #[test]
        fn prop_converges_to_partition((max, nodes) in arb_nodes()) {
            let any_eligible = nodes
                .values()
                .any(|info| !EvenShardAllocationStrategy::is_departing(info));
            prop_assume!(any_eligible);

            let mut nodes = nodes;
            for _ in 0..6 {
                let plan = EvenShardAllocationStrategy.rebalance(&nodes, max);
                if plan.is_empty() {
                    break;
                }
                nodes = apply_and_ack(&nodes, &plan);
            }

            for shard in 0..max {
                let owners = nodes.values().filter(|n| n.shards().contains(shard)).count();
                prop_assert_eq!(owners, 1);
            }
            for info in nodes.values() {
                if EvenShardAllocationStrategy::is_departing(info) {
                    prop_assert!(info.shards().is_empty());
                }
            }
            prop_assert!(EvenShardAllocationStrategy.rebalance(&nodes, max).is_empty());
        }
    }
}
