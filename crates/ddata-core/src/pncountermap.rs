//! Map of named PN-counters. Updates replicate the counter delta only.

use crate::error::Result;
use crate::lattice::{DeltaCrdt, Lattice};
use crate::node::NodeId;
use crate::ormap::{ORMap, ORMapDelta};
use crate::pncounter::PNCounter;
use crate::pruning::RemovedNodePruning;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "K: Serialize", deserialize = "K: Deserialize<'de>"))]
pub struct PNCounterMap<K: Ord + Clone> {
    underlying: ORMap<K, PNCounter>,
}

pub type PNCounterMapDelta<K> = ORMapDelta<K, PNCounter>;

impl<K: Ord + Clone> PNCounterMap<K> {
    pub fn new() -> Self {
        Self {
            underlying: ORMap::with_value_deltas(),
        }
    }

    pub fn get(&self, key: &K) -> Option<i64> {
        self.underlying.get(key).map(|c| c.value())
    }

    pub fn entries(&self) -> impl Iterator<Item = (&K, i64)> {
        self.underlying.entries().map(|(k, c)| (k, c.value()))
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.underlying.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.underlying.len()
    }

    pub fn is_empty(&self) -> bool {
        self.underlying.is_empty()
    }

    pub fn increment(&mut self, node: &NodeId, key: K, n: i64) -> Result<()> {
        self.underlying
            .update(node, key, PNCounter::new(), |c| c.increment(node, n))
    }

    pub fn decrement(&mut self, node: &NodeId, key: K, n: i64) -> Result<()> {
        self.underlying
            .update(node, key, PNCounter::new(), |c| c.decrement(node, n))
    }

    pub fn remove(&mut self, node: &NodeId, key: &K) {
        self.underlying.remove(node, key);
    }
}

impl<K: Ord + Clone> Default for PNCounterMap<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone> Lattice for PNCounterMap<K> {
    fn bottom() -> Self {
        Self::new()
    }

    fn join(&self, other: &Self) -> Self {
        Self {
            underlying: self.underlying.join(&other.underlying),
        }
    }
}

impl<K: Ord + Clone> DeltaCrdt for PNCounterMap<K> {
    type Delta = PNCounterMapDelta<K>;

    fn delta(&self) -> Option<Self::Delta> {
        self.underlying.delta()
    }

    fn merge_delta(&self, delta: &Self::Delta) -> Self {
        Self {
            underlying: self.underlying.merge_delta(delta),
        }
    }

    fn reset_delta(&mut self) {
        self.underlying.reset_delta();
    }
}

impl<K: Ord + Clone> RemovedNodePruning for PNCounterMap<K> {
    fn modified_by_nodes(&self) -> BTreeSet<NodeId> {
        self.underlying.modified_by_nodes()
    }

    fn need_pruning_from(&self, removed: &NodeId) -> bool {
        self.underlying.need_pruning_from(removed)
    }

    fn prune(&self, removed: &NodeId, collapse_into: &NodeId) -> Self {
        Self {
            underlying: self.underlying.prune(removed, collapse_into),
        }
    }

    fn prune_cleanup(&self, removed: &NodeId) -> Self {
        Self {
            underlying: self.underlying.prune_cleanup(removed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> NodeId {
        NodeId::new(id)
    }

    #[test]
    fn counters_per_key() {
        let mut map = PNCounterMap::new();
        map.increment(&node("a"), "apples", 5).unwrap();
        map.decrement(&node("a"), "apples", 2).unwrap();
        map.increment(&node("a"), "pears", 1).unwrap();
        assert_eq!(map.get(&"apples"), Some(3));
        assert_eq!(map.get(&"pears"), Some(1));
        assert_eq!(map.get(&"plums"), None);
    }

    #[test]
    fn concurrent_increments_add_up() {
        let mut base = PNCounterMap::new();
        base.increment(&node("a"), "k", 1).unwrap();
        base.reset_delta();

        let mut left = base.clone();
        left.increment(&node("a"), "k", 2).unwrap();
        let mut right = base.clone();
        right.decrement(&node("b"), "k", 4).unwrap();

        let left_delta = left.split_delta().unwrap();
        let right_delta = right.split_delta().unwrap();
        let via_deltas = base.merge_delta(&left_delta).merge_delta(&right_delta);
        assert_eq!(via_deltas.get(&"k"), Some(-1));
        assert_eq!(left.join(&right).get(&"k"), Some(-1));
    }
}
