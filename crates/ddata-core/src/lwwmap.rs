//! Last-Writer-Wins map: an [`ORMap`] of [`LWWRegister`] values.
//!
//! Concurrent puts of the same key resolve by register timestamp.

use crate::lattice::{DeltaCrdt, Lattice};
use crate::lwwreg::{default_clock, Clock, LWWRegister};
use crate::node::NodeId;
use crate::ormap::{ORMap, ORMapDelta};
use crate::pruning::RemovedNodePruning;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "K: Serialize, V: Serialize",
    deserialize = "K: Deserialize<'de>, V: Deserialize<'de>"
))]
pub struct LWWMap<K: Ord + Clone, V: Clone + fmt::Debug + PartialEq> {
    underlying: ORMap<K, LWWRegister<V>>,
}

pub type LWWMapDelta<K, V> = ORMapDelta<K, LWWRegister<V>>;

impl<K: Ord + Clone, V: Clone + fmt::Debug + PartialEq> LWWMap<K, V> {
    pub fn new() -> Self {
        Self {
            underlying: ORMap::new(),
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.underlying.get(key).map(|r| r.value())
    }

    pub fn register(&self, key: &K) -> Option<&LWWRegister<V>> {
        self.underlying.get(key)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&K, &V)> {
        self.underlying.entries().map(|(k, r)| (k, r.value()))
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

    pub fn put(&mut self, node: &NodeId, key: K, value: V)
    where
        K: fmt::Debug,
    {
        self.put_with_clock(node, key, value, default_clock);
    }

    pub fn put_with_clock(&mut self, node: &NodeId, key: K, value: V, clock: Clock<V>)
    where
        K: fmt::Debug,
    {
        let register = match self.underlying.get(&key) {
            Some(existing) => {
                let mut next = existing.clone();
                next.set_with_clock(node, value, clock);
                next
            }
            None => LWWRegister::with_clock(node, value, clock),
        };
        // registers are never observed-remove sets, so put cannot fail
        let _ = self.underlying.put(node, key, register);
    }

    pub fn remove(&mut self, node: &NodeId, key: &K) {
        self.underlying.remove(node, key);
    }
}

impl<K: Ord + Clone, V: Clone + fmt::Debug + PartialEq> Default for LWWMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone, V: Clone + fmt::Debug + PartialEq> Lattice for LWWMap<K, V> {
    fn bottom() -> Self {
        Self::new()
    }

    fn join(&self, other: &Self) -> Self {
        Self {
            underlying: self.underlying.join(&other.underlying),
        }
    }
}

impl<K: Ord + Clone, V: Clone + fmt::Debug + PartialEq> DeltaCrdt for LWWMap<K, V> {
    type Delta = LWWMapDelta<K, V>;

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

impl<K: Ord + Clone, V: Clone + fmt::Debug + PartialEq> RemovedNodePruning for LWWMap<K, V> {
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

    fn at_one(_: i64, _: &String) -> i64 {
        1
    }

    fn at_two(_: i64, _: &String) -> i64 {
        2
    }

    #[test]
    fn later_put_wins_across_replicas() {
        let mut left: LWWMap<String, String> = LWWMap::new();
        left.put_with_clock(&node("a"), "k".into(), "first".into(), at_one);
        let mut right: LWWMap<String, String> = LWWMap::new();
        right.put_with_clock(&node("b"), "k".into(), "second".into(), at_two);

        assert_eq!(left.join(&right).get(&"k".into()), Some(&"second".to_string()));
        assert_eq!(right.join(&left).get(&"k".into()), Some(&"second".to_string()));
    }

    #[test]
    fn remove_then_put() {
        let mut map: LWWMap<String, String> = LWWMap::new();
        map.put(&node("a"), "k".into(), "v".into());
        map.remove(&node("a"), &"k".into());
        assert!(map.get(&"k".into()).is_none());

        map.put(&node("a"), "k".into(), "w".into());
        assert_eq!(map.get(&"k".into()), Some(&"w".to_string()));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn delta_carries_register() {
        let before: LWWMap<String, String> = LWWMap::new();
        let mut after = before.clone();
        after.put(&node("a"), "k".into(), "v".into());
        let delta = after.split_delta().unwrap();
        assert_eq!(before.merge_delta(&delta), after);
    }
}
