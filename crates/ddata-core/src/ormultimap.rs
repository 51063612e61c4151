//! Observed-Remove multi-map: each key maps to an [`ORSet`] of values.
//!
//! With value deltas enabled, removed keys keep their last set around as a
//! tombstone so that a concurrent binding for the same key merges into the
//! existing set instead of resurrecting removed elements.

use crate::error::Result;
use crate::lattice::{DeltaCrdt, Lattice};
use crate::node::NodeId;
use crate::ormap::{ORMap, ORMapDelta};
use crate::orset::ORSet;
use crate::pruning::RemovedNodePruning;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "K: Serialize, V: Serialize",
    deserialize = "K: Deserialize<'de>, V: Deserialize<'de>"
))]
pub struct ORMultiMap<K: Ord + Clone, V: Ord + Clone + fmt::Debug> {
    underlying: ORMap<K, ORSet<V>>,
}

pub type ORMultiMapDelta<K, V> = ORMapDelta<K, ORSet<V>>;

impl<K: Ord + Clone, V: Ord + Clone + fmt::Debug> ORMultiMap<K, V> {
    pub fn new() -> Self {
        Self {
            underlying: ORMap::new(),
        }
    }

    /// Multi-map replicating element-level deltas of the value sets.
    pub fn with_value_deltas() -> Self {
        Self {
            underlying: ORMap::with_value_deltas(),
        }
    }

    fn with_value_deltas_enabled(&self) -> bool {
        self.underlying.uses_value_deltas()
    }

    pub fn get(&self, key: &K) -> Option<BTreeSet<V>> {
        self.underlying.get(key).map(|set| set.elements())
    }

    pub fn entries(&self) -> impl Iterator<Item = (&K, BTreeSet<V>)> {
        self.underlying.entries().map(|(k, set)| (k, set.elements()))
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.underlying.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.underlying.keys()
    }

    pub fn len(&self) -> usize {
        self.underlying.len()
    }

    pub fn is_empty(&self) -> bool {
        self.underlying.is_empty()
    }

    /// Replace the whole value set of `key`.
    pub fn put(&mut self, node: &NodeId, key: K, values: BTreeSet<V>) -> Result<()> {
        self.underlying.update(node, key, ORSet::new(), |set| {
            set.clear(node);
            for value in values {
                set.add(node, value);
            }
            Ok(())
        })
    }

    pub fn add_binding(&mut self, node: &NodeId, key: K, value: V) -> Result<()> {
        self.underlying
            .update(node, key, ORSet::new(), |set| {
                set.add(node, value);
                Ok(())
            })
    }

    /// Remove one element. The key goes away with its last element.
    pub fn remove_binding(&mut self, node: &NodeId, key: K, value: &V) -> Result<()> {
        self.underlying.update(node, key.clone(), ORSet::new(), |set| {
            set.remove(node, value);
            Ok(())
        })?;
        if self.underlying.get(&key).is_some_and(|set| set.is_empty()) {
            if self.with_value_deltas_enabled() {
                self.underlying.remove_key(node, &key);
            } else {
                self.underlying.remove(node, &key);
            }
        }
        Ok(())
    }

    /// Move a binding from `old` to `new` within the same key.
    pub fn replace_binding(&mut self, node: &NodeId, key: K, old: &V, new: V) -> Result<()> {
        if &new != old {
            self.add_binding(node, key.clone(), new)?;
            self.remove_binding(node, key, old)?;
        }
        Ok(())
    }

    pub fn remove(&mut self, node: &NodeId, key: &K) -> Result<()> {
        if self.with_value_deltas_enabled() {
            if self.underlying.contains_key(key) {
                self.underlying.update(node, key.clone(), ORSet::new(), |set| {
                    set.clear(node);
                    Ok(())
                })?;
            }
            self.underlying.remove_key(node, key);
        } else {
            self.underlying.remove(node, key);
        }
        Ok(())
    }
}

impl<K: Ord + Clone, V: Ord + Clone + fmt::Debug> Default for ORMultiMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone, V: Ord + Clone + fmt::Debug> Lattice for ORMultiMap<K, V> {
    fn bottom() -> Self {
        Self::new()
    }

    fn join(&self, other: &Self) -> Self {
        let underlying = if self.with_value_deltas_enabled() || other.with_value_deltas_enabled() {
            self.underlying.merge_retaining_deleted_values(&other.underlying)
        } else {
            self.underlying.join(&other.underlying)
        };
        Self { underlying }
    }
}

impl<K: Ord + Clone, V: Ord + Clone + fmt::Debug> DeltaCrdt for ORMultiMap<K, V> {
    type Delta = ORMultiMapDelta<K, V>;

    fn delta(&self) -> Option<Self::Delta> {
        self.underlying.delta()
    }

    fn merge_delta(&self, delta: &Self::Delta) -> Self {
        let underlying = if self.with_value_deltas_enabled() {
            self.underlying.merge_delta_retaining_deleted_values(delta)
        } else {
            self.underlying.merge_delta(delta)
        };
        Self { underlying }
    }

    fn reset_delta(&mut self) {
        self.underlying.reset_delta();
    }
}

impl<K: Ord + Clone, V: Ord + Clone + fmt::Debug> RemovedNodePruning for ORMultiMap<K, V> {
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
