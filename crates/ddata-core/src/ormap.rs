//! Observed-Remove Map
//!
//! An [`ORSet`] of keys paired with a map of replicated values. Keys follow
//! add-wins semantics; values are merged with their own join. Deltas either
//! carry a full value (`Put`, destructive) or, when the map is configured for
//! value deltas, the delta of the value itself (`Update`).
//!
//! Key-set deltas are always applied before the value deltas they travel
//! with, so that a value update can see whether its key is live.

use crate::error::{CrdtError, Result};
use crate::gcounter::GCounter;
use crate::gset::GSet;
use crate::lattice::{DeltaCrdt, DeltaOp, Lattice};
use crate::node::NodeId;
use crate::orset::{ORSet, ORSetDelta};
use crate::pncounter::PNCounter;
use crate::pruning::RemovedNodePruning;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A value that can live inside an [`ORMap`].
pub trait MapValue: Clone + fmt::Debug + PartialEq + RemovedNodePruning {
    /// Delta emitted by the value's own mutators. Types without deltas use
    /// themselves.
    type Delta: DeltaOp + fmt::Debug + PartialEq;

    fn merge_value(&self, other: &Self) -> Self;

    fn value_delta(&self) -> Option<Self::Delta>;

    fn reset_value_delta(&mut self);

    fn merge_value_delta(&self, delta: &Self::Delta) -> Self;

    /// Empty value of the kind `delta` applies to. Used when an update delta
    /// arrives before the put that created its value.
    fn zero_for(delta: &Self::Delta) -> Self;

    /// Observed-remove sets must not be replaced outright.
    fn is_observed_remove_set(&self) -> bool {
        false
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound(
    serialize = "K: Serialize, V: Serialize",
    deserialize = "K: Deserialize<'de>, V: Deserialize<'de>"
))]
pub struct ORMap<K: Ord + Clone, V: MapValue> {
    keys: ORSet<K>,
    values: BTreeMap<K, V>,
    /// Emit value deltas instead of full values on update
    #[serde(default)]
    value_deltas: bool,
    #[serde(skip)]
    delta: Option<Box<ORMapDelta<K, V>>>,
}

/// Delta of an [`ORMap`] mutation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "K: Serialize, V: Serialize, V::Delta: Serialize",
    deserialize = "K: Deserialize<'de>, V: Deserialize<'de>, V::Delta: Deserialize<'de>"
))]
pub enum ORMapDelta<K: Ord + Clone, V: MapValue> {
    /// Destructive write of a full value
    Put {
        keys: ORSetDelta<K>,
        key: K,
        value: V,
    },
    /// Key and value removed together
    Remove { keys: ORSetDelta<K> },
    /// Key removed, value retained as a tombstone by value-delta maps
    RemoveKey { keys: ORSetDelta<K>, key: K },
    /// Value deltas for existing keys
    Update {
        keys: ORSetDelta<K>,
        values: BTreeMap<K, V::Delta>,
    },
    Group(Vec<ORMapDelta<K, V>>),
}

impl<K: Ord + Clone, V: MapValue> ORMap<K, V> {
    pub fn new() -> Self {
        Self {
            keys: ORSet::new(),
            values: BTreeMap::new(),
            value_deltas: false,
            delta: None,
        }
    }

    /// A map whose updates replicate the value's own delta.
    pub fn with_value_deltas() -> Self {
        Self {
            value_deltas: true,
            ..Self::new()
        }
    }

    fn from_parts(keys: ORSet<K>, values: BTreeMap<K, V>, value_deltas: bool) -> Self {
        Self {
            keys,
            values,
            value_deltas,
            delta: None,
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        if self.keys.contains(key) {
            self.values.get(key)
        } else {
            None
        }
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.keys.contains(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.keys.iter()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&K, &V)> {
        self.values.iter().filter(|(k, _)| self.keys.contains(k))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn uses_value_deltas(&self) -> bool {
        self.value_deltas
    }

    fn push_delta(&mut self, op: ORMapDelta<K, V>) {
        let merged = match self.delta.take() {
            Some(existing) => existing.merge_op(&op),
            None => op,
        };
        self.delta = Some(Box::new(merged));
    }

    fn key_op(&mut self, op: impl FnOnce(&mut ORSet<K>)) -> ORSetDelta<K> {
        self.keys.reset_delta();
        op(&mut self.keys);
        self.keys
            .split_delta()
            .unwrap_or_else(|| ORSetDelta::Group(Vec::new()))
    }

    /// Replace the value at `key`. Observed-remove set values cannot be
    /// replaced once present; use [`ORMap::update`] for them.
    pub fn put(&mut self, node: &NodeId, key: K, value: V) -> Result<()>
    where
        K: fmt::Debug,
    {
        if value.is_observed_remove_set() && self.values.contains_key(&key) {
            return Err(CrdtError::ReplaceObservedRemoveValue(format!("{:?}", key)));
        }
        let mut value = value;
        value.reset_value_delta();
        let keys = self.key_op(|keys| keys.add(node, key.clone()));
        self.push_delta(ORMapDelta::Put {
            keys,
            key: key.clone(),
            value: value.clone(),
        });
        self.values.insert(key, value);
        Ok(())
    }

    /// Apply `modify` to the current value at `key`, or to `initial` when the
    /// key is absent.
    pub fn update<F>(&mut self, node: &NodeId, key: K, initial: V, modify: F) -> Result<()>
    where
        F: FnOnce(&mut V) -> Result<()>,
    {
        let (mut value, had_value) = match self.values.get(&key) {
            Some(existing) => (existing.clone(), true),
            None => (initial, false),
        };
        value.reset_value_delta();
        modify(&mut value)?;
        let value_delta = if self.value_deltas {
            value.value_delta()
        } else {
            None
        };
        value.reset_value_delta();

        let keys = self.key_op(|keys| keys.add(node, key.clone()));
        let op = match value_delta {
            Some(d) if had_value => ORMapDelta::Update {
                keys,
                values: BTreeMap::from([(key.clone(), d)]),
            },
            _ => ORMapDelta::Put {
                keys,
                key: key.clone(),
                value: value.clone(),
            },
        };
        self.push_delta(op);
        self.values.insert(key, value);
        Ok(())
    }

    /// Remove a key together with its value.
    pub fn remove(&mut self, node: &NodeId, key: &K) {
        let keys = self.key_op(|keys| keys.remove(node, key));
        self.values.remove(key);
        self.push_delta(ORMapDelta::Remove { keys });
    }

    /// Remove the key but keep the value around as a tombstone.
    pub(crate) fn remove_key(&mut self, node: &NodeId, key: &K) {
        let keys = self.key_op(|keys| keys.remove(node, key));
        self.push_delta(ORMapDelta::RemoveKey {
            keys,
            key: key.clone(),
        });
    }

    fn dry_merge(&self, other: &Self, merged_keys: ORSet<K>, value_keys: BTreeSet<K>) -> Self {
        let mut merged = BTreeMap::new();
        for key in value_keys {
            match (self.values.get(&key), other.values.get(&key)) {
                (Some(a), Some(b)) => {
                    merged.insert(key, a.merge_value(b));
                }
                (Some(a), None) if merged_keys.contains(&key) => {
                    merged.insert(key, a.clone());
                }
                (None, Some(b)) if merged_keys.contains(&key) => {
                    merged.insert(key, b.clone());
                }
                _ => {}
            }
        }
        Self::from_parts(merged_keys, merged, self.value_deltas || other.value_deltas)
    }

    /// Full merge that keeps values of removed keys when both sides hold them.
    pub(crate) fn merge_retaining_deleted_values(&self, other: &Self) -> Self {
        let merged_keys = self.keys.join(&other.keys);
        let value_keys = self
            .values
            .keys()
            .chain(other.values.keys())
            .cloned()
            .collect();
        self.dry_merge(other, merged_keys, value_keys)
    }

    fn apply_delta(&self, delta: &ORMapDelta<K, V>, retain_deleted: bool) -> Self {
        let mut keys = self.keys.clone();
        keys.reset_delta();
        let (mut live, mut tombstoned): (BTreeMap<K, V>, BTreeMap<K, V>) = self
            .values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .partition(|(k, _)| self.keys.contains(k));

        fn process<K: Ord + Clone, V: MapValue>(
            op: &ORMapDelta<K, V>,
            keys: &mut ORSet<K>,
            live: &mut BTreeMap<K, V>,
            tombstoned: &mut BTreeMap<K, V>,
        ) {
            match op {
                ORMapDelta::Put {
                    keys: key_delta,
                    key,
                    value,
                } => {
                    *keys = keys.merge_delta(key_delta);
                    live.insert(key.clone(), value.clone());
                }
                ORMapDelta::Remove { keys: key_delta } => {
                    *keys = keys.merge_delta(key_delta);
                    if let ORSetDelta::Remove(removed) = key_delta {
                        for key in removed.iter() {
                            if !keys.contains(key) {
                                live.remove(key);
                            }
                        }
                    }
                }
                ORMapDelta::RemoveKey {
                    keys: key_delta,
                    key,
                } => {
                    *keys = keys.merge_delta(key_delta);
                    if !keys.contains(key) {
                        if let Some(value) = live.remove(key) {
                            tombstoned.insert(key.clone(), value);
                        }
                    }
                }
                ORMapDelta::Update {
                    keys: key_delta,
                    values,
                } => {
                    *keys = keys.merge_delta(key_delta);
                    for (key, value_delta) in values {
                        if !keys.contains(key) {
                            continue;
                        }
                        let updated = match live.get(key).or_else(|| tombstoned.get(key)) {
                            Some(existing) => existing.merge_value_delta(value_delta),
                            None => V::zero_for(value_delta).merge_value_delta(value_delta),
                        };
                        live.insert(key.clone(), updated);
                    }
                }
                ORMapDelta::Group(ops) => {
                    for op in ops {
                        process(op, keys, live, tombstoned);
                    }
                }
            }
        }

        process(delta, &mut keys, &mut live, &mut tombstoned);

        if retain_deleted {
            for (key, value) in tombstoned {
                live.entry(key).or_insert(value);
            }
        }
        Self::from_parts(keys, live, self.value_deltas)
    }

    pub(crate) fn merge_delta_retaining_deleted_values(&self, delta: &ORMapDelta<K, V>) -> Self {
        self.apply_delta(delta, true)
    }
}

impl<K: Ord + Clone, V: MapValue> Default for ORMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone, V: MapValue> PartialEq for ORMap<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.keys == other.keys && self.values == other.values
    }
}

impl<K: Ord + Clone, V: MapValue> Lattice for ORMap<K, V> {
    fn bottom() -> Self {
        Self::new()
    }

    fn join(&self, other: &Self) -> Self {
        let merged_keys = self.keys.join(&other.keys);
        let value_keys = merged_keys.elements();
        self.dry_merge(other, merged_keys, value_keys)
    }
}

impl<K: Ord + Clone, V: MapValue> DeltaOp for ORMapDelta<K, V> {
    fn merge_op(&self, later: &Self) -> Self {
        use ORMapDelta::*;
        match (self, later) {
            (
                Put { keys, key, .. },
                Put {
                    keys: later_keys,
                    key: later_key,
                    value,
                },
            ) if key == later_key => Put {
                keys: keys.merge_op(later_keys),
                key: key.clone(),
                value: value.clone(),
            },
            (
                Put { keys, key, value },
                Update {
                    keys: later_keys,
                    values,
                },
            ) if values.len() == 1 && values.contains_key(key) => {
                let value = match values.get(key) {
                    Some(d) => value.merge_value_delta(d),
                    None => value.clone(),
                };
                Put {
                    keys: keys.merge_op(later_keys),
                    key: key.clone(),
                    value,
                }
            }
            (
                Update { keys, values },
                Update {
                    keys: later_keys,
                    values: later_values,
                },
            ) => {
                let mut merged = values.clone();
                for (key, d) in later_values {
                    let next = match values.get(key) {
                        Some(existing) => existing.merge_op(d),
                        None => d.clone(),
                    };
                    merged.insert(key.clone(), next);
                }
                Update {
                    keys: keys.merge_op(later_keys),
                    values: merged,
                }
            }
            (
                Update { keys, values },
                Put {
                    keys: later_keys,
                    key,
                    value,
                },
            ) if values.len() == 1 && values.contains_key(key) => Put {
                keys: keys.merge_op(later_keys),
                key: key.clone(),
                value: value.clone(),
            },
            (Group(ops), Group(more)) => Group(ops.iter().chain(more.iter()).cloned().collect()),
            (Group(ops), atomic) => {
                let mut ops = ops.clone();
                match ops.last() {
                    Some(last @ (Put { .. } | Update { .. })) => {
                        let merged = last.merge_op(atomic);
                        ops.pop();
                        match merged {
                            Group(tail) => ops.extend(tail),
                            single => ops.push(single),
                        }
                    }
                    _ => ops.push(atomic.clone()),
                }
                Group(ops)
            }
            (atomic, Group(ops)) => {
                let mut grouped = Vec::with_capacity(ops.len() + 1);
                grouped.push(atomic.clone());
                grouped.extend(ops.iter().cloned());
                Group(grouped)
            }
            (first, second) => Group(vec![first.clone(), second.clone()]),
        }
    }

    fn requires_causal_delivery(&self) -> bool {
        true
    }

    fn op_count(&self) -> usize {
        match self {
            ORMapDelta::Group(ops) => ops.len(),
            _ => 1,
        }
    }
}

impl<K: Ord + Clone, V: MapValue> DeltaCrdt for ORMap<K, V> {
    type Delta = ORMapDelta<K, V>;

    fn delta(&self) -> Option<ORMapDelta<K, V>> {
        self.delta.as_deref().cloned()
    }

    fn merge_delta(&self, delta: &ORMapDelta<K, V>) -> Self {
        self.apply_delta(delta, false)
    }

    fn reset_delta(&mut self) {
        self.delta = None;
    }
}

impl<K: Ord + Clone, V: MapValue> RemovedNodePruning for ORMap<K, V> {
    fn modified_by_nodes(&self) -> BTreeSet<NodeId> {
        let mut nodes = self.keys.modified_by_nodes();
        for value in self.values.values() {
            nodes.extend(value.modified_by_nodes());
        }
        nodes
    }

    fn need_pruning_from(&self, removed: &NodeId) -> bool {
        self.keys.need_pruning_from(removed)
            || self.values.values().any(|v| v.need_pruning_from(removed))
    }

    fn prune(&self, removed: &NodeId, collapse_into: &NodeId) -> Self {
        let values = self
            .values
            .iter()
            .map(|(k, v)| {
                let v = if v.need_pruning_from(removed) {
                    v.prune(removed, collapse_into)
                } else {
                    v.clone()
                };
                (k.clone(), v)
            })
            .collect();
        Self::from_parts(self.keys.prune(removed, collapse_into), values, self.value_deltas)
    }

    fn prune_cleanup(&self, removed: &NodeId) -> Self {
        let values = self
            .values
            .iter()
            .map(|(k, v)| {
                let v = if v.need_pruning_from(removed) {
                    v.prune_cleanup(removed)
                } else {
                    v.clone()
                };
                (k.clone(), v)
            })
            .collect();
        Self::from_parts(self.keys.prune_cleanup(removed), values, self.value_deltas)
    }
}

// ============================================================================
// MapValue for the built-in value types
// ============================================================================

impl MapValue for GCounter {
    type Delta = GCounter;

    fn merge_value(&self, other: &Self) -> Self {
        self.join(other)
    }

    fn value_delta(&self) -> Option<GCounter> {
        self.delta()
    }

    fn reset_value_delta(&mut self) {
        self.reset_delta();
    }

    fn merge_value_delta(&self, delta: &GCounter) -> Self {
        self.merge_delta(delta)
    }

    fn zero_for(_delta: &GCounter) -> Self {
        GCounter::new()
    }
}

impl MapValue for PNCounter {
    type Delta = PNCounter;

    fn merge_value(&self, other: &Self) -> Self {
        self.join(other)
    }

    fn value_delta(&self) -> Option<PNCounter> {
        self.delta()
    }

    fn reset_value_delta(&mut self) {
        self.reset_delta();
    }

    fn merge_value_delta(&self, delta: &PNCounter) -> Self {
        self.merge_delta(delta)
    }

    fn zero_for(_delta: &PNCounter) -> Self {
        PNCounter::new()
    }
}

impl<T: Ord + Clone + fmt::Debug> MapValue for GSet<T> {
    type Delta = GSet<T>;

    fn merge_value(&self, other: &Self) -> Self {
        self.join(other)
    }

    fn value_delta(&self) -> Option<GSet<T>> {
        self.delta()
    }

    fn reset_value_delta(&mut self) {
        self.reset_delta();
    }

    fn merge_value_delta(&self, delta: &GSet<T>) -> Self {
        self.merge_delta(delta)
    }

    fn zero_for(_delta: &GSet<T>) -> Self {
        GSet::new()
    }
}

impl<T: Ord + Clone + fmt::Debug> MapValue for ORSet<T> {
    type Delta = ORSetDelta<T>;

    fn merge_value(&self, other: &Self) -> Self {
        self.join(other)
    }

    fn value_delta(&self) -> Option<ORSetDelta<T>> {
        self.delta()
    }

    fn reset_value_delta(&mut self) {
        self.reset_delta();
    }

    fn merge_value_delta(&self, delta: &ORSetDelta<T>) -> Self {
        self.merge_delta(delta)
    }

    fn zero_for(_delta: &ORSetDelta<T>) -> Self {
        ORSet::new()
    }

    fn is_observed_remove_set(&self) -> bool {
        true
    }
}
