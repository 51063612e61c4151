//! Observed-Remove Set (OR-Set / Add-Wins Set)
//!
//! Every element carries the dot of the add that created it, and the set keeps
//! a version vector of everything it has observed. During a merge an element
//! present on one side only is kept when the other side has not seen its dot
//! (a concurrent add) and dropped when it has (the other side removed it).
//! Concurrent add and remove of the same element: add wins.

use crate::fast_merge::{Lineage, Shortcut};
use crate::lattice::{DeltaCrdt, DeltaOp, Lattice};
use crate::node::NodeId;
use crate::pruning::RemovedNodePruning;
use crate::version_vector::VersionVector;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct ORSet<T: Ord + Clone> {
    /// Element → dots of the adds that are still live
    elements: BTreeMap<T, VersionVector>,
    /// Everything this replica has observed
    vvector: VersionVector,
    #[serde(skip)]
    delta: Option<Box<ORSetDelta<T>>>,
    #[serde(skip)]
    lineage: Lineage,
}

/// Delta of an [`ORSet`] mutation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ORSetDelta<T: Ord + Clone> {
    /// Added elements with their fresh dots
    Add(ORSet<T>),
    /// Exactly one removed element, with the remover's full version vector
    Remove(ORSet<T>),
    /// Full state after a clear
    FullState(ORSet<T>),
    /// Ordered sequence of the above, never nested
    Group(Vec<ORSetDelta<T>>),
}

impl<T: Ord + Clone> ORSet<T> {
    pub fn new() -> Self {
        Self::from_parts(BTreeMap::new(), VersionVector::new())
    }

    pub(crate) fn from_parts(elements: BTreeMap<T, VersionVector>, vvector: VersionVector) -> Self {
        Self {
            elements,
            vvector,
            delta: None,
            lineage: Lineage::new(),
        }
    }

    pub fn contains(&self, value: &T) -> bool {
        self.elements.contains_key(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.elements.keys()
    }

    pub fn elements(&self) -> BTreeSet<T> {
        self.elements.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn version_vector(&self) -> &VersionVector {
        &self.vvector
    }

    /// Dots currently attached to an element.
    pub fn dots(&self, value: &T) -> Option<&VersionVector> {
        self.elements.get(value)
    }

    fn push_delta(&mut self, op: ORSetDelta<T>) {
        let merged = match self.delta.take() {
            Some(existing) => existing.merge_op(&op),
            None => op,
        };
        self.delta = Some(Box::new(merged));
    }

    /// Add an element under a fresh dot owned by `node`.
    pub fn add(&mut self, node: &NodeId, value: T) {
        let version = self.vvector.increment(node);
        let dot = VersionVector::single(node.clone(), version);
        let added = ORSet::from_parts(BTreeMap::from([(value.clone(), dot.clone())]), dot.clone());
        self.push_delta(ORSetDelta::Add(added));
        self.elements.insert(value, dot);
        self.lineage.advance();
    }

    /// Remove an element. The delta carries the full version vector so the
    /// receiver can tell this removal apart from an add it has not yet seen.
    pub fn remove(&mut self, node: &NodeId, value: &T) {
        let dot = VersionVector::single(node.clone(), self.vvector.version_at(node));
        let removed = ORSet::from_parts(BTreeMap::from([(value.clone(), dot)]), self.vvector.clone());
        self.push_delta(ORSetDelta::Remove(removed));
        self.elements.remove(value);
        self.lineage.advance();
    }

    /// Remove every element. Replicated as a full-state delta.
    pub fn clear(&mut self, _node: &NodeId) {
        let cleared = ORSet::from_parts(BTreeMap::new(), self.vvector.clone());
        self.push_delta(ORSetDelta::FullState(cleared));
        self.elements.clear();
        self.lineage.advance();
    }

    fn merge_common_dots(
        lhs: &VersionVector,
        lhs_seen: &VersionVector,
        rhs: &VersionVector,
        rhs_seen: &VersionVector,
    ) -> VersionVector {
        let common = VersionVector::from_entries(
            lhs.iter()
                .filter(|&(node, &v)| rhs.version_at(node) == v)
                .map(|(node, &v)| (node.clone(), v)),
        );
        let lhs_unique = VersionVector::from_entries(
            lhs.iter()
                .filter(|&(node, _)| !common.contains(node))
                .map(|(node, &v)| (node.clone(), v)),
        );
        let rhs_unique = VersionVector::from_entries(
            rhs.iter()
                .filter(|&(node, _)| !common.contains(node))
                .map(|(node, &v)| (node.clone(), v)),
        );
        let lhs_keep = lhs_unique.subtract_dots(rhs_seen);
        let rhs_keep = rhs_unique.subtract_dots(lhs_seen);
        lhs_keep.merge(&rhs_keep).merge(&common)
    }

    /// Structural merge. With `add_delta` the elements unique to `self` are
    /// kept unconditionally, since an add delta only carries the dots of its
    /// own adds and says nothing about removals.
    fn dry_merge(&self, that: &ORSet<T>, add_delta: bool) -> ORSet<T> {
        let mut entries = BTreeMap::new();
        for (value, this_dots) in &self.elements {
            let kept = match that.elements.get(value) {
                Some(that_dots) => {
                    Self::merge_common_dots(this_dots, &self.vvector, that_dots, &that.vvector)
                }
                None if add_delta => this_dots.clone(),
                None => this_dots.subtract_dots(&that.vvector),
            };
            if !kept.is_empty() {
                entries.insert(value.clone(), kept);
            }
        }
        for (value, that_dots) in &that.elements {
            if self.elements.contains_key(value) {
                continue;
            }
            let kept = that_dots.subtract_dots(&self.vvector);
            if !kept.is_empty() {
                entries.insert(value.clone(), kept);
            }
        }
        ORSet::from_parts(entries, self.vvector.merge(&that.vvector))
    }

    fn merge_remove_delta(&self, that: &ORSet<T>) -> ORSet<T> {
        let Some((value, that_dot)) = that.elements.iter().next() else {
            return ORSet::from_parts(self.elements.clone(), self.vvector.clone());
        };
        let mut elements = self.elements.clone();
        if let Some(this_dot) = self.elements.get(value) {
            if this_dot.subtract_dots(&that.vvector).is_empty() {
                elements.remove(value);
            }
        }
        ORSet::from_parts(elements, self.vvector.merge(that_dot))
    }

    fn apply_op(&self, op: &ORSetDelta<T>) -> ORSet<T> {
        match op {
            ORSetDelta::Add(added) => self.dry_merge(added, true),
            ORSetDelta::Remove(removed) => self.merge_remove_delta(removed),
            ORSetDelta::FullState(full) => self.dry_merge(full, false),
            ORSetDelta::Group(ops) => ops
                .iter()
                .fold(ORSet::from_parts(self.elements.clone(), self.vvector.clone()), |acc, op| {
                    acc.apply_op(op)
                }),
        }
    }
}

impl<T: Ord + Clone> Default for ORSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Ord + Clone> PartialEq for ORSet<T> {
    fn eq(&self, other: &Self) -> bool {
        self.elements == other.elements && self.vvector == other.vvector
    }
}

impl<T: Ord + Clone> Lattice for ORSet<T> {
    fn bottom() -> Self {
        Self::new()
    }

    fn join(&self, other: &Self) -> Self {
        match self.lineage.shortcut(&other.lineage) {
            Shortcut::KeepSelf => {
                let mut kept = self.clone();
                kept.lineage.detach();
                kept
            }
            Shortcut::TakeOther => {
                let mut taken = other.clone();
                taken.lineage.detach();
                taken
            }
            Shortcut::FullMerge => self.dry_merge(other, false),
        }
    }
}

impl<T: Ord + Clone> DeltaOp for ORSetDelta<T> {
    fn merge_op(&self, later: &Self) -> Self {
        match (self, later) {
            (ORSetDelta::Add(a), ORSetDelta::Add(b)) => {
                let mut elements = a.elements.clone();
                elements.extend(b.elements.iter().map(|(k, v)| (k.clone(), v.clone())));
                ORSetDelta::Add(ORSet::from_parts(elements, a.vvector.merge(&b.vvector)))
            }
            (ORSetDelta::Group(ops), ORSetDelta::Group(more)) => {
                ORSetDelta::Group(ops.iter().chain(more.iter()).cloned().collect())
            }
            (ORSetDelta::Group(ops), ORSetDelta::Add(_)) => {
                let mut ops = ops.clone();
                match ops.last() {
                    Some(last @ ORSetDelta::Add(_)) => {
                        let merged = last.merge_op(later);
                        ops.pop();
                        ops.push(merged);
                    }
                    _ => ops.push(later.clone()),
                }
                ORSetDelta::Group(ops)
            }
            (ORSetDelta::Group(ops), atomic) => {
                let mut ops = ops.clone();
                ops.push(atomic.clone());
                ORSetDelta::Group(ops)
            }
            (atomic, ORSetDelta::Group(ops)) => {
                let mut grouped = Vec::with_capacity(ops.len() + 1);
                grouped.push(atomic.clone());
                grouped.extend(ops.iter().cloned());
                ORSetDelta::Group(grouped)
            }
            (first, second) => ORSetDelta::Group(vec![first.clone(), second.clone()]),
        }
    }

    fn requires_causal_delivery(&self) -> bool {
        true
    }

    fn op_count(&self) -> usize {
        match self {
            ORSetDelta::Group(ops) => ops.len(),
            _ => 1,
        }
    }
}

impl<T: Ord + Clone> DeltaCrdt for ORSet<T> {
    type Delta = ORSetDelta<T>;

    fn delta(&self) -> Option<ORSetDelta<T>> {
        self.delta.as_deref().cloned()
    }

    fn merge_delta(&self, delta: &ORSetDelta<T>) -> Self {
        self.apply_op(delta)
    }

    fn reset_delta(&mut self) {
        self.delta = None;
    }
}

impl<T: Ord + Clone> RemovedNodePruning for ORSet<T> {
    fn modified_by_nodes(&self) -> BTreeSet<NodeId> {
        self.vvector.modified_by_nodes()
    }

    fn need_pruning_from(&self, removed: &NodeId) -> bool {
        self.vvector.need_pruning_from(removed)
    }

    fn prune(&self, removed: &NodeId, collapse_into: &NodeId) -> Self {
        let pruned: BTreeMap<T, VersionVector> = self
            .elements
            .iter()
            .filter(|(_, dot)| dot.need_pruning_from(removed))
            .map(|(value, dot)| (value.clone(), dot.prune(removed, collapse_into)))
            .collect();
        let mut elements = self.elements.clone();
        elements.extend(pruned.iter().map(|(k, v)| (k.clone(), v.clone())));
        let mut set = ORSet::from_parts(elements, self.vvector.prune(removed, collapse_into));
        // re-add so the collapsed dots are covered by the new version vector
        for value in pruned.into_keys() {
            set.add(collapse_into, value);
        }
        set.reset_delta();
        set
    }

    fn prune_cleanup(&self, removed: &NodeId) -> Self {
        let elements = self
            .elements
            .iter()
            .map(|(value, dot)| (value.clone(), dot.prune_cleanup(removed)))
            .filter(|(_, dot)| !dot.is_empty())
            .collect();
        ORSet::from_parts(elements, self.vvector.prune_cleanup(removed))
    }
}
