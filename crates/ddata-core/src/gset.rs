//! Grow-only Set - elements can only be added, never removed.

use crate::lattice::{DeltaCrdt, DeltaOp, Lattice};
use crate::node::NodeId;
use crate::pruning::RemovedNodePruning;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GSet<T: Ord + Clone> {
    elements: BTreeSet<T>,
    /// Elements added since the last delta reset
    #[serde(skip)]
    delta: Option<BTreeSet<T>>,
}

impl<T: Ord + Clone> GSet<T> {
    pub fn new() -> Self {
        Self {
            elements: BTreeSet::new(),
            delta: None,
        }
    }

    /// Add an element (the only mutation allowed)
    pub fn insert(&mut self, value: T) {
        if self.elements.insert(value.clone()) {
            self.delta.get_or_insert_with(BTreeSet::new).insert(value);
        }
    }

    pub fn contains(&self, value: &T) -> bool {
        self.elements.contains(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.elements.iter()
    }

    pub fn elements(&self) -> &BTreeSet<T> {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

impl<T: Ord + Clone> Default for GSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Ord + Clone> PartialEq for GSet<T> {
    fn eq(&self, other: &Self) -> bool {
        self.elements == other.elements
    }
}

impl<T: Ord + Clone> Eq for GSet<T> {}

impl<T: Ord + Clone> FromIterator<T> for GSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            elements: iter.into_iter().collect(),
            delta: None,
        }
    }
}

impl<T: Ord + Clone> Lattice for GSet<T> {
    fn bottom() -> Self {
        Self::new()
    }

    fn join(&self, other: &Self) -> Self {
        self.elements.union(&other.elements).cloned().collect()
    }
}

impl<T: Ord + Clone> DeltaOp for GSet<T> {
    fn merge_op(&self, later: &Self) -> Self {
        self.join(later)
    }
}

impl<T: Ord + Clone> DeltaCrdt for GSet<T> {
    type Delta = GSet<T>;

    fn delta(&self) -> Option<GSet<T>> {
        self.delta.as_ref().map(|d| d.iter().cloned().collect())
    }

    fn merge_delta(&self, delta: &GSet<T>) -> Self {
        self.join(delta)
    }

    fn reset_delta(&mut self) {
        self.delta = None;
    }
}

/// A grow-only set carries no per-node state.
impl<T: Ord + Clone> RemovedNodePruning for GSet<T> {
    fn modified_by_nodes(&self) -> BTreeSet<NodeId> {
        BTreeSet::new()
    }

    fn need_pruning_from(&self, _removed: &NodeId) -> bool {
        false
    }

    fn prune(&self, _removed: &NodeId, _collapse_into: &NodeId) -> Self {
        self.clone()
    }

    fn prune_cleanup(&self, _removed: &NodeId) -> Self {
        self.clone()
    }
}
