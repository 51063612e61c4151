//! Version vector: node identity → highest counter observed from that node.
//!
//! Counters handed out by [`VersionVector::increment`] come from one
//! process-wide monotonic source, so a dot minted after a prune can never
//! collide with a dot minted before it, even for the same node.

use crate::lattice::Lattice;
use crate::node::NodeId;
use crate::pruning::RemovedNodePruning;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};

static COUNTER: AtomicU64 = AtomicU64::new(1);

/// Causal relation between two version vectors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionOrdering {
    Same,
    Before,
    After,
    Concurrent,
}

impl VersionOrdering {
    fn and_then(self, next: VersionOrdering) -> VersionOrdering {
        match (self, next) {
            (VersionOrdering::Same, n) => n,
            (current, VersionOrdering::Same) => current,
            (current, n) if current == n => current,
            _ => VersionOrdering::Concurrent,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionVector {
    versions: BTreeMap<NodeId, u64>,
}

impl VersionVector {
    pub fn new() -> Self {
        Self {
            versions: BTreeMap::new(),
        }
    }

    /// A vector holding exactly one dot.
    pub fn single(node: NodeId, version: u64) -> Self {
        let mut vv = Self::new();
        vv.set(node, version);
        vv
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (NodeId, u64)>) -> Self {
        let mut vv = Self::new();
        for (node, version) in entries {
            vv.set(node, version);
        }
        vv
    }

    pub fn version_at(&self, node: &NodeId) -> u64 {
        self.versions.get(node).copied().unwrap_or(0)
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.versions.contains_key(node)
    }

    /// Set the version for a node. Zero removes the entry.
    pub fn set(&mut self, node: NodeId, version: u64) {
        if version == 0 {
            self.versions.remove(&node);
        } else {
            self.versions.insert(node, version);
        }
    }

    pub fn remove(&mut self, node: &NodeId) {
        self.versions.remove(node);
    }

    /// Bump the entry for `node` to a fresh counter and return it.
    pub fn increment(&mut self, node: &NodeId) -> u64 {
        let ticked = COUNTER.fetch_add(1, Ordering::Relaxed);
        let next = ticked.max(self.version_at(node) + 1);
        COUNTER.fetch_max(next + 1, Ordering::Relaxed);
        self.versions.insert(node.clone(), next);
        next
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &u64)> {
        self.versions.iter()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.versions.keys()
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Pointwise maximum.
    pub fn merge(&self, other: &VersionVector) -> VersionVector {
        let mut merged = self.clone();
        merged.merge_in(other);
        merged
    }

    pub fn merge_in(&mut self, other: &VersionVector) {
        for (node, &version) in &other.versions {
            let entry = self.versions.entry(node.clone()).or_insert(0);
            *entry = (*entry).max(version);
        }
    }

    /// Classify the causal relation, stopping early once it is known to be
    /// concurrent.
    pub fn compare(&self, other: &VersionVector) -> VersionOrdering {
        if self.versions.is_empty() && other.versions.is_empty() {
            return VersionOrdering::Same;
        }
        let mut order = VersionOrdering::Same;
        let mut left = self.versions.iter().peekable();
        let mut right = other.versions.iter().peekable();

        loop {
            let step = match (left.peek().copied(), right.peek().copied()) {
                (None, None) => break,
                (Some(_), None) => {
                    left.next();
                    VersionOrdering::After
                }
                (None, Some(_)) => {
                    right.next();
                    VersionOrdering::Before
                }
                (Some((ln, lv)), Some((rn, rv))) => match ln.cmp(rn) {
                    std::cmp::Ordering::Less => {
                        left.next();
                        VersionOrdering::After
                    }
                    std::cmp::Ordering::Greater => {
                        right.next();
                        VersionOrdering::Before
                    }
                    std::cmp::Ordering::Equal => {
                        let step = match lv.cmp(rv) {
                            std::cmp::Ordering::Greater => VersionOrdering::After,
                            std::cmp::Ordering::Less => VersionOrdering::Before,
                            std::cmp::Ordering::Equal => VersionOrdering::Same,
                        };
                        left.next();
                        right.next();
                        step
                    }
                },
            };
            order = order.and_then(step);
            if order == VersionOrdering::Concurrent {
                return order;
            }
        }
        order
    }

    pub fn is_before(&self, other: &VersionVector) -> bool {
        self.compare(other) == VersionOrdering::Before
    }

    pub fn is_after(&self, other: &VersionVector) -> bool {
        self.compare(other) == VersionOrdering::After
    }

    pub fn is_concurrent(&self, other: &VersionVector) -> bool {
        self.compare(other) == VersionOrdering::Concurrent
    }

    /// Same-or-after.
    pub fn dominates(&self, other: &VersionVector) -> bool {
        matches!(
            self.compare(other),
            VersionOrdering::Same | VersionOrdering::After
        )
    }

    /// Keep only the dots of `self` that `seen` has not yet observed.
    pub fn subtract_dots(&self, seen: &VersionVector) -> VersionVector {
        VersionVector {
            versions: self
                .versions
                .iter()
                .filter(|&(node, &version)| version > seen.version_at(node))
                .map(|(node, version)| (node.clone(), *version))
                .collect(),
        }
    }
}

impl Lattice for VersionVector {
    fn bottom() -> Self {
        Self::new()
    }

    fn join(&self, other: &Self) -> Self {
        self.merge(other)
    }
}

impl RemovedNodePruning for VersionVector {
    fn modified_by_nodes(&self) -> BTreeSet<NodeId> {
        self.versions.keys().cloned().collect()
    }

    fn need_pruning_from(&self, removed: &NodeId) -> bool {
        self.versions.contains_key(removed)
    }

    fn prune(&self, removed: &NodeId, collapse_into: &NodeId) -> Self {
        if !self.contains(removed) {
            return self.clone();
        }
        let mut pruned = self.clone();
        pruned.remove(removed);
        pruned.increment(collapse_into);
        pruned
    }

    fn prune_cleanup(&self, removed: &NodeId) -> Self {
        let mut cleaned = self.clone();
        cleaned.remove(removed);
        cleaned
    }
}
