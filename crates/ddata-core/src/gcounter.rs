//! Grow-only counter.
//!
//! Each node owns one entry that only ever grows. The counter value is the
//! sum of all entries and the join takes the per-node maximum.

use crate::error::{CrdtError, Result};
use crate::fast_merge::{Lineage, Shortcut};
use crate::lattice::{DeltaCrdt, DeltaOp, Lattice};
use crate::node::NodeId;
use crate::pruning::RemovedNodePruning;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GCounter {
    /// Per-node totals
    state: BTreeMap<NodeId, u64>,
    /// Entries touched since the last delta reset
    #[serde(skip)]
    delta: Option<BTreeMap<NodeId, u64>>,
    #[serde(skip)]
    lineage: Lineage,
}

impl GCounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn from_state(state: BTreeMap<NodeId, u64>) -> Self {
        Self {
            state,
            delta: None,
            lineage: Lineage::new(),
        }
    }

    /// Sum of all node entries.
    pub fn value(&self) -> u64 {
        self.state.values().fold(0u64, |acc, v| acc.saturating_add(*v))
    }

    /// Entry contributed by one node.
    pub fn value_at(&self, node: &NodeId) -> u64 {
        self.state.get(node).copied().unwrap_or(0)
    }

    pub fn state(&self) -> &BTreeMap<NodeId, u64> {
        &self.state
    }

    /// Add `n` to the entry owned by `node`. Negative amounts are rejected.
    pub fn increment(&mut self, node: &NodeId, n: i64) -> Result<()> {
        if n < 0 {
            return Err(CrdtError::NegativeIncrement(n));
        }
        if n == 0 {
            return Ok(());
        }
        let next = self.value_at(node).saturating_add(n as u64);
        self.state.insert(node.clone(), next);
        self.delta
            .get_or_insert_with(BTreeMap::new)
            .insert(node.clone(), next);
        self.lineage.advance();
        Ok(())
    }

    fn merge_states(&self, other: &Self) -> BTreeMap<NodeId, u64> {
        let mut merged = self.state.clone();
        for (node, &v) in &other.state {
            merged
                .entry(node.clone())
                .and_modify(|e| *e = (*e).max(v))
                .or_insert(v);
        }
        merged
    }
}

impl PartialEq for GCounter {
    fn eq(&self, other: &Self) -> bool {
        self.state == other.state
    }
}

impl Eq for GCounter {}

impl Lattice for GCounter {
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
            Shortcut::FullMerge => Self::from_state(self.merge_states(other)),
        }
    }
}

impl DeltaOp for GCounter {
    fn merge_op(&self, later: &Self) -> Self {
        Self::from_state(self.merge_states(later))
    }
}

impl DeltaCrdt for GCounter {
    type Delta = GCounter;

    fn delta(&self) -> Option<GCounter> {
        self.delta.clone().map(Self::from_state)
    }

    fn merge_delta(&self, delta: &GCounter) -> Self {
        self.join(delta)
    }

    fn reset_delta(&mut self) {
        self.delta = None;
    }
}

impl RemovedNodePruning for GCounter {
    fn modified_by_nodes(&self) -> BTreeSet<NodeId> {
        self.state.keys().cloned().collect()
    }

    fn need_pruning_from(&self, removed: &NodeId) -> bool {
        self.state.contains_key(removed)
    }

    fn prune(&self, removed: &NodeId, collapse_into: &NodeId) -> Self {
        let mut state = self.state.clone();
        match state.remove(removed) {
            Some(moved) => {
                let entry = state.entry(collapse_into.clone()).or_insert(0);
                *entry = entry.saturating_add(moved);
                Self::from_state(state)
            }
            None => Self::from_state(state),
        }
    }

    fn prune_cleanup(&self, removed: &NodeId) -> Self {
        let mut state = self.state.clone();
        state.remove(removed);
        Self::from_state(state)
    }
}
