//! PN-Counter (Positive-Negative Counter) CRDT
//!
//! A PN-Counter supports both increment and decrement operations by maintaining
//! two grow-only counters: one for increments (P) and one for decrements (N).
//! The value is P - N.

use crate::error::Result;
use crate::gcounter::GCounter;
use crate::lattice::{DeltaCrdt, DeltaOp, Lattice};
use crate::node::NodeId;
use crate::pruning::RemovedNodePruning;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PNCounter {
    /// Per-node increments
    increments: GCounter,
    /// Per-node decrements
    decrements: GCounter,
}

impl PNCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value (sum of increments - sum of decrements)
    pub fn value(&self) -> i64 {
        let inc = self.increments.value() as i128;
        let dec = self.decrements.value() as i128;
        (inc - dec).clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }

    /// Increment by `n`; a negative `n` is routed to the decrement side.
    pub fn increment(&mut self, node: &NodeId, n: i64) -> Result<()> {
        if n >= 0 {
            self.increments.increment(node, n)
        } else {
            self.decrements.increment(node, n.checked_neg().unwrap_or(i64::MAX))
        }
    }

    /// Decrement by `n`; a negative `n` is routed to the increment side.
    pub fn decrement(&mut self, node: &NodeId, n: i64) -> Result<()> {
        self.increment(node, n.checked_neg().unwrap_or(i64::MAX))
    }

    pub fn increments(&self) -> &GCounter {
        &self.increments
    }

    pub fn decrements(&self) -> &GCounter {
        &self.decrements
    }
}

impl Lattice for PNCounter {
    fn bottom() -> Self {
        Self::new()
    }

    fn join(&self, other: &Self) -> Self {
        Self {
            increments: self.increments.join(&other.increments),
            decrements: self.decrements.join(&other.decrements),
        }
    }
}

impl DeltaOp for PNCounter {
    fn merge_op(&self, later: &Self) -> Self {
        Self {
            increments: self.increments.merge_op(&later.increments),
            decrements: self.decrements.merge_op(&later.decrements),
        }
    }
}

impl DeltaCrdt for PNCounter {
    type Delta = PNCounter;

    fn delta(&self) -> Option<PNCounter> {
        match (self.increments.delta(), self.decrements.delta()) {
            (None, None) => None,
            (inc, dec) => Some(PNCounter {
                increments: inc.unwrap_or_default(),
                decrements: dec.unwrap_or_default(),
            }),
        }
    }

    fn merge_delta(&self, delta: &PNCounter) -> Self {
        self.join(delta)
    }

    fn reset_delta(&mut self) {
        self.increments.reset_delta();
        self.decrements.reset_delta();
    }
}

impl RemovedNodePruning for PNCounter {
    fn modified_by_nodes(&self) -> BTreeSet<NodeId> {
        let mut nodes = self.increments.modified_by_nodes();
        nodes.extend(self.decrements.modified_by_nodes());
        nodes
    }

    fn need_pruning_from(&self, removed: &NodeId) -> bool {
        self.increments.need_pruning_from(removed) || self.decrements.need_pruning_from(removed)
    }

    fn prune(&self, removed: &NodeId, collapse_into: &NodeId) -> Self {
        Self {
            increments: self.increments.prune(removed, collapse_into),
            decrements: self.decrements.prune(removed, collapse_into),
        }
    }

    fn prune_cleanup(&self, removed: &NodeId) -> Self {
        Self {
            increments: self.increments.prune_cleanup(removed),
            decrements: self.decrements.prune_cleanup(removed),
        }
    }
}
