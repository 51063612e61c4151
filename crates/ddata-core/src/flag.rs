//! Flag: a boolean that can only be switched from off to on.

use crate::lattice::{DeltaOp, Lattice};
use crate::node::NodeId;
use crate::ormap::MapValue;
use crate::pruning::RemovedNodePruning;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flag {
    enabled: bool,
}

impl Flag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enabled() -> Self {
        Self { enabled: true }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn switch_on(&mut self) {
        self.enabled = true;
    }
}

impl Lattice for Flag {
    fn bottom() -> Self {
        Self::new()
    }

    fn join(&self, other: &Self) -> Self {
        Self {
            enabled: self.enabled || other.enabled,
        }
    }
}

impl DeltaOp for Flag {
    fn merge_op(&self, later: &Self) -> Self {
        self.join(later)
    }
}

impl RemovedNodePruning for Flag {
    fn modified_by_nodes(&self) -> BTreeSet<NodeId> {
        BTreeSet::new()
    }

    fn need_pruning_from(&self, _removed: &NodeId) -> bool {
        false
    }

    fn prune(&self, _removed: &NodeId, _collapse_into: &NodeId) -> Self {
        *self
    }

    fn prune_cleanup(&self, _removed: &NodeId) -> Self {
        *self
    }
}

impl MapValue for Flag {
    type Delta = Flag;

    fn merge_value(&self, other: &Self) -> Self {
        self.join(other)
    }

    fn value_delta(&self) -> Option<Flag> {
        None
    }

    fn reset_value_delta(&mut self) {}

    fn merge_value_delta(&self, delta: &Flag) -> Self {
        self.join(delta)
    }

    fn zero_for(_delta: &Flag) -> Self {
        Flag::new()
    }
}
