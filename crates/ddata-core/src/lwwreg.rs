//! Last-Writer-Wins register.
//!
//! Holds a single value stamped with a wall-clock timestamp and the node that
//! wrote it. The higher timestamp wins a merge; equal timestamps are broken by
//! the lower node id. Correctness depends on reasonably synchronized clocks,
//! so a custom clock can be supplied per write.

use crate::lattice::DeltaOp;
use crate::node::NodeId;
use crate::ormap::MapValue;
use crate::pruning::RemovedNodePruning;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Computes the timestamp of a new write from the current timestamp and the
/// value being written.
pub type Clock<T> = fn(i64, &T) -> i64;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LWWRegister<T> {
    node: NodeId,
    value: T,
    timestamp: i64,
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Wall-clock milliseconds, never going backwards relative to the current
/// timestamp.
pub fn default_clock<T>(current: i64, _value: &T) -> i64 {
    now_millis().max(current.saturating_add(1))
}

/// Clock under which the first write wins.
pub fn reverse_clock<T>(current: i64, _value: &T) -> i64 {
    (-now_millis()).min(current.saturating_sub(1))
}

impl<T: Clone> LWWRegister<T> {
    pub fn new(node: &NodeId, value: T) -> Self {
        Self::with_clock(node, value, default_clock)
    }

    pub fn with_clock(node: &NodeId, value: T, clock: Clock<T>) -> Self {
        let timestamp = clock(0, &value);
        Self {
            node: node.clone(),
            value,
            timestamp,
        }
    }

    /// Register with an explicit timestamp.
    pub fn with_timestamp(node: &NodeId, value: T, timestamp: i64) -> Self {
        Self {
            node: node.clone(),
            value,
            timestamp,
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Node that wrote the current value.
    pub fn updated_by(&self) -> &NodeId {
        &self.node
    }

    pub fn set(&mut self, node: &NodeId, value: T) {
        self.set_with_clock(node, value, default_clock);
    }

    pub fn set_with_clock(&mut self, node: &NodeId, value: T, clock: Clock<T>) {
        self.timestamp = clock(self.timestamp, &value);
        self.node = node.clone();
        self.value = value;
    }

    pub fn merge(&self, other: &Self) -> Self {
        if other.timestamp > self.timestamp {
            other.clone()
        } else if other.timestamp < self.timestamp {
            self.clone()
        } else if other.node < self.node {
            other.clone()
        } else {
            self.clone()
        }
    }
}

impl<T: Clone> DeltaOp for LWWRegister<T> {
    fn merge_op(&self, later: &Self) -> Self {
        self.merge(later)
    }
}

/// The writer node is not merged state; nothing to prune.
impl<T: Clone> RemovedNodePruning for LWWRegister<T> {
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

impl<T: Clone + fmt::Debug + PartialEq> MapValue for LWWRegister<T> {
    type Delta = LWWRegister<T>;

    fn merge_value(&self, other: &Self) -> Self {
        self.merge(other)
    }

    fn value_delta(&self) -> Option<Self> {
        None
    }

    fn reset_value_delta(&mut self) {}

    fn merge_value_delta(&self, delta: &Self) -> Self {
        self.merge(delta)
    }

    fn zero_for(delta: &Self) -> Self {
        delta.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> NodeId {
        NodeId::new(id)
    }

    #[test]
    fn later_timestamp_wins() {
        let older = LWWRegister::with_timestamp(&node("b"), "old", 10);
        let newer = LWWRegister::with_timestamp(&node("c"), "new", 20);
        assert_eq!(older.merge(&newer).value(), &"new");
        assert_eq!(newer.merge(&older).value(), &"new");
    }

    #[test]
    fn tie_goes_to_lower_node() {
        let a = LWWRegister::with_timestamp(&node("a"), 1, 5);
        let b = LWWRegister::with_timestamp(&node("b"), 2, 5);
        assert_eq!(a.merge(&b).value(), &1);
        assert_eq!(b.merge(&a).value(), &1);
    }

    #[test]
    fn set_never_moves_timestamp_backwards() {
        let mut reg = LWWRegister::with_timestamp(&node("a"), 0, i64::MAX - 10);
        reg.set(&node("a"), 1);
        assert_eq!(reg.timestamp(), i64::MAX - 9);
        assert_eq!(reg.value(), &1);
    }

    #[test]
    fn reverse_clock_keeps_first_write() {
        let mut first = LWWRegister::with_clock(&node("a"), "first", reverse_clock);
        let second = {
            let mut reg = first.clone();
            reg.set_with_clock(&node("b"), "second", reverse_clock);
            reg
        };
        first = first.merge(&second);
        assert_eq!(first.value(), &"first");
    }
}
