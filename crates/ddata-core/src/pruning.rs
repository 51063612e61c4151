//! Removed-node pruning contract.
//!
//! Types that keep per-node state (counters, version vectors, dots) grow with
//! every node that ever touched them. When a node leaves the cluster its
//! contribution is folded into a surviving node so that the entry can be
//! dropped. The replicator coordinates when this is safe; the types only
//! implement the structural transformation.

use crate::node::NodeId;
use std::collections::BTreeSet;

pub trait RemovedNodePruning: Sized {
    /// Nodes that have contributed state to this value.
    fn modified_by_nodes(&self) -> BTreeSet<NodeId>;

    /// Whether `removed` still has state in this value.
    fn need_pruning_from(&self, removed: &NodeId) -> bool;

    /// Move the contribution of `removed` into `collapse_into`.
    fn prune(&self, removed: &NodeId, collapse_into: &NodeId) -> Self;

    /// Drop any remaining state of `removed` without moving it. Applied to
    /// stale data arriving after the prune was performed elsewhere.
    fn prune_cleanup(&self, removed: &NodeId) -> Self;
}
