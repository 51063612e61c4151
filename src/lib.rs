//! # ddata
//!
//! Replicated, eventually consistent CRDT data store.
//!
//! - [`crdt`]: replicated data types, version vectors and removed-node pruning
//! - [`delta`]: selection of which deltas go to which nodes on each tick
//! - [`replicator`]: the replicator state machine, quorum aggregators, the
//!   tokio driver and the deterministic cluster simulator

pub use ddata_core as crdt;
pub use ddata_delta as delta;
pub use ddata_replicator as replicator;

pub use ddata_core::{DataType, Key, NodeId, ReplicatedData};
pub use ddata_replicator::{
    spawn_replicator, ReadConsistency, Replicator, ReplicatorConfig, ReplicatorHandle,
    SimulatedCluster, WriteConsistency,
};
