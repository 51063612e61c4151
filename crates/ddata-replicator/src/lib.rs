//! ddata Replicator - eventually consistent replication of CRDTs
//!
//! Each node runs one [`Replicator`] holding a key → [`DataEnvelope`] map.
//! Writes are applied locally and replicated to peers with a requested
//! [`WriteConsistency`]; reads may consult peers according to a
//! [`ReadConsistency`]. In the background, deltas of local updates are
//! pushed to slices of the cluster, full-state digests are gossiped to
//! random peers, and contributions of removed nodes are pruned.
//!
//! The replicator is sans-IO. Drive it with [`spawn_replicator`] on tokio,
//! or deterministically with [`SimulatedCluster`].
//!
//! # Example
//!
//! ```rust
//! use ddata_core::{GCounter, Key};
//! use ddata_replicator::{Response, SimulatedCluster, UpdateResponse, WriteConsistency};
//!
//! let mut cluster = SimulatedCluster::new(3);
//! let key = Key::<GCounter>::new("hits");
//! let a = cluster.node(0);
//!
//! let request = cluster.update(&a, &key, GCounter::new(), WriteConsistency::all(3000), |c, node| {
//!     c.increment(node, 1)
//! });
//! cluster.deliver_all();
//!
//! assert!(matches!(
//!     cluster.response(&request),
//!     Some(Response::Update(UpdateResponse::Success { .. }))
//! ));
//! let b = cluster.node(1);
//! assert_eq!(cluster.local_typed(&b, &key).map(|c| c.value()), Some(1));
//! ```

pub mod aggregator;
pub mod clock;
pub mod config;
pub mod consistency;
pub mod digest;
pub mod durable;
pub mod envelope;
pub mod error;
pub mod message;
pub mod network;
pub mod replicator;
pub mod runtime;
pub mod simulation;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ReplicatorConfig, ReplicatorConfigBuilder};
pub use consistency::{ReadConsistency, WriteConsistency};
pub use digest::Digest;
pub use durable::{DurableStore, MemoryDurableStore};
pub use envelope::{DataEnvelope, DeltaEnvelope, EnvelopeData, PruningState};
pub use error::{ReplicatorError, Result, StoreError, TransportError};
pub use message::{
    Change, Command, DeleteResponse, Effect, Event, GetResponse, KeyId, MemberEvent, PeerMessage,
    RequestId, Response, SubscriberId, Tick, UpdateResponse,
};
pub use network::{MemoryNetwork, MemoryTransport, Transport};
pub use replicator::{Replicator, ReplicatorState};
pub use runtime::{spawn_replicator, ReplicatorHandle, Subscription};
pub use simulation::{NetworkConfig, SimulatedCluster};
