//! ddata Delta - choosing which deltas go to which node
//!
//! Deltas of local mutations are logged per key with a sequence number and
//! shipped to a rotating slice of the cluster every propagation tick. The
//! receiver uses the `(from, to)` sequence range to detect gaps for deltas
//! that require causal delivery.
//!
//! # Example
//!
//! ```rust
//! use ddata_core::gset::GSet;
//! use ddata_core::node::NodeId;
//! use ddata_delta::selector::{DeltaPropagationSelector, DeltaSlot};
//!
//! let mut selector: DeltaPropagationSelector<GSet<i32>> = DeltaPropagationSelector::new(5, 50);
//! selector.update("key", DeltaSlot::Delta([1].into_iter().collect()));
//!
//! let peers = vec![NodeId::new("b"), NodeId::new("c")];
//! let out = selector.collect_propagations(&peers);
//! assert_eq!(out.len(), 2);
//! ```

pub mod selector;

pub use selector::{DeltaGroup, DeltaPropagationSelector, DeltaSlot, Propagations, SeqNr};
