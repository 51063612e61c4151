pub mod data;
pub mod error;
pub mod fast_merge;
pub mod flag;
pub mod gcounter;
pub mod gset;
pub mod lattice;
pub mod lwwmap;
pub mod lwwreg;
pub mod node;
pub mod ormap;
pub mod ormultimap;
pub mod orset;
pub mod pncounter;
pub mod pncountermap;
pub mod pruning;
pub mod version_vector;

pub use data::{DataType, Key, ReplicatedData, ReplicatedDelta};
pub use error::{CrdtError, Result};
pub use flag::Flag;
pub use gcounter::GCounter;
pub use gset::GSet;
pub use lattice::{DeltaCrdt, DeltaOp, Lattice};
pub use lwwmap::LWWMap;
pub use lwwreg::LWWRegister;
pub use node::NodeId;
pub use ormap::{MapValue, ORMap, ORMapDelta};
pub use ormultimap::ORMultiMap;
pub use orset::{ORSet, ORSetDelta};
pub use pncounter::PNCounter;
pub use pncountermap::PNCounterMap;
pub use pruning::RemovedNodePruning;
pub use version_vector::{VersionOrdering, VersionVector};
