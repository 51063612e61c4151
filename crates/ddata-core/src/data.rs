//! The closed set of replicated data types and their deltas.
//!
//! The replicator stores every key as a [`ReplicatedData`] and dispatches
//! merges by variant. Merging two different variants is a type mismatch,
//! which the replicator reports instead of merging.

use crate::error::{CrdtError, Result};
use crate::flag::Flag;
use crate::gcounter::GCounter;
use crate::gset::GSet;
use crate::lattice::{DeltaCrdt, DeltaOp, Lattice};
use crate::lwwmap::{LWWMap, LWWMapDelta};
use crate::lwwreg::LWWRegister;
use crate::node::NodeId;
use crate::ormap::{MapValue, ORMap, ORMapDelta};
use crate::ormultimap::{ORMultiMap, ORMultiMapDelta};
use crate::orset::{ORSet, ORSetDelta};
use crate::pncounter::PNCounter;
use crate::pncountermap::{PNCounterMap, PNCounterMapDelta};
use crate::pruning::RemovedNodePruning;
use crate::version_vector::VersionVector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ReplicatedData {
    GCounter(GCounter),
    PNCounter(PNCounter),
    GSet(GSet<String>),
    ORSet(ORSet<String>),
    ORMap(ORMap<String, ReplicatedData>),
    ORMultiMap(ORMultiMap<String, String>),
    LWWRegister(LWWRegister<String>),
    LWWMap(LWWMap<String, String>),
    PNCounterMap(PNCounterMap<String>),
    Flag(Flag),
    VersionVector(VersionVector),
}

/// Delta of a [`ReplicatedData`] mutation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "delta")]
pub enum ReplicatedDelta {
    GCounter(GCounter),
    PNCounter(PNCounter),
    GSet(GSet<String>),
    ORSet(ORSetDelta<String>),
    ORMap(ORMapDelta<String, ReplicatedData>),
    ORMultiMap(ORMultiMapDelta<String, String>),
    LWWMap(LWWMapDelta<String, String>),
    PNCounterMap(PNCounterMapDelta<String>),
}

impl ReplicatedData {
    pub fn type_name(&self) -> &'static str {
        match self {
            ReplicatedData::GCounter(_) => "GCounter",
            ReplicatedData::PNCounter(_) => "PNCounter",
            ReplicatedData::GSet(_) => "GSet",
            ReplicatedData::ORSet(_) => "ORSet",
            ReplicatedData::ORMap(_) => "ORMap",
            ReplicatedData::ORMultiMap(_) => "ORMultiMap",
            ReplicatedData::LWWRegister(_) => "LWWRegister",
            ReplicatedData::LWWMap(_) => "LWWMap",
            ReplicatedData::PNCounterMap(_) => "PNCounterMap",
            ReplicatedData::Flag(_) => "Flag",
            ReplicatedData::VersionVector(_) => "VersionVector",
        }
    }

    fn mismatch(&self, other: &ReplicatedData) -> CrdtError {
        CrdtError::TypeMismatch {
            expected: self.type_name(),
            found: other.type_name(),
        }
    }

    /// Join two values of the same variant.
    pub fn merge(&self, other: &ReplicatedData) -> Result<ReplicatedData> {
        let merged = match (self, other) {
            (Self::GCounter(a), Self::GCounter(b)) => Self::GCounter(a.join(b)),
            (Self::PNCounter(a), Self::PNCounter(b)) => Self::PNCounter(a.join(b)),
            (Self::GSet(a), Self::GSet(b)) => Self::GSet(a.join(b)),
            (Self::ORSet(a), Self::ORSet(b)) => Self::ORSet(a.join(b)),
            (Self::ORMap(a), Self::ORMap(b)) => Self::ORMap(a.join(b)),
            (Self::ORMultiMap(a), Self::ORMultiMap(b)) => Self::ORMultiMap(a.join(b)),
            (Self::LWWRegister(a), Self::LWWRegister(b)) => Self::LWWRegister(a.merge(b)),
            (Self::LWWMap(a), Self::LWWMap(b)) => Self::LWWMap(a.join(b)),
            (Self::PNCounterMap(a), Self::PNCounterMap(b)) => Self::PNCounterMap(a.join(b)),
            (Self::Flag(a), Self::Flag(b)) => Self::Flag(a.join(b)),
            (Self::VersionVector(a), Self::VersionVector(b)) => Self::VersionVector(a.join(b)),
            _ => return Err(self.mismatch(other)),
        };
        Ok(merged)
    }

    /// Whether this variant records deltas of its mutations.
    pub fn supports_delta(&self) -> bool {
        !matches!(
            self,
            ReplicatedData::LWWRegister(_) | ReplicatedData::Flag(_) | ReplicatedData::VersionVector(_)
        )
    }

    pub fn delta(&self) -> Option<ReplicatedDelta> {
        match self {
            ReplicatedData::GCounter(d) => d.delta().map(ReplicatedDelta::GCounter),
            ReplicatedData::PNCounter(d) => d.delta().map(ReplicatedDelta::PNCounter),
            ReplicatedData::GSet(d) => d.delta().map(ReplicatedDelta::GSet),
            ReplicatedData::ORSet(d) => d.delta().map(ReplicatedDelta::ORSet),
            ReplicatedData::ORMap(d) => d.delta().map(ReplicatedDelta::ORMap),
            ReplicatedData::ORMultiMap(d) => d.delta().map(ReplicatedDelta::ORMultiMap),
            ReplicatedData::LWWMap(d) => d.delta().map(ReplicatedDelta::LWWMap),
            ReplicatedData::PNCounterMap(d) => d.delta().map(ReplicatedDelta::PNCounterMap),
            ReplicatedData::LWWRegister(_)
            | ReplicatedData::Flag(_)
            | ReplicatedData::VersionVector(_) => None,
        }
    }

    pub fn reset_delta(&mut self) {
        match self {
            ReplicatedData::GCounter(d) => d.reset_delta(),
            ReplicatedData::PNCounter(d) => d.reset_delta(),
            ReplicatedData::GSet(d) => d.reset_delta(),
            ReplicatedData::ORSet(d) => d.reset_delta(),
            ReplicatedData::ORMap(d) => d.reset_delta(),
            ReplicatedData::ORMultiMap(d) => d.reset_delta(),
            ReplicatedData::LWWMap(d) => d.reset_delta(),
            ReplicatedData::PNCounterMap(d) => d.reset_delta(),
            ReplicatedData::LWWRegister(_)
            | ReplicatedData::Flag(_)
            | ReplicatedData::VersionVector(_) => {}
        }
    }

    pub fn merge_delta(&self, delta: &ReplicatedDelta) -> Result<ReplicatedData> {
        let merged = match (self, delta) {
            (ReplicatedData::GCounter(a), ReplicatedDelta::GCounter(d)) => {
                ReplicatedData::GCounter(a.merge_delta(d))
            }
            (ReplicatedData::PNCounter(a), ReplicatedDelta::PNCounter(d)) => {
                ReplicatedData::PNCounter(a.merge_delta(d))
            }
            (ReplicatedData::GSet(a), ReplicatedDelta::GSet(d)) => {
                ReplicatedData::GSet(a.merge_delta(d))
            }
            (ReplicatedData::ORSet(a), ReplicatedDelta::ORSet(d)) => {
                ReplicatedData::ORSet(a.merge_delta(d))
            }
            (ReplicatedData::ORMap(a), ReplicatedDelta::ORMap(d)) => {
                ReplicatedData::ORMap(a.merge_delta(d))
            }
            (ReplicatedData::ORMultiMap(a), ReplicatedDelta::ORMultiMap(d)) => {
                ReplicatedData::ORMultiMap(a.merge_delta(d))
            }
            (ReplicatedData::LWWMap(a), ReplicatedDelta::LWWMap(d)) => {
                ReplicatedData::LWWMap(a.merge_delta(d))
            }
            (ReplicatedData::PNCounterMap(a), ReplicatedDelta::PNCounterMap(d)) => {
                ReplicatedData::PNCounterMap(a.merge_delta(d))
            }
            _ => {
                return Err(CrdtError::DeltaTypeMismatch {
                    data: self.type_name(),
                    delta: delta.type_name(),
                })
            }
        };
        Ok(merged)
    }
}

impl ReplicatedDelta {
    pub fn type_name(&self) -> &'static str {
        match self {
            ReplicatedDelta::GCounter(_) => "GCounter",
            ReplicatedDelta::PNCounter(_) => "PNCounter",
            ReplicatedDelta::GSet(_) => "GSet",
            ReplicatedDelta::ORSet(_) => "ORSet",
            ReplicatedDelta::ORMap(_) => "ORMap",
            ReplicatedDelta::ORMultiMap(_) => "ORMultiMap",
            ReplicatedDelta::LWWMap(_) => "LWWMap",
            ReplicatedDelta::PNCounterMap(_) => "PNCounterMap",
        }
    }

    /// Empty value of the type this delta applies to.
    pub fn zero(&self) -> ReplicatedData {
        match self {
            ReplicatedDelta::GCounter(_) => ReplicatedData::GCounter(GCounter::new()),
            ReplicatedDelta::PNCounter(_) => ReplicatedData::PNCounter(PNCounter::new()),
            ReplicatedDelta::GSet(_) => ReplicatedData::GSet(GSet::new()),
            ReplicatedDelta::ORSet(_) => ReplicatedData::ORSet(ORSet::new()),
            ReplicatedDelta::ORMap(_) => ReplicatedData::ORMap(ORMap::new()),
            ReplicatedDelta::ORMultiMap(_) => ReplicatedData::ORMultiMap(ORMultiMap::new()),
            ReplicatedDelta::LWWMap(_) => ReplicatedData::LWWMap(LWWMap::new()),
            ReplicatedDelta::PNCounterMap(_) => ReplicatedData::PNCounterMap(PNCounterMap::new()),
        }
    }

    /// Deltas of non-causal types are themselves full values and can be
    /// replicated as a plain write.
    pub fn as_full_data(&self) -> Option<ReplicatedData> {
        match self {
            ReplicatedDelta::GCounter(d) => Some(ReplicatedData::GCounter(d.clone())),
            ReplicatedDelta::PNCounter(d) => Some(ReplicatedData::PNCounter(d.clone())),
            ReplicatedDelta::GSet(d) => Some(ReplicatedData::GSet(d.clone())),
            _ => None,
        }
    }
}

impl DeltaOp for ReplicatedDelta {
    fn merge_op(&self, later: &Self) -> Self {
        match (self, later) {
            (Self::GCounter(a), Self::GCounter(b)) => Self::GCounter(a.merge_op(b)),
            (Self::PNCounter(a), Self::PNCounter(b)) => Self::PNCounter(a.merge_op(b)),
            (Self::GSet(a), Self::GSet(b)) => Self::GSet(a.merge_op(b)),
            (Self::ORSet(a), Self::ORSet(b)) => Self::ORSet(a.merge_op(b)),
            (Self::ORMap(a), Self::ORMap(b)) => Self::ORMap(a.merge_op(b)),
            (Self::ORMultiMap(a), Self::ORMultiMap(b)) => Self::ORMultiMap(a.merge_op(b)),
            (Self::LWWMap(a), Self::LWWMap(b)) => Self::LWWMap(a.merge_op(b)),
            (Self::PNCounterMap(a), Self::PNCounterMap(b)) => Self::PNCounterMap(a.merge_op(b)),
            // a key never changes type, so the later delta stands alone
            (_, later) => later.clone(),
        }
    }

    fn requires_causal_delivery(&self) -> bool {
        match self {
            ReplicatedDelta::ORSet(d) => d.requires_causal_delivery(),
            ReplicatedDelta::ORMap(d) => d.requires_causal_delivery(),
            ReplicatedDelta::ORMultiMap(d) => d.requires_causal_delivery(),
            ReplicatedDelta::LWWMap(d) => d.requires_causal_delivery(),
            ReplicatedDelta::PNCounterMap(d) => d.requires_causal_delivery(),
            ReplicatedDelta::GCounter(_) | ReplicatedDelta::PNCounter(_) | ReplicatedDelta::GSet(_) => {
                false
            }
        }
    }

    fn op_count(&self) -> usize {
        match self {
            ReplicatedDelta::ORSet(d) => d.op_count(),
            ReplicatedDelta::ORMap(d) => d.op_count(),
            ReplicatedDelta::ORMultiMap(d) => d.op_count(),
            ReplicatedDelta::LWWMap(d) => d.op_count(),
            ReplicatedDelta::PNCounterMap(d) => d.op_count(),
            ReplicatedDelta::GCounter(_) | ReplicatedDelta::PNCounter(_) | ReplicatedDelta::GSet(_) => 1,
        }
    }
}

macro_rules! dispatch {
    ($data:expr, $inner:ident => $body:expr) => {
        match $data {
            ReplicatedData::GCounter($inner) => $body,
            ReplicatedData::PNCounter($inner) => $body,
            ReplicatedData::GSet($inner) => $body,
            ReplicatedData::ORSet($inner) => $body,
            ReplicatedData::ORMap($inner) => $body,
            ReplicatedData::ORMultiMap($inner) => $body,
            ReplicatedData::LWWRegister($inner) => $body,
            ReplicatedData::LWWMap($inner) => $body,
            ReplicatedData::PNCounterMap($inner) => $body,
            ReplicatedData::Flag($inner) => $body,
            ReplicatedData::VersionVector($inner) => $body,
        }
    };
}

macro_rules! dispatch_map {
    ($data:expr, $inner:ident => $body:expr) => {
        match $data {
            ReplicatedData::GCounter($inner) => ReplicatedData::GCounter($body),
            ReplicatedData::PNCounter($inner) => ReplicatedData::PNCounter($body),
            ReplicatedData::GSet($inner) => ReplicatedData::GSet($body),
            ReplicatedData::ORSet($inner) => ReplicatedData::ORSet($body),
            ReplicatedData::ORMap($inner) => ReplicatedData::ORMap($body),
            ReplicatedData::ORMultiMap($inner) => ReplicatedData::ORMultiMap($body),
            ReplicatedData::LWWRegister($inner) => ReplicatedData::LWWRegister($body),
            ReplicatedData::LWWMap($inner) => ReplicatedData::LWWMap($body),
            ReplicatedData::PNCounterMap($inner) => ReplicatedData::PNCounterMap($body),
            ReplicatedData::Flag($inner) => ReplicatedData::Flag($body),
            ReplicatedData::VersionVector($inner) => ReplicatedData::VersionVector($body),
        }
    };
}

impl RemovedNodePruning for ReplicatedData {
    fn modified_by_nodes(&self) -> BTreeSet<NodeId> {
        dispatch!(self, d => d.modified_by_nodes())
    }

    fn need_pruning_from(&self, removed: &NodeId) -> bool {
        dispatch!(self, d => d.need_pruning_from(removed))
    }

    fn prune(&self, removed: &NodeId, collapse_into: &NodeId) -> Self {
        dispatch_map!(self, d => d.prune(removed, collapse_into))
    }

    fn prune_cleanup(&self, removed: &NodeId) -> Self {
        dispatch_map!(self, d => d.prune_cleanup(removed))
    }
}

/// Nested values inside an [`ORMap`] of [`ReplicatedData`]. A mismatched
/// nested merge keeps the local value.
impl MapValue for ReplicatedData {
    type Delta = ReplicatedDelta;

    fn merge_value(&self, other: &Self) -> Self {
        self.merge(other).unwrap_or_else(|_| self.clone())
    }

    fn value_delta(&self) -> Option<ReplicatedDelta> {
        self.delta()
    }

    fn reset_value_delta(&mut self) {
        self.reset_delta();
    }

    fn merge_value_delta(&self, delta: &ReplicatedDelta) -> Self {
        self.merge_delta(delta).unwrap_or_else(|_| self.clone())
    }

    fn zero_for(delta: &ReplicatedDelta) -> Self {
        delta.zero()
    }

    fn is_observed_remove_set(&self) -> bool {
        matches!(self, ReplicatedData::ORSet(_))
    }
}

// ============================================================================
// Typed keys
// ============================================================================

/// A concrete type stored under a [`Key`].
pub trait DataType: Sized {
    const TYPE_NAME: &'static str;

    fn from_data(data: &ReplicatedData) -> Option<&Self>;

    fn from_data_mut(data: &mut ReplicatedData) -> Option<&mut Self>;

    fn into_data(self) -> ReplicatedData;
}

macro_rules! data_type {
    ($variant:ident, $ty:ty) => {
        impl DataType for $ty {
            const TYPE_NAME: &'static str = stringify!($variant);

            fn from_data(data: &ReplicatedData) -> Option<&Self> {
                match data {
                    ReplicatedData::$variant(inner) => Some(inner),
                    _ => None,
                }
            }

            fn from_data_mut(data: &mut ReplicatedData) -> Option<&mut Self> {
                match data {
                    ReplicatedData::$variant(inner) => Some(inner),
                    _ => None,
                }
            }

            fn into_data(self) -> ReplicatedData {
                ReplicatedData::$variant(self)
            }
        }

        impl From<$ty> for ReplicatedData {
            fn from(value: $ty) -> Self {
                ReplicatedData::$variant(value)
            }
        }
    };
}

data_type!(GCounter, GCounter);
data_type!(PNCounter, PNCounter);
data_type!(GSet, GSet<String>);
data_type!(ORSet, ORSet<String>);
data_type!(ORMap, ORMap<String, ReplicatedData>);
data_type!(ORMultiMap, ORMultiMap<String, String>);
data_type!(LWWRegister, LWWRegister<String>);
data_type!(LWWMap, LWWMap<String, String>);
data_type!(PNCounterMap, PNCounterMap<String>);
data_type!(Flag, Flag);
data_type!(VersionVector, VersionVector);

/// Identity of a replicated entry, tagged with the type stored under it.
/// Two keys are equal when their ids are equal.
pub struct Key<T> {
    id: String,
    _type: PhantomData<fn() -> T>,
}

impl<T> Key<T> {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            _type: PhantomData,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl<T: DataType> Key<T> {
    /// View `data` as this key's type.
    pub fn get<'a>(&self, data: &'a ReplicatedData) -> Result<&'a T> {
        T::from_data(data).ok_or(CrdtError::TypeMismatch {
            expected: T::TYPE_NAME,
            found: data.type_name(),
        })
    }
}

impl<T> Clone for Key<T> {
    fn clone(&self) -> Self {
        Self::new(self.id.clone())
    }
}

impl<T> fmt::Debug for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Key").field(&self.id).finish()
    }
}

impl<T> fmt::Display for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

impl<T> PartialEq for Key<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Key<T> {}

impl<T> Hash for Key<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> NodeId {
        NodeId::new(id)
    }

    #[test]
    fn merge_of_different_variants_is_rejected() {
        let counter = ReplicatedData::GCounter(GCounter::new());
        let flag = ReplicatedData::Flag(Flag::new());
        assert_eq!(
            counter.merge(&flag),
            Err(CrdtError::TypeMismatch {
                expected: "GCounter",
                found: "Flag",
            })
        );
    }

    #[test]
    fn delta_dispatch_round_trips() {
        let mut c = GCounter::new();
        c.increment(&node("a"), 3).unwrap();
        let mut data = ReplicatedData::from(c);
        let delta = data.delta().unwrap();
        data.reset_delta();
        assert!(data.delta().is_none());
        assert!(!delta.requires_causal_delivery());

        let replayed = ReplicatedData::GCounter(GCounter::new())
            .merge_delta(&delta)
            .unwrap();
        assert_eq!(replayed, data);
        assert_eq!(delta.as_full_data(), Some(data));
    }

    #[test]
    fn orset_deltas_require_causal_delivery() {
        let mut set = ORSet::new();
        set.add(&node("a"), "x".to_string());
        let data = ReplicatedData::from(set);
        let delta = data.delta().unwrap();
        assert!(delta.requires_causal_delivery());
        assert!(delta.as_full_data().is_none());
    }

    #[test]
    fn nested_map_values_merge() {
        let mut left = ORMap::new();
        let mut counter = GCounter::new();
        counter.increment(&node("a"), 1).unwrap();
        left.put(&node("a"), "c".to_string(), ReplicatedData::from(counter))
            .unwrap();

        let mut right = ORMap::new();
        right
            .put(&node("b"), "f".to_string(), ReplicatedData::from(Flag::enabled()))
            .unwrap();

        let merged = ReplicatedData::ORMap(left).merge(&ReplicatedData::ORMap(right)).unwrap();
        let map = Key::<ORMap<String, ReplicatedData>>::new("m").get(&merged).unwrap();
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn keys_compare_by_id() {
        let a: Key<GCounter> = Key::new("counter");
        let b: Key<GCounter> = Key::new("counter");
        assert_eq!(a, b);
        assert_eq!(a.id(), "counter");

        let data = ReplicatedData::Flag(Flag::new());
        assert!(a.get(&data).is_err());
    }

    #[test]
    fn serde_round_trip_keeps_variant() {
        let mut reg = LWWRegister::new(&node("a"), "v".to_string());
        reg.set(&node("b"), "w".to_string());
        let data = ReplicatedData::from(reg);
        let json = serde_json::to_string(&data).unwrap();
        let back: ReplicatedData = serde_json::from_str(&json).unwrap();
        assert_eq!(back, data);
    }
}
