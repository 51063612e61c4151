//! Per-key replicated state: the data (or its tombstone), removed-node
//! pruning markers and delta sequence bookkeeping.

use ddata_core::data::{ReplicatedData, ReplicatedDelta};
use ddata_core::error::Result;
use ddata_core::node::NodeId;
use ddata_core::pruning::RemovedNodePruning;
use ddata_core::version_vector::VersionVector;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Progress of pruning one removed node out of one key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PruningState {
    /// `owner` will collapse the removed node's contribution into its own
    /// once every member is in `seen`.
    Initialized {
        owner: NodeId,
        seen: BTreeSet<NodeId>,
    },
    /// Pruning happened. Kept until `obsolete_time` so stale data from the
    /// removed node is cleaned on merge.
    Performed { obsolete_time: i64 },
}

impl PruningState {
    pub fn initialized(owner: NodeId) -> Self {
        PruningState::Initialized {
            owner,
            seen: BTreeSet::new(),
        }
    }

    pub fn merge(&self, other: &PruningState) -> PruningState {
        match (self, other) {
            (
                PruningState::Performed { obsolete_time: a },
                PruningState::Performed { obsolete_time: b },
            ) => {
                if a >= b {
                    self.clone()
                } else {
                    other.clone()
                }
            }
            (PruningState::Performed { .. }, _) => self.clone(),
            (_, PruningState::Performed { .. }) => other.clone(),
            (
                PruningState::Initialized {
                    owner: this_owner,
                    seen: this_seen,
                },
                PruningState::Initialized {
                    owner: that_owner,
                    seen: that_seen,
                },
            ) => {
                if this_owner == that_owner {
                    PruningState::Initialized {
                        owner: this_owner.clone(),
                        seen: this_seen.union(that_seen).cloned().collect(),
                    }
                } else if this_owner > that_owner {
                    other.clone()
                } else {
                    self.clone()
                }
            }
        }
    }

    /// Record that `node` has observed an initialized marker. Returns `None`
    /// when nothing changed.
    pub fn add_seen(&self, node: &NodeId) -> Option<PruningState> {
        match self {
            PruningState::Initialized { owner, seen } => {
                if owner == node || seen.contains(node) {
                    None
                } else {
                    let mut seen = seen.clone();
                    seen.insert(node.clone());
                    Some(PruningState::Initialized {
                        owner: owner.clone(),
                        seen,
                    })
                }
            }
            PruningState::Performed { .. } => None,
        }
    }

    pub fn is_obsolete(&self, now: i64) -> bool {
        matches!(self, PruningState::Performed { obsolete_time } if *obsolete_time <= now)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EnvelopeData {
    Data(ReplicatedData),
    Deleted,
}

impl EnvelopeData {
    pub fn as_data(&self) -> Option<&ReplicatedData> {
        match self {
            EnvelopeData::Data(data) => Some(data),
            EnvelopeData::Deleted => None,
        }
    }
}

pub type PruningMap = BTreeMap<NodeId, PruningState>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataEnvelope {
    pub data: EnvelopeData,
    #[serde(default)]
    pub pruning: PruningMap,
    #[serde(default)]
    pub delta_versions: VersionVector,
}

fn merge_pruning(a: &PruningMap, b: &PruningMap, now: i64) -> PruningMap {
    let mut merged = b.clone();
    for (removed, state) in a {
        let state = match merged.get(removed) {
            Some(existing) => state.merge(existing),
            None => state.clone(),
        };
        merged.insert(removed.clone(), state);
    }
    merged.retain(|_, state| !state.is_obsolete(now));
    merged
}

/// Remove contributions of nodes whose pruning has been performed.
fn cleaned(data: &ReplicatedData, pruning: &PruningMap) -> ReplicatedData {
    pruning
        .iter()
        .fold(data.clone(), |acc, (removed, state)| match state {
            PruningState::Performed { .. } if acc.need_pruning_from(removed) => {
                acc.prune_cleanup(removed)
            }
            _ => acc,
        })
}

fn cleaned_delta_versions(versions: &VersionVector, pruning: &PruningMap) -> VersionVector {
    pruning
        .iter()
        .fold(versions.clone(), |acc, (removed, state)| match state {
            PruningState::Performed { .. } => acc.prune_cleanup(removed),
            PruningState::Initialized { .. } => acc,
        })
}

impl DataEnvelope {
    pub fn new(data: ReplicatedData) -> Self {
        Self {
            data: EnvelopeData::Data(data),
            pruning: BTreeMap::new(),
            delta_versions: VersionVector::new(),
        }
    }

    pub fn deleted() -> Self {
        Self {
            data: EnvelopeData::Deleted,
            pruning: BTreeMap::new(),
            delta_versions: VersionVector::new(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self.data, EnvelopeData::Deleted)
    }

    pub fn value(&self) -> Option<&ReplicatedData> {
        self.data.as_data()
    }

    pub fn with_data(&self, data: ReplicatedData) -> Self {
        Self {
            data: EnvelopeData::Data(data),
            pruning: self.pruning.clone(),
            delta_versions: self.delta_versions.clone(),
        }
    }

    pub fn without_delta_versions(&self) -> Self {
        Self {
            data: self.data.clone(),
            pruning: self.pruning.clone(),
            delta_versions: VersionVector::new(),
        }
    }

    /// Join with another envelope of the same key. A tombstone on either side
    /// wins. Fails if both carry data of different types.
    pub fn merge(&self, other: &DataEnvelope, now: i64) -> Result<DataEnvelope> {
        let (ours, theirs) = match (&self.data, &other.data) {
            (EnvelopeData::Deleted, _) | (_, EnvelopeData::Deleted) => {
                return Ok(DataEnvelope::deleted())
            }
            (EnvelopeData::Data(ours), EnvelopeData::Data(theirs)) => (ours, theirs),
        };

        let pruning = merge_pruning(&self.pruning, &other.pruning, now);
        let delta_versions = cleaned_delta_versions(&self.delta_versions, &self.pruning)
            .merge(&cleaned_delta_versions(&other.delta_versions, &other.pruning));
        let data = cleaned(ours, &pruning).merge(&cleaned(theirs, &pruning))?;
        Ok(DataEnvelope {
            data: EnvelopeData::Data(data),
            pruning,
            delta_versions,
        })
    }

    /// Join a locally modified value into this envelope.
    pub fn merge_data(&self, other: &ReplicatedData) -> Result<DataEnvelope> {
        match &self.data {
            EnvelopeData::Deleted => Ok(self.clone()),
            EnvelopeData::Data(ours) => {
                let merged = cleaned(ours, &self.pruning).merge(&cleaned(other, &self.pruning))?;
                Ok(self.with_data(merged))
            }
        }
    }

    /// Apply a propagated delta.
    pub fn merge_delta(&self, delta: &DeltaEnvelope, now: i64) -> Result<DataEnvelope> {
        let ours = match &self.data {
            EnvelopeData::Deleted => return Ok(self.clone()),
            EnvelopeData::Data(ours) => ours,
        };
        let pruning = merge_pruning(&self.pruning, &delta.pruning, now);
        let delta_versions = cleaned_delta_versions(&self.delta_versions, &self.pruning)
            .merge(&delta.delta_versions);
        let data = cleaned(&cleaned(ours, &pruning).merge_delta(&delta.delta)?, &pruning);
        Ok(DataEnvelope {
            data: EnvelopeData::Data(data),
            pruning,
            delta_versions,
        })
    }

    /// Mark every initialized pruning marker as observed by `node`.
    pub fn add_seen(&self, node: &NodeId) -> DataEnvelope {
        let mut changed = false;
        let pruning = self
            .pruning
            .iter()
            .map(|(removed, state)| match state.add_seen(node) {
                Some(updated) => {
                    changed = true;
                    (removed.clone(), updated)
                }
                None => (removed.clone(), state.clone()),
            })
            .collect();
        if changed {
            DataEnvelope {
                data: self.data.clone(),
                pruning,
                delta_versions: self.delta_versions.clone(),
            }
        } else {
            self.clone()
        }
    }

    pub fn need_pruning_from(&self, removed: &NodeId) -> bool {
        self.value()
            .is_some_and(|data| data.need_pruning_from(removed))
    }

    pub fn init_removed_node_pruning(&self, removed: &NodeId, owner: &NodeId) -> DataEnvelope {
        let mut pruning = self.pruning.clone();
        pruning.insert(removed.clone(), PruningState::initialized(owner.clone()));
        DataEnvelope {
            data: self.data.clone(),
            pruning,
            delta_versions: self.delta_versions.clone(),
        }
    }

    /// Collapse `removed` into the owner of its initialized marker and flip
    /// the marker to performed. Does nothing unless the marker is
    /// initialized.
    pub fn prune(&self, removed: &NodeId, obsolete_time: i64) -> DataEnvelope {
        let (data, owner) = match (&self.data, self.pruning.get(removed)) {
            (EnvelopeData::Data(data), Some(PruningState::Initialized { owner, .. })) => {
                (data, owner)
            }
            _ => return self.clone(),
        };
        let mut pruning = self.pruning.clone();
        pruning.insert(removed.clone(), PruningState::Performed { obsolete_time });
        DataEnvelope {
            data: EnvelopeData::Data(data.prune(removed, owner)),
            pruning,
            delta_versions: self.delta_versions.prune_cleanup(removed),
        }
    }
}

/// Envelope around a propagated delta. Carries the sender's pruning state so
/// a delta built on pruned data is cleaned the same way at the receiver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeltaEnvelope {
    pub delta: ReplicatedDelta,
    #[serde(default)]
    pub pruning: PruningMap,
    #[serde(default)]
    pub delta_versions: VersionVector,
}

impl DeltaEnvelope {
    pub fn new(delta: ReplicatedDelta, pruning: PruningMap) -> Self {
        Self {
            delta,
            pruning,
            delta_versions: VersionVector::new(),
        }
    }

    /// Full envelope for a key that has no local state yet.
    pub fn into_envelope(self) -> Result<DataEnvelope> {
        let data = self.delta.zero().merge_delta(&self.delta)?;
        Ok(DataEnvelope {
            data: EnvelopeData::Data(data),
            pruning: self.pruning,
            delta_versions: self.delta_versions,
        })
    }
}
