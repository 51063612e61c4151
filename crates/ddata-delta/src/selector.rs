//! Delta propagation selection.
//!
//! Local mutations append one delta per key under a monotonically increasing
//! sequence number. Every propagation tick a round-robin slice of the other
//! nodes is chosen, and each selected node receives, per key, the merged
//! group of deltas it has not been sent yet:
//!
//! ```text
//! On update(key, d):
//!   seq[key] += 1
//!   log[key][seq[key]] = d
//!
//! On tick:
//!   for node in slice(all_nodes):
//!     for key in log:
//!       j = sent[key][node]
//!       group = ⊔ log[key][j+1..]          // cached per (key, from, to)
//!       sent[key][node] = last seq in log[key]
//!
//! On cleanup:
//!   drop log[key][..=min over all nodes of sent[key][node]]
//! ```
//!
//! A merged group that grows past `max_delta_size` operations is replaced by
//! [`DeltaSlot::NoDelta`], telling the receiver to wait for full state.

use ddata_core::lattice::DeltaOp;
use ddata_core::node::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Delta sequence number, per key
pub type SeqNr = u64;

/// Upper bound on the number of nodes receiving deltas per tick.
pub const MAX_NODES_PER_TICK: usize = 10;

/// A logged delta, or the placeholder for one too large to ship.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum DeltaSlot<D> {
    Delta(D),
    NoDelta,
}

impl<D: DeltaOp> DeltaSlot<D> {
    /// `delta` if it holds fewer than `max_delta_size` operations,
    /// otherwise the placeholder.
    pub fn bounded(delta: D, max_delta_size: usize) -> Self {
        if delta.op_count() < max_delta_size {
            DeltaSlot::Delta(delta)
        } else {
            DeltaSlot::NoDelta
        }
    }

    fn merge(&self, later: &DeltaSlot<D>, max_delta_size: usize) -> DeltaSlot<D> {
        match (self, later) {
            (DeltaSlot::Delta(a), DeltaSlot::Delta(b)) => {
                DeltaSlot::bounded(a.merge_op(b), max_delta_size)
            }
            _ => DeltaSlot::NoDelta,
        }
    }
}

/// Merged deltas for one key covering `from_seq_nr..=to_seq_nr`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeltaGroup<D> {
    pub slot: DeltaSlot<D>,
    pub from_seq_nr: SeqNr,
    pub to_seq_nr: SeqNr,
}

/// Per-node output of one propagation tick: key id to merged delta group.
pub type Propagations<D> = BTreeMap<NodeId, BTreeMap<String, DeltaGroup<D>>>;

#[derive(Debug, Clone)]
pub struct DeltaPropagationSelector<D> {
    gossip_interval_divisor: usize,
    max_delta_size: usize,
    propagation_count: u64,
    round_robin_counter: u64,
    delta_counter: BTreeMap<String, SeqNr>,
    delta_entries: BTreeMap<String, BTreeMap<SeqNr, DeltaSlot<D>>>,
    delta_sent_to_node: BTreeMap<String, BTreeMap<NodeId, SeqNr>>,
}

impl<D: DeltaOp> DeltaPropagationSelector<D> {
    pub fn new(gossip_interval_divisor: usize, max_delta_size: usize) -> Self {
        Self {
            gossip_interval_divisor: gossip_interval_divisor.max(1),
            max_delta_size,
            propagation_count: 0,
            round_robin_counter: 0,
            delta_counter: BTreeMap::new(),
            delta_entries: BTreeMap::new(),
            delta_sent_to_node: BTreeMap::new(),
        }
    }

    pub fn gossip_interval_divisor(&self) -> usize {
        self.gossip_interval_divisor
    }

    /// Number of propagation ticks so far.
    pub fn propagation_count(&self) -> u64 {
        self.propagation_count
    }

    /// Latest sequence number assigned for `key`, 0 if none.
    pub fn current_version(&self, key: &str) -> SeqNr {
        self.delta_counter.get(key).copied().unwrap_or(0)
    }

    /// Append a delta for `key`. Returns its sequence number.
    pub fn update(&mut self, key: &str, slot: DeltaSlot<D>) -> SeqNr {
        let seq = self.current_version(key) + 1;
        self.delta_counter.insert(key.to_string(), seq);
        self.delta_entries
            .entry(key.to_string())
            .or_default()
            .insert(seq, slot);
        seq
    }

    /// Forget everything about a deleted key.
    pub fn delete(&mut self, key: &str) {
        self.delta_entries.remove(key);
        self.delta_counter.remove(key);
        self.delta_sent_to_node.remove(key);
    }

    pub fn has_delta_entries(&self, key: &str) -> bool {
        self.delta_entries
            .get(key)
            .is_some_and(|entries| !entries.is_empty())
    }

    pub fn has_any_delta_entries(&self) -> bool {
        self.delta_entries.values().any(|entries| !entries.is_empty())
    }

    /// Between 2 and 10 nodes, roughly `1/divisor` of the cluster.
    pub fn nodes_slice_size(&self, all_nodes: usize) -> usize {
        (all_nodes / self.gossip_interval_divisor + 1)
            .max(2)
            .min(all_nodes.min(MAX_NODES_PER_TICK))
    }

    fn next_slice(&mut self, all_nodes: &[NodeId]) -> Vec<NodeId> {
        let size = self.nodes_slice_size(all_nodes.len());
        if all_nodes.len() <= size {
            return all_nodes.to_vec();
        }
        let start = (self.round_robin_counter % all_nodes.len() as u64) as usize;
        self.round_robin_counter += size as u64;
        all_nodes.iter().cycle().skip(start).take(size).cloned().collect()
    }

    fn merge_group(&self, entries: &[&DeltaSlot<D>]) -> DeltaSlot<D> {
        let mut iter = entries.iter();
        let Some(first) = iter.next() else {
            return DeltaSlot::NoDelta;
        };
        iter.fold((*first).clone(), |acc, next| acc.merge(next, self.max_delta_size))
    }

    /// Select this tick's nodes and collect, for each, the deltas not yet
    /// sent to it. `all_nodes` are the other members of the cluster, in a
    /// stable order. Nodes with nothing new are left out.
    pub fn collect_propagations(&mut self, all_nodes: &[NodeId]) -> Propagations<D> {
        self.propagation_count += 1;
        let mut result = BTreeMap::new();
        if all_nodes.is_empty() {
            return result;
        }

        let slice = self.next_slice(all_nodes);
        let mut cache: BTreeMap<(String, SeqNr, SeqNr), DeltaSlot<D>> = BTreeMap::new();

        for node in slice {
            let mut deltas = BTreeMap::new();
            for (key, entries) in &self.delta_entries {
                let sent = self
                    .delta_sent_to_node
                    .get(key)
                    .and_then(|m| m.get(&node))
                    .copied()
                    .unwrap_or(0);
                let pending: Vec<(&SeqNr, &DeltaSlot<D>)> =
                    entries.range(sent + 1..).collect();
                let (from, to) = match (pending.first(), pending.last()) {
                    (Some(first), Some(last)) => (*first.0, *last.0),
                    _ => continue,
                };

                let cache_key = (key.clone(), from, to);
                let slot = match cache.get(&cache_key) {
                    Some(cached) => cached.clone(),
                    None => {
                        let slots: Vec<&DeltaSlot<D>> = pending.iter().map(|(_, s)| *s).collect();
                        let merged = self.merge_group(&slots);
                        cache.insert(cache_key, merged.clone());
                        merged
                    }
                };
                deltas.insert(
                    key.clone(),
                    DeltaGroup {
                        slot,
                        from_seq_nr: from,
                        to_seq_nr: to,
                    },
                );
            }

            for (key, group) in &deltas {
                self.delta_sent_to_node
                    .entry(key.clone())
                    .or_default()
                    .insert(node.clone(), group.to_seq_nr);
            }
            if !deltas.is_empty() {
                result.insert(node, deltas);
            }
        }
        result
    }

    fn smallest_version_sent_to_all(&self, key: &str, all_nodes: &[NodeId]) -> SeqNr {
        match self.delta_sent_to_node.get(key) {
            None => 0,
            Some(sent) if sent.is_empty() => 0,
            Some(sent) if all_nodes.iter().any(|n| !sent.contains_key(n)) => 0,
            Some(sent) => sent.values().copied().min().unwrap_or(0),
        }
    }

    /// Drop logged deltas that every node has been sent.
    pub fn cleanup_delta_entries(&mut self, all_nodes: &[NodeId]) {
        if all_nodes.is_empty() {
            self.delta_entries.clear();
            return;
        }
        let floors: Vec<(String, SeqNr)> = self
            .delta_entries
            .keys()
            .map(|key| (key.clone(), self.smallest_version_sent_to_all(key, all_nodes)))
            .collect();
        for (key, floor) in floors {
            if let Some(entries) = self.delta_entries.get_mut(&key) {
                entries.retain(|seq, _| *seq > floor);
            }
        }
    }

    /// Forget what was sent to a node that left the cluster.
    pub fn cleanup_removed_node(&mut self, node: &NodeId) {
        for sent in self.delta_sent_to_node.values_mut() {
            sent.remove(node);
        }
    }

    pub fn delta_entry_count(&self, key: &str) -> usize {
        self.delta_entries.get(key).map_or(0, |entries| entries.len())
    }
}
