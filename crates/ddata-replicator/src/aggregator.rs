//! Quorum aggregators.
//!
//! One aggregator lives per in-flight read or write with a non-local
//! consistency level. It fans the request out to a primary set of replicas,
//! widens to secondaries at `timeout / 5`, collects replies and decides the
//! client response. Aggregators never touch the replicator's data; they
//! return the messages to send and, once finished, the outcome.

use crate::consistency::{ReadConsistency, WriteConsistency};
use crate::envelope::DataEnvelope;
use crate::message::{
    DeleteResponse, DeltaEntry, KeyId, PeerMessage, RequestId, Response, UpdateResponse,
};
use ddata_core::node::NodeId;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Upper bound on nodes contacted only after the secondary deadline.
pub const MAX_SECONDARY_NODES: usize = 10;

/// Messages to send, plus the outcome once the aggregator is finished.
#[derive(Debug)]
pub struct AggregatorStep<R> {
    pub sends: Vec<(NodeId, PeerMessage)>,
    pub done: Option<R>,
}

impl<R> AggregatorStep<R> {
    fn empty() -> Self {
        Self {
            sends: Vec::new(),
            done: None,
        }
    }

    fn finished(done: R) -> Self {
        Self {
            sends: Vec::new(),
            done: Some(done),
        }
    }
}

/// Split `nodes` into those contacted immediately and those held back.
/// Reachable nodes come first. Without `rng` the order is the node order,
/// which keeps causal deltas flowing to the same replicas.
pub fn primary_and_secondary_nodes(
    nodes: &BTreeSet<NodeId>,
    unreachable: &BTreeSet<NodeId>,
    done_when_remaining: isize,
    rng: Option<&mut StdRng>,
) -> (Vec<NodeId>, Vec<NodeId>) {
    let primary_size = nodes.len() as isize - done_when_remaining;
    if primary_size >= nodes.len() as isize {
        return (nodes.iter().cloned().collect(), Vec::new());
    }

    let (mut reachable, mut unreachable_nodes): (Vec<NodeId>, Vec<NodeId>) =
        nodes.iter().cloned().partition(|n| !unreachable.contains(n));
    if let Some(rng) = rng {
        reachable.shuffle(rng);
        unreachable_nodes.shuffle(rng);
    }
    let mut ordered = reachable;
    ordered.extend(unreachable_nodes);

    let split = primary_size.max(0) as usize;
    let secondary = ordered.split_off(split.min(ordered.len()));
    (
        ordered,
        secondary.into_iter().take(MAX_SECONDARY_NODES).collect(),
    )
}

// ============================================================================
// Write
// ============================================================================

#[derive(Debug)]
pub struct WriteAggregator {
    key: KeyId,
    request: RequestId,
    origin: NodeId,
    write: DataEnvelope,
    delta: Option<DeltaEntry>,
    done_when_remaining: isize,
    node_count: usize,
    primary: Vec<NodeId>,
    secondary: Vec<NodeId>,
    remaining: BTreeSet<NodeId>,
    nacks: BTreeSet<NodeId>,
    got_local_store_reply: bool,
    durable: bool,
    timeout_ms: u64,
}

impl WriteAggregator {
    /// `write` is the full envelope; `delta`, when present, is tried first
    /// and replaced by the full write on a `DeltaNack` or at the secondary
    /// deadline.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: KeyId,
        request: RequestId,
        origin: NodeId,
        write: DataEnvelope,
        delta: Option<DeltaEntry>,
        consistency: &WriteConsistency,
        nodes: &BTreeSet<NodeId>,
        unreachable: &BTreeSet<NodeId>,
        durable: bool,
        rng: &mut StdRng,
    ) -> Self {
        let done_when_remaining = consistency.done_when_remaining(nodes.len());
        let shuffle = if delta.is_some() { None } else { Some(rng) };
        let (primary, secondary) =
            primary_and_secondary_nodes(nodes, unreachable, done_when_remaining, shuffle);
        Self {
            key,
            request,
            origin,
            write,
            delta,
            done_when_remaining,
            node_count: nodes.len(),
            primary,
            secondary,
            remaining: nodes.clone(),
            nacks: BTreeSet::new(),
            got_local_store_reply: !durable,
            durable,
            timeout_ms: consistency.timeout_ms(),
        }
    }

    pub fn request(&self) -> RequestId {
        self.request
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn primary_nodes(&self) -> &[NodeId] {
        &self.primary
    }

    pub fn secondary_nodes(&self) -> &[NodeId] {
        &self.secondary
    }

    fn write_message(&self) -> PeerMessage {
        PeerMessage::Write {
            key: self.key.clone(),
            envelope: self.write.clone(),
            request: Some(self.request),
        }
    }

    fn first_message(&self) -> PeerMessage {
        match &self.delta {
            Some(entry) => PeerMessage::DeltaPropagation {
                origin: self.origin.clone(),
                ack: Some(self.request),
                deltas: [(self.key.clone(), entry.clone())].into_iter().collect(),
            },
            None => self.write_message(),
        }
    }

    pub fn start(&mut self) -> AggregatorStep<Response> {
        let message = self.first_message();
        let sends = self
            .primary
            .iter()
            .map(|node| (node.clone(), message.clone()))
            .collect();
        AggregatorStep {
            sends,
            done: self.reply_if_done(),
        }
    }

    pub fn on_ack(&mut self, from: &NodeId) -> AggregatorStep<Response> {
        self.remaining.remove(from);
        AggregatorStep {
            sends: Vec::new(),
            done: self.reply_if_done(),
        }
    }

    pub fn on_nack(&mut self, from: &NodeId) -> AggregatorStep<Response> {
        self.nacks.insert(from.clone());
        AggregatorStep {
            sends: Vec::new(),
            done: self.reply_if_done(),
        }
    }

    /// The replica missed earlier deltas; send it the full state.
    pub fn on_delta_nack(&mut self, from: &NodeId) -> AggregatorStep<Response> {
        debug!(key = %self.key, node = %from, "delta rejected, retrying with full state");
        AggregatorStep {
            sends: vec![(from.clone(), self.write_message())],
            done: None,
        }
    }

    pub fn on_local_store(&mut self, ok: bool) -> AggregatorStep<Response> {
        self.got_local_store_reply = true;
        if !ok {
            self.nacks.insert(self.origin.clone());
        }
        AggregatorStep {
            sends: Vec::new(),
            done: self.reply_if_done(),
        }
    }

    pub fn on_send_to_secondary(&mut self) -> AggregatorStep<Response> {
        let message = self.write_message();
        let mut sends = Vec::new();
        if self.delta.is_some() {
            for node in self.primary.iter().filter(|n| self.remaining.contains(*n)) {
                sends.push((node.clone(), message.clone()));
            }
        }
        for node in &self.secondary {
            sends.push((node.clone(), message.clone()));
        }
        AggregatorStep { sends, done: None }
    }

    pub fn on_timeout(&mut self) -> AggregatorStep<Response> {
        AggregatorStep::finished(self.reply(true))
    }

    fn not_enough_nodes(&self) -> bool {
        self.done_when_remaining < 0 || (self.node_count as isize) < self.done_when_remaining
    }

    fn is_done(&self) -> bool {
        self.got_local_store_reply
            && (self.remaining.len() as isize <= self.done_when_remaining
                || self.remaining.is_subset(&self.nacks)
                || self.not_enough_nodes())
    }

    fn reply_if_done(&self) -> Option<Response> {
        if self.is_done() {
            Some(self.reply(false))
        } else {
            None
        }
    }

    fn reply(&self, is_timeout: bool) -> Response {
        let key = self.key.clone();
        let is_delete = self.write.is_deleted();
        let not_enough = self.not_enough_nodes();
        let is_success = self.remaining.len() as isize <= self.done_when_remaining && !not_enough;
        let is_timeout_or_not_enough = is_timeout || not_enough || self.nacks.is_empty();

        let response = if is_success && is_delete {
            Response::Delete(DeleteResponse::Success { key })
        } else if is_success {
            Response::Update(UpdateResponse::Success { key })
        } else if is_delete && (is_timeout_or_not_enough || !self.durable) {
            Response::Delete(DeleteResponse::ReplicationDeleteFailure { key })
        } else if is_timeout_or_not_enough || !self.durable {
            Response::Update(UpdateResponse::Timeout { key })
        } else if is_delete {
            Response::Delete(DeleteResponse::StoreFailure { key })
        } else {
            Response::Update(UpdateResponse::StoreFailure { key })
        };
        debug!(
            key = %self.key,
            request = %self.request,
            remaining = self.remaining.len(),
            nacks = self.nacks.len(),
            timeout = is_timeout,
            "write aggregator done"
        );
        response
    }
}

// ============================================================================
// Read
// ============================================================================

/// Result of a finished read round.
#[derive(Clone, Debug, PartialEq)]
pub struct ReadDone {
    pub key: KeyId,
    pub ok: bool,
    pub result: Option<DataEnvelope>,
    /// Replicas that answered with something older than `result`.
    pub lagging: Vec<NodeId>,
}

#[derive(Debug)]
pub struct ReadAggregator {
    key: KeyId,
    request: RequestId,
    done_when_remaining: isize,
    primary: Vec<NodeId>,
    secondary: Vec<NodeId>,
    remaining: BTreeSet<NodeId>,
    result: Option<DataEnvelope>,
    replies: BTreeMap<NodeId, Option<DataEnvelope>>,
    timeout_ms: u64,
}

impl ReadAggregator {
    pub fn new(
        key: KeyId,
        request: RequestId,
        consistency: &ReadConsistency,
        nodes: &BTreeSet<NodeId>,
        unreachable: &BTreeSet<NodeId>,
        local_value: Option<DataEnvelope>,
        rng: &mut StdRng,
    ) -> Self {
        let done_when_remaining = consistency.done_when_remaining(nodes.len());
        let (primary, secondary) =
            primary_and_secondary_nodes(nodes, unreachable, done_when_remaining, Some(rng));
        Self {
            key,
            request,
            done_when_remaining,
            primary,
            secondary,
            remaining: nodes.clone(),
            result: local_value,
            replies: BTreeMap::new(),
            timeout_ms: consistency.timeout_ms(),
        }
    }

    pub fn request(&self) -> RequestId {
        self.request
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    fn read_message(&self) -> PeerMessage {
        PeerMessage::Read {
            key: self.key.clone(),
            request: self.request,
        }
    }

    pub fn start(&mut self) -> AggregatorStep<ReadDone> {
        let message = self.read_message();
        let sends = self
            .primary
            .iter()
            .map(|node| (node.clone(), message.clone()))
            .collect();
        let remaining = self.remaining.len() as isize;
        let done = if remaining == self.done_when_remaining {
            Some(self.finish(true))
        } else if self.done_when_remaining < 0 || remaining < self.done_when_remaining {
            Some(self.finish(false))
        } else {
            None
        };
        AggregatorStep { sends, done }
    }

    pub fn on_read_result(
        &mut self,
        from: &NodeId,
        envelope: Option<DataEnvelope>,
        now: i64,
    ) -> AggregatorStep<ReadDone> {
        if !self.remaining.remove(from) {
            return AggregatorStep::empty();
        }
        self.result = match (self.result.take(), &envelope) {
            (Some(ours), Some(theirs)) => match ours.merge(theirs, now) {
                Ok(merged) => Some(merged),
                Err(err) => {
                    warn!(key = %self.key, node = %from, error = %err, "ignoring read result");
                    Some(ours)
                }
            },
            (Some(ours), None) => Some(ours),
            (None, Some(theirs)) => Some(theirs.clone()),
            (None, None) => None,
        };
        self.replies.insert(from.clone(), envelope);

        if self.remaining.len() as isize <= self.done_when_remaining {
            AggregatorStep::finished(self.finish(true))
        } else {
            AggregatorStep::empty()
        }
    }

    pub fn on_send_to_secondary(&mut self) -> AggregatorStep<ReadDone> {
        let message = self.read_message();
        AggregatorStep {
            sends: self
                .secondary
                .iter()
                .map(|node| (node.clone(), message.clone()))
                .collect(),
            done: None,
        }
    }

    pub fn on_timeout(&mut self) -> AggregatorStep<ReadDone> {
        AggregatorStep::finished(self.finish(false))
    }

    fn finish(&self, ok: bool) -> ReadDone {
        let lagging = match (&self.result, ok) {
            (Some(result), true) => self
                .replies
                .iter()
                .filter(|(_, reply)| reply.as_ref().map_or(true, |env| env.data != result.data))
                .map(|(node, _)| node.clone())
                .collect(),
            _ => Vec::new(),
        };
        debug!(key = %self.key, request = %self.request, ok, "read aggregator done");
        ReadDone {
            key: self.key.clone(),
            ok,
            result: self.result.clone(),
            lagging,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ddata_core::data::ReplicatedData;
    use ddata_core::gcounter::GCounter;
    use rand::SeedableRng;

    fn node(id: &str) -> NodeId {
        NodeId::new(id)
    }

    fn nodes(ids: &[&str]) -> BTreeSet<NodeId> {
        ids.iter().map(|id| node(id)).collect()
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(1)
    }

    fn counter(entries: &[(&str, i64)]) -> DataEnvelope {
        let mut c = GCounter::new();
        for (n, amount) in entries {
            c.increment(&node(n), *amount).unwrap();
        }
        DataEnvelope::new(ReplicatedData::GCounter(c))
    }

    fn write_aggregator(consistency: WriteConsistency, others: &[&str], durable: bool) -> WriteAggregator {
        WriteAggregator::new(
            "k".into(),
            RequestId::new(),
            node("self"),
            counter(&[("self", 1)]),
            None,
            &consistency,
            &nodes(others),
            &BTreeSet::new(),
            durable,
            &mut rng(),
        )
    }

    #[test]
    fn test_primary_prefers_reachable_nodes() {
        let all = nodes(&["a", "b", "c", "d"]);
        let unreachable = nodes(&["a", "b"]);
        let (primary, secondary) = primary_and_secondary_nodes(&all, &unreachable, 2, None);
        assert_eq!(primary, vec![node("c"), node("d")]);
        assert_eq!(secondary, vec![node("a"), node("b")]);

        let (primary, secondary) = primary_and_secondary_nodes(&all, &unreachable, 0, None);
        assert_eq!(primary.len(), 4);
        assert!(secondary.is_empty());
    }

    #[test]
    fn test_secondary_nodes_are_capped() {
        let all: BTreeSet<NodeId> = (0..30).map(|i| node(&format!("n{:02}", i))).collect();
        let (primary, secondary) =
            primary_and_secondary_nodes(&all, &BTreeSet::new(), 25, Some(&mut rng()));
        assert_eq!(primary.len(), 5);
        assert_eq!(secondary.len(), MAX_SECONDARY_NODES);
    }

    #[test]
    fn test_write_majority_succeeds_after_enough_acks() {
        let mut agg = write_aggregator(WriteConsistency::majority(1000), &["a", "b", "c", "d"], false);
        let start = agg.start();
        assert_eq!(start.sends.len(), 2);
        assert!(start.done.is_none());

        let first = start.sends[0].0.clone();
        let second = start.sends[1].0.clone();
        assert!(agg.on_ack(&first).done.is_none());
        assert_eq!(
            agg.on_ack(&second).done,
            Some(Response::Update(UpdateResponse::Success { key: "k".into() }))
        );
    }

    #[test]
    fn test_write_timeout() {
        let mut agg = write_aggregator(WriteConsistency::all(1000), &["a", "b"], false);
        agg.start();
        agg.on_ack(&node("a"));
        assert_eq!(
            agg.on_timeout().done,
            Some(Response::Update(UpdateResponse::Timeout { key: "k".into() }))
        );
    }

    #[test]
    fn test_write_to_more_nodes_than_exist() {
        let mut agg = write_aggregator(WriteConsistency::to(5, 1000), &["a"], false);
        assert_eq!(
            agg.start().done,
            Some(Response::Update(UpdateResponse::Timeout { key: "k".into() }))
        );
    }

    #[test]
    fn test_all_nacks_finish_early() {
        let mut agg = write_aggregator(WriteConsistency::all(1000), &["a", "b"], true);
        agg.start();
        agg.on_nack(&node("a"));
        agg.on_nack(&node("b"));
        // still waiting for the local durable store
        assert!(agg.on_nack(&node("b")).done.is_none());
        assert_eq!(
            agg.on_local_store(true).done,
            Some(Response::Update(UpdateResponse::StoreFailure { key: "k".into() }))
        );
    }

    #[test]
    fn test_delete_failure() {
        let mut agg = WriteAggregator::new(
            "k".into(),
            RequestId::new(),
            node("self"),
            DataEnvelope::deleted(),
            None,
            &WriteConsistency::all(1000),
            &nodes(&["a"]),
            &BTreeSet::new(),
            false,
            &mut rng(),
        );
        agg.start();
        assert_eq!(
            agg.on_timeout().done,
            Some(Response::Delete(DeleteResponse::ReplicationDeleteFailure { key: "k".into() }))
        );
    }

    #[test]
    fn test_delta_nack_resends_full_state() {
        let entry = DeltaEntry {
            envelope: crate::envelope::DeltaEnvelope::new(
                ddata_core::data::ReplicatedDelta::GCounter(GCounter::new()),
                BTreeMap::new(),
            ),
            from_seq_nr: 3,
            to_seq_nr: 3,
        };
        let mut agg = WriteAggregator::new(
            "k".into(),
            RequestId::new(),
            node("self"),
            counter(&[("self", 1)]),
            Some(entry),
            &WriteConsistency::all(1000),
            &nodes(&["a", "b"]),
            &BTreeSet::new(),
            false,
            &mut rng(),
        );
        let start = agg.start();
        assert!(start
            .sends
            .iter()
            .all(|(_, m)| matches!(m, PeerMessage::DeltaPropagation { ack: Some(_), .. })));

        let retry = agg.on_delta_nack(&node("a"));
        assert!(matches!(retry.sends[..], [(_, PeerMessage::Write { .. })]));

        agg.on_ack(&node("b"));
        let secondary = agg.on_send_to_secondary();
        assert_eq!(secondary.sends.len(), 1);
        assert_eq!(secondary.sends[0].0, node("a"));
    }

    #[test]
    fn test_causal_delta_write_keeps_node_order() {
        let entry = DeltaEntry {
            envelope: crate::envelope::DeltaEnvelope::new(
                ddata_core::data::ReplicatedDelta::GCounter(GCounter::new()),
                BTreeMap::new(),
            ),
            from_seq_nr: 1,
            to_seq_nr: 1,
        };
        let agg = WriteAggregator::new(
            "k".into(),
            RequestId::new(),
            node("self"),
            counter(&[("self", 1)]),
            Some(entry),
            &WriteConsistency::to(3, 1000),
            &nodes(&["a", "b", "c", "d"]),
            &BTreeSet::new(),
            false,
            &mut rng(),
        );
        assert_eq!(agg.primary_nodes(), &[node("a"), node("b")]);
        assert_eq!(agg.secondary_nodes(), &[node("c"), node("d")]);

        let shuffled = write_aggregator(WriteConsistency::to(3, 1000), &["a", "b", "c", "d"], false);
        assert_eq!(shuffled.primary_nodes().len(), 2);
        assert_eq!(shuffled.secondary_nodes().len(), 2);
    }

    #[test]
    fn test_read_merges_replies_and_reports_lagging() {
        let mut agg = ReadAggregator::new(
            "k".into(),
            RequestId::new(),
            &ReadConsistency::all(1000),
            &nodes(&["a", "b"]),
            &BTreeSet::new(),
            Some(counter(&[("self", 1)])),
            &mut rng(),
        );
        assert_eq!(agg.start().sends.len(), 2);
        assert!(agg
            .on_read_result(&node("a"), Some(counter(&[("a", 2)])), 0)
            .done
            .is_none());
        // duplicate replies are ignored
        assert!(agg.on_read_result(&node("a"), None, 0).done.is_none());

        let done = agg.on_read_result(&node("b"), None, 0).done.unwrap();
        assert!(done.ok);
        assert_eq!(done.result, Some(counter(&[("self", 1), ("a", 2)])));
        assert_eq!(done.lagging, vec![node("a"), node("b")]);
    }

    #[test]
    fn test_read_from_one_is_immediately_done() {
        let mut agg = ReadAggregator::new(
            "k".into(),
            RequestId::new(),
            &ReadConsistency::from(1, 1000),
            &nodes(&["a", "b"]),
            &BTreeSet::new(),
            None,
            &mut rng(),
        );
        let done = agg.start().done.unwrap();
        assert!(done.ok);
        assert!(done.result.is_none());
    }

    #[test]
    fn test_read_timeout_fails() {
        let mut agg = ReadAggregator::new(
            "k".into(),
            RequestId::new(),
            &ReadConsistency::majority(1000),
            &nodes(&["a", "b"]),
            &BTreeSet::new(),
            None,
            &mut rng(),
        );
        agg.start();
        assert!(!agg.on_timeout().done.unwrap().ok);
    }
}
