//! The replicator state machine.
//!
//! A [`Replicator`] owns the authoritative key → envelope map of one node.
//! It is sans-IO: the host feeds it one [`Event`] at a time and carries out
//! the returned [`Effect`]s (sending peer messages, replying to clients,
//! notifying subscribers, writing the durable store, scheduling aggregator
//! timers). Time is read through a [`Clock`].
//!
//! ```text
//!   start ──► Loading ──LoadAllCompleted──► Normal ──self removed──► Stopped
//!     │                                        ▲
//!     └──────────── no durable keys ───────────┘
//! ```
//!
//! While loading, client commands and membership changes are stashed and
//! replayed afterwards; gossip, replication and ticks are ignored.

use crate::aggregator::{AggregatorStep, ReadAggregator, ReadDone, WriteAggregator};
use crate::clock::Clock;
use crate::config::ReplicatorConfig;
use crate::digest::{chunk_of, digest, Digest};
use crate::envelope::{DataEnvelope, DeltaEnvelope, EnvelopeData, PruningState};
use crate::message::{
    AggregatorTimer, Change, Command, DeleteResponse, DeltaEntry, Effect, Event, GetResponse,
    KeyId, MemberEvent, ModifyFn, PeerMessage, RequestId, Response, StoreReply, SubscriberId,
    Tick, UpdateResponse,
};
use crate::consistency::{ReadConsistency, WriteConsistency};
use crate::error::StoreError;
use ddata_core::data::{ReplicatedData, ReplicatedDelta};
use ddata_core::lattice::DeltaOp;
use ddata_core::node::NodeId;
use ddata_core::pruning::RemovedNodePruning;
use ddata_core::version_vector::VersionVector;
use ddata_delta::selector::{DeltaPropagationSelector, DeltaSlot, SeqNr};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use sha2::{Digest as _, Sha256};
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Status chunks sent to one peer per gossip tick, at most.
const MAX_STATUS_CHUNKS_PER_TICK: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicatorState {
    Loading,
    Normal,
    Stopped,
}

pub struct Replicator {
    self_node: NodeId,
    config: ReplicatorConfig,
    clock: Arc<dyn Clock>,
    state: ReplicatorState,
    data_entries: BTreeMap<KeyId, (DataEnvelope, Digest)>,
    /// Other members, reachable or not.
    nodes: BTreeSet<NodeId>,
    unreachable: BTreeSet<NodeId>,
    /// Removed node → `all_reachable_clock_time` when its removal was seen.
    removed_nodes: BTreeMap<NodeId, i64>,
    /// Time elapsed while every member was reachable.
    all_reachable_clock_time: i64,
    previous_clock_time: i64,
    selector: DeltaPropagationSelector<ReplicatedDelta>,
    subscribers: BTreeMap<KeyId, BTreeSet<SubscriberId>>,
    new_subscribers: BTreeMap<KeyId, BTreeSet<SubscriberId>>,
    changed: BTreeSet<KeyId>,
    write_aggregators: BTreeMap<RequestId, WriteAggregator>,
    read_aggregators: BTreeMap<RequestId, ReadAggregator>,
    stash: Vec<Event>,
    status_count: u64,
    status_total_chunks: usize,
    rng: StdRng,
}

fn seed_for(node: &NodeId) -> u64 {
    let hash = Sha256::digest(node.as_str().as_bytes());
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&hash[..8]);
    u64::from_be_bytes(seed)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Replicator {
    pub fn new(self_node: NodeId, config: ReplicatorConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_millis();
        let selector =
            DeltaPropagationSelector::new(config.gossip_interval_divisor, config.max_delta_size);
        let rng = StdRng::seed_from_u64(seed_for(&self_node));
        let state = if config.has_durable_keys() {
            ReplicatorState::Loading
        } else {
            ReplicatorState::Normal
        };
        Self {
            self_node,
            config,
            clock,
            state,
            data_entries: BTreeMap::new(),
            nodes: BTreeSet::new(),
            unreachable: BTreeSet::new(),
            removed_nodes: BTreeMap::new(),
            all_reachable_clock_time: 0,
            previous_clock_time: now,
            selector,
            subscribers: BTreeMap::new(),
            new_subscribers: BTreeMap::new(),
            changed: BTreeSet::new(),
            write_aggregators: BTreeMap::new(),
            read_aggregators: BTreeMap::new(),
            stash: Vec::new(),
            status_count: 0,
            status_total_chunks: 0,
            rng,
        }
    }

    pub fn self_node(&self) -> &NodeId {
        &self.self_node
    }

    pub fn config(&self) -> &ReplicatorConfig {
        &self.config
    }

    pub fn state(&self) -> ReplicatorState {
        self.state
    }

    /// Effects to run once before the first event: a durable load when
    /// durable keys are configured.
    pub fn start(&mut self) -> Vec<Effect> {
        match self.state {
            ReplicatorState::Loading => vec![Effect::LoadAll],
            _ => Vec::new(),
        }
    }

    pub fn envelope(&self, key: &str) -> Option<&DataEnvelope> {
        self.data_entries.get(key).map(|(envelope, _)| envelope)
    }

    /// Current local value, `None` when absent or deleted.
    pub fn data(&self, key: &str) -> Option<&ReplicatedData> {
        self.envelope(key).and_then(|envelope| envelope.value())
    }

    pub fn key_ids(&self) -> BTreeSet<KeyId> {
        self.data_entries
            .iter()
            .filter(|(_, (envelope, _))| !envelope.is_deleted())
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn nodes(&self) -> &BTreeSet<NodeId> {
        &self.nodes
    }

    pub fn unreachable(&self) -> &BTreeSet<NodeId> {
        &self.unreachable
    }

    pub fn removed_nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.removed_nodes.keys()
    }

    pub fn pending_aggregators(&self) -> usize {
        self.write_aggregators.len() + self.read_aggregators.len()
    }

    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        let mut out = Vec::new();
        match self.state {
            ReplicatorState::Loading => self.handle_loading(event, &mut out),
            ReplicatorState::Normal => self.handle_normal(event, &mut out),
            ReplicatorState::Stopped => debug!(node = %self.self_node, ?event, "stopped, dropping event"),
        }
        out
    }

    fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    fn reply(&self, request: RequestId, response: Response, out: &mut Vec<Effect>) {
        out.push(Effect::Reply { request, response });
    }

    fn send(&self, to: &NodeId, message: PeerMessage, out: &mut Vec<Effect>) {
        out.push(Effect::Send {
            to: to.clone(),
            message,
        });
    }

    fn stop(&mut self, out: &mut Vec<Effect>) {
        info!(node = %self.self_node, "replicator stopping");
        self.state = ReplicatorState::Stopped;
        self.write_aggregators.clear();
        self.read_aggregators.clear();
        self.stash.clear();
        out.push(Effect::Stop);
    }

    // ========================================================================
    // Loading
    // ========================================================================

    fn handle_loading(&mut self, event: Event, out: &mut Vec<Effect>) {
        match event {
            Event::LoadData(batch) => self.load_data(batch, out),
            Event::LoadAllCompleted => {
                info!(
                    node = %self.self_node,
                    keys = self.data_entries.len(),
                    stashed = self.stash.len(),
                    "durable data loaded"
                );
                self.state = ReplicatorState::Normal;
                for stashed in mem::take(&mut self.stash) {
                    self.handle_normal(stashed, out);
                }
                self.flush_changes(out);
            }
            Event::LoadFailed(err) => {
                error!(node = %self.self_node, error = %err, "failed to load durable data");
                self.stop(out);
            }
            Event::Command(Command::GetReplicaCount { request }) => {
                self.reply(request, Response::ReplicaCount(0), out);
            }
            Event::Tick(_) => {}
            Event::Peer {
                message:
                    PeerMessage::Read { .. }
                    | PeerMessage::Write { .. }
                    | PeerMessage::Status { .. }
                    | PeerMessage::Gossip { .. },
                ..
            } => {}
            other => {
                debug!(node = %self.self_node, event = ?other, "stash while loading durable data");
                self.stash.push(other);
            }
        }
    }

    fn load_data(&mut self, batch: BTreeMap<KeyId, DataEnvelope>, out: &mut Vec<Effect>) {
        for (key, envelope) in batch {
            if let Some(written) = self.write(&key, &envelope) {
                if written.without_delta_versions() != envelope.without_delta_versions() {
                    out.push(Effect::Store {
                        key: key.clone(),
                        envelope: written.without_delta_versions(),
                        reply: None,
                    });
                }
            }
        }
    }

    // ========================================================================
    // Normal
    // ========================================================================

    fn handle_normal(&mut self, event: Event, out: &mut Vec<Effect>) {
        match event {
            Event::Command(command) => self.receive_command(command, out),
            Event::Peer { from, message } => self.receive_peer(from, message, out),
            Event::Member(member) => self.receive_member(member, out),
            Event::Tick(Tick::Gossip) => self.receive_gossip_tick(out),
            Event::Tick(Tick::DeltaPropagation) => self.receive_delta_propagation_tick(out),
            Event::Tick(Tick::NotifySubscribers) => self.flush_changes(out),
            Event::Tick(Tick::RemovedNodePruning) => self.receive_pruning_tick(out),
            Event::Tick(Tick::Clock) => self.receive_clock_tick(),
            Event::AggregatorTimer { request, timer } => {
                self.receive_aggregator_timer(request, timer, out)
            }
            Event::StoreCompleted { reply, result } => self.receive_store_completed(reply, result, out),
            Event::LoadData(_) | Event::LoadAllCompleted | Event::LoadFailed(_) => {
                debug!(node = %self.self_node, "ignoring durable load event after loading");
            }
        }
    }

    fn receive_command(&mut self, command: Command, out: &mut Vec<Effect>) {
        match command {
            Command::Get {
                key,
                consistency,
                request,
            } => self.receive_get(key, consistency, request, out),
            Command::Update {
                key,
                initial,
                consistency,
                modify,
                request,
            } => self.receive_update(key, initial, consistency, modify, request, out),
            Command::Delete {
                key,
                consistency,
                request,
            } => self.receive_delete(key, consistency, request, out),
            Command::Subscribe { key, subscriber } => {
                self.new_subscribers.entry(key).or_default().insert(subscriber);
            }
            Command::Unsubscribe { key, subscriber } => {
                for table in [&mut self.subscribers, &mut self.new_subscribers] {
                    if let Some(subs) = table.get_mut(&key) {
                        subs.remove(&subscriber);
                        if subs.is_empty() {
                            table.remove(&key);
                        }
                    }
                }
            }
            Command::FlushChanges => self.flush_changes(out),
            Command::GetKeyIds { request } => {
                self.reply(request, Response::KeyIds(self.key_ids()), out);
            }
            Command::GetReplicaCount { request } => {
                self.reply(request, Response::ReplicaCount(self.nodes.len() + 1), out);
            }
        }
    }

    // ========================================================================
    // Local data
    // ========================================================================

    fn get_data(&self, key: &str) -> Option<&DataEnvelope> {
        self.envelope(key)
    }

    fn get_digest(&mut self, key: &str) -> Digest {
        match self.data_entries.get_mut(key) {
            Some((envelope, cached)) => {
                if *cached == Digest::Lazy {
                    *cached = digest(envelope);
                }
                *cached
            }
            None => Digest::NotFound,
        }
    }

    fn set_data(&mut self, key: &str, envelope: DataEnvelope) -> DataEnvelope {
        let mut envelope = envelope;
        if self.config.delta_crdt_enabled {
            let current = self.selector.current_version(key);
            if current != 0 && current != envelope.delta_versions.version_at(&self.self_node) {
                envelope.delta_versions = envelope
                    .delta_versions
                    .merge(&VersionVector::single(self.self_node.clone(), current));
            }
        }

        let new_digest = if self.subscribers.contains_key(key) && !self.changed.contains(key) {
            let old_digest = self.get_digest(key);
            let new_digest = digest(&envelope);
            if new_digest != old_digest {
                self.changed.insert(key.to_string());
            }
            new_digest
        } else if envelope.is_deleted() {
            Digest::Deleted
        } else {
            Digest::Lazy
        };

        if envelope.is_deleted() {
            self.selector.delete(key);
        }
        self.data_entries
            .insert(key.to_string(), (envelope.clone(), new_digest));
        envelope
    }

    /// Merge an incoming full envelope into the local one.
    fn write(&mut self, key: &str, incoming: &DataEnvelope) -> Option<DataEnvelope> {
        let now = self.now();
        let merged = match self.get_data(key) {
            Some(existing) if existing.is_deleted() => return Some(existing.clone()),
            Some(existing) => match existing.merge(incoming, now) {
                Ok(merged) => merged,
                Err(err) => {
                    warn!(key = %key, error = %err, "couldn't merge incoming data");
                    return None;
                }
            },
            None => incoming.clone(),
        };
        Some(self.set_data(key, merged.add_seen(&self.self_node)))
    }

    fn write_delta(&mut self, key: &str, incoming: &DeltaEnvelope) -> Option<DataEnvelope> {
        let now = self.now();
        let merged = match self.get_data(key) {
            Some(existing) if existing.is_deleted() => return Some(existing.clone()),
            Some(existing) => existing.merge_delta(incoming, now),
            None => incoming.clone().into_envelope(),
        };
        match merged {
            Ok(merged) => Some(self.set_data(key, merged.add_seen(&self.self_node))),
            Err(err) => {
                warn!(key = %key, error = %err, "couldn't apply incoming delta");
                None
            }
        }
    }

    /// Write through to the durable store when the key is durable, and ack
    /// the peer if it asked for one.
    fn store_written(
        &mut self,
        key: &str,
        written: Option<DataEnvelope>,
        reply_to: Option<(NodeId, RequestId)>,
        out: &mut Vec<Effect>,
    ) {
        match written {
            Some(envelope) => {
                if self.config.is_durable(key) {
                    out.push(Effect::Store {
                        key: key.to_string(),
                        envelope: envelope.without_delta_versions(),
                        reply: reply_to.map(|(to, request)| StoreReply::Peer { to, request }),
                    });
                } else if let Some((to, request)) = reply_to {
                    self.send(&to, PeerMessage::WriteAck { request }, out);
                }
            }
            None => {
                if let Some((to, request)) = reply_to {
                    self.send(&to, PeerMessage::WriteNack { request }, out);
                }
            }
        }
    }

    fn write_and_store(
        &mut self,
        key: &str,
        incoming: &DataEnvelope,
        reply_to: Option<(NodeId, RequestId)>,
        out: &mut Vec<Effect>,
    ) {
        let written = self.write(key, incoming);
        self.store_written(key, written, reply_to, out);
    }

    fn store_local(&self, key: &str, envelope: &DataEnvelope, reply: StoreReply, out: &mut Vec<Effect>) {
        out.push(Effect::Store {
            key: key.to_string(),
            envelope: envelope.without_delta_versions(),
            reply: Some(reply),
        });
    }

    // ========================================================================
    // Get / Update / Delete
    // ========================================================================

    fn receive_get(
        &mut self,
        key: KeyId,
        consistency: ReadConsistency,
        request: RequestId,
        out: &mut Vec<Effect>,
    ) {
        debug!(node = %self.self_node, key = %key, "received Get");
        let local = self.get_data(&key).cloned();
        if consistency.is_local(self.nodes.len()) {
            let response = match local {
                Some(envelope) => match envelope.data {
                    EnvelopeData::Deleted => GetResponse::DataDeleted { key },
                    EnvelopeData::Data(data) => GetResponse::Success { key, data },
                },
                None => GetResponse::NotFound { key },
            };
            self.reply(request, Response::Get(response), out);
        } else {
            let mut aggregator = ReadAggregator::new(
                key,
                request,
                &consistency,
                &self.nodes,
                &self.unreachable,
                local,
                &mut self.rng,
            );
            let timeout = aggregator.timeout_ms();
            let step = aggregator.start();
            if let Some(done) = self.route_step(step, out) {
                self.finish_read(request, done, out);
            } else {
                self.schedule_aggregator_timers(request, timeout, out);
                self.read_aggregators.insert(request, aggregator);
            }
        }
    }

    fn receive_update(
        &mut self,
        key: KeyId,
        initial: Option<ReplicatedData>,
        consistency: WriteConsistency,
        modify: ModifyFn,
        request: RequestId,
        out: &mut Vec<Effect>,
    ) {
        let local = self.get_data(&key).cloned();
        let current = match &local {
            Some(envelope) if envelope.is_deleted() => {
                self.reply(
                    request,
                    Response::Update(UpdateResponse::DataDeleted { key }),
                    out,
                );
                return;
            }
            Some(envelope) => envelope.value().cloned(),
            None => initial,
        };
        let Some(current) = current else {
            let error = "no value for key and no initial value".to_string();
            self.reply(
                request,
                Response::Update(UpdateResponse::ModifyFailure { key, error }),
                out,
            );
            return;
        };

        let node = self.self_node.clone();
        let outcome = panic::catch_unwind(AssertUnwindSafe(move || {
            let mut value = current;
            modify(&mut value, &node).map(|()| value)
        }));
        let mut modified = match outcome {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => {
                debug!(key = %key, error = %err, "update failed");
                let error = format!("Update failed: {}", err);
                self.reply(
                    request,
                    Response::Update(UpdateResponse::ModifyFailure { key, error }),
                    out,
                );
                return;
            }
            Err(payload) => {
                let error = format!("Update panicked: {}", panic_message(payload.as_ref()));
                warn!(key = %key, error = %error, "update function panicked");
                self.reply(
                    request,
                    Response::Update(UpdateResponse::ModifyFailure { key, error }),
                    out,
                );
                return;
            }
        };

        let delta = if self.config.delta_crdt_enabled && modified.supports_delta() {
            Some(match modified.delta() {
                Some(d) => DeltaSlot::bounded(d, self.config.max_delta_size),
                None => DeltaSlot::NoDelta,
            })
        } else {
            None
        };
        modified.reset_delta();

        let envelope = match &local {
            Some(existing) => match existing.merge_data(&modified) {
                Ok(envelope) => envelope,
                Err(err) => {
                    let error = format!("Update failed: {}", err);
                    self.reply(
                        request,
                        Response::Update(UpdateResponse::ModifyFailure { key, error }),
                        out,
                    );
                    return;
                }
            },
            None => DataEnvelope::new(modified),
        };

        debug!(node = %self.self_node, key = %key, "received Update");
        // the selector is updated first so set_data records the new version
        if let Some(slot) = &delta {
            self.selector.update(&key, slot.clone());
        }
        let new_envelope = self.set_data(&key, envelope);
        let durable = self.config.is_durable(&key);

        if consistency.is_local(self.nodes.len()) {
            let success = Response::Update(UpdateResponse::Success { key: key.clone() });
            if durable {
                let failure = Response::Update(UpdateResponse::StoreFailure { key: key.clone() });
                let reply = StoreReply::Client {
                    request,
                    success,
                    failure,
                };
                self.store_local(&key, &new_envelope, reply, out);
            } else {
                self.reply(request, success, out);
            }
            return;
        }

        let (write_envelope, write_delta) = match delta {
            Some(DeltaSlot::Delta(d)) if d.requires_causal_delivery() => {
                let version = self.selector.current_version(&key);
                let entry = DeltaEntry {
                    envelope: DeltaEnvelope::new(d, new_envelope.pruning.clone()),
                    from_seq_nr: version,
                    to_seq_nr: version,
                };
                (new_envelope.clone(), Some(entry))
            }
            Some(DeltaSlot::Delta(d)) => match d.as_full_data() {
                Some(full) => (new_envelope.with_data(full), None),
                None => (new_envelope.clone(), None),
            },
            Some(DeltaSlot::NoDelta) | None => (new_envelope.clone(), None),
        };
        let aggregator = WriteAggregator::new(
            key.clone(),
            request,
            self.self_node.clone(),
            write_envelope,
            write_delta,
            &consistency,
            &self.nodes,
            &self.unreachable,
            durable,
            &mut self.rng,
        );
        if durable {
            self.store_local(&key, &new_envelope, StoreReply::Aggregator { request }, out);
        }
        self.start_write(aggregator, out);
    }

    fn receive_delete(
        &mut self,
        key: KeyId,
        consistency: WriteConsistency,
        request: RequestId,
        out: &mut Vec<Effect>,
    ) {
        if self.get_data(&key).is_some_and(|envelope| envelope.is_deleted()) {
            self.reply(
                request,
                Response::Delete(DeleteResponse::DataDeleted { key }),
                out,
            );
            return;
        }

        debug!(node = %self.self_node, key = %key, "received Delete");
        let deleted = self.set_data(&key, DataEnvelope::deleted());
        let durable = self.config.is_durable(&key);
        if consistency.is_local(self.nodes.len()) {
            let success = Response::Delete(DeleteResponse::Success { key: key.clone() });
            if durable {
                let failure = Response::Delete(DeleteResponse::StoreFailure { key: key.clone() });
                let reply = StoreReply::Client {
                    request,
                    success,
                    failure,
                };
                self.store_local(&key, &deleted, reply, out);
            } else {
                self.reply(request, success, out);
            }
            return;
        }

        let aggregator = WriteAggregator::new(
            key.clone(),
            request,
            self.self_node.clone(),
            deleted.clone(),
            None,
            &consistency,
            &self.nodes,
            &self.unreachable,
            durable,
            &mut self.rng,
        );
        if durable {
            self.store_local(&key, &deleted, StoreReply::Aggregator { request }, out);
        }
        self.start_write(aggregator, out);
    }

    // ========================================================================
    // Aggregators
    // ========================================================================

    fn route_step<R>(&self, step: AggregatorStep<R>, out: &mut Vec<Effect>) -> Option<R> {
        for (to, message) in step.sends {
            self.send(&to, message, out);
        }
        step.done
    }

    fn schedule_aggregator_timers(&self, request: RequestId, timeout_ms: u64, out: &mut Vec<Effect>) {
        out.push(Effect::ScheduleTimer {
            request,
            timer: AggregatorTimer::SendToSecondary,
            after_ms: timeout_ms / 5,
        });
        out.push(Effect::ScheduleTimer {
            request,
            timer: AggregatorTimer::Timeout,
            after_ms: timeout_ms,
        });
    }

    fn start_write(&mut self, mut aggregator: WriteAggregator, out: &mut Vec<Effect>) {
        let request = aggregator.request();
        let timeout = aggregator.timeout_ms();
        let step = aggregator.start();
        match self.route_step(step, out) {
            Some(response) => self.reply(request, response, out),
            None => {
                self.schedule_aggregator_timers(request, timeout, out);
                self.write_aggregators.insert(request, aggregator);
            }
        }
    }

    fn with_write_aggregator<F>(&mut self, request: RequestId, out: &mut Vec<Effect>, f: F)
    where
        F: FnOnce(&mut WriteAggregator) -> AggregatorStep<Response>,
    {
        let Some(mut aggregator) = self.write_aggregators.remove(&request) else {
            debug!(node = %self.self_node, request = %request, "reply for finished write");
            return;
        };
        let step = f(&mut aggregator);
        match self.route_step(step, out) {
            Some(response) => self.reply(request, response, out),
            None => {
                self.write_aggregators.insert(request, aggregator);
            }
        }
    }

    fn with_read_aggregator<F>(&mut self, request: RequestId, out: &mut Vec<Effect>, f: F)
    where
        F: FnOnce(&mut ReadAggregator) -> AggregatorStep<ReadDone>,
    {
        let Some(mut aggregator) = self.read_aggregators.remove(&request) else {
            debug!(node = %self.self_node, request = %request, "reply for finished read");
            return;
        };
        let step = f(&mut aggregator);
        match self.route_step(step, out) {
            Some(done) => self.finish_read(request, done, out),
            None => {
                self.read_aggregators.insert(request, aggregator);
            }
        }
    }

    /// Reply to a finished read, repairing the local replica and any peer
    /// that answered with older data first.
    fn finish_read(&mut self, request: RequestId, done: ReadDone, out: &mut Vec<Effect>) {
        let ReadDone {
            key,
            ok,
            result,
            lagging,
        } = done;
        let response = match (ok, result) {
            (false, _) => GetResponse::Failure { key },
            (true, None) => GetResponse::NotFound { key },
            (true, Some(envelope)) => {
                let written = self.write(&key, &envelope);
                let repaired = written.clone().unwrap_or(envelope);
                self.store_written(&key, written, None, out);
                for node in lagging {
                    let message = PeerMessage::ReadRepair {
                        key: key.clone(),
                        envelope: repaired.clone(),
                    };
                    self.send(&node, message, out);
                }
                match repaired.data {
                    EnvelopeData::Deleted => GetResponse::DataDeleted { key },
                    EnvelopeData::Data(data) => GetResponse::Success { key, data },
                }
            }
        };
        self.reply(request, Response::Get(response), out);
    }

    fn receive_aggregator_timer(
        &mut self,
        request: RequestId,
        timer: AggregatorTimer,
        out: &mut Vec<Effect>,
    ) {
        if self.write_aggregators.contains_key(&request) {
            self.with_write_aggregator(request, out, |aggregator| match timer {
                AggregatorTimer::SendToSecondary => aggregator.on_send_to_secondary(),
                AggregatorTimer::Timeout => aggregator.on_timeout(),
            });
        } else if self.read_aggregators.contains_key(&request) {
            self.with_read_aggregator(request, out, |aggregator| match timer {
                AggregatorTimer::SendToSecondary => aggregator.on_send_to_secondary(),
                AggregatorTimer::Timeout => aggregator.on_timeout(),
            });
        }
    }

    fn receive_store_completed(
        &mut self,
        reply: StoreReply,
        result: Result<(), StoreError>,
        out: &mut Vec<Effect>,
    ) {
        if let Err(err) = &result {
            warn!(node = %self.self_node, error = %err, "durable store failed");
        }
        let ok = result.is_ok();
        match reply {
            StoreReply::Client {
                request,
                success,
                failure,
            } => self.reply(request, if ok { success } else { failure }, out),
            StoreReply::Aggregator { request } => {
                self.with_write_aggregator(request, out, |aggregator| aggregator.on_local_store(ok))
            }
            StoreReply::Peer { to, request } => {
                let message = if ok {
                    PeerMessage::WriteAck { request }
                } else {
                    PeerMessage::WriteNack { request }
                };
                self.send(&to, message, out);
            }
        }
    }

    // ========================================================================
    // Peer protocol
    // ========================================================================

    fn is_node_removed<'a>(&self, node: &NodeId, mut keys: impl Iterator<Item = &'a KeyId>) -> bool {
        self.removed_nodes.contains_key(node)
            || keys.any(|key| {
                self.get_data(key)
                    .is_some_and(|envelope| envelope.pruning.contains_key(node))
            })
    }

    fn receive_peer(&mut self, from: NodeId, message: PeerMessage, out: &mut Vec<Effect>) {
        match message {
            PeerMessage::Read { key, request } => {
                let envelope = self.get_data(&key).cloned();
                self.send(&from, PeerMessage::ReadResult { request, envelope }, out);
            }
            PeerMessage::ReadResult { request, envelope } => {
                let now = self.now();
                self.with_read_aggregator(request, out, |aggregator| {
                    aggregator.on_read_result(&from, envelope, now)
                });
            }
            PeerMessage::Write {
                key,
                envelope,
                request,
            } => {
                let reply_to = request.map(|request| (from.clone(), request));
                self.write_and_store(&key, &envelope, reply_to, out);
            }
            PeerMessage::WriteAck { request } => {
                self.with_write_aggregator(request, out, |aggregator| aggregator.on_ack(&from))
            }
            PeerMessage::WriteNack { request } => {
                self.with_write_aggregator(request, out, |aggregator| aggregator.on_nack(&from))
            }
            PeerMessage::DeltaNack { request } => {
                self.with_write_aggregator(request, out, |aggregator| aggregator.on_delta_nack(&from))
            }
            PeerMessage::ReadRepair { key, envelope } => {
                self.write_and_store(&key, &envelope, None, out);
                self.send(&from, PeerMessage::ReadRepairAck { key }, out);
            }
            PeerMessage::ReadRepairAck { key } => {
                debug!(node = %self.self_node, from = %from, key = %key, "read repair acknowledged");
            }
            PeerMessage::Status {
                digests,
                chunk,
                total_chunks,
            } => {
                if self.is_node_removed(&from, digests.keys()) {
                    debug!(node = %self.self_node, from = %from, "ignoring status from removed node");
                } else {
                    self.receive_status(&from, digests, chunk, total_chunks, out);
                }
            }
            PeerMessage::Gossip { updated, send_back } => {
                if self.is_node_removed(&from, updated.keys()) {
                    debug!(node = %self.self_node, from = %from, "ignoring gossip from removed node");
                } else {
                    self.receive_gossip(&from, updated, send_back, out);
                }
            }
            PeerMessage::DeltaPropagation {
                origin,
                ack,
                deltas,
            } => self.receive_delta_propagation(&from, origin, ack, deltas, out),
        }
    }

    // ========================================================================
    // Anti-entropy
    // ========================================================================

    fn receive_gossip_tick(&mut self, out: &mut Vec<Effect>) {
        let candidates: Vec<NodeId> = self.nodes.difference(&self.unreachable).cloned().collect();
        if let Some(to) = candidates.choose(&mut self.rng).cloned() {
            self.gossip_to(&to, out);
        }
    }

    fn gossip_to(&mut self, to: &NodeId, out: &mut Vec<Effect>) {
        let keys: Vec<KeyId> = self.data_entries.keys().cloned().collect();
        let max = self.config.max_delta_elements.max(1);
        if keys.len() <= max {
            let digests = keys
                .into_iter()
                .map(|key| {
                    let d = self.get_digest(&key);
                    (key, d)
                })
                .collect();
            let status = PeerMessage::Status {
                digests,
                chunk: 0,
                total_chunks: 1,
            };
            self.send(to, status, out);
            return;
        }

        let total_chunks = keys.len() / max;
        for _ in 0..total_chunks.min(MAX_STATUS_CHUNKS_PER_TICK) {
            if total_chunks == self.status_total_chunks {
                self.status_count += 1;
            } else {
                self.status_count = self.rng.gen_range(0..total_chunks) as u64;
                self.status_total_chunks = total_chunks;
            }
            let chunk = (self.status_count % total_chunks as u64) as usize;
            let digests = keys
                .iter()
                .filter(|key| chunk_of(key, total_chunks) == chunk)
                .map(|key| (key.clone(), self.get_digest(key)))
                .collect();
            let status = PeerMessage::Status {
                digests,
                chunk,
                total_chunks,
            };
            self.send(to, status, out);
        }
    }

    fn receive_status(
        &mut self,
        from: &NodeId,
        digests: BTreeMap<KeyId, Digest>,
        chunk: usize,
        total_chunks: usize,
        out: &mut Vec<Effect>,
    ) {
        debug!(
            node = %self.self_node,
            from = %from,
            keys = digests.len(),
            chunk,
            total_chunks,
            "received gossip status"
        );
        let other_different: BTreeSet<KeyId> = digests
            .iter()
            .filter(|(key, theirs)| {
                let ours = self.get_digest(key);
                ours != Digest::NotFound && ours != **theirs
            })
            .map(|(key, _)| key.clone())
            .collect();

        let my_keys: BTreeSet<KeyId> = self
            .data_entries
            .keys()
            .filter(|key| total_chunks <= 1 || chunk_of(key, total_chunks) == chunk)
            .cloned()
            .collect();
        let other_keys: BTreeSet<KeyId> = digests.keys().cloned().collect();

        let updated: BTreeMap<KeyId, DataEnvelope> = other_different
            .iter()
            .chain(my_keys.difference(&other_keys))
            .take(self.config.max_delta_elements)
            .filter_map(|key| self.get_data(key).map(|envelope| (key.clone(), envelope.clone())))
            .collect();
        if !updated.is_empty() {
            let gossip = PeerMessage::Gossip {
                updated,
                send_back: !other_different.is_empty(),
            };
            self.send(from, gossip, out);
        }

        let my_missing: BTreeMap<KeyId, Digest> = other_keys
            .difference(&my_keys)
            .map(|key| (key.clone(), Digest::NotFound))
            .collect();
        if !my_missing.is_empty() {
            let status = PeerMessage::Status {
                digests: my_missing,
                chunk,
                total_chunks,
            };
            self.send(from, status, out);
        }
    }

    fn receive_gossip(
        &mut self,
        from: &NodeId,
        updated: BTreeMap<KeyId, DataEnvelope>,
        send_back: bool,
        out: &mut Vec<Effect>,
    ) {
        debug!(node = %self.self_node, from = %from, keys = updated.len(), "received gossip");
        let mut reply_keys = Vec::new();
        for (key, envelope) in updated {
            let had_data = self.data_entries.contains_key(&key);
            self.write_and_store(&key, &envelope, None, out);
            if send_back {
                if let Some(current) = self.get_data(&key) {
                    if had_data || !current.pruning.is_empty() {
                        reply_keys.push(key);
                    }
                }
            }
        }
        if !reply_keys.is_empty() {
            let updated = reply_keys
                .into_iter()
                .filter_map(|key| self.get_data(&key).cloned().map(|envelope| (key, envelope)))
                .collect();
            let gossip = PeerMessage::Gossip {
                updated,
                send_back: false,
            };
            self.send(from, gossip, out);
        }
    }

    // ========================================================================
    // Delta propagation
    // ========================================================================

    fn delta_targets(&self) -> Vec<NodeId> {
        self.nodes.difference(&self.unreachable).cloned().collect()
    }

    fn receive_delta_propagation_tick(&mut self, out: &mut Vec<Effect>) {
        if !self.config.delta_crdt_enabled {
            return;
        }
        let targets = self.delta_targets();
        let propagations = self.selector.collect_propagations(&targets);
        for (node, groups) in propagations {
            let deltas: BTreeMap<KeyId, DeltaEntry> = groups
                .into_iter()
                .filter_map(|(key, group)| match group.slot {
                    DeltaSlot::Delta(delta) => {
                        let pruning = self
                            .get_data(&key)
                            .map(|envelope| envelope.pruning.clone())
                            .unwrap_or_default();
                        let entry = DeltaEntry {
                            envelope: DeltaEnvelope::new(delta, pruning),
                            from_seq_nr: group.from_seq_nr,
                            to_seq_nr: group.to_seq_nr,
                        };
                        Some((key, entry))
                    }
                    DeltaSlot::NoDelta => {
                        debug!(
                            node = %self.self_node,
                            key = %key,
                            to = %node,
                            from_seq_nr = group.from_seq_nr,
                            to_seq_nr = group.to_seq_nr,
                            "skip delta too large to ship, left to gossip"
                        );
                        None
                    }
                })
                .collect();
            if !deltas.is_empty() {
                let message = PeerMessage::DeltaPropagation {
                    origin: self.self_node.clone(),
                    ack: None,
                    deltas,
                };
                self.send(&node, message, out);
            }
        }
        let divisor = self.selector.gossip_interval_divisor() as u64;
        if self.selector.propagation_count() % divisor == 0
            && self.selector.has_any_delta_entries()
        {
            self.selector.cleanup_delta_entries(&targets);
        }
    }

    fn delta_seq_nr(&self, key: &str, origin: &NodeId) -> SeqNr {
        self.get_data(key)
            .map_or(0, |envelope| envelope.delta_versions.version_at(origin))
    }

    fn receive_delta_propagation(
        &mut self,
        from: &NodeId,
        origin: NodeId,
        ack: Option<RequestId>,
        deltas: BTreeMap<KeyId, DeltaEntry>,
        out: &mut Vec<Effect>,
    ) {
        if !self.config.delta_crdt_enabled {
            return;
        }
        if self.is_node_removed(&origin, deltas.keys()) {
            debug!(node = %self.self_node, origin = %origin, "ignoring deltas from removed node");
            return;
        }
        let reply_to = ack.map(|request| (from.clone(), request));

        for (key, entry) in deltas {
            if !entry.envelope.delta.requires_causal_delivery() {
                let written = self.write_delta(&key, &entry.envelope);
                self.store_written(&key, written, reply_to.clone(), out);
                continue;
            }

            let current = self.delta_seq_nr(&key, &origin);
            if current >= entry.to_seq_nr {
                debug!(
                    node = %self.self_node,
                    origin = %origin,
                    key = %key,
                    to_seq_nr = entry.to_seq_nr,
                    current,
                    "skipping delta, already handled"
                );
                if let Some((to, request)) = &reply_to {
                    self.send(to, PeerMessage::WriteAck { request: *request }, out);
                }
            } else if entry.from_seq_nr > current + 1 {
                debug!(
                    node = %self.self_node,
                    origin = %origin,
                    key = %key,
                    from_seq_nr = entry.from_seq_nr,
                    current,
                    "skipping delta, missing earlier deltas"
                );
                if let Some((to, request)) = &reply_to {
                    self.send(to, PeerMessage::DeltaNack { request: *request }, out);
                }
            } else {
                debug!(
                    node = %self.self_node,
                    origin = %origin,
                    key = %key,
                    from_seq_nr = entry.from_seq_nr,
                    to_seq_nr = entry.to_seq_nr,
                    current,
                    "applying delta"
                );
                let mut envelope = entry.envelope;
                envelope.delta_versions = VersionVector::single(origin.clone(), entry.to_seq_nr);
                let written = self.write_delta(&key, &envelope);
                self.store_written(&key, written, reply_to.clone(), out);
            }
        }
    }

    // ========================================================================
    // Membership and pruning
    // ========================================================================

    fn receive_member(&mut self, member: MemberEvent, out: &mut Vec<Effect>) {
        match member {
            MemberEvent::Up(node) => {
                if node != self.self_node {
                    debug!(node = %self.self_node, member = %node, "member up");
                    self.nodes.insert(node);
                }
            }
            MemberEvent::Removed(node) => {
                if node == self.self_node {
                    self.stop(out);
                } else {
                    debug!(node = %self.self_node, member = %node, "adding removed node");
                    self.nodes.remove(&node);
                    self.unreachable.remove(&node);
                    self.removed_nodes
                        .insert(node.clone(), self.all_reachable_clock_time);
                    self.selector.cleanup_removed_node(&node);
                }
            }
            MemberEvent::Unreachable(node) => {
                if self.nodes.contains(&node) {
                    self.unreachable.insert(node);
                }
            }
            MemberEvent::Reachable(node) => {
                self.unreachable.remove(&node);
            }
        }
    }

    fn receive_clock_tick(&mut self) {
        let now = self.now();
        if self.unreachable.is_empty() {
            self.all_reachable_clock_time += now - self.previous_clock_time;
        }
        self.previous_clock_time = now;
    }

    /// The lowest node id among all members, self included.
    fn is_leader(&self) -> bool {
        self.nodes
            .iter()
            .next()
            .map_or(true, |lowest| self.self_node < *lowest)
    }

    fn receive_pruning_tick(&mut self, out: &mut Vec<Effect>) {
        // a node that cannot be reached might not have seen a marker yet
        if !self.unreachable.is_empty() {
            return;
        }
        if self.is_leader() {
            self.collect_removed_nodes();
            self.init_removed_node_pruning();
        }
        self.perform_removed_node_pruning(out);
        self.delete_obsolete_pruning_performed();
    }

    fn collect_removed_nodes(&mut self) {
        let mut newly_removed = BTreeSet::new();
        for (envelope, _) in self.data_entries.values() {
            if let Some(data) = envelope.value() {
                for node in data.modified_by_nodes() {
                    if node != self.self_node
                        && !self.nodes.contains(&node)
                        && !self.removed_nodes.contains_key(&node)
                    {
                        newly_removed.insert(node);
                    }
                }
            }
        }
        for node in newly_removed {
            debug!(node = %self.self_node, removed = %node, "adding removed node from data");
            self.removed_nodes
                .insert(node, self.all_reachable_clock_time);
        }
    }

    fn init_removed_node_pruning(&mut self) {
        let window = self.config.max_pruning_dissemination_ms as i64;
        let ready: Vec<NodeId> = self
            .removed_nodes
            .iter()
            .filter(|(_, detected)| self.all_reachable_clock_time - **detected > window)
            .map(|(node, _)| node.clone())
            .collect();
        if ready.is_empty() {
            return;
        }

        let keys: Vec<KeyId> = self.data_entries.keys().cloned().collect();
        for key in keys {
            for removed in &ready {
                let Some(envelope) = self.get_data(&key) else {
                    continue;
                };
                if !envelope.need_pruning_from(removed) {
                    continue;
                }
                let init = match envelope.pruning.get(removed) {
                    None => true,
                    Some(PruningState::Initialized { owner, .. }) => *owner != self.self_node,
                    Some(PruningState::Performed { .. }) => false,
                };
                if init {
                    let marked = envelope.init_removed_node_pruning(removed, &self.self_node);
                    debug!(node = %self.self_node, key = %key, removed = %removed, "initiated pruning");
                    self.set_data(&key, marked);
                }
            }
        }
    }

    fn perform_removed_node_pruning(&mut self, out: &mut Vec<Effect>) {
        let now = self.now();
        let keys: Vec<KeyId> = self.data_entries.keys().cloned().collect();
        for key in keys {
            let ready: Vec<NodeId> = match self.get_data(&key) {
                Some(envelope) if !envelope.is_deleted() => envelope
                    .pruning
                    .iter()
                    .filter_map(|(removed, state)| match state {
                        PruningState::Initialized { owner, seen }
                            if *owner == self.self_node
                                && self.nodes.iter().all(|n| seen.contains(n)) =>
                        {
                            Some(removed.clone())
                        }
                        _ => None,
                    })
                    .collect(),
                _ => continue,
            };

            let durable = self.config.is_durable(&key);
            let obsolete_time = now + self.config.pruning_marker_ttl_ms(durable) as i64;
            for removed in ready {
                let Some(envelope) = self.get_data(&key).cloned() else {
                    continue;
                };
                let pruned = envelope.prune(&removed, obsolete_time);
                debug!(node = %self.self_node, key = %key, removed = %removed, "performed pruning");
                let data_changed = pruned.data != envelope.data;
                let stored = self.set_data(&key, pruned);
                if data_changed && durable {
                    out.push(Effect::Store {
                        key: key.clone(),
                        envelope: stored.without_delta_versions(),
                        reply: None,
                    });
                }
            }
        }
    }

    fn delete_obsolete_pruning_performed(&mut self) {
        let now = self.now();
        let keys: Vec<KeyId> = self.data_entries.keys().cloned().collect();
        for key in keys {
            let Some(envelope) = self.get_data(&key) else {
                continue;
            };
            let obsolete: Vec<NodeId> = envelope
                .pruning
                .iter()
                .filter(|(_, state)| state.is_obsolete(now))
                .map(|(removed, _)| removed.clone())
                .collect();
            if obsolete.is_empty() {
                continue;
            }
            let mut cleaned = envelope.clone();
            for removed in obsolete {
                debug!(node = %self.self_node, key = %key, removed = %removed, "removing obsolete pruning marker");
                cleaned.pruning.remove(&removed);
                self.removed_nodes.remove(&removed);
            }
            self.set_data(&key, cleaned);
        }
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    fn change_for(&self, key: &str) -> Option<Change> {
        self.get_data(key).map(|envelope| match &envelope.data {
            EnvelopeData::Deleted => Change::Deleted {
                key: key.to_string(),
            },
            EnvelopeData::Data(data) => Change::Changed {
                key: key.to_string(),
                data: data.clone(),
            },
        })
    }

    fn notify(&self, key: &str, subscribers: &BTreeSet<SubscriberId>, out: &mut Vec<Effect>) {
        if let Some(change) = self.change_for(key) {
            for subscriber in subscribers {
                out.push(Effect::Notify {
                    subscriber: *subscriber,
                    change: change.clone(),
                });
            }
        }
    }

    fn flush_changes(&mut self, out: &mut Vec<Effect>) {
        for key in mem::take(&mut self.changed) {
            if let Some(subscribers) = self.subscribers.get(&key) {
                self.notify(&key, subscribers, out);
            }
        }
        // new subscribers get the current value even if nothing changed
        for (key, subscribers) in mem::take(&mut self.new_subscribers) {
            self.notify(&key, &subscribers, out);
            self.subscribers.entry(key).or_default().extend(subscribers);
        }
    }
}
