//! Deterministic in-process cluster.
//!
//! Every node is a [`Replicator`] driven synchronously: peer messages queue
//! in a single in-flight list, aggregator timers fire when the shared
//! [`ManualClock`] is advanced, and each node's durable store is a map that
//! completes writes immediately. Loss, duplication and partitions are
//! injected at delivery time.

use crate::clock::{Clock, ManualClock};
use crate::config::ReplicatorConfig;
use crate::consistency::{ReadConsistency, WriteConsistency};
use crate::digest::{digest, Digest};
use crate::durable::{load_batches, LOAD_BATCH_SIZE};
use crate::envelope::DataEnvelope;
use crate::error::StoreError;
use crate::message::{
    AggregatorTimer, Change, Command, Effect, Event, KeyId, MemberEvent, PeerMessage, RequestId,
    Response, SubscriberId, Tick,
};
use crate::replicator::{Replicator, ReplicatorState};
use ddata_core::data::{DataType, Key, ReplicatedData};
use ddata_core::error::Result as CrdtResult;
use ddata_core::node::NodeId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, trace};

/// Guard against message storms in `deliver_all`.
const MAX_DELIVERIES: usize = 1_000_000;

/// Network faults for the simulated cluster
#[derive(Debug, Clone, Default)]
pub struct NetworkConfig {
    /// Probability of message loss (0.0 - 1.0)
    pub loss_rate: f64,
    /// Probability of message duplication (0.0 - 1.0)
    pub dup_rate: f64,
}

impl NetworkConfig {
    pub fn lossy(loss_rate: f64) -> Self {
        Self {
            loss_rate,
            ..Default::default()
        }
    }

    pub fn with_dups(dup_rate: f64) -> Self {
        Self {
            dup_rate,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
struct InFlight {
    from: NodeId,
    to: NodeId,
    message: PeerMessage,
}

#[derive(Debug, Clone)]
struct PendingTimer {
    due: i64,
    node: NodeId,
    request: RequestId,
    timer: AggregatorTimer,
}

struct SimNode {
    replicator: Replicator,
    durable: BTreeMap<KeyId, DataEnvelope>,
    fail_store: bool,
}

pub struct SimulatedCluster {
    config: ReplicatorConfig,
    network: NetworkConfig,
    clock: ManualClock,
    nodes: BTreeMap<NodeId, SimNode>,
    in_flight: VecDeque<InFlight>,
    partitions: BTreeSet<(NodeId, NodeId)>,
    timers: Vec<PendingTimer>,
    responses: HashMap<RequestId, Response>,
    notifications: BTreeMap<NodeId, Vec<(SubscriberId, Change)>>,
    next_subscriber: u64,
    delivered: usize,
    dropped: usize,
    rng: StdRng,
}

fn link(a: &NodeId, b: &NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

impl SimulatedCluster {
    /// `n` nodes named `node-0`, `node-1`, ... with default settings.
    pub fn new(n: usize) -> Self {
        Self::with_config(n, ReplicatorConfig::default())
    }

    pub fn with_config(n: usize, config: ReplicatorConfig) -> Self {
        let mut cluster = Self {
            config,
            network: NetworkConfig::default(),
            clock: ManualClock::new(0),
            nodes: BTreeMap::new(),
            in_flight: VecDeque::new(),
            partitions: BTreeSet::new(),
            timers: Vec::new(),
            responses: HashMap::new(),
            notifications: BTreeMap::new(),
            next_subscriber: 1,
            delivered: 0,
            dropped: 0,
            rng: StdRng::seed_from_u64(12345),
        };
        for i in 0..n {
            cluster.add_node(NodeId::new(format!("node-{}", i)));
        }
        cluster
    }

    pub fn set_network(&mut self, network: NetworkConfig) {
        self.network = network;
    }

    /// Start a replicator for `node` and introduce it to every live member.
    pub fn add_node(&mut self, node: NodeId) {
        self.start_node(node.clone(), BTreeMap::new());
        self.introduce(&node);
    }

    fn start_node(&mut self, node: NodeId, durable: BTreeMap<KeyId, DataEnvelope>) {
        let clock: Arc<dyn Clock> = Arc::new(self.clock.clone());
        let mut replicator = Replicator::new(node.clone(), self.config.clone(), clock);
        let effects = replicator.start();
        self.nodes.insert(
            node.clone(),
            SimNode {
                replicator,
                durable,
                fail_store: false,
            },
        );
        self.process(&node, effects);
    }

    fn introduce(&mut self, node: &NodeId) {
        let others: Vec<NodeId> = self
            .live_nodes()
            .into_iter()
            .filter(|other| other != node)
            .collect();
        for other in others {
            self.handle(&other, Event::Member(MemberEvent::Up(node.clone())));
            self.handle(node, Event::Member(MemberEvent::Up(other.clone())));
        }
    }

    /// Stop `node` and start a fresh replicator on its durable data.
    pub fn restart(&mut self, node: &NodeId) {
        let durable = self
            .nodes
            .get(node)
            .map(|n| n.durable.clone())
            .unwrap_or_default();
        self.in_flight.retain(|m| &m.to != node);
        self.timers.retain(|t| &t.node != node);
        self.start_node(node.clone(), durable);
        self.introduce(node);
    }

    pub fn node(&self, idx: usize) -> NodeId {
        NodeId::new(format!("node-{}", idx))
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().cloned().collect()
    }

    /// Nodes whose replicator has not stopped.
    pub fn live_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.replicator.state() != ReplicatorState::Stopped)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn replicator(&self, node: &NodeId) -> Option<&Replicator> {
        self.nodes.get(node).map(|n| &n.replicator)
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    pub fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    // ========================================================================
    // Driving replicators
    // ========================================================================

    fn handle(&mut self, node: &NodeId, event: Event) {
        let effects = match self.nodes.get_mut(node) {
            Some(sim) => sim.replicator.handle(event),
            None => return,
        };
        self.process(node, effects);
    }

    fn process(&mut self, node: &NodeId, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send { to, message } => self.in_flight.push_back(InFlight {
                    from: node.clone(),
                    to,
                    message,
                }),
                Effect::Reply { request, response } => {
                    self.responses.insert(request, response);
                }
                Effect::Notify { subscriber, change } => self
                    .notifications
                    .entry(node.clone())
                    .or_default()
                    .push((subscriber, change)),
                Effect::Store {
                    key,
                    envelope,
                    reply,
                } => {
                    let result = match self.nodes.get_mut(node) {
                        Some(sim) if sim.fail_store => Err(StoreError::Store {
                            key: key.clone(),
                            reason: "simulated store failure".to_string(),
                        }),
                        Some(sim) => {
                            sim.durable.insert(key, envelope);
                            Ok(())
                        }
                        None => Ok(()),
                    };
                    if let Some(reply) = reply {
                        self.handle(node, Event::StoreCompleted { reply, result });
                    }
                }
                Effect::LoadAll => {
                    let entries = self
                        .nodes
                        .get(node)
                        .map(|sim| sim.durable.clone())
                        .unwrap_or_default();
                    for batch in load_batches(entries, LOAD_BATCH_SIZE) {
                        self.handle(node, Event::LoadData(batch));
                    }
                    self.handle(node, Event::LoadAllCompleted);
                }
                Effect::ScheduleTimer {
                    request,
                    timer,
                    after_ms,
                } => {
                    let due = self.now() + after_ms as i64;
                    self.timers.push(PendingTimer {
                        due,
                        node: node.clone(),
                        request,
                        timer,
                    });
                }
                Effect::Stop => debug!(node = %node, "simulated replicator stopped"),
            }
        }
    }

    pub fn submit(&mut self, node: &NodeId, command: Command) -> Option<RequestId> {
        let request = command.request();
        self.handle(node, Event::Command(command));
        request
    }

    pub fn update<T, F>(
        &mut self,
        node: &NodeId,
        key: &Key<T>,
        initial: T,
        consistency: WriteConsistency,
        modify: F,
    ) -> RequestId
    where
        T: DataType + 'static,
        F: FnOnce(&mut T, &NodeId) -> CrdtResult<()> + Send + 'static,
    {
        let command = Command::update(key, initial, consistency, modify);
        let request = command.request().unwrap_or_default();
        self.handle(node, Event::Command(command));
        request
    }

    pub fn get<T>(&mut self, node: &NodeId, key: &Key<T>, consistency: ReadConsistency) -> RequestId {
        let command = Command::get(key, consistency);
        let request = command.request().unwrap_or_default();
        self.handle(node, Event::Command(command));
        request
    }

    pub fn delete<T>(&mut self, node: &NodeId, key: &Key<T>, consistency: WriteConsistency) -> RequestId {
        let command = Command::delete(key, consistency);
        let request = command.request().unwrap_or_default();
        self.handle(node, Event::Command(command));
        request
    }

    pub fn subscribe<T>(&mut self, node: &NodeId, key: &Key<T>) -> SubscriberId {
        let subscriber = SubscriberId(self.next_subscriber);
        self.next_subscriber += 1;
        let command = Command::Subscribe {
            key: key.id().to_string(),
            subscriber,
        };
        self.handle(node, Event::Command(command));
        subscriber
    }

    pub fn response(&self, request: &RequestId) -> Option<&Response> {
        self.responses.get(request)
    }

    pub fn take_response(&mut self, request: &RequestId) -> Option<Response> {
        self.responses.remove(request)
    }

    pub fn take_notifications(&mut self, node: &NodeId) -> Vec<(SubscriberId, Change)> {
        self.notifications.remove(node).unwrap_or_default()
    }

    // ========================================================================
    // Network
    // ========================================================================

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn delivered_count(&self) -> usize {
        self.delivered
    }

    pub fn dropped_count(&self) -> usize {
        self.dropped
    }

    /// Deliver the next in-flight message. Returns false when none is left.
    pub fn process_one(&mut self) -> bool {
        let Some(InFlight { from, to, message }) = self.in_flight.pop_front() else {
            return false;
        };
        if self.partitions.contains(&link(&from, &to)) {
            trace!(from = %from, to = %to, kind = message.kind(), "dropped by partition");
            self.dropped += 1;
            return true;
        }
        if self.network.loss_rate > 0.0 && self.rng.gen_bool(self.network.loss_rate.min(1.0)) {
            self.dropped += 1;
            return true;
        }
        if self.network.dup_rate > 0.0 && self.rng.gen_bool(self.network.dup_rate.min(1.0)) {
            self.in_flight.push_back(InFlight {
                from: from.clone(),
                to: to.clone(),
                message: message.clone(),
            });
        }
        self.delivered += 1;
        self.handle(&to, Event::Peer { from, message });
        true
    }

    /// Deliver until nothing is in flight.
    pub fn deliver_all(&mut self) {
        let mut budget = MAX_DELIVERIES;
        while budget > 0 && self.process_one() {
            budget -= 1;
        }
    }

    /// Queue `message` as if `from` had sent it to `to`.
    pub fn inject(&mut self, from: &NodeId, to: &NodeId, message: PeerMessage) {
        self.in_flight.push_back(InFlight {
            from: from.clone(),
            to: to.clone(),
            message,
        });
    }

    /// Drop in-flight messages without delivering them.
    pub fn drop_in_flight(&mut self) {
        self.dropped += self.in_flight.len();
        self.in_flight.clear();
    }

    pub fn partition(&mut self, a: &NodeId, b: &NodeId) {
        self.partitions.insert(link(a, b));
    }

    /// Cut `node` off from every other node.
    pub fn isolate(&mut self, node: &NodeId) {
        for other in self.node_ids() {
            if &other != node {
                self.partitions.insert(link(node, &other));
            }
        }
    }

    pub fn heal(&mut self, a: &NodeId, b: &NodeId) {
        self.partitions.remove(&link(a, b));
    }

    pub fn heal_all(&mut self) {
        self.partitions.clear();
    }

    // ========================================================================
    // Time and ticks
    // ========================================================================

    /// Advance the clock, fire due aggregator timers in order and deliver a
    /// clock tick to every node.
    pub fn advance(&mut self, millis: u64) {
        let target = self.now() + millis as i64;
        loop {
            let next = self
                .timers
                .iter()
                .enumerate()
                .filter(|(_, t)| t.due <= target)
                .min_by_key(|(_, t)| t.due)
                .map(|(idx, _)| idx);
            let Some(idx) = next else {
                break;
            };
            let timer = self.timers.remove(idx);
            if timer.due > self.now() {
                self.clock.set(timer.due);
            }
            self.handle(
                &timer.node,
                Event::AggregatorTimer {
                    request: timer.request,
                    timer: timer.timer,
                },
            );
        }
        self.clock.set(target);
        self.tick_all(Tick::Clock);
    }

    pub fn tick(&mut self, node: &NodeId, tick: Tick) {
        self.handle(node, Event::Tick(tick));
    }

    pub fn tick_all(&mut self, tick: Tick) {
        for node in self.live_nodes() {
            self.tick(&node, tick);
        }
    }

    /// One gossip tick on every node, then delivery.
    pub fn gossip_round(&mut self) {
        self.tick_all(Tick::Gossip);
        self.deliver_all();
    }

    /// One delta propagation tick on every node, then delivery.
    pub fn propagate_deltas(&mut self) {
        self.tick_all(Tick::DeltaPropagation);
        self.deliver_all();
    }

    pub fn flush_changes(&mut self) {
        self.tick_all(Tick::NotifySubscribers);
    }

    /// Gossip until `key` converges or `max_rounds` pass.
    pub fn gossip_until_converged(&mut self, key: &str, max_rounds: usize) -> bool {
        for _ in 0..max_rounds {
            if self.converged(key) {
                return true;
            }
            self.gossip_round();
        }
        self.converged(key)
    }

    // ========================================================================
    // Membership
    // ========================================================================

    /// Tell every node (including `node` itself, which stops) that `node`
    /// left the cluster.
    pub fn remove_node(&mut self, node: &NodeId) {
        for member in self.live_nodes() {
            self.handle(&member, Event::Member(MemberEvent::Removed(node.clone())));
        }
        self.in_flight.retain(|m| &m.to != node && &m.from != node);
        self.timers.retain(|t| &t.node != node);
    }

    pub fn mark_unreachable(&mut self, node: &NodeId) {
        for member in self.live_nodes() {
            if &member != node {
                self.handle(&member, Event::Member(MemberEvent::Unreachable(node.clone())));
            }
        }
    }

    pub fn mark_reachable(&mut self, node: &NodeId) {
        for member in self.live_nodes() {
            if &member != node {
                self.handle(&member, Event::Member(MemberEvent::Reachable(node.clone())));
            }
        }
    }

    // ========================================================================
    // Durable storage
    // ========================================================================

    pub fn set_store_failure(&mut self, node: &NodeId, fail: bool) {
        if let Some(sim) = self.nodes.get_mut(node) {
            sim.fail_store = fail;
        }
    }

    pub fn durable_entry(&self, node: &NodeId, key: &str) -> Option<&DataEnvelope> {
        self.nodes.get(node).and_then(|sim| sim.durable.get(key))
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn local_envelope(&self, node: &NodeId, key: &str) -> Option<&DataEnvelope> {
        self.replicator(node).and_then(|r| r.envelope(key))
    }

    pub fn local_value(&self, node: &NodeId, key: &str) -> Option<&ReplicatedData> {
        self.replicator(node).and_then(|r| r.data(key))
    }

    pub fn local_typed<T: DataType>(&self, node: &NodeId, key: &Key<T>) -> Option<&T> {
        self.local_value(node, key.id())
            .and_then(|data| key.get(data).ok())
    }

    /// Every live node holds the same data and pruning state for `key`.
    pub fn converged(&self, key: &str) -> bool {
        let digests: HashSet<Option<Digest>> = self
            .live_nodes()
            .iter()
            .map(|node| self.local_envelope(node, key).map(digest))
            .collect();
        digests.len() <= 1
    }
}
