//! Tokio driver for a [`Replicator`].
//!
//! One task owns the state machine. Client calls, peer messages, periodic
//! ticks, aggregator timers and store completions are all funneled into it,
//! so every mutation of replicated state happens on that task.

use crate::consistency::{ReadConsistency, WriteConsistency};
use crate::durable::{load_batches, DurableStore, LOAD_BATCH_SIZE};
use crate::error::{ReplicatorError, Result};
use crate::message::{
    Change, Command, DeleteResponse, Effect, Event, GetResponse, KeyId, MemberEvent, RequestId,
    Response, SubscriberId, Tick, UpdateResponse,
};
use crate::network::{Inbox, Transport};
use crate::replicator::{Replicator, ReplicatorState};
use ddata_core::data::{DataType, Key};
use ddata_core::error::Result as CrdtResult;
use ddata_core::node::NodeId;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

enum Input {
    Command {
        command: Command,
        reply: Option<oneshot::Sender<Response>>,
    },
    Subscribe {
        key: KeyId,
        subscriber: SubscriberId,
        sender: mpsc::UnboundedSender<Change>,
    },
    Unsubscribe {
        key: KeyId,
        subscriber: SubscriberId,
    },
    Member(MemberEvent),
    Shutdown,
}

/// Cloneable client handle to a running replicator.
#[derive(Clone)]
pub struct ReplicatorHandle {
    node: NodeId,
    inputs: mpsc::UnboundedSender<Input>,
    next_subscriber: Arc<AtomicU64>,
}

/// Change notifications for one key. Dropping it unsubscribes.
pub struct Subscription {
    key: KeyId,
    id: SubscriberId,
    changes: mpsc::UnboundedReceiver<Change>,
    inputs: mpsc::UnboundedSender<Input>,
}

impl Subscription {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next change, `None` once the replicator is gone.
    pub async fn recv(&mut self) -> Option<Change> {
        self.changes.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Change> {
        self.changes.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.inputs.send(Input::Unsubscribe {
            key: self.key.clone(),
            subscriber: self.id,
        });
    }
}

impl ReplicatorHandle {
    pub fn self_node(&self) -> &NodeId {
        &self.node
    }

    fn submit(&self, input: Input) -> Result<()> {
        self.inputs
            .send(input)
            .map_err(|_| ReplicatorError::ChannelClosed)
    }

    async fn ask(&self, command: Command) -> Result<Response> {
        let (tx, rx) = oneshot::channel();
        self.submit(Input::Command {
            command,
            reply: Some(tx),
        })?;
        rx.await.map_err(|_| ReplicatorError::Stopped)
    }

    pub async fn get<T: DataType>(
        &self,
        key: &Key<T>,
        consistency: ReadConsistency,
    ) -> Result<GetResponse> {
        match self.ask(Command::get(key, consistency)).await? {
            Response::Get(response) => Ok(response),
            _ => Err(ReplicatorError::UnexpectedResponse("Get")),
        }
    }

    pub async fn update<T, F>(
        &self,
        key: &Key<T>,
        initial: T,
        consistency: WriteConsistency,
        modify: F,
    ) -> Result<UpdateResponse>
    where
        T: DataType + 'static,
        F: FnOnce(&mut T, &NodeId) -> CrdtResult<()> + Send + 'static,
    {
        match self
            .ask(Command::update(key, initial, consistency, modify))
            .await?
        {
            Response::Update(response) => Ok(response),
            _ => Err(ReplicatorError::UnexpectedResponse("Update")),
        }
    }

    pub async fn delete<T>(
        &self,
        key: &Key<T>,
        consistency: WriteConsistency,
    ) -> Result<DeleteResponse> {
        match self.ask(Command::delete(key, consistency)).await? {
            Response::Delete(response) => Ok(response),
            _ => Err(ReplicatorError::UnexpectedResponse("Delete")),
        }
    }

    /// Keys with live (non-deleted) data.
    pub async fn key_ids(&self) -> Result<BTreeSet<KeyId>> {
        let command = Command::GetKeyIds {
            request: RequestId::new(),
        };
        match self.ask(command).await? {
            Response::KeyIds(keys) => Ok(keys),
            _ => Err(ReplicatorError::UnexpectedResponse("GetKeyIds")),
        }
    }

    pub async fn replica_count(&self) -> Result<usize> {
        let command = Command::GetReplicaCount {
            request: RequestId::new(),
        };
        match self.ask(command).await? {
            Response::ReplicaCount(count) => Ok(count),
            _ => Err(ReplicatorError::UnexpectedResponse("GetReplicaCount")),
        }
    }

    pub fn subscribe<T>(&self, key: &Key<T>) -> Result<Subscription> {
        let (sender, changes) = mpsc::unbounded_channel();
        let id = SubscriberId(self.next_subscriber.fetch_add(1, Ordering::Relaxed));
        self.submit(Input::Subscribe {
            key: key.id().to_string(),
            subscriber: id,
            sender,
        })?;
        Ok(Subscription {
            key: key.id().to_string(),
            id,
            changes,
            inputs: self.inputs.clone(),
        })
    }

    pub fn member_event(&self, event: MemberEvent) -> Result<()> {
        self.submit(Input::Member(event))
    }

    /// Deliver pending change notifications without waiting for the tick.
    pub fn flush_changes(&self) -> Result<()> {
        self.submit(Input::Command {
            command: Command::FlushChanges,
            reply: None,
        })
    }

    pub fn shutdown(&self) {
        let _ = self.inputs.send(Input::Shutdown);
    }
}

fn interval(ms: u64) -> Interval {
    let period = Duration::from_millis(ms.max(1));
    let mut interval = time::interval_at(time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

struct Runtime {
    replicator: Replicator,
    transport: Arc<dyn Transport>,
    store: Arc<dyn DurableStore>,
    pending: HashMap<RequestId, oneshot::Sender<Response>>,
    subscribers: HashMap<SubscriberId, (KeyId, mpsc::UnboundedSender<Change>)>,
    internal: mpsc::UnboundedSender<Event>,
}

/// Run `replicator` on a new tokio task, talking to peers over `transport`
/// and persisting durable keys to `store`.
pub fn spawn_replicator(
    replicator: Replicator,
    transport: Arc<dyn Transport>,
    store: Arc<dyn DurableStore>,
) -> (ReplicatorHandle, JoinHandle<()>) {
    let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();
    let handle = ReplicatorHandle {
        node: replicator.self_node().clone(),
        inputs: inputs_tx,
        next_subscriber: Arc::new(AtomicU64::new(1)),
    };
    let runtime = Runtime {
        replicator,
        transport,
        store,
        pending: HashMap::new(),
        subscribers: HashMap::new(),
        internal: internal_tx,
    };
    let task = tokio::spawn(runtime.run(inputs_rx, internal_rx));
    (handle, task)
}

impl Runtime {
    async fn run(
        mut self,
        mut inputs: mpsc::UnboundedReceiver<Input>,
        mut internal: mpsc::UnboundedReceiver<Event>,
    ) {
        let node = self.replicator.self_node().clone();
        let Some(mut inbox): Option<Inbox> = self.transport.subscribe() else {
            error!(node = %node, "transport inbox already taken");
            return;
        };

        let config = self.replicator.config().clone();
        let mut gossip = interval(config.gossip_interval_ms);
        let mut delta = interval(config.delta_propagation_interval_ms);
        let mut notify = interval(config.notify_subscribers_interval_ms);
        let mut pruning = interval(config.pruning_interval_ms);
        // elapsed reachable time only needs gossip granularity
        let mut clock = interval(config.gossip_interval_ms);

        info!(node = %node, "replicator started");
        let effects = self.replicator.start();
        self.apply(effects).await;

        while self.replicator.state() != ReplicatorState::Stopped {
            let event = tokio::select! {
                input = inputs.recv() => match input {
                    Some(Input::Command { command, reply }) => {
                        if let (Some(request), Some(reply)) = (command.request(), reply) {
                            self.pending.insert(request, reply);
                        }
                        Event::Command(command)
                    }
                    Some(Input::Subscribe { key, subscriber, sender }) => {
                        self.subscribers.insert(subscriber, (key.clone(), sender));
                        Event::Command(Command::Subscribe { key, subscriber })
                    }
                    Some(Input::Unsubscribe { key, subscriber }) => {
                        self.subscribers.remove(&subscriber);
                        Event::Command(Command::Unsubscribe { key, subscriber })
                    }
                    Some(Input::Member(member)) => Event::Member(member),
                    Some(Input::Shutdown) | None => break,
                },
                Some((from, message)) = inbox.recv() => Event::Peer { from, message },
                Some(event) = internal.recv() => event,
                _ = gossip.tick() => Event::Tick(Tick::Gossip),
                _ = delta.tick() => Event::Tick(Tick::DeltaPropagation),
                _ = notify.tick() => Event::Tick(Tick::NotifySubscribers),
                _ = pruning.tick() => Event::Tick(Tick::RemovedNodePruning),
                _ = clock.tick() => Event::Tick(Tick::Clock),
            };
            let effects = self.replicator.handle(event);
            self.apply(effects).await;
        }
        info!(node = %node, pending = self.pending.len(), "replicator task finished");
    }

    async fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send { to, message } => {
                    let kind = message.kind();
                    if let Err(err) = self.transport.send(&to, message).await {
                        debug!(to = %to, kind, error = %err, "peer message not delivered");
                    }
                }
                Effect::Reply { request, response } => match self.pending.remove(&request) {
                    Some(reply) => {
                        let _ = reply.send(response);
                    }
                    None => debug!(request = %request, "no caller waiting for reply"),
                },
                Effect::Notify { subscriber, change } => {
                    let closed = match self.subscribers.get(&subscriber) {
                        Some((_, sender)) => sender.send(change).is_err(),
                        None => false,
                    };
                    if closed {
                        if let Some((key, _)) = self.subscribers.remove(&subscriber) {
                            let _ = self
                                .internal
                                .send(Event::Command(Command::Unsubscribe { key, subscriber }));
                        }
                    }
                }
                Effect::Store {
                    key,
                    envelope,
                    reply,
                } => {
                    let result = self.store.store(&key, &envelope).await;
                    match reply {
                        Some(reply) => {
                            let _ = self.internal.send(Event::StoreCompleted { reply, result });
                        }
                        None => {
                            if let Err(err) = result {
                                warn!(key = %key, error = %err, "durable write failed");
                            }
                        }
                    }
                }
                Effect::LoadAll => {
                    let store = self.store.clone();
                    let internal = self.internal.clone();
                    tokio::spawn(async move {
                        match store.load_all().await {
                            Ok(entries) => {
                                for batch in load_batches(entries, LOAD_BATCH_SIZE) {
                                    let _ = internal.send(Event::LoadData(batch));
                                }
                                let _ = internal.send(Event::LoadAllCompleted);
                            }
                            Err(err) => {
                                let _ = internal.send(Event::LoadFailed(err));
                            }
                        }
                    });
                }
                Effect::ScheduleTimer {
                    request,
                    timer,
                    after_ms,
                } => {
                    let internal = self.internal.clone();
                    tokio::spawn(async move {
                        time::sleep(Duration::from_millis(after_ms)).await;
                        let _ = internal.send(Event::AggregatorTimer { request, timer });
                    });
                }
                Effect::Stop => {
                    self.pending.clear();
                }
            }
        }
    }
}
