//! Everything that flows into and out of a [`Replicator`](crate::Replicator).
//!
//! Clients send [`Command`]s, peers exchange [`PeerMessage`]s, and the host
//! feeds membership changes, ticks and store completions. All of them arrive
//! as an [`Event`]; the replicator answers with [`Effect`]s for the host to
//! carry out.

use crate::consistency::{ReadConsistency, WriteConsistency};
use crate::digest::Digest;
use crate::envelope::{DataEnvelope, DeltaEnvelope};
use crate::error::StoreError;
use ddata_core::data::{DataType, Key, ReplicatedData};
use ddata_core::error::{CrdtError, Result as CrdtResult};
use ddata_core::node::NodeId;
use ddata_delta::selector::SeqNr;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use ulid::Ulid;

pub type KeyId = String;

/// Correlates a client request with its response, and a quorum round with
/// the peer replies that belong to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(Ulid);

impl RequestId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriberId(pub u64);

/// Mutation applied by an update: receives the current (or initial) value
/// and the id of the local node. Must be free of side effects.
pub type ModifyFn = Box<dyn FnOnce(&mut ReplicatedData, &NodeId) -> CrdtResult<()> + Send>;

/// Wrap a mutation of a concrete data type.
pub fn modify_typed<T, F>(f: F) -> ModifyFn
where
    T: DataType + 'static,
    F: FnOnce(&mut T, &NodeId) -> CrdtResult<()> + Send + 'static,
{
    Box::new(move |data: &mut ReplicatedData, node: &NodeId| {
        let found = data.type_name();
        match T::from_data_mut(data) {
            Some(value) => f(value, node),
            None => Err(CrdtError::TypeMismatch {
                expected: T::TYPE_NAME,
                found,
            }),
        }
    })
}

pub enum Command {
    Get {
        key: KeyId,
        consistency: ReadConsistency,
        request: RequestId,
    },
    Update {
        key: KeyId,
        initial: Option<ReplicatedData>,
        consistency: WriteConsistency,
        modify: ModifyFn,
        request: RequestId,
    },
    Delete {
        key: KeyId,
        consistency: WriteConsistency,
        request: RequestId,
    },
    Subscribe {
        key: KeyId,
        subscriber: SubscriberId,
    },
    Unsubscribe {
        key: KeyId,
        subscriber: SubscriberId,
    },
    /// Notify subscribers of pending changes now.
    FlushChanges,
    GetKeyIds {
        request: RequestId,
    },
    GetReplicaCount {
        request: RequestId,
    },
}

impl Command {
    pub fn get<T>(key: &Key<T>, consistency: ReadConsistency) -> Self {
        Command::Get {
            key: key.id().to_string(),
            consistency,
            request: RequestId::new(),
        }
    }

    /// Typed update: `modify` runs against the stored value, or `initial`
    /// when the key has none.
    pub fn update<T, F>(key: &Key<T>, initial: T, consistency: WriteConsistency, modify: F) -> Self
    where
        T: DataType + 'static,
        F: FnOnce(&mut T, &NodeId) -> CrdtResult<()> + Send + 'static,
    {
        Command::Update {
            key: key.id().to_string(),
            initial: Some(initial.into_data()),
            consistency,
            modify: modify_typed(modify),
            request: RequestId::new(),
        }
    }

    pub fn delete<T>(key: &Key<T>, consistency: WriteConsistency) -> Self {
        Command::Delete {
            key: key.id().to_string(),
            consistency,
            request: RequestId::new(),
        }
    }

    pub fn request(&self) -> Option<RequestId> {
        match self {
            Command::Get { request, .. }
            | Command::Update { request, .. }
            | Command::Delete { request, .. }
            | Command::GetKeyIds { request }
            | Command::GetReplicaCount { request } => Some(*request),
            Command::Subscribe { .. } | Command::Unsubscribe { .. } | Command::FlushChanges => None,
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Get {
                key,
                consistency,
                request,
            } => f
                .debug_struct("Get")
                .field("key", key)
                .field("consistency", consistency)
                .field("request", request)
                .finish(),
            Command::Update {
                key,
                initial,
                consistency,
                request,
                ..
            } => f
                .debug_struct("Update")
                .field("key", key)
                .field("initial", initial)
                .field("consistency", consistency)
                .field("request", request)
                .finish_non_exhaustive(),
            Command::Delete {
                key,
                consistency,
                request,
            } => f
                .debug_struct("Delete")
                .field("key", key)
                .field("consistency", consistency)
                .field("request", request)
                .finish(),
            Command::Subscribe { key, subscriber } => f
                .debug_struct("Subscribe")
                .field("key", key)
                .field("subscriber", subscriber)
                .finish(),
            Command::Unsubscribe { key, subscriber } => f
                .debug_struct("Unsubscribe")
                .field("key", key)
                .field("subscriber", subscriber)
                .finish(),
            Command::FlushChanges => write!(f, "FlushChanges"),
            Command::GetKeyIds { request } => {
                f.debug_struct("GetKeyIds").field("request", request).finish()
            }
            Command::GetReplicaCount { request } => f
                .debug_struct("GetReplicaCount")
                .field("request", request)
                .finish(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum GetResponse {
    Success { key: KeyId, data: ReplicatedData },
    NotFound { key: KeyId },
    /// The read quorum was not reached in time.
    Failure { key: KeyId },
    DataDeleted { key: KeyId },
}

impl GetResponse {
    pub fn data(&self) -> Option<&ReplicatedData> {
        match self {
            GetResponse::Success { data, .. } => Some(data),
            _ => None,
        }
    }

    /// Typed view of a successful read.
    pub fn get<'a, T: DataType>(&'a self, key: &Key<T>) -> Option<&'a T> {
        self.data().and_then(|data| key.get(data).ok())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum UpdateResponse {
    Success { key: KeyId },
    /// The write quorum was not reached in time. The local replica has the
    /// update and gossip will spread it.
    Timeout { key: KeyId },
    ModifyFailure { key: KeyId, error: String },
    StoreFailure { key: KeyId },
    DataDeleted { key: KeyId },
}

#[derive(Clone, Debug, PartialEq)]
pub enum DeleteResponse {
    Success { key: KeyId },
    ReplicationDeleteFailure { key: KeyId },
    StoreFailure { key: KeyId },
    DataDeleted { key: KeyId },
}

#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    Get(GetResponse),
    Update(UpdateResponse),
    Delete(DeleteResponse),
    KeyIds(BTreeSet<KeyId>),
    ReplicaCount(usize),
}

/// Subscription notification.
#[derive(Clone, Debug, PartialEq)]
pub enum Change {
    Changed { key: KeyId, data: ReplicatedData },
    Deleted { key: KeyId },
}

impl Change {
    pub fn key(&self) -> &str {
        match self {
            Change::Changed { key, .. } | Change::Deleted { key } => key,
        }
    }
}

/// One key's delta range in a [`PeerMessage::DeltaPropagation`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeltaEntry {
    pub envelope: DeltaEnvelope,
    pub from_seq_nr: SeqNr,
    pub to_seq_nr: SeqNr,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PeerMessage {
    Read {
        key: KeyId,
        request: RequestId,
    },
    ReadResult {
        request: RequestId,
        envelope: Option<DataEnvelope>,
    },
    /// Full-state write. `request` is set when the sender waits for an ack.
    Write {
        key: KeyId,
        envelope: DataEnvelope,
        request: Option<RequestId>,
    },
    WriteAck {
        request: RequestId,
    },
    WriteNack {
        request: RequestId,
    },
    /// A causal delta could not be applied because of a sequence gap.
    DeltaNack {
        request: RequestId,
    },
    ReadRepair {
        key: KeyId,
        envelope: DataEnvelope,
    },
    ReadRepairAck {
        key: KeyId,
    },
    Status {
        digests: BTreeMap<KeyId, Digest>,
        chunk: usize,
        total_chunks: usize,
    },
    Gossip {
        updated: BTreeMap<KeyId, DataEnvelope>,
        send_back: bool,
    },
    DeltaPropagation {
        origin: NodeId,
        ack: Option<RequestId>,
        deltas: BTreeMap<KeyId, DeltaEntry>,
    },
}

impl PeerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Read { .. } => "Read",
            PeerMessage::ReadResult { .. } => "ReadResult",
            PeerMessage::Write { .. } => "Write",
            PeerMessage::WriteAck { .. } => "WriteAck",
            PeerMessage::WriteNack { .. } => "WriteNack",
            PeerMessage::DeltaNack { .. } => "DeltaNack",
            PeerMessage::ReadRepair { .. } => "ReadRepair",
            PeerMessage::ReadRepairAck { .. } => "ReadRepairAck",
            PeerMessage::Status { .. } => "Status",
            PeerMessage::Gossip { .. } => "Gossip",
            PeerMessage::DeltaPropagation { .. } => "DeltaPropagation",
        }
    }
}

/// Cluster membership change, pushed by the host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberEvent {
    Up(NodeId),
    Removed(NodeId),
    Unreachable(NodeId),
    Reachable(NodeId),
}

/// Periodic work, scheduled by the host at the configured intervals.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tick {
    Gossip,
    DeltaPropagation,
    NotifySubscribers,
    RemovedNodePruning,
    Clock,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AggregatorTimer {
    SendToSecondary,
    Timeout,
}

/// Where the outcome of a durable store request goes.
#[derive(Clone, Debug, PartialEq)]
pub enum StoreReply {
    Client {
        request: RequestId,
        success: Response,
        failure: Response,
    },
    /// The local write aggregator waiting on the durable copy.
    Aggregator { request: RequestId },
    /// A peer waiting for `WriteAck`/`WriteNack`.
    Peer { to: NodeId, request: RequestId },
}

#[derive(Debug)]
pub enum Event {
    Command(Command),
    Peer {
        from: NodeId,
        message: PeerMessage,
    },
    Member(MemberEvent),
    Tick(Tick),
    AggregatorTimer {
        request: RequestId,
        timer: AggregatorTimer,
    },
    StoreCompleted {
        reply: StoreReply,
        result: Result<(), StoreError>,
    },
    LoadData(BTreeMap<KeyId, DataEnvelope>),
    LoadAllCompleted,
    LoadFailed(StoreError),
}

impl From<Command> for Event {
    fn from(command: Command) -> Self {
        Event::Command(command)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    Send {
        to: NodeId,
        message: PeerMessage,
    },
    Reply {
        request: RequestId,
        response: Response,
    },
    Notify {
        subscriber: SubscriberId,
        change: Change,
    },
    Store {
        key: KeyId,
        envelope: DataEnvelope,
        reply: Option<StoreReply>,
    },
    /// Load every durable entry and feed it back as `LoadData` batches.
    LoadAll,
    ScheduleTimer {
        request: RequestId,
        timer: AggregatorTimer,
        after_ms: u64,
    },
    Stop,
}
