//! Error types for the replicator runtime surface.
//!
//! Client-visible outcomes of Get/Update/Delete are responses, not errors;
//! these types cover the durable store, the transport and the async handle.

use ddata_core::error::CrdtError;
use ddata_core::node::NodeId;
use thiserror::Error;

/// Durable store failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Failed to load durable data: {0}")]
    Load(String),

    #[error("Failed to store key {key}: {reason}")]
    Store { key: String, reason: String },
}

/// Transport failures. Delivery is best effort, so these are logged by the
/// runtime rather than surfaced to clients.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Peer not found: {0}")]
    PeerNotFound(NodeId),

    #[error("Link to {0} is partitioned")]
    Partitioned(NodeId),

    #[error("Disconnected")]
    Disconnected,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplicatorError {
    #[error("Replicator has stopped")]
    Stopped,

    #[error("Replicator channel closed")]
    ChannelClosed,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("CRDT error: {0}")]
    Crdt(#[from] CrdtError),

    #[error("Unexpected response to {0}")]
    UnexpectedResponse(&'static str),
}

pub type Result<T> = std::result::Result<T, ReplicatorError>;
