//! Peer transport abstraction.
//!
//! Replication is best effort: messages may be dropped, and the protocol
//! (retries at the secondary deadline, gossip, read repair) recovers. A
//! transport only needs per-link FIFO delivery of [`PeerMessage`]s.

use crate::error::TransportError;
use crate::message::PeerMessage;
use async_trait::async_trait;
use ddata_core::node::NodeId;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// Incoming peer messages, tagged with the sender.
pub type Inbox = mpsc::UnboundedReceiver<(NodeId, PeerMessage)>;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn local_node(&self) -> &NodeId;

    async fn send(&self, to: &NodeId, message: PeerMessage) -> Result<(), TransportError>;

    /// Take the inbox. Only the first call returns it.
    fn subscribe(&self) -> Option<Inbox>;
}

/// Type alias for the inbox senders shared by every transport of a network.
type SharedInboxes = Arc<RwLock<HashMap<NodeId, mpsc::UnboundedSender<(NodeId, PeerMessage)>>>>;
/// Unordered pairs of nodes that cannot talk to each other.
type SharedPartitions = Arc<RwLock<BTreeSet<(NodeId, NodeId)>>>;

fn link(a: &NodeId, b: &NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

/// An in-process network of [`MemoryTransport`]s with injectable
/// partitions. Clones share the same network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inboxes: SharedInboxes,
    partitions: SharedPartitions,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node. Joining again replaces its inbox.
    pub fn join(&self, node: NodeId) -> MemoryTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.write().insert(node.clone(), tx);
        MemoryTransport {
            local_node: node,
            inboxes: self.inboxes.clone(),
            partitions: self.partitions.clone(),
            inbox: RwLock::new(Some(rx)),
        }
    }

    pub fn leave(&self, node: &NodeId) {
        self.inboxes.write().remove(node);
    }

    pub fn partition(&self, a: &NodeId, b: &NodeId) {
        self.partitions.write().insert(link(a, b));
    }

    pub fn heal(&self, a: &NodeId, b: &NodeId) {
        self.partitions.write().remove(&link(a, b));
    }

    pub fn heal_all(&self) {
        self.partitions.write().clear();
    }

    pub fn is_partitioned(&self, a: &NodeId, b: &NodeId) -> bool {
        self.partitions.read().contains(&link(a, b))
    }
}

pub struct MemoryTransport {
    local_node: NodeId,
    inboxes: SharedInboxes,
    partitions: SharedPartitions,
    inbox: RwLock<Option<Inbox>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_node(&self) -> &NodeId {
        &self.local_node
    }

    async fn send(&self, to: &NodeId, message: PeerMessage) -> Result<(), TransportError> {
        if self.partitions.read().contains(&link(&self.local_node, to)) {
            trace!(from = %self.local_node, to = %to, kind = message.kind(), "dropped by partition");
            return Err(TransportError::Partitioned(to.clone()));
        }
        let tx = {
            let inboxes = self.inboxes.read();
            inboxes.get(to).cloned()
        };
        match tx {
            Some(tx) => tx
                .send((self.local_node.clone(), message))
                .map_err(|_| TransportError::Disconnected),
            None => Err(TransportError::PeerNotFound(to.clone())),
        }
    }

    fn subscribe(&self) -> Option<Inbox> {
        self.inbox.write().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::RequestId;

    fn ack() -> PeerMessage {
        PeerMessage::WriteAck {
            request: RequestId::new(),
        }
    }

    #[tokio::test]
    async fn test_memory_transport() {
        let network = MemoryNetwork::new();
        let a = network.join(NodeId::new("a"));
        let b = network.join(NodeId::new("b"));
        let mut inbox = b.subscribe().unwrap();
        assert!(b.subscribe().is_none());

        a.send(&NodeId::new("b"), ack()).await.unwrap();
        let (from, message) = inbox.recv().await.unwrap();
        assert_eq!(from, NodeId::new("a"));
        assert_eq!(message.kind(), "WriteAck");

        assert_eq!(
            a.send(&NodeId::new("c"), ack()).await,
            Err(TransportError::PeerNotFound(NodeId::new("c")))
        );
    }

    #[tokio::test]
    async fn test_partition_is_symmetric() {
        let network = MemoryNetwork::new();
        let a = network.join(NodeId::new("a"));
        let b = network.join(NodeId::new("b"));
        network.partition(&NodeId::new("b"), &NodeId::new("a"));

        assert!(a.send(&NodeId::new("b"), ack()).await.is_err());
        assert!(b.send(&NodeId::new("a"), ack()).await.is_err());

        network.heal(&NodeId::new("a"), &NodeId::new("b"));
        assert!(a.send(&NodeId::new("b"), ack()).await.is_ok());
    }
}
