//! Node identity.
//!
//! Every replica in the cluster is named by a [`NodeId`]. Identities are
//! totally ordered; the ordering is what picks the advisory pruning leader
//! and breaks ties between concurrent register writes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identity of a cluster node.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_order_by_address() {
        let a = NodeId::new("node-a");
        let b = NodeId::from("node-b");
        assert!(a < b);
        assert_eq!(a.to_string(), "node-a");
    }

    #[test]
    fn node_id_serializes_as_plain_string() {
        let id = NodeId::new("n1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"n1\"");
    }
}
