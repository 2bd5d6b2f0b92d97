//! Node identity and directory records.

use crate::Hash;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of a cluster node.
///
/// Node ids are ordered lexicographically; election tie-breaks rely on this.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
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

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Role assigned to a node when it is registered.
///
/// The role is explicit typed state. It never changes after registration and
/// is never derived from the node's name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The privileged default leader.
    Authority,
    /// A subordinate follower that may act as interim leader.
    Member,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Authority => "authority",
            Role::Member => "member",
        }
    }
}

/// Reachability of a node as seen by the local registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Active,
    /// A catch-up is running against this node.
    Syncing,
    Unreachable,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Active => "active",
            NodeStatus::Syncing => "syncing",
            NodeStatus::Unreachable => "unreachable",
        }
    }
}

/// One entry of the node directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub role: Role,
    pub status: NodeStatus,
    /// Height of the last block the node is known to hold, if any.
    pub reported_height: Option<u64>,
    pub last_block_hash: Option<Hash>,
    /// Unix milliseconds of the last contact.
    pub last_seen_ms: u64,
}

impl NodeRecord {
    /// Create a freshly registered, active record with no known tip.
    pub fn new(id: NodeId, role: Role, now_ms: u64) -> Self {
        Self {
            id,
            role,
            status: NodeStatus::Active,
            reported_height: None,
            last_block_hash: None,
            last_seen_ms: now_ms,
        }
    }

    pub fn is_authority(&self) -> bool {
        self.role == Role::Authority
    }
}
