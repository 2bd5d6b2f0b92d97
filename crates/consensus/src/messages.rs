//! Logical consensus RPCs.
//!
//! Transport is external; these are the payloads and their required fields.

use consortium_types::{ChainTip, LogEntry, NodeId};
use serde::{Deserialize, Serialize};

/// Vote solicitation from a campaigning Member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVote {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    /// Voter's current term after handling the request.
    pub term: u64,
    pub voter_id: NodeId,
    pub granted: bool,
}

/// Log replication from the leader. Empty `entries` is a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntries {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
    /// Leader's chain tip, so followers can detect they are behind.
    pub leader_tip: Option<ChainTip>,
}

impl AppendEntries {
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendResponse {
    /// Follower's current term after handling the request.
    pub term: u64,
    pub follower_id: NodeId,
    pub success: bool,
    /// Highest index the follower holds in agreement with the leader. On
    /// a refused request, where the leader should resume from.
    pub match_index: u64,
    pub commit_index: u64,
    /// Committed entries the leader does not have yet. Only sent to a
    /// recovering Authority whose commit index is behind the follower's.
    pub committed_tail: Vec<LogEntry>,
    pub follower_tip: Option<ChainTip>,
}
