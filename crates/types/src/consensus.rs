//! Replicated-log entries, votes and consensus roles.

use crate::{Hash, NodeId};
use serde::{Deserialize, Serialize};

/// One entry of the replicated log: a reference to a proposed block.
///
/// Indices start at 1 and increase by exactly one per entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub block_hash: Hash,
    pub block_height: u64,
    pub timestamp_ms: u64,
}

/// A vote granted in a Member election.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub term: u64,
    pub candidate_id: NodeId,
    pub voter_id: NodeId,
    pub timestamp_ms: u64,
}

/// Current consensus role of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsensusRole {
    /// The privileged node. Never leaves this role.
    Authority,
    Member,
    /// A Member campaigning for interim leadership.
    Candidate,
    /// A Member that won an election and leads until the Authority returns.
    InterimLeader,
}

impl ConsensusRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsensusRole::Authority => "AUTHORITY",
            ConsensusRole::Member => "MEMBER",
            ConsensusRole::Candidate => "CANDIDATE",
            ConsensusRole::InterimLeader => "INTERIM_LEADER",
        }
    }

    /// Whether this role proposes and replicates blocks.
    pub fn is_leader(&self) -> bool {
        matches!(self, ConsensusRole::Authority | ConsensusRole::InterimLeader)
    }
}

impl std::fmt::Display for ConsensusRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
