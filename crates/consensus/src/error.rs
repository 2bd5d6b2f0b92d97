//! Consensus error types.
//!
//! All of these are routine outcomes. Callers log and count them; none is
//! fatal to the node.

use consortium_types::{Hash, NodeId};

/// Why an election could not be started or a vote was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ElectionError {
    #[error("node is not eligible to campaign in role {role}")]
    NotEligible { role: &'static str },

    #[error("leader heard from recently; election timeout has not elapsed")]
    LeaderAlive,

    #[error("campaign for term {term} already in flight")]
    CampaignInFlight { term: u64 },

    #[error("stale term {term}, current term is {current}")]
    StaleTerm { term: u64, current: u64 },

    #[error("candidate log ends at {candidate_index}, ours at {local_index} (term {term})")]
    StaleLog {
        term: u64,
        candidate_index: u64,
        local_index: u64,
    },

    #[error("already voted for {candidate} in term {term}")]
    AlreadyVoted { term: u64, candidate: NodeId },

    #[error("no quorum within the election window for term {term} ({granted}/{needed} votes)")]
    QuorumNotReached {
        term: u64,
        granted: usize,
        needed: usize,
    },
}

impl ElectionError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            ElectionError::NotEligible { .. } => "not_eligible",
            ElectionError::LeaderAlive => "leader_alive",
            ElectionError::CampaignInFlight { .. } => "campaign_in_flight",
            ElectionError::StaleTerm { .. } => "stale_term",
            ElectionError::StaleLog { .. } => "stale_log",
            ElectionError::AlreadyVoted { .. } => "already_voted",
            ElectionError::QuorumNotReached { .. } => "quorum_not_reached",
        }
    }
}

/// Why a block could not be proposed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProposeError {
    #[error("not the leader (known leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    #[error("entry {index} for block {block_hash} is still awaiting quorum")]
    UncommittedEntryPending { index: u64, block_hash: Hash },

    #[error(transparent)]
    Log(#[from] LogError),
}

/// Replication log misuse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogError {
    #[error("expected index {expected}, got {got}")]
    IndexGap { expected: u64, got: u64 },

    #[error("index {index} is at or below commit index {commit_index}")]
    IndexRegression { index: u64, commit_index: u64 },

    #[error("no entry at index {0}")]
    UnknownIndex(u64),
}
