//! Consensus configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Denominator used for Member election quorum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuorumPolicy {
    /// Majority of the Member set. The Authority is not counted.
    #[default]
    MembersOnly,
    /// Majority of Members plus the Authority. The Authority still never
    /// votes, so this makes elections strictly harder to win.
    FullCluster,
}

/// Consensus timing and quorum configuration.
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Interval between leader heartbeats.
    pub heartbeat_interval: Duration,

    /// Minimum silence from the leader before a Member may campaign.
    pub election_timeout: Duration,

    /// Upper bound of the random extra added to `election_timeout`, drawn
    /// afresh for each node and after every failed election.
    pub election_jitter: Duration,

    /// How long a campaign may run before it is declared failed.
    pub election_window: Duration,

    /// Quorum denominator for Member elections.
    pub quorum_policy: QuorumPolicy,

    /// Maximum log entries carried by one AppendEntries message.
    pub max_entries_per_message: usize,

    /// Seed mixed with the node id for timeout jitter.
    pub jitter_seed: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(500),
            election_timeout: Duration::from_millis(1500),
            election_jitter: Duration::from_millis(1500),
            election_window: Duration::from_millis(1000),
            quorum_policy: QuorumPolicy::MembersOnly,
            max_entries_per_message: 64,
            jitter_seed: 0,
        }
    }
}

impl ConsensusConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_election_timeout(mut self, timeout: Duration, jitter: Duration) -> Self {
        self.election_timeout = timeout;
        self.election_jitter = jitter;
        self
    }

    pub fn with_election_window(mut self, window: Duration) -> Self {
        self.election_window = window;
        self
    }

    pub fn with_quorum_policy(mut self, policy: QuorumPolicy) -> Self {
        self.quorum_policy = policy;
        self
    }

    pub fn with_jitter_seed(mut self, seed: u64) -> Self {
        self.jitter_seed = seed;
        self
    }
}
