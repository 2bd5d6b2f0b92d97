use consortium_consensus::QuorumPolicy;
use std::time::Duration;

/// Parameters of one failover scenario.
#[derive(Debug, Clone)]
pub struct ScenarioConfig {
    pub members: usize,
    pub seed: u64,
    /// Blocks the Authority appends before its outage.
    pub blocks_before_outage: usize,
    /// Blocks the interim leader appends while the Authority is down.
    pub blocks_during_outage: usize,
    pub transactions_per_block: usize,
    /// Simulated time advanced between cluster ticks.
    pub step: Duration,
    /// How long the Members may take to elect an interim leader.
    pub election_limit: Duration,
    /// Settling time after each phase so heartbeats spread commits.
    pub settle: Duration,
    pub quorum_policy: QuorumPolicy,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            members: 3,
            seed: 42,
            blocks_before_outage: 3,
            blocks_during_outage: 2,
            transactions_per_block: 2,
            step: Duration::from_millis(100),
            election_limit: Duration::from_secs(30),
            settle: Duration::from_secs(1),
            quorum_policy: QuorumPolicy::MembersOnly,
        }
    }
}

impl ScenarioConfig {
    pub fn new(members: usize) -> Self {
        Self {
            members,
            ..Self::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_blocks(mut self, before_outage: usize, during_outage: usize) -> Self {
        self.blocks_before_outage = before_outage;
        self.blocks_during_outage = during_outage;
        self
    }

    pub fn with_transactions_per_block(mut self, count: usize) -> Self {
        self.transactions_per_block = count;
        self
    }

    pub fn with_election_limit(mut self, limit: Duration) -> Self {
        self.election_limit = limit;
        self
    }

    pub fn with_quorum_policy(mut self, policy: QuorumPolicy) -> Self {
        self.quorum_policy = policy;
        self
    }

    /// Height every node should reach once the scenario finishes: the
    /// Authority appends one more block after reclaiming leadership.
    pub fn expected_final_height(&self) -> u64 {
        (self.blocks_before_outage + self.blocks_during_outage) as u64
    }
}
