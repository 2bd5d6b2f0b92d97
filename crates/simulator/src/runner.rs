//! Scenario runner.

use crate::config::ScenarioConfig;
use consortium_node::{Clock, NodeError};
use consortium_storage::LedgerStore;
use consortium_test_helpers::{ClusterBuilder, TestCluster};
use consortium_types::NodeId;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("no interim leader elected within {0:?}")]
    NoInterimLeader(Duration),

    #[error("{count} leaders at once: {leaders:?}")]
    SplitLeadership { count: usize, leaders: Vec<NodeId> },

    #[error("authority did not reclaim leadership, leaders are {0:?}")]
    AuthorityNotRestored(Vec<NodeId>),

    #[error("block at height {height} did not commit")]
    NotCommitted { height: u64 },

    #[error(transparent)]
    Node(#[from] NodeError),
}

/// Outcome of one scenario run.
#[derive(Debug, Clone)]
pub struct ScenarioReport {
    pub seed: u64,
    pub members: usize,
    /// Simulated time from the Authority's crash to the first leader.
    pub election_time: Duration,
    pub interim_leader: NodeId,
    pub interim_term: u64,
    /// Authority term after it reclaimed leadership. Never below the
    /// interim term.
    pub final_term: u64,
    pub blocks_committed: usize,
    pub heights: BTreeMap<NodeId, Option<u64>>,
    /// Whether every store ended at the expected height.
    pub converged: bool,
    pub simulated_time: Duration,
}

impl ScenarioReport {
    pub fn print_summary(&self) {
        println!("\n═══════════════════════════════════════════");
        println!("           FAILOVER SCENARIO REPORT         ");
        println!("═══════════════════════════════════════════");
        println!();
        println!("Cluster:");
        println!("  Members:         {}", self.members);
        println!("  Seed:            {}", self.seed);
        println!("  Simulated time:  {:?}", self.simulated_time);
        println!();
        println!("Leadership:");
        println!("  Election time:   {:?}", self.election_time);
        println!("  Interim leader:  {}", self.interim_leader);
        println!("  Interim term:    {}", self.interim_term);
        println!("  Final term:      {}", self.final_term);
        println!();
        println!("Chain:");
        println!("  Committed:       {}", self.blocks_committed);
        for (node, height) in &self.heights {
            match height {
                Some(height) => println!("  {node:<16} {height}"),
                None => println!("  {node:<16} empty"),
            }
        }
        println!("  Converged:       {}", self.converged);
        println!();
    }
}

/// Runs a [`ScenarioConfig`] against a fresh in-memory cluster.
pub struct Simulator {
    config: ScenarioConfig,
    cluster: TestCluster,
    committed: usize,
}

impl Simulator {
    pub fn new(config: ScenarioConfig) -> Self {
        let cluster = ClusterBuilder::new(config.members)
            .with_seed(config.seed)
            .with_quorum_policy(config.quorum_policy)
            .build();
        Self {
            config,
            cluster,
            committed: 0,
        }
    }

    pub fn cluster(&self) -> &TestCluster {
        &self.cluster
    }

    /// Run every phase in order. Each phase fails fast on the first
    /// broken expectation.
    pub async fn run(mut self) -> Result<ScenarioReport, ScenarioError> {
        let started = self.cluster.clock.now();
        let authority = self.cluster.authority_id();

        // Steady state.
        self.cluster.start_all().await;
        for _ in 0..self.config.blocks_before_outage {
            self.append(&authority).await?;
        }
        self.settle().await?;
        info!(blocks = self.committed, "Steady phase complete");

        // Outage: process and store both go away.
        self.cluster.crash(&authority);
        self.cluster.store(&authority).set_available(false);
        let crashed_at = self.cluster.clock.now();

        let mut worst: Vec<NodeId> = Vec::new();
        let elected = self
            .cluster
            .run_until(self.config.election_limit, self.config.step, |cluster| {
                let leaders = cluster.leaders();
                if leaders.len() > worst.len() {
                    worst = leaders.clone();
                }
                !leaders.is_empty()
            })
            .await;
        if worst.len() > 1 {
            return Err(ScenarioError::SplitLeadership {
                count: worst.len(),
                leaders: worst,
            });
        }
        if !elected {
            return Err(ScenarioError::NoInterimLeader(self.config.election_limit));
        }
        let election_time = self.cluster.clock.now().saturating_sub(crashed_at);
        let interim = self.cluster.leaders().remove(0);
        let interim_term = self.cluster.node(&interim).current_term();
        info!(
            leader = %interim,
            term = interim_term,
            ?election_time,
            "Interim leader elected"
        );

        self.settle().await?;
        for _ in 0..self.config.blocks_during_outage {
            self.append(&interim).await?;
        }
        self.settle().await?;

        // Return.
        self.cluster.store(&authority).set_available(true);
        self.cluster.restart(&authority).await;
        let leaders = self.cluster.leaders();
        if leaders != [authority.clone()] {
            return Err(ScenarioError::AuthorityNotRestored(leaders));
        }
        self.settle().await?;
        let final_term = self.cluster.authority().current_term();
        info!(term = final_term, "Authority reclaimed leadership");

        self.append(&authority).await?;
        self.settle().await?;

        let heights = self.cluster.heights();
        let expected = self.config.expected_final_height();
        let converged = heights.values().all(|height| *height == Some(expected));
        if !converged {
            warn!(?heights, expected, "Stores did not converge");
        }

        Ok(ScenarioReport {
            seed: self.config.seed,
            members: self.config.members,
            election_time,
            interim_leader: interim,
            interim_term,
            final_term,
            blocks_committed: self.committed,
            heights,
            converged,
            simulated_time: self.cluster.clock.now().saturating_sub(started),
        })
    }

    async fn append(&mut self, leader: &NodeId) -> Result<(), ScenarioError> {
        let outcome = self
            .cluster
            .append(leader, self.config.transactions_per_block)
            .await?;
        if !outcome.committed {
            return Err(ScenarioError::NotCommitted {
                height: outcome.entry.block_height,
            });
        }
        self.committed += 1;
        Ok(())
    }

    /// Let heartbeats run, checking that no two nodes lead at once.
    async fn settle(&self) -> Result<(), ScenarioError> {
        let mut elapsed = Duration::ZERO;
        while elapsed < self.config.settle {
            self.cluster.clock.advance(self.config.step);
            elapsed += self.config.step;
            self.cluster.tick_all().await;
            let leaders = self.cluster.leaders();
            if leaders.len() > 1 {
                return Err(ScenarioError::SplitLeadership {
                    count: leaders.len(),
                    leaders,
                });
            }
        }
        Ok(())
    }

    /// Local tip height of `node`, if its store is readable.
    pub fn height_of(&self, node: &NodeId) -> Option<u64> {
        self.cluster
            .store(node)
            .tip()
            .ok()
            .flatten()
            .map(|tip| tip.height)
    }
}
