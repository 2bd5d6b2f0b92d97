//! In-memory clusters driven by a shared manual clock.

use crate::fixtures::next_bundle;
use crate::{member_id, TestKeys, AUTHORITY};
use consortium_consensus::QuorumPolicy;
use consortium_node::{
    AppendOutcome, ConsensusSection, InMemoryNetwork, LedgerNode, ManualClock, NodeConfig,
    NodeError,
};
use consortium_storage::{LedgerStore, StoreRegistry};
use consortium_storage_memory::MemoryLedgerStore;
use consortium_types::{BlockBundle, NodeId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Builds a [`TestCluster`] of one Authority and `members` Members.
#[derive(Debug, Clone)]
pub struct ClusterBuilder {
    members: usize,
    seed: u64,
    consensus: ConsensusSection,
    rpc_timeout: Duration,
    auto_sync: bool,
    unreachable_after: Duration,
}

impl ClusterBuilder {
    pub fn new(members: usize) -> Self {
        Self {
            members,
            seed: 42,
            consensus: ConsensusSection::default(),
            rpc_timeout: Duration::from_millis(200),
            auto_sync: true,
            unreachable_after: Duration::from_secs(5),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self.consensus.jitter_seed = seed;
        self
    }

    pub fn with_consensus(mut self, consensus: ConsensusSection) -> Self {
        self.consensus = consensus;
        self
    }

    pub fn with_quorum_policy(mut self, policy: QuorumPolicy) -> Self {
        self.consensus.quorum_policy = policy;
        self
    }

    pub fn with_auto_sync(mut self, enabled: bool) -> Self {
        self.auto_sync = enabled;
        self
    }

    pub fn with_unreachable_after(mut self, after: Duration) -> Self {
        self.unreachable_after = after;
        self
    }

    /// Build the cluster. Nothing runs until [`TestCluster::start_all`].
    ///
    /// # Panics
    ///
    /// Panics if a node rejects its generated configuration.
    pub fn build(self) -> TestCluster {
        let authority_id = NodeId::from(AUTHORITY);
        let member_ids: Vec<NodeId> = (1..=self.members).map(member_id).collect();
        let all_ids: Vec<NodeId> = std::iter::once(authority_id.clone())
            .chain(member_ids.iter().cloned())
            .collect();

        let keys = TestKeys::new(all_ids.iter().cloned(), self.seed);
        let stores = Arc::new(StoreRegistry::new());
        let mut memory = BTreeMap::new();
        for id in &all_ids {
            let store = Arc::new(MemoryLedgerStore::new());
            stores.register(id.clone(), store.clone());
            memory.insert(id.clone(), store);
        }

        let mut cluster = TestCluster {
            authority_id,
            member_ids,
            keys,
            clock: Arc::new(ManualClock::new(Duration::from_secs(1_000))),
            network: InMemoryNetwork::new(),
            stores,
            memory,
            nodes: BTreeMap::new(),
            down: Mutex::new(BTreeSet::new()),
            builder: self,
        };
        for id in all_ids {
            let node = cluster.make_node(&id).expect("generated config is valid");
            cluster.nodes.insert(id, node);
        }
        cluster
    }
}

/// A running set of nodes sharing one network, one store registry and one
/// manual clock.
///
/// Every node replicates into every registered store, so a crashed node's
/// store keeps receiving blocks unless it is taken offline separately.
pub struct TestCluster {
    authority_id: NodeId,
    member_ids: Vec<NodeId>,
    keys: TestKeys,
    pub clock: Arc<ManualClock>,
    pub network: Arc<InMemoryNetwork>,
    pub stores: Arc<StoreRegistry>,
    memory: BTreeMap<NodeId, Arc<MemoryLedgerStore>>,
    nodes: BTreeMap<NodeId, LedgerNode>,
    /// Crashed nodes; they are not ticked.
    down: Mutex<BTreeSet<NodeId>>,
    builder: ClusterBuilder,
}

impl TestCluster {
    fn make_node(&self, id: &NodeId) -> Result<LedgerNode, NodeError> {
        let config = NodeConfig::new(id.clone(), self.authority_id.clone(), self.member_ids.clone())
            .with_rpc_timeout(self.builder.rpc_timeout)
            .with_auto_sync(self.builder.auto_sync)
            .with_unreachable_after(self.builder.unreachable_after)
            .with_consensus(self.builder.consensus.clone());
        let transport = self.network.transport(id.clone(), self.builder.rpc_timeout);
        let node = LedgerNode::new(
            config,
            self.stores.clone(),
            Arc::new(transport),
            Arc::new(self.keys.directory()),
            self.clock.clone(),
        )?;
        self.network.register(id.clone(), node.rpc_handler());
        Ok(node)
    }

    pub fn authority_id(&self) -> NodeId {
        self.authority_id.clone()
    }

    pub fn member_ids(&self) -> &[NodeId] {
        &self.member_ids
    }

    pub fn keys(&self) -> &TestKeys {
        &self.keys
    }

    /// # Panics
    ///
    /// Panics if `id` is not in the cluster.
    pub fn node(&self, id: &NodeId) -> &LedgerNode {
        &self.nodes[id]
    }

    pub fn authority(&self) -> &LedgerNode {
        self.node(&self.authority_id)
    }

    /// # Panics
    ///
    /// Panics if `id` is not in the cluster.
    pub fn store(&self, id: &NodeId) -> &Arc<MemoryLedgerStore> {
        &self.memory[id]
    }

    pub fn is_down(&self, id: &NodeId) -> bool {
        self.down_set().contains(id)
    }

    /// Current leaders among running nodes.
    pub fn leaders(&self) -> Vec<NodeId> {
        let down = self.down_set();
        self.nodes
            .iter()
            .filter(|(id, node)| !down.contains(*id) && node.is_leader())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn start_all(&self) {
        for (id, node) in &self.nodes {
            if !self.is_down(id) {
                node.start().await;
            }
        }
    }

    /// Tick every running node once, Authority first.
    pub async fn tick_all(&self) {
        for (id, node) in &self.nodes {
            if !self.is_down(id) {
                node.tick().await;
            }
        }
    }

    /// Advance the clock in `step` increments for `total`, ticking all
    /// running nodes after each step.
    pub async fn run_for(&self, total: Duration, step: Duration) {
        let mut elapsed = Duration::ZERO;
        while elapsed < total {
            self.clock.advance(step);
            elapsed += step;
            self.tick_all().await;
        }
    }

    /// Run until `done` holds or `limit` elapses. Returns whether it held.
    pub async fn run_until(
        &self,
        limit: Duration,
        step: Duration,
        mut done: impl FnMut(&TestCluster) -> bool,
    ) -> bool {
        let mut elapsed = Duration::ZERO;
        while elapsed < limit {
            if done(self) {
                return true;
            }
            self.clock.advance(step);
            elapsed += step;
            self.tick_all().await;
        }
        done(self)
    }

    /// Cut `id` off the network and stop ticking it.
    pub fn crash(&self, id: &NodeId) {
        self.network.set_up(id, false);
        self.down_set().insert(id.clone());
    }

    /// Replace `id` with a freshly constructed node over the same store,
    /// as after a process restart, and start it.
    ///
    /// # Panics
    ///
    /// Panics if the node cannot be rebuilt.
    pub async fn restart(&mut self, id: &NodeId) {
        let node = self.make_node(id).expect("restart with existing config");
        self.network.set_up(id, true);
        self.down_set().remove(id);
        self.nodes.insert(id.clone(), node);
        self.nodes[id].start().await;
    }

    /// The next block on `signer`'s local chain, signed by `signer`.
    pub fn next_block(&self, signer: &NodeId, tx_count: usize) -> BlockBundle {
        let tip = self.store(signer).tip().unwrap_or(None);
        next_bundle(self.keys.keypair(signer), tip, tx_count)
    }

    /// Build the next block on `leader`'s chain and append it through
    /// `leader`.
    pub async fn append(&self, leader: &NodeId, tx_count: usize) -> Result<AppendOutcome, NodeError> {
        let bundle = self.next_block(leader, tx_count);
        self.node(leader)
            .append_block(bundle.block, bundle.transactions)
            .await
    }

    /// Heights of every node's local tip.
    pub fn heights(&self) -> BTreeMap<NodeId, Option<u64>> {
        self.memory
            .iter()
            .map(|(id, store)| (id.clone(), store.tip().ok().flatten().map(|t| t.height)))
            .collect()
    }

    fn down_set(&self) -> std::sync::MutexGuard<'_, BTreeSet<NodeId>> {
        self.down.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cluster_commits_and_replicates() {
        let cluster = ClusterBuilder::new(2).build();
        cluster.start_all().await;
        assert_eq!(cluster.leaders(), vec![cluster.authority_id()]);

        for _ in 0..3 {
            let outcome = cluster.append(&cluster.authority_id(), 2).await.unwrap();
            assert!(outcome.committed);
        }
        assert!(cluster.heights().values().all(|h| *h == Some(2)));
    }
}
