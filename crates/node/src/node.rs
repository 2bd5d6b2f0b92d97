//! The node runtime.
//!
//! [`LedgerNode`] owns one node's consensus state, registry and store
//! handles, and drives them from timers, caller requests and peer RPCs.
//! The consensus state machine is synchronous; this module performs the
//! [`Action`]s it returns. Locks guard in-memory transitions only and are
//! always released before any peer call.

use crate::clock::Clock;
use crate::events::EventBus;
use crate::transport::{PeerTransport, RpcHandler, TransportBlockSource};
use crate::{NodeConfig, NodeError, TransportError};
use consortium_consensus::{
    Action, AppendEntries, AppendResponse, ConsensusState, ConsensusStats, RecoveredState,
    RequestVote, VoteResponse,
};
use consortium_metrics as metrics;
use consortium_replication::{
    validate_block, BlockReplicator, NodeRegistry, RegistryStatistics, ReplicationReport,
    SyncProtocol, SyncReport,
};
use consortium_storage::{ConsensusMeta, StorageError, StoreRegistry, TargetStore};
use consortium_types::{
    Block, BlockBundle, ChainTip, ConsensusEvent, ConsensusRole, EventKind, Hash, LogEntry, NodeId,
    NodeStatus, SignatureVerifier, Transaction,
};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Send rounds performed by one dispatch before leftovers wait for the
/// next tick. Log repair walks `next_index` back one step per round.
const MAX_DISPATCH_ROUNDS: usize = 16;

/// Result of [`LedgerNode::append_block`].
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    pub entry: LogEntry,
    /// Whether the entry reached quorum during the call. An uncommitted
    /// entry stays pending and is re-sent with the next heartbeats.
    pub committed: bool,
    /// Fan-out results, present when the entry committed during the call.
    pub replication: Option<ReplicationReport>,
}

/// Result of [`LedgerNode::sync_with_network`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkSyncSummary {
    pub nodes_checked: usize,
    pub blocks_added: usize,
    pub blocks_failed: usize,
}

/// Point-in-time view of a node.
#[derive(Debug, Clone)]
pub struct NodeStats {
    pub node_id: NodeId,
    pub role: ConsensusRole,
    pub term: u64,
    pub leader: Option<NodeId>,
    pub commit_index: u64,
    pub last_log_index: u64,
    pub local_tip: Option<ChainTip>,
    pub last_activity_ms: u64,
    pub consensus: ConsensusStats,
    pub registry: RegistryStatistics,
}

/// One cluster node. Cloning yields another handle to the same node.
#[derive(Clone)]
pub struct LedgerNode {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    config: NodeConfig,
    consensus: Mutex<ConsensusState>,
    local: TargetStore,
    registry: Arc<NodeRegistry>,
    replicator: BlockReplicator,
    sync: SyncProtocol,
    verifier: Arc<dyn SignatureVerifier>,
    transport: Arc<dyn PeerTransport>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    /// Proposed bundles awaiting commit, by block hash.
    proposals: Mutex<HashMap<Hash, BlockBundle>>,
    /// Committed bundles some target still lacks, by height.
    unfinished: Mutex<BTreeMap<u64, (BlockBundle, ReplicationReport)>>,
    /// Sends produced outside a dispatch, flushed on the next tick.
    outbox: Mutex<Vec<Action>>,
    last_activity_ms: AtomicU64,
}

impl std::fmt::Debug for LedgerNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerNode")
            .field("node_id", &self.inner.config.node_id)
            .field("consensus", &*self.inner.consensus.lock())
            .finish_non_exhaustive()
    }
}

impl LedgerNode {
    /// Build a node from its configuration and injected collaborators.
    ///
    /// `stores` must already hold this node's own store; every other
    /// registered store becomes a replication target. Recovered term
    /// metadata is loaded from the local store.
    pub fn new(
        config: NodeConfig,
        stores: Arc<StoreRegistry>,
        transport: Arc<dyn PeerTransport>,
        verifier: Arc<dyn SignatureVerifier>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        let node_id = config.node_id.clone();
        let local = stores.resolve(&node_id).map_err(|_| {
            NodeError::Config(format!("no storage target registered for {node_id}"))
        })?;
        let recovered = local
            .store()
            .load_consensus_meta()
            .map_err(|e| NodeError::Config(format!("local store unreachable: {e}")))?
            .map(|meta| RecoveredState {
                current_term: meta.current_term,
                last_known_cluster_term: meta.last_known_cluster_term,
            })
            .unwrap_or_default();

        let now = clock.now();
        let now_ms = clock.now_ms();
        let registry = Arc::new(NodeRegistry::new().with_directory(local.store_arc()));
        let loaded = registry.load_directory();
        registry.register(node_id.clone(), config.role, now_ms);
        for peer in config.peers() {
            registry.register(peer.clone(), config.role_of(&peer), now_ms);
        }

        let mut consensus = ConsensusState::new(
            node_id.clone(),
            config.authority_id.clone(),
            config.members.iter().cloned(),
            config.consensus.to_consensus_config(),
            recovered,
        );
        consensus.set_time(now);
        let tip = local.store().tip().unwrap_or(None);
        consensus.set_local_tip(tip);

        info!(
            node = %node_id,
            role = config.role.as_str(),
            term = recovered.current_term,
            last_known_cluster_term = recovered.last_known_cluster_term,
            height = ?tip.map(|t| t.height),
            directory_entries = loaded,
            "Node initialized"
        );

        let events = EventBus::new(
            local.store_arc(),
            config.event_buffer,
            config.recent_event_capacity,
        );
        let inner = NodeInner {
            consensus: Mutex::new(consensus),
            replicator: BlockReplicator::new(stores, registry.clone()),
            sync: SyncProtocol::new(verifier.clone(), registry.clone()),
            registry,
            local,
            verifier,
            transport,
            clock,
            events,
            proposals: Mutex::new(HashMap::new()),
            unfinished: Mutex::new(BTreeMap::new()),
            outbox: Mutex::new(Vec::new()),
            last_activity_ms: AtomicU64::new(now_ms),
            config,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    pub fn node_id(&self) -> &NodeId {
        &self.inner.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn role(&self) -> ConsensusRole {
        self.inner.consensus.lock().role()
    }

    pub fn is_leader(&self) -> bool {
        self.inner.consensus.lock().is_leader()
    }

    pub fn current_term(&self) -> u64 {
        self.inner.consensus.lock().current_term()
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.inner.consensus.lock().leader_id().cloned()
    }

    pub fn commit_index(&self) -> u64 {
        self.inner.consensus.lock().commit_index()
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.inner.registry
    }

    pub fn local_store(&self) -> &TargetStore {
        &self.inner.local
    }

    /// Handle for registering this node with a network.
    pub fn rpc_handler(&self) -> Weak<dyn RpcHandler> {
        let handler: Arc<dyn RpcHandler> = self.inner.clone();
        Arc::downgrade(&handler)
    }

    /// Live stream of every event this node emits.
    pub fn subscribe(&self) -> broadcast::Receiver<ConsensusEvent> {
        self.inner.events.subscribe()
    }

    pub fn recent_events(&self, limit: usize) -> Vec<ConsensusEvent> {
        self.inner.events.recent(limit)
    }

    /// Committed heights some replication target still lacks.
    pub fn unfinished_replications(&self) -> Vec<u64> {
        self.inner.unfinished.lock().keys().copied().collect()
    }

    /// Proposed blocks still waiting for their entry to commit.
    pub fn pending_proposals(&self) -> usize {
        self.inner.proposals.lock().len()
    }

    pub fn stats(&self) -> NodeStats {
        let local_tip = self.inner.local_tip();
        let consensus = self.inner.consensus.lock();
        NodeStats {
            node_id: consensus.node_id().clone(),
            role: consensus.role(),
            term: consensus.current_term(),
            leader: consensus.leader_id().cloned(),
            commit_index: consensus.commit_index(),
            last_log_index: consensus.log().last_index(),
            local_tip,
            last_activity_ms: self.inner.last_activity_ms.load(Ordering::Relaxed),
            consensus: consensus.stats(),
            registry: self.inner.registry.statistics(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Run startup actions. The Authority reasserts leadership here.
    pub async fn start(&self) {
        let actions = {
            let mut consensus = self.inner.consensus.lock();
            consensus.set_time(self.inner.clock.now());
            consensus.on_startup()
        };
        self.inner.dispatch(actions).await;
    }

    /// One timer step: flush deferred sends, advance consensus timers,
    /// mark silent peers, and catch up if a peer is ahead.
    pub async fn tick(&self) {
        let inner = &self.inner;
        let now_ms = inner.clock.now_ms();
        let mut actions = std::mem::take(&mut *inner.outbox.lock());
        {
            let tip = inner.local_tip();
            let mut consensus = inner.consensus.lock();
            consensus.set_time(inner.clock.now());
            consensus.set_local_tip(tip);
            actions.extend(consensus.tick());
        }
        inner.dispatch(actions).await;

        inner.registry.mark_stale(
            now_ms,
            inner.config.unreachable_after_ms,
            &inner.config.node_id,
        );

        if inner.config.auto_sync {
            self.catch_up_if_behind().await;
        }
    }

    /// Tick every `tick_interval` until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        self.start().await;
        let mut interval = tokio::time::interval(self.inner.config.tick_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(node = %self.node_id(), "Node running");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(node = %self.node_id(), "Node stopping");
                    break;
                }
                _ = interval.tick() => self.tick().await,
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Block append and replication
    // ═══════════════════════════════════════════════════════════════════════

    /// Propose a block. If this node leads, the block is committed once a
    /// cluster majority accepts it and is then replicated to every target.
    pub async fn append_block(
        &self,
        block: Block,
        transactions: Vec<Transaction>,
    ) -> Result<AppendOutcome, NodeError> {
        let inner = &self.inner;
        let bundle = BlockBundle::new(block, transactions);
        let tip = inner.local.store().tip()?;
        if let Err(error) = validate_block(&bundle, tip.as_ref(), inner.verifier.as_ref()) {
            metrics::record_validation_failure(error.metric_label());
            warn!(node = %self.node_id(), height = bundle.height(), %error, "Refusing invalid block");
            return Err(error.into());
        }

        let (entry, actions) = {
            let mut consensus = inner.consensus.lock();
            consensus.set_time(inner.clock.now());
            consensus.propose(bundle.block.hash, bundle.height())?
        };
        inner.touch();
        inner
            .proposals
            .lock()
            .insert(bundle.block.hash, bundle);

        let reports = inner.dispatch(actions).await;
        let committed = inner.consensus.lock().commit_index() >= entry.index;
        let replication = reports
            .into_iter()
            .find(|report| report.block_hash == entry.block_hash);
        Ok(AppendOutcome {
            entry,
            committed,
            replication,
        })
    }

    /// Re-drive replication of a committed height to the targets that
    /// failed it.
    pub async fn retry_replication(&self, height: u64) -> Result<ReplicationReport, NodeError> {
        let inner = &self.inner;
        let (bundle, previous) = inner
            .unfinished
            .lock()
            .get(&height)
            .cloned()
            .ok_or(NodeError::NothingToRetry(height))?;
        let targets: Vec<NodeId> = previous.pending_retry().into_iter().cloned().collect();
        if targets.is_empty() {
            inner.unfinished.lock().remove(&height);
            return Err(NodeError::NothingToRetry(height));
        }

        let report = inner
            .replicator
            .replicate_to(&targets, &bundle, inner.clock.now_ms());
        let term = inner.consensus.lock().current_term();
        inner.publish_replication(&report, term, None);

        let mut unfinished = inner.unfinished.lock();
        if report.pending_retry().is_empty() {
            unfinished.remove(&height);
        } else {
            unfinished.insert(height, (bundle, report.clone()));
        }
        Ok(report)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sync
    // ═══════════════════════════════════════════════════════════════════════

    /// Catch up from `peer`.
    pub async fn request_sync(&self, peer: &NodeId) -> Result<SyncReport, NodeError> {
        let inner = &self.inner;
        if *peer == inner.config.node_id || inner.registry.get(peer).is_none() {
            return Err(TransportError::UnknownPeer(peer.clone()).into());
        }

        let source = TransportBlockSource::new(peer.clone(), inner.transport.as_ref());
        let result = inner
            .sync
            .catch_up(&inner.local, &source, inner.clock.now_ms())
            .await;
        inner.refresh_local_tip();

        let term = inner.consensus.lock().current_term();
        match &result {
            Ok(report) if !report.applied.is_empty() => {
                inner.touch();
                let mut event = inner.event(EventKind::Replication, term).with_peer(peer.clone());
                if let Some(height) = report.final_height() {
                    event = event.with_height(height);
                }
                inner.publish(event.with_detail(format!(
                    "caught up {} blocks",
                    report.applied.len()
                )));
            }
            Ok(_) => {}
            Err(error) => {
                let mut event = inner
                    .event(EventKind::Replication, term)
                    .with_peer(peer.clone())
                    .with_detail(error.to_string())
                    .failed();
                if let Some(height) = error.applied_through() {
                    event = event.with_height(height);
                }
                inner.publish(event);
            }
        }
        result.map_err(NodeError::from)
    }

    /// Probe every peer's tip, then catch up from each peer still ahead.
    pub async fn sync_with_network(&self) -> NetworkSyncSummary {
        let inner = &self.inner;
        let peers = inner.config.peers();
        let probes = join_all(peers.iter().map(|peer| async move {
            (peer, inner.transport.fetch_tip(peer).await)
        }))
        .await;

        let now_ms = inner.clock.now_ms();
        let mut summary = NetworkSyncSummary {
            nodes_checked: probes.len(),
            ..NetworkSyncSummary::default()
        };
        for (peer, probe) in probes {
            match probe {
                Ok(Some(tip)) => inner.registry.observe_tip(peer, tip, now_ms),
                Ok(None) => inner.registry.observe_contact(peer, now_ms),
                Err(error) => {
                    debug!(node = %self.node_id(), peer = %peer, %error, "Tip probe failed");
                    inner.registry.set_status(peer, NodeStatus::Unreachable);
                }
            }
        }

        let start = inner.local_tip().map(|t| t.height);
        for record in inner.registry.peers_ahead_of(self.node_id(), start) {
            let local_height = inner.local_tip().map(|t| t.height);
            if record.reported_height <= local_height {
                continue;
            }
            match self.request_sync(&record.id).await {
                Ok(report) => summary.blocks_added += report.applied.len(),
                Err(error) => {
                    summary.blocks_failed += 1;
                    warn!(node = %self.node_id(), peer = %record.id, %error, "Sync with peer failed");
                }
            }
        }

        info!(
            node = %self.node_id(),
            nodes_checked = summary.nodes_checked,
            blocks_added = summary.blocks_added,
            blocks_failed = summary.blocks_failed,
            "Network sync finished"
        );
        summary
    }

    /// Catch up from the highest known peer if one reports a higher tip.
    async fn catch_up_if_behind(&self) {
        let local_height = self.inner.local_tip().map(|t| t.height);
        let ahead = self.inner.registry.peers_ahead_of(self.node_id(), local_height);
        for record in ahead {
            match self.request_sync(&record.id).await {
                Ok(_) => return,
                Err(error) => {
                    debug!(node = %self.node_id(), peer = %record.id, %error, "Catch-up attempt failed");
                }
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Action execution
// ═══════════════════════════════════════════════════════════════════════

enum Outbound {
    Vote(NodeId, RequestVote),
    Append(NodeId, AppendEntries),
}

enum Reply {
    Vote(VoteResponse),
    Append(AppendResponse),
}

impl NodeInner {
    /// Carry out `actions`, feeding peer replies back into consensus until
    /// no sends remain. Returns the reports of blocks committed meanwhile.
    async fn dispatch(&self, actions: Vec<Action>) -> Vec<ReplicationReport> {
        let mut reports = Vec::new();
        let mut queue = actions;

        for round in 0.. {
            let sends = self.perform_local(std::mem::take(&mut queue), &mut reports);
            if sends.is_empty() {
                break;
            }
            if round == MAX_DISPATCH_ROUNDS {
                debug!(node = %self.config.node_id, deferred = sends.len(), "Deferring sends to next tick");
                self.outbox.lock().extend(sends.into_iter().map(Outbound::into_action));
                break;
            }

            let replies = join_all(sends.into_iter().map(|send| self.send(send))).await;

            let now = self.clock.now();
            let now_ms = self.clock.now_ms();
            let mut consensus = self.consensus.lock();
            consensus.set_time(now);
            for reply in replies.into_iter().flatten() {
                match reply {
                    Reply::Vote(response) => {
                        self.registry.observe_contact(&response.voter_id, now_ms);
                        queue.extend(consensus.on_vote_response(&response));
                    }
                    Reply::Append(response) => {
                        match response.follower_tip {
                            Some(tip) => {
                                self.registry.observe_tip(&response.follower_id, tip, now_ms)
                            }
                            None => self.registry.observe_contact(&response.follower_id, now_ms),
                        }
                        queue.extend(consensus.on_append_response(&response));
                    }
                }
            }
        }
        self.drop_proposals_unless_leading();
        reports
    }

    /// Perform every action that needs no peer and return the sends.
    fn perform_local(
        &self,
        actions: Vec<Action>,
        reports: &mut Vec<ReplicationReport>,
    ) -> Vec<Outbound> {
        let mut sends = Vec::new();
        for action in actions {
            match action {
                Action::SendAppendEntries { to, message } => sends.push(Outbound::Append(to, message)),
                Action::SendRequestVote { to, message } => sends.push(Outbound::Vote(to, message)),
                Action::Emit(event) => self.publish(event),
                Action::PersistMeta {
                    current_term,
                    last_known_cluster_term,
                } => self.persist_meta(current_term, last_known_cluster_term),
                Action::Commit { entry } => {
                    if let Some(report) = self.replicate_committed(&entry) {
                        reports.push(report);
                    }
                }
            }
        }
        sends
    }

    async fn send(&self, outbound: Outbound) -> Option<Reply> {
        let (peer, result) = match outbound {
            Outbound::Vote(to, request) => {
                let result = self.transport.request_vote(&to, request).await;
                (to, result.map(Reply::Vote))
            }
            Outbound::Append(to, message) => {
                let result = self.transport.append_entries(&to, message).await;
                (to, result.map(Reply::Append))
            }
        };
        match result {
            Ok(reply) => Some(reply),
            Err(error) => {
                debug!(node = %self.config.node_id, peer = %peer, %error, "Peer RPC failed");
                if matches!(
                    error,
                    TransportError::Timeout { .. } | TransportError::PeerUnreachable(_)
                ) {
                    self.registry.set_status(&peer, NodeStatus::Unreachable);
                }
                None
            }
        }
    }

    /// Write a committed block to every target and report per target.
    fn replicate_committed(&self, entry: &LogEntry) -> Option<ReplicationReport> {
        let bundle = {
            let mut proposals = self.proposals.lock();
            let bundle = proposals.remove(&entry.block_hash);
            proposals.retain(|_, b| b.height() > entry.block_height);
            bundle
        };
        let Some(bundle) = bundle else {
            debug!(
                node = %self.config.node_id,
                index = entry.index,
                height = entry.block_height,
                "Committed entry has no local payload"
            );
            return None;
        };

        let report = self.replicator.replicate(&bundle, self.clock.now_ms());
        self.publish_replication(&report, entry.term, Some(entry.index));
        self.refresh_local_tip();
        self.touch();

        if !report.pending_retry().is_empty() {
            self.unfinished
                .lock()
                .insert(report.height, (bundle, report.clone()));
        } else if !report.is_complete() {
            warn!(
                node = %self.config.node_id,
                height = report.height,
                failed = report.failed().len(),
                "Replication failures are not retryable, not tracking"
            );
        }
        Some(report)
    }

    fn publish_replication(&self, report: &ReplicationReport, term: u64, index: Option<u64>) {
        for outcome in &report.outcomes {
            let mut event = self
                .event(EventKind::Replication, term)
                .with_peer(outcome.target.clone())
                .with_height(report.height);
            if let Some(index) = index {
                event = event.with_index(index);
            }
            match &outcome.result {
                Ok(applied) => event = event.with_detail(applied.as_str()),
                Err(error) => event = event.with_detail(error.to_string()).failed(),
            }
            self.publish(event);
        }

        let local_ok = report
            .outcome(&self.config.node_id)
            .is_some_and(|o| o.result.is_ok());
        if local_ok {
            let mut event = self
                .event(EventKind::EntryApplied, term)
                .with_height(report.height);
            if let Some(index) = index {
                event = event.with_index(index);
            }
            self.publish(event);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Helpers
    // ═══════════════════════════════════════════════════════════════════════

    fn event(&self, kind: EventKind, term: u64) -> ConsensusEvent {
        ConsensusEvent::new(kind, self.config.node_id.clone(), term)
    }

    fn publish(&self, event: ConsensusEvent) {
        self.events.publish(event, self.clock.now_ms());
    }

    fn persist_meta(&self, current_term: u64, last_known_cluster_term: u64) {
        let meta = ConsensusMeta {
            current_term,
            last_known_cluster_term,
        };
        if let Err(error) = self.local.store().save_consensus_meta(&meta) {
            warn!(node = %self.config.node_id, %error, "Failed to persist consensus metadata");
        }
    }

    fn local_tip(&self) -> Option<ChainTip> {
        match self.local.store().tip() {
            Ok(tip) => tip,
            Err(error) => {
                debug!(node = %self.config.node_id, %error, "Local tip unavailable");
                None
            }
        }
    }

    /// Publish the local tip to consensus and the registry.
    fn refresh_local_tip(&self) {
        let Some(tip) = self.local_tip() else {
            return;
        };
        self.registry
            .observe_tip(&self.config.node_id, tip, self.clock.now_ms());
        metrics::set_block_height(tip.height);
        self.consensus.lock().set_local_tip(Some(tip));
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(self.clock.now_ms(), Ordering::Relaxed);
    }

    /// Handle actions produced by an inbound RPC. Sends are deferred to
    /// the next tick; handlers never call peers.
    fn perform_inbound(&self, actions: Vec<Action>) {
        let mut reports = Vec::new();
        let sends = self.perform_local(actions, &mut reports);
        if !sends.is_empty() {
            self.outbox
                .lock()
                .extend(sends.into_iter().map(Outbound::into_action));
        }
        self.drop_proposals_unless_leading();
    }

    /// A node that no longer leads will never see its proposals commit
    /// locally; the new leader's entries replace them.
    fn drop_proposals_unless_leading(&self) {
        if self.consensus.lock().is_leader() {
            return;
        }
        let mut proposals = self.proposals.lock();
        if !proposals.is_empty() {
            debug!(node = %self.config.node_id, dropped = proposals.len(), "Dropping proposals after losing leadership");
            proposals.clear();
        }
    }
}

impl Outbound {
    fn into_action(self) -> Action {
        match self {
            Outbound::Vote(to, message) => Action::SendRequestVote { to, message },
            Outbound::Append(to, message) => Action::SendAppendEntries { to, message },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Inbound RPCs
// ═══════════════════════════════════════════════════════════════════════

impl RpcHandler for NodeInner {
    fn handle_request_vote(&self, request: RequestVote) -> VoteResponse {
        self.registry
            .observe_contact(&request.candidate_id, self.clock.now_ms());
        let (response, actions) = {
            let mut consensus = self.consensus.lock();
            consensus.set_time(self.clock.now());
            consensus.on_request_vote(&request)
        };
        self.perform_inbound(actions);
        response
    }

    fn handle_append_entries(&self, message: AppendEntries) -> AppendResponse {
        let now_ms = self.clock.now_ms();
        match message.leader_tip {
            Some(tip) => self.registry.observe_tip(&message.leader_id, tip, now_ms),
            None => self.registry.observe_contact(&message.leader_id, now_ms),
        }
        let tip = self.local_tip();
        let (response, actions) = {
            let mut consensus = self.consensus.lock();
            consensus.set_time(self.clock.now());
            consensus.set_local_tip(tip);
            consensus.on_append_entries(&message)
        };
        if !message.entries.is_empty() {
            self.touch();
        }
        self.perform_inbound(actions);
        response
    }

    fn handle_fetch_tip(&self) -> Result<Option<ChainTip>, StorageError> {
        self.local.store().tip()
    }

    fn handle_fetch_block(&self, height: u64) -> Result<Option<BlockBundle>, StorageError> {
        self.local.store().get_bundle_at_height(height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::transport::InMemoryNetwork;
    use consortium_storage::test_helpers::{keypair, make_chain, write_bundle};
    use consortium_storage::LedgerStore;
    use consortium_storage_memory::MemoryLedgerStore;
    use consortium_types::KeyDirectory;
    use std::time::Duration;

    fn single_authority() -> (LedgerNode, Arc<MemoryLedgerStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryLedgerStore::new());
        let stores = Arc::new(StoreRegistry::new());
        stores.register(NodeId::from("authority"), store.clone());
        let (node, clock) = authority_over(stores);
        (node, store, clock)
    }

    /// A lone Authority that also replicates into an archive store.
    fn authority_with_archive() -> (LedgerNode, Arc<MemoryLedgerStore>) {
        let archive = Arc::new(MemoryLedgerStore::new());
        let stores = Arc::new(StoreRegistry::new());
        stores.register(NodeId::from("authority"), Arc::new(MemoryLedgerStore::new()));
        stores.register(NodeId::from("archive"), archive.clone());
        let (node, _clock) = authority_over(stores);
        (node, archive)
    }

    fn authority_over(stores: Arc<StoreRegistry>) -> (LedgerNode, Arc<ManualClock>) {
        let authority = keypair("authority", 1);
        let network = InMemoryNetwork::new();
        let clock = Arc::new(ManualClock::new(Duration::from_secs(1)));
        let node = LedgerNode::new(
            NodeConfig::new(NodeId::from("authority"), NodeId::from("authority"), Vec::new()),
            stores,
            Arc::new(network.transport(NodeId::from("authority"), Duration::from_millis(50))),
            Arc::new(KeyDirectory::new().with_keypair(&authority)),
            clock.clone(),
        )
        .unwrap();
        (node, clock)
    }

    #[test]
    fn test_missing_local_store_is_terminal() {
        let network = InMemoryNetwork::new();
        let error = LedgerNode::new(
            NodeConfig::new(NodeId::from("authority"), NodeId::from("authority"), Vec::new()),
            Arc::new(StoreRegistry::new()),
            Arc::new(network.transport(NodeId::from("authority"), Duration::from_millis(50))),
            Arc::new(KeyDirectory::new()),
            Arc::new(ManualClock::default()),
        )
        .unwrap_err();
        assert!(error.is_terminal());
    }

    #[tokio::test]
    async fn test_lone_authority_commits_alone() {
        let (node, store, _clock) = single_authority();
        node.start().await;
        assert_eq!(node.role(), ConsensusRole::Authority);
        assert_eq!(node.current_term(), 1);

        let chain = make_chain(&keypair("authority", 1), 2, 3);
        for bundle in &chain {
            let outcome = node
                .append_block(bundle.block.clone(), bundle.transactions.clone())
                .await
                .unwrap();
            assert!(outcome.committed);
            assert!(outcome.replication.unwrap().is_complete());
        }

        assert_eq!(store.tip().unwrap(), Some(chain[1].block.tip()));
        let stats = node.stats();
        assert_eq!(stats.commit_index, 2);
        assert_eq!(stats.local_tip.map(|t| t.height), Some(1));
        assert_eq!(
            store.load_consensus_meta().unwrap().map(|m| m.current_term),
            Some(1)
        );
        let kinds: Vec<EventKind> = node.recent_events(100).iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&EventKind::LeaderRestored));
        assert!(kinds.contains(&EventKind::EntryApplied));
    }

    #[tokio::test]
    async fn test_invalid_block_is_refused() {
        let (node, store, _clock) = single_authority();
        node.start().await;
        let chain = make_chain(&keypair("authority", 1), 3, 1);

        // Height 1 without genesis does not extend the empty store.
        let error = node
            .append_block(chain[1].block.clone(), chain[1].transactions.clone())
            .await
            .unwrap_err();
        assert!(matches!(error, NodeError::Validation(_)));
        assert_eq!(node.commit_index(), 0);
        assert!(store.tip().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retry_without_failures() {
        let (node, _store, _clock) = single_authority();
        assert!(matches!(
            node.retry_replication(7).await,
            Err(NodeError::NothingToRetry(7))
        ));
        assert!(matches!(
            node.request_sync(&NodeId::from("ghost")).await,
            Err(NodeError::Transport(TransportError::UnknownPeer(_)))
        ));
    }

    #[tokio::test]
    async fn test_conflicting_target_is_not_tracked_for_retry() {
        let (node, archive) = authority_with_archive();
        node.start().await;
        let foreign = make_chain(&keypair("intruder", 9), 1, 0);
        write_bundle(archive.as_ref(), &foreign[0]).unwrap();

        let genesis = &make_chain(&keypair("authority", 1), 1, 2)[0];
        let outcome = node
            .append_block(genesis.block.clone(), genesis.transactions.clone())
            .await
            .unwrap();
        assert!(outcome.committed);
        let report = outcome.replication.unwrap();
        assert!(!report.is_complete());
        assert!(report.pending_retry().is_empty());

        assert!(node.unfinished_replications().is_empty());
        assert!(matches!(
            node.retry_replication(0).await,
            Err(NodeError::NothingToRetry(0))
        ));
    }

    #[tokio::test]
    async fn test_retry_forgets_height_once_failure_is_permanent() {
        let (node, archive) = authority_with_archive();
        node.start().await;
        archive.set_available(false);

        let genesis = &make_chain(&keypair("authority", 1), 1, 0)[0];
        let outcome = node
            .append_block(genesis.block.clone(), genesis.transactions.clone())
            .await
            .unwrap();
        assert_eq!(outcome.replication.unwrap().pending_retry().len(), 1);
        assert_eq!(node.unfinished_replications(), vec![0]);

        // The archive comes back holding someone else's genesis.
        archive.set_available(true);
        let foreign = make_chain(&keypair("intruder", 9), 1, 0);
        write_bundle(archive.as_ref(), &foreign[0]).unwrap();

        let retry = node.retry_replication(0).await.unwrap();
        assert!(!retry.is_complete());
        assert!(retry.pending_retry().is_empty());
        assert!(node.unfinished_replications().is_empty());
    }
}
