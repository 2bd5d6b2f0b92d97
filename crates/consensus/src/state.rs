//! Consensus state machine.
//!
//! One [`ConsensusState`] per node. The runtime owns it behind a lock, so
//! role and term changes are applied one at a time. Every handler is
//! synchronous and returns the [`Action`]s the runtime must carry out.
//!
//! # Log catch-up for a returning Authority
//!
//! The Authority leads even when its log is behind (it may have been down
//! while an Interim Leader committed entries). A follower that has
//! committed past the Authority's `leader_commit` answers with its
//! committed tail instead of applying the message, and the Authority
//! adopts those entries before proposing anything new.

use crate::action::Action;
use crate::config::{ConsensusConfig, QuorumPolicy};
use crate::error::{ElectionError, ProposeError};
use crate::heartbeat::HeartbeatMonitor;
use crate::log::ReplicationLog;
use crate::messages::{AppendEntries, AppendResponse, RequestVote, VoteResponse};
use crate::vote_tracker::{majority, VoteTracker};
use consortium_metrics as metrics;
use consortium_types::{
    ChainTip, ConsensusEvent, ConsensusRole, EventKind, Hash, LogEntry, NodeId, Vote,
};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Consensus statistics for monitoring.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConsensusStats {
    pub elections_started: u64,
    pub elections_won: u64,
    pub elections_failed: u64,
    /// Times this node handed interim leadership back to the Authority.
    pub handbacks: u64,
    /// Times this node (as Authority) reasserted leadership.
    pub reassertions: u64,
    pub committed_entries: u64,
}

/// State recovered from storage on startup.
///
/// For a fresh start, use `RecoveredState::default()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveredState {
    pub current_term: u64,
    pub last_known_cluster_term: u64,
}

#[derive(Debug, Clone)]
struct Campaign {
    term: u64,
    started_at: Duration,
}

#[derive(Debug, Clone)]
struct PendingEntry {
    entry: LogEntry,
    acks: BTreeSet<NodeId>,
}

/// Role-asymmetric consensus state for one node.
pub struct ConsensusState {
    node_id: NodeId,
    authority_id: NodeId,
    /// Voting Members. Never contains the Authority.
    members: BTreeSet<NodeId>,
    config: ConsensusConfig,

    role: ConsensusRole,
    current_term: u64,
    last_known_cluster_term: u64,
    leader_id: Option<NodeId>,
    /// Votes for terms at or below this are refused: cast votes are not
    /// persisted, so a restarted node cannot tell whether it already voted.
    recovered_term: u64,

    heartbeat: HeartbeatMonitor,
    votes: VoteTracker,
    log: ReplicationLog,
    campaign: Option<Campaign>,
    pending: Option<PendingEntry>,
    /// Leader's next log index to send, per peer.
    next_index: BTreeMap<NodeId, u64>,
    last_heartbeat_sent: Option<Duration>,

    local_tip: Option<ChainTip>,
    now: Duration,
    stats: ConsensusStats,
}

impl std::fmt::Debug for ConsensusState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusState")
            .field("node_id", &self.node_id)
            .field("role", &self.role)
            .field("current_term", &self.current_term)
            .field("leader_id", &self.leader_id)
            .field("commit_index", &self.log.commit_index())
            .finish_non_exhaustive()
    }
}

impl ConsensusState {
    /// Create the state for `node_id`.
    ///
    /// The node is the Authority iff `node_id == authority_id`; the role is
    /// fixed by configuration, never inferred. `members` lists the voting
    /// Members; the Authority is removed from it if present.
    pub fn new(
        node_id: NodeId,
        authority_id: NodeId,
        members: impl IntoIterator<Item = NodeId>,
        config: ConsensusConfig,
        recovered: RecoveredState,
    ) -> Self {
        let role = if node_id == authority_id {
            ConsensusRole::Authority
        } else {
            ConsensusRole::Member
        };
        let members: BTreeSet<NodeId> = members
            .into_iter()
            .filter(|m| *m != authority_id)
            .collect();
        let heartbeat = HeartbeatMonitor::new(&config, &node_id, Duration::ZERO);

        Self {
            node_id,
            authority_id,
            members,
            config,
            role,
            current_term: recovered.current_term,
            last_known_cluster_term: recovered.last_known_cluster_term,
            leader_id: None,
            recovered_term: recovered.current_term,
            heartbeat,
            votes: VoteTracker::new(),
            log: ReplicationLog::new(),
            campaign: None,
            pending: None,
            next_index: BTreeMap::new(),
            last_heartbeat_sent: None,
            local_tip: None,
            now: Duration::ZERO,
            stats: ConsensusStats::default(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn authority_id(&self) -> &NodeId {
        &self.authority_id
    }

    pub fn members(&self) -> &BTreeSet<NodeId> {
        &self.members
    }

    pub fn role(&self) -> ConsensusRole {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role.is_leader()
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn last_known_cluster_term(&self) -> u64 {
        self.last_known_cluster_term
    }

    pub fn leader_id(&self) -> Option<&NodeId> {
        self.leader_id.as_ref()
    }

    pub fn commit_index(&self) -> u64 {
        self.log.commit_index()
    }

    pub fn log(&self) -> &ReplicationLog {
        &self.log
    }

    pub fn heartbeat(&self) -> &HeartbeatMonitor {
        &self.heartbeat
    }

    pub fn votes(&self) -> &VoteTracker {
        &self.votes
    }

    /// The leader's entry still awaiting quorum, if any.
    pub fn pending_entry(&self) -> Option<&LogEntry> {
        self.pending.as_ref().map(|p| &p.entry)
    }

    pub fn local_tip(&self) -> Option<ChainTip> {
        self.local_tip
    }

    pub fn stats(&self) -> ConsensusStats {
        self.stats
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    /// Every other node in the cluster, Authority included.
    pub fn peers(&self) -> Vec<NodeId> {
        std::iter::once(&self.authority_id)
            .chain(self.members.iter())
            .filter(|id| **id != self.node_id)
            .cloned()
            .collect()
    }

    /// Votes needed to win a Member election.
    pub fn election_quorum(&self) -> usize {
        match self.config.quorum_policy {
            QuorumPolicy::MembersOnly => majority(self.members.len()),
            QuorumPolicy::FullCluster => majority(self.members.len() + 1),
        }
    }

    /// Accepts needed to commit a log entry.
    pub fn commit_quorum(&self) -> usize {
        majority(self.members.len() + 1)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Time and local inputs
    // ═══════════════════════════════════════════════════════════════════════

    /// Set the current time. Must be called before each handler.
    pub fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    /// Record this node's chain tip; carried in outgoing messages.
    pub fn set_local_tip(&mut self, tip: Option<ChainTip>) {
        self.local_tip = tip;
    }

    /// Called once after construction.
    ///
    /// The Authority always starts as Authority and immediately reasserts
    /// leadership above every term it has seen. Members start their
    /// election timer.
    pub fn on_startup(&mut self) -> Vec<Action> {
        if self.role == ConsensusRole::Authority {
            self.reassert_authority()
        } else {
            self.heartbeat.reset(self.now);
            Vec::new()
        }
    }

    /// Periodic timer: leaders send heartbeats, Members check the election
    /// timeout, Candidates check the election window.
    pub fn tick(&mut self) -> Vec<Action> {
        match self.role {
            ConsensusRole::Authority | ConsensusRole::InterimLeader => {
                let due = self.last_heartbeat_sent.map_or(true, |sent| {
                    self.now.saturating_sub(sent) >= self.config.heartbeat_interval
                });
                if !due {
                    return Vec::new();
                }
                self.last_heartbeat_sent = Some(self.now);
                self.broadcast_append_entries()
            }
            ConsensusRole::Member => {
                if !self.members.contains(&self.node_id) || !self.heartbeat.election_due(self.now)
                {
                    return Vec::new();
                }
                match self.start_election() {
                    Ok(actions) => actions,
                    Err(error) => {
                        debug!(node = %self.node_id, %error, "Election not started");
                        Vec::new()
                    }
                }
            }
            ConsensusRole::Candidate => {
                let expired = self.campaign.as_ref().is_some_and(|c| {
                    self.now.saturating_sub(c.started_at) > self.config.election_window
                });
                if expired {
                    self.fail_election()
                } else {
                    Vec::new()
                }
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Elections
    // ═══════════════════════════════════════════════════════════════════════

    /// Begin a campaign for `current_term + 1`.
    ///
    /// Only a Member whose leader has been silent past its election timeout
    /// may campaign. At most one campaign runs per term.
    pub fn start_election(&mut self) -> Result<Vec<Action>, ElectionError> {
        match self.role {
            ConsensusRole::Member => {}
            ConsensusRole::Candidate => {
                if let Some(campaign) = &self.campaign {
                    return Err(ElectionError::CampaignInFlight {
                        term: campaign.term,
                    });
                }
            }
            role @ (ConsensusRole::Authority | ConsensusRole::InterimLeader) => {
                return Err(ElectionError::NotEligible {
                    role: role.as_str(),
                })
            }
        }
        if !self.members.contains(&self.node_id) {
            return Err(ElectionError::NotEligible {
                role: self.role.as_str(),
            });
        }
        if !self.heartbeat.election_due(self.now) {
            return Err(ElectionError::LeaderAlive);
        }

        let term = self.current_term + 1;
        if !self.votes.try_latch_campaign(term) {
            return Err(ElectionError::CampaignInFlight { term });
        }

        self.current_term = term;
        self.role = ConsensusRole::Candidate;
        self.leader_id = None;
        self.campaign = Some(Campaign {
            term,
            started_at: self.now,
        });
        self.votes.record_vote(Vote {
            term,
            candidate_id: self.node_id.clone(),
            voter_id: self.node_id.clone(),
            timestamp_ms: self.now_ms(),
        });
        self.votes.remember_decision(term, &self.node_id, true);
        self.votes.record_grant(term, self.node_id.clone());
        self.stats.elections_started += 1;
        metrics::set_term(term);
        metrics::record_election("started");

        info!(
            node = %self.node_id,
            term,
            timeout_ms = self.heartbeat.election_timeout().as_millis() as u64,
            "Leader silent past election timeout, starting election"
        );

        let mut actions = vec![
            self.persist_meta(),
            Action::Emit(self.event(EventKind::ElectionStart)),
        ];

        if self.votes.grant_count(term) >= self.election_quorum() {
            actions.extend(self.become_interim_leader());
            return Ok(actions);
        }

        let request = RequestVote {
            term,
            candidate_id: self.node_id.clone(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        for voter in self.members.iter().filter(|m| **m != self.node_id) {
            actions.push(Action::SendRequestVote {
                to: voter.clone(),
                message: request.clone(),
            });
        }
        Ok(actions)
    }

    /// Handle a vote request from a campaigning Member.
    ///
    /// A decision for a given `(term, candidate)` is made once; repeats get
    /// the same answer.
    pub fn on_request_vote(&mut self, request: &RequestVote) -> (VoteResponse, Vec<Action>) {
        self.heartbeat.record_peer(&request.candidate_id, self.now);
        let mut actions = Vec::new();

        if self.role == ConsensusRole::Authority {
            // Not a voter. A live Authority answers a campaign by reasserting.
            if request.term >= self.current_term {
                self.observe_cluster_term(request.term);
                info!(
                    node = %self.node_id,
                    candidate = %request.candidate_id,
                    term = request.term,
                    "Member campaigning while Authority is alive"
                );
                actions.extend(self.reassert_authority());
            }
            return (self.vote_response(false), actions);
        }

        if let Some(granted) = self.votes.decision(request.term, &request.candidate_id) {
            return (self.vote_response(granted), actions);
        }

        if request.term < self.current_term {
            self.deny_vote(
                request,
                ElectionError::StaleTerm {
                    term: request.term,
                    current: self.current_term,
                },
            );
            return (self.vote_response(false), actions);
        }

        if request.term > self.current_term {
            self.adopt_term(request.term, &mut actions);
        } else if self.role == ConsensusRole::Candidate && self.outranked_by(request) {
            info!(
                node = %self.node_id,
                rival = %request.candidate_id,
                term = request.term,
                "Yielding to outranking candidate"
            );
            self.campaign = None;
            self.role = ConsensusRole::Member;
            self.votes.release_self_vote(request.term, &self.node_id);
            metrics::record_election("yielded");
        }

        if let Some(error) = self.vote_denial(request) {
            self.deny_vote(request, error);
            return (self.vote_response(false), actions);
        }

        self.votes.record_vote(Vote {
            term: request.term,
            candidate_id: request.candidate_id.clone(),
            voter_id: self.node_id.clone(),
            timestamp_ms: self.now_ms(),
        });
        self.votes
            .remember_decision(request.term, &request.candidate_id, true);
        self.heartbeat.reset(self.now);
        debug!(node = %self.node_id, candidate = %request.candidate_id, term = request.term, "Vote granted");
        actions.push(Action::Emit(
            self.event(EventKind::VoteGranted)
                .with_peer(request.candidate_id.clone()),
        ));
        (self.vote_response(true), actions)
    }

    /// Why `request` cannot get our vote at its term, if it cannot.
    fn vote_denial(&self, request: &RequestVote) -> Option<ElectionError> {
        if !self.members.contains(&request.candidate_id) {
            return Some(ElectionError::NotEligible { role: "non-member" });
        }
        if request.term <= self.recovered_term {
            return Some(ElectionError::StaleTerm {
                term: request.term,
                current: self.recovered_term,
            });
        }
        if request.last_log_index < self.log.last_index() {
            return Some(ElectionError::StaleLog {
                term: request.term,
                candidate_index: request.last_log_index,
                local_index: self.log.last_index(),
            });
        }
        match self.votes.voted_for(request.term) {
            Some(candidate) if *candidate != request.candidate_id => {
                Some(ElectionError::AlreadyVoted {
                    term: request.term,
                    candidate: candidate.clone(),
                })
            }
            _ => None,
        }
    }

    /// Remember, log and count a refused vote.
    fn deny_vote(&mut self, request: &RequestVote, error: ElectionError) {
        debug!(
            node = %self.node_id,
            candidate = %request.candidate_id,
            term = request.term,
            reason = error.metric_label(),
            %error,
            "Vote denied"
        );
        metrics::record_election(error.metric_label());
        self.votes
            .remember_decision(request.term, &request.candidate_id, false);
    }

    /// Count a vote response for our campaign.
    pub fn on_vote_response(&mut self, response: &VoteResponse) -> Vec<Action> {
        self.heartbeat.record_peer(&response.voter_id, self.now);
        let mut actions = Vec::new();

        if response.term > self.current_term && self.role != ConsensusRole::Authority {
            self.adopt_term(response.term, &mut actions);
            return actions;
        }

        let Some(term) = self.campaign.as_ref().map(|c| c.term) else {
            return actions;
        };
        if self.role != ConsensusRole::Candidate
            || response.term != term
            || !response.granted
            || !self.members.contains(&response.voter_id)
        {
            return actions;
        }

        let granted = self.votes.record_grant(term, response.voter_id.clone());
        debug!(node = %self.node_id, term, granted, needed = self.election_quorum(), "Vote received");
        if granted >= self.election_quorum() {
            actions.extend(self.become_interim_leader());
        }
        actions
    }

    fn outranked_by(&self, request: &RequestVote) -> bool {
        let ours = self.log.last_index();
        request.last_log_index > ours
            || (request.last_log_index == ours && request.candidate_id < self.node_id)
    }

    fn become_interim_leader(&mut self) -> Vec<Action> {
        let term = self.current_term;
        let granted = self.votes.grant_count(term);
        self.role = ConsensusRole::InterimLeader;
        self.leader_id = Some(self.node_id.clone());
        self.campaign = None;
        self.reset_peer_progress();
        self.stats.elections_won += 1;
        metrics::record_election("won");

        info!(
            node = %self.node_id,
            term,
            votes = granted,
            needed = self.election_quorum(),
            "Won election, acting as interim leader"
        );

        let mut actions = vec![Action::Emit(
            self.event(EventKind::LeaderElected)
                .with_detail(format!("{granted} of {} members", self.members.len())),
        )];
        self.last_heartbeat_sent = Some(self.now);
        actions.extend(self.broadcast_append_entries());
        actions
    }

    fn fail_election(&mut self) -> Vec<Action> {
        let Some(campaign) = self.campaign.take() else {
            return Vec::new();
        };
        let error = ElectionError::QuorumNotReached {
            term: campaign.term,
            granted: self.votes.grant_count(campaign.term),
            needed: self.election_quorum(),
        };
        self.role = ConsensusRole::Member;
        self.stats.elections_failed += 1;
        self.heartbeat.rerandomize();
        self.heartbeat.reset(self.now);
        metrics::record_election(error.metric_label());

        warn!(
            node = %self.node_id,
            term = campaign.term,
            %error,
            next_timeout_ms = self.heartbeat.election_timeout().as_millis() as u64,
            "Election failed"
        );

        vec![Action::Emit(
            self.event(EventKind::ElectionFailed)
                .with_detail(error.to_string())
                .failed(),
        )]
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Leadership changes
    // ═══════════════════════════════════════════════════════════════════════

    /// Move a non-Authority node to a newer term, stepping down from any
    /// candidacy or interim leadership.
    fn adopt_term(&mut self, term: u64, actions: &mut Vec<Action>) {
        debug_assert!(self.role != ConsensusRole::Authority);
        self.current_term = term;
        self.observe_cluster_term(term);
        self.leader_id = None;
        match self.role {
            ConsensusRole::Candidate => {
                self.campaign = None;
                self.role = ConsensusRole::Member;
                metrics::record_election("superseded");
            }
            ConsensusRole::InterimLeader => {
                info!(node = %self.node_id, term, "Newer term observed, stepping down");
                self.role = ConsensusRole::Member;
                self.pending = None;
                self.next_index.clear();
            }
            ConsensusRole::Member | ConsensusRole::Authority => {}
        }
        self.votes.prune_below(term);
        metrics::set_term(term);
        actions.push(self.persist_meta());
    }

    /// Interim Leader yields to a returning Authority.
    ///
    /// Any in-flight round is abandoned and `leader_id` stays empty until
    /// the next Authority heartbeat sets it.
    fn hand_back(&mut self, authority_term: u64, actions: &mut Vec<Action>) {
        info!(
            node = %self.node_id,
            interim_term = self.current_term,
            authority_term,
            abandoned = ?self.pending.as_ref().map(|p| p.entry.index),
            "Authority returned, handing back leadership"
        );
        actions.push(Action::Emit(
            self.event(EventKind::LeadershipTransferred)
                .with_peer(self.authority_id.clone())
                .with_detail(format!("authority term {authority_term}")),
        ));
        self.role = ConsensusRole::Member;
        self.leader_id = None;
        self.pending = None;
        self.next_index.clear();
        self.heartbeat.record_leader_contact(self.now);
        self.stats.handbacks += 1;

        if authority_term > self.current_term {
            self.current_term = authority_term;
            self.observe_cluster_term(authority_term);
            self.votes.prune_below(authority_term);
            metrics::set_term(authority_term);
            actions.push(self.persist_meta());
        }
    }

    /// Authority takes a term above everything it has observed and
    /// announces itself to every peer.
    fn reassert_authority(&mut self) -> Vec<Action> {
        let term = self.current_term.max(self.last_known_cluster_term) + 1;
        self.current_term = term;
        self.leader_id = Some(self.node_id.clone());
        self.reset_peer_progress();
        self.votes.prune_below(term);
        self.stats.reassertions += 1;
        metrics::set_term(term);

        info!(
            node = %self.node_id,
            term,
            last_known_cluster_term = self.last_known_cluster_term,
            "Authority asserting leadership"
        );

        let mut actions = vec![
            self.persist_meta(),
            Action::Emit(self.event(EventKind::LeaderRestored)),
        ];
        self.last_heartbeat_sent = Some(self.now);
        actions.extend(self.broadcast_append_entries());
        actions
    }

    fn observe_cluster_term(&mut self, term: u64) {
        self.last_known_cluster_term = self.last_known_cluster_term.max(term);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Log replication
    // ═══════════════════════════════════════════════════════════════════════

    /// Propose a block as the next log entry.
    ///
    /// Returns the entry and the actions replicating it. Re-proposing the
    /// block of the pending entry returns that entry again and re-sends it.
    pub fn propose(
        &mut self,
        block_hash: Hash,
        block_height: u64,
    ) -> Result<(LogEntry, Vec<Action>), ProposeError> {
        if !self.role.is_leader() {
            return Err(ProposeError::NotLeader {
                leader: self.leader_id.clone(),
            });
        }
        if let Some(pending) = &self.pending {
            if pending.entry.block_hash == block_hash {
                let entry = pending.entry.clone();
                return Ok((entry, self.broadcast_append_entries()));
            }
            return Err(ProposeError::UncommittedEntryPending {
                index: pending.entry.index,
                block_hash: pending.entry.block_hash,
            });
        }

        let entry = LogEntry {
            term: self.current_term,
            index: self.log.last_index() + 1,
            block_hash,
            block_height,
            timestamp_ms: self.now_ms(),
        };
        self.log.append(entry.clone())?;
        self.pending = Some(PendingEntry {
            entry: entry.clone(),
            acks: BTreeSet::from([self.node_id.clone()]),
        });

        debug!(
            node = %self.node_id,
            term = entry.term,
            index = entry.index,
            height = block_height,
            "Leader appended entry"
        );

        let peers = self.peers();
        let mut actions = vec![
            Action::Emit(
                self.event(EventKind::LeaderAppend)
                    .with_index(entry.index)
                    .with_height(block_height),
            ),
            Action::Emit(
                self.event(EventKind::AppendEntries)
                    .with_index(entry.index)
                    .with_height(block_height)
                    .with_detail(format!("{} peers", peers.len())),
            ),
        ];
        actions.extend(self.broadcast_append_entries());
        actions.extend(self.try_commit());
        Ok((entry, actions))
    }

    /// Handle AppendEntries (or a heartbeat) from a leader.
    pub fn on_append_entries(&mut self, message: &AppendEntries) -> (AppendResponse, Vec<Action>) {
        self.heartbeat.record_peer(&message.leader_id, self.now);
        let mut actions = Vec::new();

        if self.role == ConsensusRole::Authority {
            // Another node is leading. The Authority never follows.
            if message.term >= self.current_term {
                self.observe_cluster_term(message.term);
                warn!(
                    node = %self.node_id,
                    leader = %message.leader_id,
                    term = message.term,
                    "Rival leader observed, reasserting"
                );
                actions.extend(self.reassert_authority());
            }
            return (self.append_response(false, self.log.last_index()), actions);
        }

        if message.term < self.current_term {
            return (self.append_response(false, self.log.last_index()), actions);
        }

        let from_authority = message.leader_id == self.authority_id;
        match self.role {
            ConsensusRole::InterimLeader if from_authority => {
                self.hand_back(message.term, &mut actions);
                return (self.append_response(false, self.log.last_index()), actions);
            }
            ConsensusRole::InterimLeader if message.term == self.current_term => {
                warn!(
                    node = %self.node_id,
                    rival = %message.leader_id,
                    term = message.term,
                    "Second leader in our term, ignoring"
                );
                return (self.append_response(false, self.log.last_index()), actions);
            }
            _ => {}
        }

        if message.term > self.current_term {
            self.adopt_term(message.term, &mut actions);
        } else if self.role == ConsensusRole::Candidate {
            self.campaign = None;
            self.role = ConsensusRole::Member;
            metrics::record_election("superseded");
        }

        self.leader_id = Some(message.leader_id.clone());
        self.heartbeat.record_leader_contact(self.now);

        if from_authority && self.log.commit_index() > message.leader_commit {
            let tail = self.log.committed_from(
                message.leader_commit + 1,
                self.config.max_entries_per_message,
            );
            debug!(
                node = %self.node_id,
                authority_commit = message.leader_commit,
                our_commit = self.log.commit_index(),
                entries = tail.len(),
                "Authority behind on commits, returning committed tail"
            );
            let mut response = self.append_response(false, self.log.last_index());
            response.committed_tail = tail;
            return (response, actions);
        }

        match self.log.term_at(message.prev_log_index) {
            Some(term) if term == message.prev_log_term => {}
            Some(_) => {
                if message.prev_log_index > self.log.commit_index() {
                    let _ = self.log.truncate_from(message.prev_log_index);
                }
                let matched = self
                    .log
                    .last_index()
                    .min(message.prev_log_index.saturating_sub(1));
                return (self.append_response(false, matched), actions);
            }
            None => {
                return (self.append_response(false, self.log.last_index()), actions);
            }
        }

        // Highest index known to hold the leader's entry.
        let mut matched = message.prev_log_index;
        let mut accepted = true;
        for entry in &message.entries {
            match self.log.term_at(entry.index) {
                Some(term) if term == entry.term => {
                    matched = entry.index;
                    continue;
                }
                Some(_) => {
                    if let Err(error) = self.log.truncate_from(entry.index) {
                        warn!(node = %self.node_id, index = entry.index, %error, "Leader entry conflicts with committed log");
                        accepted = false;
                        break;
                    }
                }
                None => {}
            }
            if let Err(error) = self.log.append(entry.clone()) {
                warn!(node = %self.node_id, index = entry.index, %error, "Failed to append leader entry");
                accepted = false;
                break;
            }
            matched = entry.index;
        }

        if message.leader_commit > self.log.commit_index() {
            let target = message.leader_commit.min(matched);
            match self.log.commit_to(target) {
                Ok(newly) if !newly.is_empty() => {
                    debug!(node = %self.node_id, commit_index = target, "Follower commit advanced");
                    metrics::set_commit_index(target);
                }
                Ok(_) => {}
                Err(error) => warn!(node = %self.node_id, %error, "Commit index not advanced"),
            }
        }

        (self.append_response(accepted, matched), actions)
    }

    /// Handle a follower's answer to AppendEntries.
    pub fn on_append_response(&mut self, response: &AppendResponse) -> Vec<Action> {
        let peer = &response.follower_id;
        self.heartbeat.record_peer(peer, self.now);
        let mut actions = Vec::new();

        if response.term > self.current_term {
            if self.role == ConsensusRole::Authority {
                self.observe_cluster_term(response.term);
                actions.extend(self.reassert_authority());
            } else {
                self.adopt_term(response.term, &mut actions);
            }
            return actions;
        }
        if !self.role.is_leader() || response.term != self.current_term {
            return actions;
        }

        if !response.committed_tail.is_empty() {
            if self.role == ConsensusRole::Authority {
                self.adopt_committed(&response.committed_tail);
                actions.push(self.append_entries_to(peer));
            }
            return actions;
        }

        if response.success {
            self.next_index
                .insert(peer.clone(), response.match_index + 1);
            if let Some(pending) = &mut self.pending {
                if response.match_index >= pending.entry.index {
                    pending.acks.insert(peer.clone());
                }
            }
            actions.extend(self.try_commit());
        } else {
            let current = self.next_index_for(peer);
            let next = (response.match_index + 1)
                .min(current.saturating_sub(1))
                .max(1);
            if next != current {
                self.next_index.insert(peer.clone(), next);
                actions.push(self.append_entries_to(peer));
            }
        }
        actions
    }

    /// Adopt entries a follower committed while this Authority was away.
    fn adopt_committed(&mut self, entries: &[LogEntry]) {
        for entry in entries {
            if entry.index <= self.log.commit_index() {
                continue;
            }
            if let Some(existing) = self.log.entry(entry.index) {
                if existing != entry {
                    if self
                        .pending
                        .as_ref()
                        .is_some_and(|p| p.entry.index >= entry.index)
                    {
                        warn!(
                            node = %self.node_id,
                            index = entry.index,
                            "Pending entry superseded by interim commit"
                        );
                        self.pending = None;
                    }
                    if self.log.truncate_from(entry.index).is_err() {
                        break;
                    }
                }
            }
            if self.log.entry(entry.index).is_none() && self.log.append(entry.clone()).is_err() {
                break;
            }
            if self.log.commit_to(entry.index).is_err() {
                break;
            }
            self.observe_cluster_term(entry.term);
        }
        self.reset_peer_progress();
        metrics::set_commit_index(self.log.commit_index());
        info!(
            node = %self.node_id,
            commit_index = self.log.commit_index(),
            "Adopted entries committed during absence"
        );
    }

    fn try_commit(&mut self) -> Vec<Action> {
        let quorum = self.commit_quorum();
        if !self.pending.as_ref().is_some_and(|p| p.acks.len() >= quorum) {
            return Vec::new();
        }
        let Some(pending) = self.pending.take() else {
            return Vec::new();
        };
        let entry = pending.entry;
        if let Err(error) = self.log.commit_to(entry.index) {
            warn!(node = %self.node_id, %error, "Failed to commit entry");
            return Vec::new();
        }
        self.stats.committed_entries += 1;
        metrics::set_commit_index(entry.index);

        info!(
            node = %self.node_id,
            term = entry.term,
            index = entry.index,
            height = entry.block_height,
            accepts = pending.acks.len(),
            "Entry committed"
        );

        vec![
            Action::Emit(
                self.event(EventKind::Committed)
                    .with_index(entry.index)
                    .with_height(entry.block_height),
            ),
            Action::Commit { entry },
        ]
    }

    fn broadcast_append_entries(&self) -> Vec<Action> {
        self.peers()
            .iter()
            .map(|peer| self.append_entries_to(peer))
            .collect()
    }

    /// Assume every peer is up to date; failures walk `next_index` back.
    fn reset_peer_progress(&mut self) {
        let next = self.log.last_index() + 1;
        self.next_index = self.peers().into_iter().map(|p| (p, next)).collect();
    }

    fn next_index_for(&self, peer: &NodeId) -> u64 {
        let tail = self.log.last_index() + 1;
        self.next_index
            .get(peer)
            .copied()
            .unwrap_or(tail)
            .clamp(1, tail)
    }

    fn append_entries_to(&self, peer: &NodeId) -> Action {
        let next = self.next_index_for(peer);
        let prev_log_index = next - 1;
        Action::SendAppendEntries {
            to: peer.clone(),
            message: AppendEntries {
                term: self.current_term,
                leader_id: self.node_id.clone(),
                prev_log_index,
                prev_log_term: self.log.term_at(prev_log_index).unwrap_or(0),
                entries: self
                    .log
                    .entries_from(next, self.config.max_entries_per_message),
                leader_commit: self.log.commit_index(),
                leader_tip: self.local_tip,
            },
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Helpers
    // ═══════════════════════════════════════════════════════════════════════

    fn now_ms(&self) -> u64 {
        self.now.as_millis() as u64
    }

    fn event(&self, kind: EventKind) -> ConsensusEvent {
        ConsensusEvent::new(kind, self.node_id.clone(), self.current_term)
    }

    fn persist_meta(&self) -> Action {
        Action::PersistMeta {
            current_term: self.current_term,
            last_known_cluster_term: self.last_known_cluster_term,
        }
    }

    fn vote_response(&self, granted: bool) -> VoteResponse {
        VoteResponse {
            term: self.current_term,
            voter_id: self.node_id.clone(),
            granted,
        }
    }

    fn append_response(&self, success: bool, match_index: u64) -> AppendResponse {
        AppendResponse {
            term: self.current_term,
            follower_id: self.node_id.clone(),
            success,
            match_index,
            commit_index: self.log.commit_index(),
            committed_tail: Vec::new(),
            follower_tip: self.local_tip,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    const AUTHORITY: &str = "authority";

    fn config() -> ConsensusConfig {
        ConsensusConfig::default()
            .with_heartbeat_interval(Duration::from_millis(500))
            .with_election_timeout(Duration::from_millis(1500), Duration::from_millis(1500))
            .with_election_window(Duration::from_millis(1000))
            .with_jitter_seed(42)
    }

    fn node(id: &str, members: &[&str], recovered: RecoveredState) -> ConsensusState {
        let mut state = ConsensusState::new(
            NodeId::from(id),
            NodeId::from(AUTHORITY),
            members.iter().map(|m| NodeId::from(*m)),
            config(),
            recovered,
        );
        state.on_startup();
        state
    }

    fn member(id: &str) -> ConsensusState {
        node(id, &["m1", "m2", "m3"], RecoveredState::default())
    }

    fn authority() -> ConsensusState {
        node(AUTHORITY, &["m1", "m2", "m3"], RecoveredState::default())
    }

    /// Long enough for any jittered timeout to elapse.
    fn silence() -> Duration {
        Duration::from_millis(3_100)
    }

    fn kinds(actions: &[Action]) -> Vec<EventKind> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Emit(event) => Some(event.kind),
                _ => None,
            })
            .collect()
    }

    fn append_for(actions: &[Action], to: &str) -> AppendEntries {
        actions
            .iter()
            .find_map(|a| match a {
                Action::SendAppendEntries { to: peer, message } if peer.as_str() == to => {
                    Some(message.clone())
                }
                _ => None,
            })
            .unwrap_or_else(|| panic!("no AppendEntries for {to} in {actions:?}"))
    }

    fn vote_requests(actions: &[Action]) -> Vec<(NodeId, RequestVote)> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::SendRequestVote { to, message } => Some((to.clone(), message.clone())),
                _ => None,
            })
            .collect()
    }

    fn commits(actions: &[Action]) -> Vec<LogEntry> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Commit { entry } => Some(entry.clone()),
                _ => None,
            })
            .collect()
    }

    /// Run `candidate` to a timed-out election and return its vote requests.
    fn campaign(candidate: &mut ConsensusState, at: Duration) -> Vec<(NodeId, RequestVote)> {
        candidate.set_time(at);
        let actions = candidate.tick();
        assert!(kinds(&actions).contains(&EventKind::ElectionStart));
        vote_requests(&actions)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Authority
    // ═══════════════════════════════════════════════════════════════════════

    #[test]
    fn test_authority_never_campaigns() {
        let mut state = authority();
        assert_eq!(state.role(), ConsensusRole::Authority);
        state.set_time(Duration::from_secs(60));

        assert!(matches!(
            state.start_election(),
            Err(ElectionError::NotEligible { .. })
        ));
        let actions = state.tick();
        assert!(vote_requests(&actions).is_empty());
        assert_eq!(actions.len(), 3, "heartbeat to every member");
        assert_eq!(state.role(), ConsensusRole::Authority);
    }

    #[test]
    fn test_authority_denies_votes_without_recording() {
        let mut state = authority();
        let term = state.current_term();
        let request = RequestVote {
            term: term + 3,
            candidate_id: NodeId::from("m1"),
            last_log_index: 0,
            last_log_term: 0,
        };
        let (response, actions) = state.on_request_vote(&request);

        assert!(!response.granted);
        assert!(state.votes().cast_votes().is_empty());
        // A live Authority answers a campaign by reasserting above it.
        assert_eq!(state.current_term(), term + 4);
        assert!(kinds(&actions).contains(&EventKind::LeaderRestored));
    }

    #[test]
    fn test_authority_recovery_term() {
        let mut state = ConsensusState::new(
            NodeId::from(AUTHORITY),
            NodeId::from(AUTHORITY),
            ["m1", "m2"].map(NodeId::from),
            config(),
            RecoveredState {
                current_term: 3,
                last_known_cluster_term: 7,
            },
        );
        let actions = state.on_startup();

        assert_eq!(state.role(), ConsensusRole::Authority);
        assert_eq!(state.current_term(), 8);
        assert_eq!(state.leader_id(), Some(&NodeId::from(AUTHORITY)));
        assert!(actions.contains(&Action::PersistMeta {
            current_term: 8,
            last_known_cluster_term: 7,
        }));
        assert!(kinds(&actions).contains(&EventKind::LeaderRestored));
        assert_eq!(append_for(&actions, "m1").term, 8);
        assert_eq!(append_for(&actions, "m2").term, 8);
    }

    #[test]
    fn test_healthy_authority_is_never_displaced() {
        let mut auth = authority();
        let mut m1 = member("m1");

        // Heartbeats every 500ms for a minute: m1 never campaigns.
        for step in 1..=120u64 {
            let now = Duration::from_millis(step * 500);
            auth.set_time(now);
            m1.set_time(now);
            let beats = auth.tick();
            let (_, actions) = m1.on_append_entries(&append_for(&beats, "m1"));
            assert!(kinds(&actions).is_empty());
            assert!(kinds(&m1.tick()).is_empty());
        }
        assert_eq!(m1.role(), ConsensusRole::Member);
        assert_eq!(m1.leader_id(), Some(&NodeId::from(AUTHORITY)));
        assert_eq!(auth.stats().reassertions, 1);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Elections
    // ═══════════════════════════════════════════════════════════════════════

    #[test]
    fn test_member_waits_for_timeout() {
        let mut m1 = member("m1");
        m1.set_time(Duration::from_millis(1_000));
        assert_eq!(m1.start_election(), Err(ElectionError::LeaderAlive));
    }

    #[test]
    #[traced_test]
    fn test_member_wins_election_at_next_term() {
        let recovered = RecoveredState {
            current_term: 4,
            last_known_cluster_term: 4,
        };
        let members = ["m1", "m2", "m3"];
        let mut m1 = node("m1", &members, recovered);
        let mut m2 = node("m2", &members, recovered);

        let requests = campaign(&mut m1, silence());
        assert_eq!(m1.role(), ConsensusRole::Candidate);
        assert_eq!(m1.current_term(), 5);
        let targets: Vec<_> = requests.iter().map(|(to, _)| to.as_str()).collect();
        assert_eq!(targets, vec!["m2", "m3"], "authority is never solicited");

        let (_, request) = &requests[0];
        m2.set_time(silence());
        let (response, actions) = m2.on_request_vote(request);
        assert!(response.granted);
        assert_eq!(kinds(&actions), vec![EventKind::VoteGranted]);

        let actions = m1.on_vote_response(&response);
        assert_eq!(m1.role(), ConsensusRole::InterimLeader);
        assert_eq!(m1.leader_id(), Some(&NodeId::from("m1")));
        assert!(kinds(&actions).contains(&EventKind::LeaderElected));
        // Announces itself to every peer, the Authority included.
        assert_eq!(append_for(&actions, AUTHORITY).term, 5);
        assert_eq!(append_for(&actions, "m3").term, 5);
        assert!(logs_contain("interim leader"));
    }

    #[test]
    fn test_vote_request_is_idempotent() {
        let mut m2 = member("m2");
        let request = RequestVote {
            term: 1,
            candidate_id: NodeId::from("m1"),
            last_log_index: 0,
            last_log_term: 0,
        };
        let (first, _) = m2.on_request_vote(&request);
        let (second, actions) = m2.on_request_vote(&request);
        assert_eq!(first, second);
        assert!(first.granted);
        assert!(actions.is_empty());
        assert_eq!(m2.votes().cast_votes().len(), 1);

        let rival = RequestVote {
            candidate_id: NodeId::from("m3"),
            ..request
        };
        let (denied, _) = m2.on_request_vote(&rival);
        assert!(!denied.granted);
        let (again, _) = m2.on_request_vote(&rival);
        assert_eq!(denied, again);
    }

    #[test]
    fn test_vote_denied_to_stale_log() {
        let mut leader = authority();
        let mut m2 = member("m2");
        // m2 holds one entry.
        let (_, actions) = leader.propose(Hash::from_bytes(b"b1"), 1).unwrap();
        m2.on_append_entries(&append_for(&actions, "m2"));
        assert_eq!(m2.log().last_index(), 1);

        let (response, _) = m2.on_request_vote(&RequestVote {
            term: 5,
            candidate_id: NodeId::from("m1"),
            last_log_index: 0,
            last_log_term: 0,
        });
        assert!(!response.granted);
    }

    #[test]
    #[traced_test]
    fn test_vote_denials_are_logged_with_reason() {
        let mut m2 = member("m2");
        let request = |term, candidate: &str| RequestVote {
            term,
            candidate_id: NodeId::from(candidate),
            last_log_index: 0,
            last_log_term: 0,
        };

        assert!(m2.on_request_vote(&request(5, "m1")).0.granted);

        assert!(!m2.on_request_vote(&request(3, "m3")).0.granted);
        assert!(logs_contain("stale term 3, current term is 5"));

        assert!(!m2.on_request_vote(&request(5, "m3")).0.granted);
        assert!(logs_contain("already voted for m1 in term 5"));

        assert!(!m2.on_request_vote(&request(6, "mallory")).0.granted);
        assert!(logs_contain("not_eligible"));

        // Replays return the remembered answer without logging again.
        let (replay, _) = m2.on_request_vote(&request(5, "m3"));
        assert!(!replay.granted);
        logs_assert(|lines: &[&str]| {
            match lines.iter().filter(|l| l.contains("already_voted")).count() {
                1 => Ok(()),
                n => Err(format!("expected one already_voted denial, saw {n}")),
            }
        });
    }

    #[test]
    #[traced_test]
    fn test_stale_log_denial_reports_both_indexes() {
        let mut leader = authority();
        let mut m2 = member("m2");
        let (_, actions) = leader.propose(Hash::from_bytes(b"b1"), 1).unwrap();
        m2.on_append_entries(&append_for(&actions, "m2"));

        let (response, _) = m2.on_request_vote(&RequestVote {
            term: 5,
            candidate_id: NodeId::from("m3"),
            last_log_index: 0,
            last_log_term: 0,
        });
        assert!(!response.granted);
        assert!(logs_contain("candidate log ends at 0, ours at 1"));
        assert!(logs_contain("stale_log"));
    }

    #[test]
    fn test_tie_break_smaller_id_wins() {
        let mut m1 = member("m1");
        let mut m2 = member("m2");
        let r1 = campaign(&mut m1, silence());
        let r2 = campaign(&mut m2, silence());
        assert_eq!(m1.current_term(), m2.current_term());

        let to_m2 = &r1.iter().find(|(to, _)| to.as_str() == "m2").unwrap().1;
        let to_m1 = &r2.iter().find(|(to, _)| to.as_str() == "m1").unwrap().1;

        // m1 ignores the lower-ranked rival; m2 yields and votes for m1.
        let (m1_answer, _) = m1.on_request_vote(to_m1);
        assert!(!m1_answer.granted);
        let (m2_answer, _) = m2.on_request_vote(to_m2);
        assert!(m2_answer.granted);
        assert_eq!(m2.role(), ConsensusRole::Member);

        m1.on_vote_response(&m2_answer);
        assert_eq!(m1.role(), ConsensusRole::InterimLeader);
        m2.on_vote_response(&m1_answer);
        assert_eq!(m2.role(), ConsensusRole::Member);
    }

    #[test]
    fn test_one_campaign_per_term() {
        let mut m1 = member("m1");
        campaign(&mut m1, silence());
        assert_eq!(
            m1.start_election(),
            Err(ElectionError::CampaignInFlight { term: 1 })
        );
    }

    #[test]
    fn test_election_window_expiry() {
        let mut m1 = member("m1");
        campaign(&mut m1, silence());

        m1.set_time(silence() + Duration::from_millis(900));
        assert!(kinds(&m1.tick()).is_empty());

        m1.set_time(silence() + Duration::from_millis(1_001));
        let actions = m1.tick();
        assert_eq!(kinds(&actions), vec![EventKind::ElectionFailed]);
        assert_eq!(m1.role(), ConsensusRole::Member);
        assert_eq!(m1.stats().elections_failed, 1);

        // Retried after a fresh timeout, at the next term.
        let requests = campaign(&mut m1, silence() * 3);
        assert_eq!(requests[0].1.term, 2);
    }

    #[test]
    fn test_full_cluster_quorum_is_stricter() {
        let cfg = config().with_quorum_policy(QuorumPolicy::FullCluster);
        let state = ConsensusState::new(
            NodeId::from("m1"),
            NodeId::from(AUTHORITY),
            ["m1", "m2", "m3", "m4"].map(NodeId::from),
            cfg,
            RecoveredState::default(),
        );
        assert_eq!(state.election_quorum(), 3);
        assert_eq!(member("m1").election_quorum(), 2);
    }

    #[test]
    fn test_restarted_member_refuses_recovered_term() {
        let mut m2 = node(
            "m2",
            &["m1", "m2", "m3"],
            RecoveredState {
                current_term: 5,
                last_known_cluster_term: 5,
            },
        );
        let request = RequestVote {
            term: 5,
            candidate_id: NodeId::from("m1"),
            last_log_index: 0,
            last_log_term: 0,
        };
        assert!(!m2.on_request_vote(&request).0.granted);
        let next = RequestVote { term: 6, ..request };
        assert!(m2.on_request_vote(&next).0.granted);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Heartbeats and handback
    // ═══════════════════════════════════════════════════════════════════════

    #[test]
    fn test_heartbeat_resets_timer_regardless_of_sender() {
        let mut leader = member("m3");
        let mut m1 = member("m1");
        // m3 leads term 1 (as if elected); m1 hears from it.
        campaign(&mut leader, silence());
        leader.become_interim_leader();
        leader.set_time(silence() * 2);
        let beat = append_for(&leader.tick(), "m1");

        m1.set_time(silence() * 2);
        let (response, _) = m1.on_append_entries(&beat);
        assert!(response.success);
        assert_eq!(m1.leader_id(), Some(&NodeId::from("m3")));
        assert!(!m1.heartbeat().election_due(silence() * 2 + Duration::from_millis(1_000)));
    }

    #[test]
    fn test_interim_leader_hands_back_to_authority() {
        let members = ["m1", "m2"];
        let mut m1 = node("m1", &members, RecoveredState::default());
        let mut m2 = node("m2", &members, RecoveredState::default());
        let requests = campaign(&mut m1, silence());
        m2.set_time(silence());
        let (vote, _) = m2.on_request_vote(&requests[0].1);
        m1.on_vote_response(&vote);
        assert_eq!(m1.role(), ConsensusRole::InterimLeader);
        m1.propose(Hash::from_bytes(b"in-flight"), 1).unwrap();

        // Authority returns having seen term 1.
        let mut auth = node(
            AUTHORITY,
            &members,
            RecoveredState {
                current_term: 0,
                last_known_cluster_term: 1,
            },
        );
        assert_eq!(auth.current_term(), 2);
        auth.set_time(silence() * 2);
        let beat = append_for(&auth.tick(), "m1");

        m1.set_time(silence() * 2);
        let (response, actions) = m1.on_append_entries(&beat);
        assert!(!response.success);
        assert_eq!(m1.role(), ConsensusRole::Member);
        assert_eq!(m1.leader_id(), None);
        assert_eq!(m1.pending_entry(), None);
        assert_eq!(m1.current_term(), 2);
        assert!(kinds(&actions).contains(&EventKind::LeadershipTransferred));

        // The next Authority heartbeat sets the leader.
        auth.set_time(silence() * 2 + Duration::from_millis(500));
        let beat = append_for(&auth.tick(), "m1");
        m1.on_append_entries(&beat);
        assert_eq!(m1.leader_id(), Some(&NodeId::from(AUTHORITY)));
    }

    #[test]
    fn test_authority_supersedes_interim_at_any_term() {
        let mut m1 = node(
            "m1",
            &["m1"],
            RecoveredState {
                current_term: 40,
                last_known_cluster_term: 40,
            },
        );
        campaign(&mut m1, silence());
        assert_eq!(m1.role(), ConsensusRole::InterimLeader);

        // Authority only ever saw term 2, but a rival AppendEntries makes
        // it jump above the Interim Leader.
        let mut auth = node(
            AUTHORITY,
            &["m1"],
            RecoveredState {
                current_term: 2,
                last_known_cluster_term: 2,
            },
        );
        m1.set_time(silence() * 2);
        let rival = append_for(&m1.tick(), AUTHORITY);
        let (_, actions) = auth.on_append_entries(&rival);
        assert_eq!(auth.current_term(), 42);
        assert_eq!(auth.role(), ConsensusRole::Authority);

        let (_, actions) = m1.on_append_entries(&append_for(&actions, "m1"));
        assert!(kinds(&actions).contains(&EventKind::LeadershipTransferred));
        assert_eq!(m1.role(), ConsensusRole::Member);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Replication
    // ═══════════════════════════════════════════════════════════════════════

    #[test]
    fn test_commit_requires_cluster_majority() {
        let mut auth = authority();
        let mut followers: Vec<_> = ["m1", "m2", "m3"].into_iter().map(member).collect();
        assert_eq!(auth.commit_quorum(), 3);

        let (entry, actions) = auth.propose(Hash::from_bytes(b"block-101"), 101).unwrap();
        assert_eq!(entry.index, 1);
        assert!(kinds(&actions).contains(&EventKind::LeaderAppend));
        assert!(commits(&actions).is_empty());

        let (r1, _) = followers[0].on_append_entries(&append_for(&actions, "m1"));
        assert!(commits(&auth.on_append_response(&r1)).is_empty());

        let (r2, _) = followers[1].on_append_entries(&append_for(&actions, "m2"));
        let done = auth.on_append_response(&r2);
        assert_eq!(commits(&done), vec![entry.clone()]);
        assert!(kinds(&done).contains(&EventKind::Committed));
        assert_eq!(auth.commit_index(), 1);

        // A late ack changes nothing.
        let (r3, _) = followers[2].on_append_entries(&append_for(&actions, "m3"));
        assert!(commits(&auth.on_append_response(&r3)).is_empty());

        // Followers learn the commit on the next heartbeat.
        auth.set_time(Duration::from_secs(1));
        let beat = append_for(&auth.tick(), "m1");
        followers[0].on_append_entries(&beat);
        assert_eq!(followers[0].commit_index(), 1);
    }

    #[test]
    fn test_propose_single_pending_entry() {
        let mut auth = authority();
        let block = Hash::from_bytes(b"a");
        let (first, _) = auth.propose(block, 1).unwrap();
        let (again, actions) = auth.propose(block, 1).unwrap();
        assert_eq!(first, again);
        assert!(!actions.is_empty());
        assert_eq!(auth.log().len(), 1);

        assert_eq!(
            auth.propose(Hash::from_bytes(b"b"), 2),
            Err(ProposeError::UncommittedEntryPending {
                index: 1,
                block_hash: block
            })
        );
    }

    #[test]
    fn test_member_cannot_propose() {
        let mut m1 = member("m1");
        assert_eq!(
            m1.propose(Hash::from_bytes(b"x"), 1).unwrap_err(),
            ProposeError::NotLeader { leader: None }
        );
    }

    #[test]
    fn test_restarted_follower_is_repaired() {
        let members = ["m1", "m2"];
        let mut auth = node(AUTHORITY, &members, RecoveredState::default());
        let mut m1 = node("m1", &members, RecoveredState::default());

        for height in 1..=3u64 {
            let (_, actions) = auth
                .propose(Hash::from_bytes(&height.to_be_bytes()), height)
                .unwrap();
            let (ack, _) = m1.on_append_entries(&append_for(&actions, "m1"));
            assert_eq!(commits(&auth.on_append_response(&ack)).len(), 1);
        }

        // m1 restarts with an empty log; the leader walks back and resends.
        let mut m1 = node("m1", &members, RecoveredState::default());
        auth.set_time(Duration::from_secs(1));
        let mut message = append_for(&auth.tick(), "m1");
        assert_eq!(message.prev_log_index, 3);
        for _ in 0..5 {
            let (response, _) = m1.on_append_entries(&message);
            if response.success {
                break;
            }
            message = append_for(&auth.on_append_response(&response), "m1");
        }
        assert_eq!(m1.log().last_index(), 3);
        assert_eq!(m1.commit_index(), 3);
    }

    #[test]
    fn test_conflict_with_committed_entry_is_not_acked() {
        let members = ["m1", "m2"];
        let mut auth = node(AUTHORITY, &members, RecoveredState::default());
        let mut m2 = node("m2", &members, RecoveredState::default());

        let (committed, actions) = auth.propose(Hash::from_bytes(b"b1"), 1).unwrap();
        let (ack, _) = m2.on_append_entries(&append_for(&actions, "m2"));
        auth.on_append_response(&ack);
        auth.set_time(Duration::from_secs(1));
        m2.on_append_entries(&append_for(&auth.tick(), "m2"));
        assert_eq!(m2.commit_index(), 1);

        // A rival leader tries to overwrite the committed entry.
        let term = m2.current_term() + 1;
        let rival = AppendEntries {
            term,
            leader_id: NodeId::from("m1"),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![
                LogEntry {
                    term,
                    index: 1,
                    block_hash: Hash::from_bytes(b"other"),
                    block_height: 1,
                    timestamp_ms: 0,
                },
                LogEntry {
                    term,
                    index: 2,
                    block_hash: Hash::from_bytes(b"other-2"),
                    block_height: 2,
                    timestamp_ms: 0,
                },
            ],
            leader_commit: 2,
            leader_tip: None,
        };
        let (response, _) = m2.on_append_entries(&rival);
        assert!(!response.success);
        assert_eq!(response.match_index, 0);
        assert_eq!(m2.log().last_index(), 1);
        assert_eq!(m2.log().entry(1), Some(&committed));
        assert_eq!(m2.commit_index(), 1);
    }

    #[test]
    fn test_partial_match_acks_only_matched_prefix() {
        let members = ["m1", "m2"];
        let mut auth = node(AUTHORITY, &members, RecoveredState::default());
        let mut m2 = node("m2", &members, RecoveredState::default());

        let (first, actions) = auth.propose(Hash::from_bytes(b"b1"), 1).unwrap();
        let (ack, _) = m2.on_append_entries(&append_for(&actions, "m2"));
        assert!(ack.success);
        assert_eq!(ack.match_index, 1);

        // Entry 1 matches, entry 3 leaves a gap and is refused.
        let gapped = AppendEntries {
            term: first.term,
            leader_id: NodeId::from(AUTHORITY),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![
                first.clone(),
                LogEntry {
                    term: first.term,
                    index: 3,
                    block_hash: Hash::from_bytes(b"b3"),
                    block_height: 3,
                    timestamp_ms: 0,
                },
            ],
            leader_commit: 3,
            leader_tip: None,
        };
        let (response, _) = m2.on_append_entries(&gapped);
        assert!(!response.success);
        assert_eq!(response.match_index, 1);
        assert_eq!(m2.commit_index(), 1);
    }

    #[test]
    fn test_returning_authority_adopts_interim_commits() {
        let members = ["m1", "m2"];
        let mut m1 = node("m1", &members, RecoveredState::default());
        let mut m2 = node("m2", &members, RecoveredState::default());

        // m1 leads while the Authority is away and commits two entries.
        let requests = campaign(&mut m1, silence());
        m2.set_time(silence());
        let (vote, _) = m2.on_request_vote(&requests[0].1);
        m1.on_vote_response(&vote);
        for height in 1..=2u64 {
            let (_, actions) = m1
                .propose(Hash::from_bytes(&height.to_be_bytes()), height)
                .unwrap();
            let (ack, _) = m2.on_append_entries(&append_for(&actions, "m2"));
            m1.on_append_response(&ack);
        }
        assert_eq!(m1.commit_index(), 2);
        m1.set_time(silence() + Duration::from_millis(600));
        m2.on_append_entries(&append_for(&m1.tick(), "m2"));
        assert_eq!(m2.commit_index(), 2);

        // Authority restarts with an empty log.
        let mut auth = node(
            AUTHORITY,
            &members,
            RecoveredState {
                current_term: 0,
                last_known_cluster_term: 1,
            },
        );
        auth.set_time(silence() * 2);
        let beat = append_for(&auth.tick(), "m2");
        m2.set_time(silence() * 2);
        let (response, _) = m2.on_append_entries(&beat);
        assert_eq!(response.committed_tail.len(), 2);

        let actions = auth.on_append_response(&response);
        assert_eq!(auth.commit_index(), 2);
        assert!(commits(&actions).is_empty());

        // The next proposal lands after the adopted entries and commits.
        let (entry, actions) = auth.propose(Hash::from_bytes(b"after"), 3).unwrap();
        assert_eq!(entry.index, 3);
        let (ack, _) = m2.on_append_entries(&append_for(&actions, "m2"));
        assert!(ack.success);
        assert_eq!(commits(&auth.on_append_response(&ack)), vec![entry]);
    }
}
