//! Vote bookkeeping for Member elections.

use consortium_types::{NodeId, Vote};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Strict majority of `n`.
pub fn majority(n: usize) -> usize {
    n / 2 + 1
}

/// Votes cast by this node and grants received while campaigning.
///
/// As a voter, at most one candidate is granted per term and the decision
/// for each `(term, candidate)` is remembered so that a repeated request
/// gets the same answer. As a candidate, grants are counted once per
/// `(term, voter)`.
#[derive(Debug, Default)]
pub struct VoteTracker {
    voted_for: BTreeMap<u64, NodeId>,
    decisions: HashMap<(u64, NodeId), bool>,
    cast: Vec<Vote>,
    grants: BTreeMap<u64, BTreeSet<NodeId>>,
    campaigns: BTreeSet<u64>,
}

impl VoteTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Earlier decision on `candidate`'s request for `term`.
    pub fn decision(&self, term: u64, candidate: &NodeId) -> Option<bool> {
        self.decisions.get(&(term, candidate.clone())).copied()
    }

    pub fn remember_decision(&mut self, term: u64, candidate: &NodeId, granted: bool) {
        self.decisions.insert((term, candidate.clone()), granted);
    }

    /// Candidate this node voted for in `term`.
    pub fn voted_for(&self, term: u64) -> Option<&NodeId> {
        self.voted_for.get(&term)
    }

    /// Record a vote cast by this node. Returns false if it already voted
    /// for someone else in that term.
    pub fn record_vote(&mut self, vote: Vote) -> bool {
        match self.voted_for.get(&vote.term) {
            Some(existing) if *existing != vote.candidate_id => false,
            Some(_) => true,
            None => {
                self.voted_for.insert(vote.term, vote.candidate_id.clone());
                self.cast.push(vote);
                true
            }
        }
    }

    /// Withdraw this node's vote for itself in `term`, so it may vote for
    /// an outranking rival instead.
    pub fn release_self_vote(&mut self, term: u64, node_id: &NodeId) {
        if self.voted_for.get(&term) == Some(node_id) {
            self.voted_for.remove(&term);
            self.cast
                .retain(|v| !(v.term == term && v.candidate_id == *node_id));
        }
        if let Some(grants) = self.grants.get_mut(&term) {
            grants.remove(node_id);
        }
        self.decisions.remove(&(term, node_id.clone()));
    }

    /// Count a grant received for our own candidacy. Returns the number of
    /// distinct grants for `term`.
    pub fn record_grant(&mut self, term: u64, voter: NodeId) -> usize {
        let grants = self.grants.entry(term).or_default();
        grants.insert(voter);
        grants.len()
    }

    pub fn grant_count(&self, term: u64) -> usize {
        self.grants.get(&term).map_or(0, BTreeSet::len)
    }

    /// Latch a campaign for `term`. Returns false if one was already
    /// started for that term.
    pub fn try_latch_campaign(&mut self, term: u64) -> bool {
        self.campaigns.insert(term)
    }

    /// Votes this node has cast, oldest first.
    pub fn cast_votes(&self) -> &[Vote] {
        &self.cast
    }

    /// Drop bookkeeping for terms below `term`.
    pub fn prune_below(&mut self, term: u64) {
        self.voted_for = self.voted_for.split_off(&term);
        self.grants = self.grants.split_off(&term);
        self.campaigns = self.campaigns.split_off(&term);
        self.decisions.retain(|(t, _), _| *t >= term);
        self.cast.retain(|v| v.term >= term);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote(term: u64, candidate: &str) -> Vote {
        Vote {
            term,
            candidate_id: NodeId::from(candidate),
            voter_id: NodeId::from("voter"),
            timestamp_ms: 0,
        }
    }

    #[test]
    fn test_majority() {
        assert_eq!(majority(1), 1);
        assert_eq!(majority(2), 2);
        assert_eq!(majority(3), 2);
        assert_eq!(majority(4), 3);
        assert_eq!(majority(5), 3);
    }

    #[test]
    fn test_one_vote_per_term() {
        let mut tracker = VoteTracker::new();
        assert!(tracker.record_vote(vote(5, "a")));
        assert!(tracker.record_vote(vote(5, "a")));
        assert!(!tracker.record_vote(vote(5, "b")));
        assert!(tracker.record_vote(vote(6, "b")));
        assert_eq!(tracker.cast_votes().len(), 2);
    }

    #[test]
    fn test_grants_deduplicated() {
        let mut tracker = VoteTracker::new();
        assert_eq!(tracker.record_grant(3, NodeId::from("a")), 1);
        assert_eq!(tracker.record_grant(3, NodeId::from("a")), 1);
        assert_eq!(tracker.record_grant(3, NodeId::from("b")), 2);
        assert_eq!(tracker.grant_count(4), 0);
    }

    #[test]
    fn test_campaign_latch() {
        let mut tracker = VoteTracker::new();
        assert!(tracker.try_latch_campaign(2));
        assert!(!tracker.try_latch_campaign(2));
        assert!(tracker.try_latch_campaign(3));
    }

    #[test]
    fn test_release_self_vote() {
        let me = NodeId::from("m2");
        let mut tracker = VoteTracker::new();
        tracker.record_vote(Vote {
            term: 4,
            candidate_id: me.clone(),
            voter_id: me.clone(),
            timestamp_ms: 0,
        });
        tracker.record_grant(4, me.clone());

        tracker.release_self_vote(4, &me);
        assert_eq!(tracker.voted_for(4), None);
        assert_eq!(tracker.grant_count(4), 0);
        assert!(tracker.record_vote(vote(4, "m1")));
    }

    #[test]
    fn test_prune_below() {
        let mut tracker = VoteTracker::new();
        tracker.record_vote(vote(1, "a"));
        tracker.record_vote(vote(2, "a"));
        tracker.remember_decision(1, &NodeId::from("a"), true);
        tracker.prune_below(2);
        assert_eq!(tracker.voted_for(1), None);
        assert_eq!(tracker.decision(1, &NodeId::from("a")), None);
        assert!(tracker.voted_for(2).is_some());
    }
}
