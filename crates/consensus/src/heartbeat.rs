//! Leader liveness tracking and randomized election timeouts.

use crate::ConsensusConfig;
use consortium_types::{Hash, NodeId};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::time::Duration;

/// Tracks when this node last heard from a leader and from each peer.
///
/// The election timeout is `base + jitter` where jitter is drawn uniformly
/// from `[0, election_jitter]`. The RNG is seeded from the configured seed
/// and the node id, so simulations are reproducible while nodes in one
/// cluster still draw different timeouts.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    base_timeout: Duration,
    jitter: Duration,
    election_timeout: Duration,
    last_leader_contact: Duration,
    peers: BTreeMap<NodeId, Duration>,
    rng: ChaCha8Rng,
}

impl HeartbeatMonitor {
    pub fn new(config: &ConsensusConfig, node_id: &NodeId, now: Duration) -> Self {
        let digest = Hash::from_bytes(node_id.as_str().as_bytes());
        let mut node_seed = [0u8; 8];
        node_seed.copy_from_slice(&digest.as_bytes()[..8]);
        let seed = config.jitter_seed ^ u64::from_be_bytes(node_seed);

        let mut monitor = Self {
            base_timeout: config.election_timeout,
            jitter: config.election_jitter,
            election_timeout: config.election_timeout,
            last_leader_contact: now,
            peers: BTreeMap::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
        };
        monitor.rerandomize();
        monitor
    }

    /// A heartbeat or AppendEntries arrived from a current leader.
    pub fn record_leader_contact(&mut self, now: Duration) {
        self.last_leader_contact = self.last_leader_contact.max(now);
    }

    /// Any message arrived from `peer`.
    pub fn record_peer(&mut self, peer: &NodeId, now: Duration) {
        self.peers.insert(peer.clone(), now);
    }

    /// Restart the election timer without hearing from a leader, e.g. after
    /// granting a vote or abandoning a failed campaign.
    pub fn reset(&mut self, now: Duration) {
        self.last_leader_contact = now;
    }

    /// Draw a fresh election timeout.
    pub fn rerandomize(&mut self) {
        let jitter_ms = self.jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            self.rng.gen_range(0..=jitter_ms)
        };
        self.election_timeout = self.base_timeout + Duration::from_millis(extra);
    }

    /// Whether the leader has been silent for longer than the timeout.
    pub fn election_due(&self, now: Duration) -> bool {
        now.saturating_sub(self.last_leader_contact) > self.election_timeout
    }

    pub fn election_timeout(&self) -> Duration {
        self.election_timeout
    }

    pub fn last_leader_contact(&self) -> Duration {
        self.last_leader_contact
    }

    /// When `peer` was last heard from.
    pub fn last_seen(&self, peer: &NodeId) -> Option<Duration> {
        self.peers.get(peer).copied()
    }

    /// Peers not heard from within `threshold`. Peers never heard from
    /// count as silent.
    pub fn silent_peers<'a>(
        &self,
        peers: impl IntoIterator<Item = &'a NodeId>,
        now: Duration,
        threshold: Duration,
    ) -> Vec<NodeId> {
        peers
            .into_iter()
            .filter(|peer| {
                self.peers
                    .get(*peer)
                    .map_or(true, |seen| now.saturating_sub(*seen) > threshold)
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ConsensusConfig {
        ConsensusConfig::default()
            .with_election_timeout(Duration::from_millis(1500), Duration::from_millis(1500))
            .with_jitter_seed(7)
    }

    #[test]
    fn test_timeout_within_bounds() {
        let mut monitor = HeartbeatMonitor::new(&config(), &NodeId::from("m1"), Duration::ZERO);
        for _ in 0..100 {
            monitor.rerandomize();
            let timeout = monitor.election_timeout();
            assert!(timeout >= Duration::from_millis(1500));
            assert!(timeout <= Duration::from_millis(3000));
        }
    }

    #[test]
    fn test_timeouts_differ_per_node() {
        let timeouts: Vec<_> = ["m1", "m2", "m3", "m4"]
            .iter()
            .map(|id| {
                HeartbeatMonitor::new(&config(), &NodeId::from(*id), Duration::ZERO)
                    .election_timeout()
            })
            .collect();
        let mut unique = timeouts.clone();
        unique.dedup();
        assert!(unique.len() > 1, "all nodes drew {timeouts:?}");
    }

    #[test]
    fn test_same_seed_same_timeout() {
        let a = HeartbeatMonitor::new(&config(), &NodeId::from("m1"), Duration::ZERO);
        let b = HeartbeatMonitor::new(&config(), &NodeId::from("m1"), Duration::ZERO);
        assert_eq!(a.election_timeout(), b.election_timeout());
    }

    #[test]
    fn test_election_due_only_after_timeout() {
        let mut monitor = HeartbeatMonitor::new(&config(), &NodeId::from("m1"), Duration::ZERO);
        let timeout = monitor.election_timeout();
        assert!(!monitor.election_due(timeout));
        assert!(monitor.election_due(timeout + Duration::from_millis(1)));

        monitor.record_leader_contact(timeout);
        assert!(!monitor.election_due(timeout + Duration::from_millis(1)));
    }

    #[test]
    fn test_silent_peers() {
        let mut monitor = HeartbeatMonitor::new(&config(), &NodeId::from("m1"), Duration::ZERO);
        let a = NodeId::from("a");
        let b = NodeId::from("b");
        let c = NodeId::from("c");
        monitor.record_peer(&a, Duration::from_secs(10));
        monitor.record_peer(&b, Duration::from_secs(1));

        let silent = monitor.silent_peers([&a, &b, &c], Duration::from_secs(12), Duration::from_secs(5));
        assert_eq!(silent, vec![b, c]);
    }
}
