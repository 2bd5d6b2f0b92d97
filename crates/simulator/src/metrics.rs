//! In-process metrics backend that counts what the cluster records.

use consortium_metrics::MetricsRecorder;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counts consensus events, election outcomes and replication outcomes.
///
/// Clones share the same counters, so one clone can be installed as the
/// global recorder while another reads it back:
///
/// ```ignore
/// let counts = CountingRecorder::default();
/// consortium_metrics::set_global_recorder(Box::new(counts.clone()));
/// ```
#[derive(Clone, Default)]
pub struct CountingRecorder {
    counts: Arc<Counts>,
}

#[derive(Default)]
struct Counts {
    events: DashMap<String, u64>,
    elections: DashMap<String, u64>,
    replication: DashMap<String, u64>,
    sync_applied: AtomicU64,
    sync_failures: AtomicU64,
    validation_failures: AtomicU64,
    max_term: AtomicU64,
    max_commit_index: AtomicU64,
}

/// Point-in-time copy of a [`CountingRecorder`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub events: BTreeMap<String, u64>,
    pub elections: BTreeMap<String, u64>,
    /// Keyed by replication outcome, summed across targets.
    pub replication: BTreeMap<String, u64>,
    pub sync_applied: u64,
    pub sync_failures: u64,
    pub validation_failures: u64,
    pub max_term: u64,
    pub max_commit_index: u64,
}

impl CountingRecorder {
    pub fn snapshot(&self) -> MetricsSnapshot {
        let collect = |map: &DashMap<String, u64>| {
            map.iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect()
        };
        let counts = &self.counts;
        MetricsSnapshot {
            events: collect(&counts.events),
            elections: collect(&counts.elections),
            replication: collect(&counts.replication),
            sync_applied: counts.sync_applied.load(Ordering::Relaxed),
            sync_failures: counts.sync_failures.load(Ordering::Relaxed),
            validation_failures: counts.validation_failures.load(Ordering::Relaxed),
            max_term: counts.max_term.load(Ordering::Relaxed),
            max_commit_index: counts.max_commit_index.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSnapshot {
    pub fn event_count(&self, kind: &str) -> u64 {
        self.events.get(kind).copied().unwrap_or(0)
    }

    pub fn print_summary(&self) {
        println!("Metrics:");
        for (kind, count) in &self.events {
            println!("  event {kind:<24} {count}");
        }
        for (outcome, count) in &self.elections {
            println!("  election {outcome:<21} {count}");
        }
        for (outcome, count) in &self.replication {
            println!("  replication {outcome:<18} {count}");
        }
        println!("  sync applied:         {}", self.sync_applied);
        println!("  sync failures:        {}", self.sync_failures);
        println!("  validation failures:  {}", self.validation_failures);
        println!("  max term:             {}", self.max_term);
        println!("  max commit index:     {}", self.max_commit_index);
    }
}

fn bump(map: &DashMap<String, u64>, key: &str) {
    *map.entry(key.to_string()).or_insert(0) += 1;
}

impl MetricsRecorder for CountingRecorder {
    fn record_event(&self, kind: &str) {
        bump(&self.counts.events, kind);
    }

    fn record_election(&self, outcome: &str) {
        bump(&self.counts.elections, outcome);
    }

    fn set_term(&self, term: u64) {
        self.counts.max_term.fetch_max(term, Ordering::Relaxed);
    }

    fn set_commit_index(&self, index: u64) {
        self.counts.max_commit_index.fetch_max(index, Ordering::Relaxed);
    }

    fn record_replication_outcome(&self, _target: &str, outcome: &str) {
        bump(&self.counts.replication, outcome);
    }

    fn record_sync_applied(&self, count: u64) {
        self.counts.sync_applied.fetch_add(count, Ordering::Relaxed);
    }

    fn record_sync_failure(&self, _label: &str) {
        self.counts.sync_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_validation_failure(&self, _label: &str) {
        self.counts.validation_failures.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_accumulate() {
        let recorder = CountingRecorder::default();
        let reader = recorder.clone();
        recorder.record_event("COMMITTED");
        recorder.record_event("COMMITTED");
        recorder.record_election("won");
        recorder.set_term(3);
        recorder.set_term(2);
        recorder.record_replication_outcome("member-1", "applied");
        recorder.record_replication_outcome("member-2", "applied");
        recorder.record_sync_applied(4);

        let snapshot = reader.snapshot();
        assert_eq!(snapshot.event_count("COMMITTED"), 2);
        assert_eq!(snapshot.event_count("LEADER_ELECTED"), 0);
        assert_eq!(snapshot.elections.get("won"), Some(&1));
        assert_eq!(snapshot.max_term, 3);
        assert_eq!(snapshot.replication.get("applied"), Some(&2));
        assert_eq!(snapshot.sync_applied, 4);
    }
}
