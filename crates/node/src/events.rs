//! Fan-out of consensus events to subscribers, the local event log and
//! the tracing/metrics layers.

use consortium_metrics as metrics;
use consortium_storage::LedgerStore;
use consortium_types::{ConsensusEvent, EventKind};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Publishes every event emitted by a node.
///
/// Each event is logged, counted, appended to the node's store, kept in a
/// bounded in-memory ring, and broadcast to live subscribers. A failing
/// event log never blocks publication.
pub struct EventBus {
    sender: broadcast::Sender<ConsensusEvent>,
    store: Arc<dyn LedgerStore>,
    recent: Mutex<VecDeque<ConsensusEvent>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(store: Arc<dyn LedgerStore>, buffer: usize, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        Self {
            sender,
            store,
            recent: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConsensusEvent> {
        self.sender.subscribe()
    }

    /// Publish `event`, stamping it with `now_ms` if it carries no time.
    pub fn publish(&self, mut event: ConsensusEvent, now_ms: u64) {
        if event.timestamp_ms == 0 {
            event.timestamp_ms = now_ms;
        }
        Self::log(&event);
        metrics::record_event(event.kind.as_str());

        if let Err(error) = self.store.record_event(&event) {
            warn!(node = %event.node_id, %error, "Failed to append event log");
        }

        if self.capacity > 0 {
            let mut recent = self.recent.lock();
            if recent.len() == self.capacity {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }

        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    /// Up to `limit` most recent events, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<ConsensusEvent> {
        let recent = self.recent.lock();
        let skip = recent.len().saturating_sub(limit);
        recent.iter().skip(skip).cloned().collect()
    }

    fn log(event: &ConsensusEvent) {
        let failure = !event.success || event.kind == EventKind::ElectionFailed;
        if failure {
            warn!(
                kind = event.kind.as_str(),
                node = %event.node_id,
                term = event.term,
                peer = ?event.peer,
                height = ?event.height,
                detail = %event.detail,
                "Consensus event"
            );
        } else {
            info!(
                kind = event.kind.as_str(),
                node = %event.node_id,
                term = event.term,
                peer = ?event.peer,
                index = ?event.index,
                height = ?event.height,
                "Consensus event"
            );
        }
    }
}
