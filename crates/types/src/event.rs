//! Typed consensus events for audit and observability consumers.

use crate::NodeId;
use serde::{Deserialize, Serialize};

/// Kind of a consensus event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    ElectionStart,
    VoteGranted,
    LeaderElected,
    ElectionFailed,
    AppendEntries,
    LeaderAppend,
    Replication,
    Committed,
    EntryApplied,
    LeaderRestored,
    LeadershipTransferred,
}

impl EventKind {
    pub const ALL: [EventKind; 11] = [
        EventKind::ElectionStart,
        EventKind::VoteGranted,
        EventKind::LeaderElected,
        EventKind::ElectionFailed,
        EventKind::AppendEntries,
        EventKind::LeaderAppend,
        EventKind::Replication,
        EventKind::Committed,
        EventKind::EntryApplied,
        EventKind::LeaderRestored,
        EventKind::LeadershipTransferred,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ElectionStart => "ELECTION_START",
            EventKind::VoteGranted => "VOTE_GRANTED",
            EventKind::LeaderElected => "LEADER_ELECTED",
            EventKind::ElectionFailed => "ELECTION_FAILED",
            EventKind::AppendEntries => "APPEND_ENTRIES",
            EventKind::LeaderAppend => "LEADER_APPEND",
            EventKind::Replication => "REPLICATION",
            EventKind::Committed => "COMMITTED",
            EventKind::EntryApplied => "ENTRY_APPLIED",
            EventKind::LeaderRestored => "LEADER_RESTORED",
            EventKind::LeadershipTransferred => "LEADERSHIP_TRANSFERRED",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A consensus event emitted by a node.
///
/// `timestamp_ms` is filled in by the emitting runtime; state machines build
/// events with a zero timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusEvent {
    pub kind: EventKind,
    pub node_id: NodeId,
    pub term: u64,
    pub timestamp_ms: u64,
    /// Counterpart node (voter, candidate, replication target, peer).
    pub peer: Option<NodeId>,
    pub index: Option<u64>,
    pub height: Option<u64>,
    /// Whether the described action succeeded. Only meaningful for
    /// per-target events such as `REPLICATION`.
    pub success: bool,
    pub detail: String,
}

impl ConsensusEvent {
    pub fn new(kind: EventKind, node_id: NodeId, term: u64) -> Self {
        Self {
            kind,
            node_id,
            term,
            timestamp_ms: 0,
            peer: None,
            index: None,
            height: None,
            success: true,
            detail: String::new(),
        }
    }

    pub fn with_peer(mut self, peer: NodeId) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn with_index(mut self, index: u64) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_height(mut self, height: u64) -> Self {
        self.height = Some(height);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn failed(mut self) -> Self {
        self.success = false;
        self
    }

    pub fn at(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_names_match_display() {
        for kind in EventKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn test_event_builder() {
        let event = ConsensusEvent::new(EventKind::Replication, NodeId::from("a"), 3)
            .with_peer(NodeId::from("b"))
            .with_height(101)
            .failed()
            .at(99);
        assert_eq!(event.peer, Some(NodeId::from("b")));
        assert_eq!(event.height, Some(101));
        assert!(!event.success);
        assert_eq!(event.timestamp_ms, 99);
    }
}
