//! Side effects requested by the consensus state machine.

use crate::messages::{AppendEntries, RequestVote};
use consortium_types::{ConsensusEvent, LogEntry, NodeId};

/// An effect for the runtime to carry out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send AppendEntries (or a heartbeat) to one peer.
    SendAppendEntries { to: NodeId, message: AppendEntries },

    /// Ask one Member for its vote.
    SendRequestVote { to: NodeId, message: RequestVote },

    /// `entry` reached quorum. The referenced block must now be replicated
    /// to every storage target.
    Commit { entry: LogEntry },

    /// Persist term metadata so it survives a restart.
    PersistMeta {
        current_term: u64,
        last_known_cluster_term: u64,
    },

    /// Publish an event to observers.
    Emit(ConsensusEvent),
}
