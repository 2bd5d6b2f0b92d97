//! Consensus core for the consortium ledger.
//!
//! A role-asymmetric variant of leader election plus log replication:
//!
//! - The **Authority** is always the leader while it is alive. It never
//!   campaigns and never votes in Member elections.
//! - **Members** follow. When the Authority's heartbeats stop for longer
//!   than a randomized timeout, a Member campaigns among the other Members
//!   and, with a majority, becomes **Interim Leader**.
//! - When the Authority returns it reasserts leadership with a term above
//!   anything it has seen, and the Interim Leader hands back.
//!
//! [`ConsensusState`] is a synchronous state machine. Time is injected with
//! [`ConsensusState::set_time`] and every handler returns a list of
//! [`Action`]s for the runtime to perform (send messages, replicate a
//! committed block, persist metadata, publish events). It performs no I/O.

mod action;
mod config;
mod error;
mod heartbeat;
mod log;
mod messages;
mod state;
mod vote_tracker;

pub use action::Action;
pub use config::{ConsensusConfig, QuorumPolicy};
pub use error::{ElectionError, LogError, ProposeError};
pub use heartbeat::HeartbeatMonitor;
pub use log::ReplicationLog;
pub use messages::{AppendEntries, AppendResponse, RequestVote, VoteResponse};
pub use state::{ConsensusState, ConsensusStats, RecoveredState};
pub use vote_tracker::{majority, VoteTracker};
