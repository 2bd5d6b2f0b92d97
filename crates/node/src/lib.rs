//! Async runtime for one ledger node.
//!
//! [`LedgerNode`] wires the consensus state machine to storage, the
//! replication fan-out and catch-up sync, and to peers through a
//! [`PeerTransport`]. [`InMemoryNetwork`] connects nodes living in one
//! process, which is how tests and the simulator run whole clusters.

mod clock;
mod config;
mod error;
mod events;
mod node;
mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConsensusSection, NodeConfig, StorageConfig};
pub use error::{NodeError, TransportError};
pub use events::EventBus;
pub use node::{AppendOutcome, LedgerNode, NetworkSyncSummary, NodeStats};
pub use transport::{
    InMemoryNetwork, InMemoryTransport, PeerTransport, RpcHandler, TransportBlockSource,
};
