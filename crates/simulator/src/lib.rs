//! Consortium Simulator
//!
//! Drives an in-memory cluster through a full leadership cycle on a
//! manual clock: steady Authority operation, Authority outage with a
//! Member election, interim appends, and the Authority's return.
//!
//! # Example
//!
//! ```ignore
//! use consortium_simulator::{ScenarioConfig, Simulator};
//!
//! let config = ScenarioConfig::new(3).with_seed(7).with_blocks(5, 2);
//! let report = Simulator::new(config).run().await?;
//! report.print_summary();
//! ```

mod config;
mod metrics;
mod runner;

pub use config::ScenarioConfig;
pub use metrics::{CountingRecorder, MetricsSnapshot};
pub use runner::{ScenarioError, ScenarioReport, Simulator};
