//! Consortium Simulator CLI
//!
//! Run a deterministic failover scenario and print what happened.
//!
//! # Example
//!
//! ```bash
//! # Three Members, fixed seed
//! consortium-sim --seed 42 -m 3
//!
//! # Longer chain, random seed, full-cluster election quorum
//! consortium-sim -m 5 --before 20 --during 10 --full-cluster-quorum
//! ```

use anyhow::{bail, Context};
use clap::Parser;
use consortium_consensus::QuorumPolicy;
use consortium_simulator::{CountingRecorder, ScenarioConfig, Simulator};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Consortium Simulator
///
/// Crashes the Authority of an in-memory cluster, lets the Members elect
/// an interim leader, then brings the Authority back. Reproducible when
/// the same seed is used.
#[derive(Parser, Debug)]
#[command(name = "consortium-sim")]
#[command(version, about, long_about = None)]
struct Args {
    /// Number of Members
    #[arg(short = 'm', long, default_value = "3")]
    members: usize,

    /// Random seed for keys and election jitter. When omitted, a random seed is used.
    #[arg(long)]
    seed: Option<u64>,

    /// Blocks appended by the Authority before the outage
    #[arg(long, default_value = "3")]
    before: usize,

    /// Blocks appended by the interim leader during the outage
    #[arg(long, default_value = "2")]
    during: usize,

    /// Transactions per block
    #[arg(short = 't', long, default_value = "2")]
    transactions: usize,

    /// Seconds of simulated time the Members get to elect a leader
    #[arg(long, default_value = "30")]
    election_limit: u64,

    /// Count the Authority in the election quorum denominator
    #[arg(long)]
    full_cluster_quorum: bool,

    /// Print counted metrics at the end
    #[arg(long)]
    metrics: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,consortium=info")),
        )
        .init();

    let args = Args::parse();
    if args.members == 0 {
        bail!("a cluster needs at least one Member");
    }

    let counts = CountingRecorder::default();
    consortium_metrics::set_global_recorder(Box::new(counts.clone()));

    let seed = args.seed.unwrap_or_else(rand::random);
    let policy = if args.full_cluster_quorum {
        QuorumPolicy::FullCluster
    } else {
        QuorumPolicy::MembersOnly
    };

    info!(
        members = args.members,
        seed,
        before = args.before,
        during = args.during,
        ?policy,
        "Starting scenario"
    );

    let config = ScenarioConfig::new(args.members)
        .with_seed(seed)
        .with_blocks(args.before, args.during)
        .with_transactions_per_block(args.transactions)
        .with_election_limit(Duration::from_secs(args.election_limit))
        .with_quorum_policy(policy);

    let report = Simulator::new(config)
        .run()
        .await
        .with_context(|| format!("scenario failed (seed {seed})"))?;
    report.print_summary();

    if args.metrics {
        counts.snapshot().print_summary();
    }

    if !report.converged {
        bail!("stores did not converge (seed {seed})");
    }
    Ok(())
}
