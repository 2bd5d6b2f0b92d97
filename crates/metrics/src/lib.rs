//! Metrics facade for the consortium ledger.
//!
//! Provides a [`MetricsRecorder`] trait with domain-specific methods and default
//! no-op implementations. A global singleton recorder is accessed via [`recorder()`],
//! and convenience free functions delegate to it.
//!
//! # Usage
//!
//! ```ignore
//! consortium_metrics::record_event("COMMITTED");
//! consortium_metrics::record_replication_outcome("node-2", "applied");
//! ```
//!
//! Nothing is recorded until a backend is installed with
//! [`set_global_recorder`].

use std::sync::OnceLock;

// ═══════════════════════════════════════════════════════════════════════
// Trait
// ═══════════════════════════════════════════════════════════════════════

/// Sink for ledger metrics.
///
/// Every method is a no-op by default; a backend overrides what it exports.
#[allow(unused_variables)]
pub trait MetricsRecorder: Send + Sync + 'static {
    // ── Consensus ────────────────────────────────────────────────────

    /// Record a consensus event by kind (`ELECTION_START`, `COMMITTED`, ...).
    fn record_event(&self, kind: &str) {}

    /// Record an election outcome (`started`, `won`, `failed`, `abandoned`).
    fn record_election(&self, outcome: &str) {}

    /// Set the current term gauge.
    fn set_term(&self, term: u64) {}

    /// Set the commit index gauge.
    fn set_commit_index(&self, index: u64) {}

    // ── Replication ──────────────────────────────────────────────────

    /// Record the outcome of writing one block to one target.
    fn record_replication_outcome(&self, target: &str, outcome: &str) {}

    /// Record the latency of a full replication fan-out.
    fn record_replication_latency(&self, latency_secs: f64) {}

    // ── Sync ─────────────────────────────────────────────────────────

    /// Record blocks applied by a catch-up run.
    fn record_sync_applied(&self, count: u64) {}

    /// Record a catch-up aborted with the given error label.
    fn record_sync_failure(&self, label: &str) {}

    /// Record a block rejected by validation.
    fn record_validation_failure(&self, label: &str) {}

    // ── Storage ──────────────────────────────────────────────────────

    /// Latency of one storage call, labelled by operation.
    fn record_storage_operation(&self, operation: &str, latency_secs: f64) {}

    /// Set the local chain height gauge.
    fn set_block_height(&self, height: u64) {}
}

// ═══════════════════════════════════════════════════════════════════════
// Global singleton
// ═══════════════════════════════════════════════════════════════════════

struct NoopRecorder;
impl MetricsRecorder for NoopRecorder {}

static RECORDER: OnceLock<Box<dyn MetricsRecorder>> = OnceLock::new();

/// Install the process-wide recorder. The first call wins; later calls
/// are ignored.
pub fn set_global_recorder(recorder: Box<dyn MetricsRecorder>) {
    let _ = RECORDER.set(recorder);
}

/// The installed recorder, or a no-op one before installation.
#[inline]
pub fn recorder() -> &'static dyn MetricsRecorder {
    RECORDER.get().map(|r| r.as_ref()).unwrap_or(&NoopRecorder)
}

// ═══════════════════════════════════════════════════════════════════════
// Convenience free functions
// ═══════════════════════════════════════════════════════════════════════

#[inline]
pub fn record_event(kind: &str) {
    recorder().record_event(kind);
}

#[inline]
pub fn record_election(outcome: &str) {
    recorder().record_election(outcome);
}

#[inline]
pub fn set_term(term: u64) {
    recorder().set_term(term);
}

#[inline]
pub fn set_commit_index(index: u64) {
    recorder().set_commit_index(index);
}

#[inline]
pub fn record_replication_outcome(target: &str, outcome: &str) {
    recorder().record_replication_outcome(target, outcome);
}

#[inline]
pub fn record_replication_latency(latency_secs: f64) {
    recorder().record_replication_latency(latency_secs);
}

#[inline]
pub fn record_sync_applied(count: u64) {
    recorder().record_sync_applied(count);
}

#[inline]
pub fn record_sync_failure(label: &str) {
    recorder().record_sync_failure(label);
}

#[inline]
pub fn record_validation_failure(label: &str) {
    recorder().record_validation_failure(label);
}

#[inline]
pub fn record_storage_operation(operation: &str, latency_secs: f64) {
    recorder().record_storage_operation(operation, latency_secs);
}

#[inline]
pub fn set_block_height(height: u64) {
    recorder().set_block_height(height);
}
