//! Control-plane metrics.
//!
//! All metrics go through the `metrics` crate facade; the binary decides
//! which recorder (if any) is installed.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `fleet_revisions_created_total` | Counter | `origin` | Revisions appended to the store |
//! | `fleet_apply_reports_total` | Counter | `outcome` | Agent apply reports |
//! | `fleet_rollbacks_total` | Counter | - | Rollbacks issued |
//! | `fleet_heartbeats_total` | Counter | - | Heartbeats recorded |
//! | `fleet_nodes_marked_offline_total` | Counter | - | Offline transitions made by sweeps |
//! | `fleet_cas_conflicts_total` | Counter | `record` | Lost compare-and-swap writes |
//! | `fleet_audit_append_failures_total` | Counter | `action` | Audit appends that failed |
//! | `fleet_sweep_duration_seconds` | Histogram | - | Offline sweep wall time |

use std::time::{Duration, Instant};

use metrics::{counter, describe_counter, describe_histogram, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: revisions appended.
    pub const REVISIONS_CREATED_TOTAL: &str = "fleet_revisions_created_total";
    /// Counter: apply reports by outcome.
    pub const APPLY_REPORTS_TOTAL: &str = "fleet_apply_reports_total";
    /// Counter: rollbacks issued.
    pub const ROLLBACKS_TOTAL: &str = "fleet_rollbacks_total";
    /// Counter: heartbeats recorded.
    pub const HEARTBEATS_TOTAL: &str = "fleet_heartbeats_total";
    /// Counter: nodes transitioned to offline.
    pub const NODES_MARKED_OFFLINE_TOTAL: &str = "fleet_nodes_marked_offline_total";
    /// Counter: compare-and-swap writes that lost a race.
    pub const CAS_CONFLICTS_TOTAL: &str = "fleet_cas_conflicts_total";
    /// Counter: audit appends that failed or timed out.
    pub const AUDIT_APPEND_FAILURES_TOTAL: &str = fleet_core::audit::AUDIT_APPEND_FAILURES;
    /// Histogram: offline sweep duration in seconds.
    pub const SWEEP_DURATION_SECONDS: &str = "fleet_sweep_duration_seconds";
}

/// Label keys used across metrics.
pub mod labels {
    /// Revision origin (initial, push, rollback).
    pub const ORIGIN: &str = "origin";
    /// Apply outcome (success, failed).
    pub const OUTCOME: &str = "outcome";
    /// Record kind that lost a CAS race (node, revision).
    pub const RECORD: &str = "record";
}

/// Handle for recording control-plane metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlMetrics;

impl ControlMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Records an appended revision.
    pub fn record_revision_created(&self, origin: &'static str) {
        counter!(names::REVISIONS_CREATED_TOTAL, labels::ORIGIN => origin).increment(1);
    }

    /// Records an agent apply report.
    pub fn record_apply_report(&self, outcome: &'static str) {
        counter!(names::APPLY_REPORTS_TOTAL, labels::OUTCOME => outcome).increment(1);
    }

    /// Records a rollback.
    pub fn record_rollback(&self) {
        counter!(names::ROLLBACKS_TOTAL).increment(1);
    }

    /// Records a heartbeat.
    pub fn record_heartbeat(&self) {
        counter!(names::HEARTBEATS_TOTAL).increment(1);
    }

    /// Records nodes marked offline by a sweep.
    pub fn record_marked_offline(&self, count: usize) {
        counter!(names::NODES_MARKED_OFFLINE_TOTAL).increment(count as u64);
    }

    /// Records a lost compare-and-swap write.
    pub fn record_cas_conflict(&self, record: &'static str) {
        counter!(names::CAS_CONFLICTS_TOTAL, labels::RECORD => record).increment(1);
    }

    /// Records sweep duration.
    pub fn observe_sweep_duration(&self, duration: Duration) {
        histogram!(names::SWEEP_DURATION_SECONDS).record(duration.as_secs_f64());
    }
}

/// RAII guard for timing operations.
///
/// Calls `on_drop` with the elapsed time when dropped.
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a new timing guard.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

/// Registers all control-plane metric descriptions.
///
/// Call once at startup after installing a recorder.
pub fn register_metrics() {
    describe_counter!(names::REVISIONS_CREATED_TOTAL, "Revisions appended to the store");
    describe_counter!(names::APPLY_REPORTS_TOTAL, "Agent apply reports by outcome");
    describe_counter!(names::ROLLBACKS_TOTAL, "Rollbacks issued");
    describe_counter!(names::HEARTBEATS_TOTAL, "Heartbeats recorded");
    describe_counter!(
        names::NODES_MARKED_OFFLINE_TOTAL,
        "Offline transitions made by sweeps"
    );
    describe_counter!(names::CAS_CONFLICTS_TOTAL, "Lost compare-and-swap writes");
    describe_counter!(names::AUDIT_APPEND_FAILURES_TOTAL, "Audit appends that failed");
    describe_histogram!(names::SWEEP_DURATION_SECONDS, "Offline sweep wall time in seconds");
}

/// Creates a timing guard for an offline sweep.
#[must_use]
pub fn time_sweep() -> TimingGuard<impl FnOnce(Duration)> {
    TimingGuard::new(|duration| ControlMetrics::new().observe_sweep_duration(duration))
}
