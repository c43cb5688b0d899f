//! Metric recording helpers for the scheduler.
//!
//! The `MetricsCollector` wraps the raw Prometheus statics so the coordinator
//! and aggregators record through one consistently labelled interface.

use super::prometheus::{
    BEST_SCORE, BUSY_UNITS, JOBS_TOTAL, JOB_DURATION, POOL_UNITS, QUEUE_DEPTH, UNIT_FAULTS,
};

/// Metrics collector for scheduler operations.
///
/// Every method is a no-op until `init_metrics()` has run.
///
/// # Example
///
/// ```ignore
/// use set_forge::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_job("optimise", "completed", 1.5);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a settled job.
    ///
    /// # Arguments
    ///
    /// * `kind` - Job kind label (e.g., "optimise", "lookup-slot")
    /// * `status` - How the job settled (e.g., "completed", "cancelled")
    /// * `duration_secs` - Time from submission to settlement
    pub fn record_job(&self, kind: &str, status: &str, duration_secs: f64) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total.with_label_values(&[kind, status]).inc();
        }

        if let Some(job_duration) = JOB_DURATION.get() {
            job_duration.with_label_values(&[kind]).observe(duration_secs);
        }

        tracing::trace!(
            kind = kind,
            status = status,
            duration_secs = duration_secs,
            "Recorded job metric"
        );
    }

    /// Record an execution unit fault.
    pub fn record_unit_fault(&self) {
        if let Some(unit_faults) = UNIT_FAULTS.get() {
            unit_faults.inc();
        }
    }

    /// Update the pool gauges.
    ///
    /// # Arguments
    ///
    /// * `queued` - Jobs waiting for a unit
    /// * `busy` - Units running a job
    /// * `units` - Live units in any state
    pub fn set_pool_state(&self, queued: usize, busy: usize, units: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth.set(queued as f64);
        }

        if let Some(busy_units) = BUSY_UNITS.get() {
            busy_units.set(busy as f64);
        }

        if let Some(pool_units) = POOL_UNITS.get() {
            pool_units.set(units as f64);
        }
    }

    /// Record a new best score for an aggregation mode ("batch" or "continuous").
    pub fn record_best_score(&self, mode: &str, score: f64) {
        if let Some(best_score) = BEST_SCORE.get() {
            best_score.with_label_values(&[mode]).set(score);
        }

        tracing::trace!(mode = mode, score = score, "Recorded best score");
    }
}
