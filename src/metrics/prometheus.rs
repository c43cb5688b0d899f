//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by set_forge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all set_forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total number of settled jobs, labeled by kind and status.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Time from submission to settlement in seconds, labeled by kind.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of jobs waiting for a free unit.
pub static QUEUE_DEPTH: OnceLock<Gauge> = OnceLock::new();

/// Number of units currently running a job.
pub static BUSY_UNITS: OnceLock<Gauge> = OnceLock::new();

/// Number of live execution units.
pub static POOL_UNITS: OnceLock<Gauge> = OnceLock::new();

/// Total execution unit faults.
pub static UNIT_FAULTS: OnceLock<Counter> = OnceLock::new();

/// Best score seen by the most recent aggregation, labeled by mode.
pub static BEST_SCORE: OnceLock<GaugeVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. Recording
/// before initialization is a silent no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Job metrics
    let jobs_total = CounterVec::new(
        Opts::new("set_forge_jobs_total", "Total number of settled jobs"),
        &["kind", "status"],
    )?;

    let job_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "set_forge_job_duration_seconds",
            "Time from job submission to settlement in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]),
        &["kind"],
    )?;

    // Queue and pool metrics
    let queue_depth = Gauge::new(
        "set_forge_queue_depth",
        "Number of jobs waiting for a free unit",
    )?;

    let busy_units = Gauge::new("set_forge_busy_units", "Number of units running a job")?;

    let pool_units = Gauge::new("set_forge_pool_units", "Number of live execution units")?;

    let unit_faults = Counter::new("set_forge_unit_faults_total", "Total execution unit faults")?;

    // Aggregation metrics
    let best_score = GaugeVec::new(
        Opts::new(
            "set_forge_best_score",
            "Best score seen by the most recent aggregation",
        ),
        &["mode"],
    )?;

    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(busy_units.clone()))?;
    registry.register(Box::new(pool_units.clone()))?;
    registry.register(Box::new(unit_faults.clone()))?;
    registry.register(Box::new(best_score.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = BUSY_UNITS.set(busy_units);
    let _ = POOL_UNITS.set(pool_units);
    let _ = UNIT_FAULTS.set(unit_faults);
    let _ = BEST_SCORE.set(best_score);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line instead if metrics were never
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
