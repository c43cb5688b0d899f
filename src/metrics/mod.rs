//! Metrics module for Prometheus-based monitoring.
//!
//! Tracks job settlement by kind and status, queue depth, pool occupancy,
//! unit faults, and the best aggregation scores.
//!
//! # Example
//!
//! ```ignore
//! use set_forge::metrics::{init_metrics, export_metrics};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! // ... run the scheduler ...
//! println!("{}", export_metrics());
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    BEST_SCORE, BUSY_UNITS, JOBS_TOTAL, JOB_DURATION, POOL_UNITS, QUEUE_DEPTH, REGISTRY,
    UNIT_FAULTS,
};
