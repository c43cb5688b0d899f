//! Result aggregation on top of the scheduler.
//!
//! Two strategies turn many optimisation jobs into one answer:
//!
//! - **Batch** ([`ResultAggregator::run_batch`]): submit `k` jobs from the
//!   same request, wait for all of them, keep the best.
//! - **Continuous** ([`ResultAggregator::run_continuous`]): keep `k` jobs in
//!   flight and publish every improvement until cancelled.
//!
//! Results are ranked by a numeric field of the kernel's response (the
//! scheduler's `score_field`, `energy` by default). Higher is better; ties
//! keep the result that arrived first.

pub mod batch;
pub mod continuous;

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;

use crate::metrics::MetricsCollector;
use crate::scheduler::{JobId, Scheduler};

pub use batch::BatchOutcome;
pub use continuous::{ContinuousRun, ContinuousSummary};

/// Errors returned by an aggregation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AggregateError {
    /// No member produced a scored result.
    #[error("All {attempts} optimisation jobs failed: {}", .reasons.join("; "))]
    AllFailed {
        attempts: usize,
        reasons: Vec<String>,
    },

    /// The aggregation was cancelled before any member produced a result.
    #[error("Aggregation was cancelled")]
    Cancelled,
}

/// Which strategy an aggregation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationMode {
    Batch,
    Continuous,
}

impl AggregationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationMode::Batch => "batch",
            AggregationMode::Continuous => "continuous",
        }
    }
}

/// A kernel response together with its score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredResult {
    /// Job that produced the response.
    pub job_id: JobId,
    /// Value of the score field.
    pub score: f64,
    /// The full kernel response.
    pub response: Value,
}

impl ScoredResult {
    /// Extracts the score from `response`.
    ///
    /// `field` is a top-level key, or a JSON pointer when it starts with `/`.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if the field is missing, not a
    /// number, or not finite.
    pub fn from_response(job_id: JobId, response: Value, field: &str) -> Result<Self, String> {
        let raw = if field.starts_with('/') {
            response.pointer(field)
        } else {
            response.get(field)
        };

        let score = match raw.and_then(Value::as_f64) {
            Some(score) if score.is_finite() => score,
            Some(score) => return Err(format!("score field '{}' is not finite: {}", field, score)),
            None => return Err(format!("response has no numeric '{}' field", field)),
        };

        Ok(Self {
            job_id,
            score,
            response,
        })
    }
}

/// Progress counters of an aggregation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunProgress {
    /// Jobs submitted.
    pub dispatched: u64,
    /// Jobs that settled, in any way.
    pub completed: u64,
    /// Jobs that produced a scored result.
    pub succeeded: u64,
    /// Jobs that failed, were lost, or returned no usable score.
    pub failed: u64,
    /// Jobs cancelled with the aggregation.
    pub cancelled: u64,
}

/// Shared state of one aggregation: the best-result register and counters.
///
/// The register only ever moves to a strictly higher score.
#[derive(Debug)]
pub struct AggregationRun {
    mode: AggregationMode,
    best: watch::Sender<Option<ScoredResult>>,
    dispatched: AtomicU64,
    completed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

impl AggregationRun {
    pub fn new(mode: AggregationMode) -> Self {
        let (best, _) = watch::channel(None);
        Self {
            mode,
            best,
            dispatched: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> AggregationMode {
        self.mode
    }

    /// Replaces the best result if `candidate` scores strictly higher.
    ///
    /// Returns `true` if the register changed.
    pub fn offer(&self, candidate: ScoredResult) -> bool {
        self.best.send_if_modified(|best| {
            if best
                .as_ref()
                .is_some_and(|current| candidate.score <= current.score)
            {
                return false;
            }
            *best = Some(candidate);
            true
        })
    }

    /// Returns the best result so far.
    pub fn best(&self) -> Option<ScoredResult> {
        self.best.borrow().clone()
    }

    /// Returns a receiver notified on every improvement.
    pub fn subscribe(&self) -> watch::Receiver<Option<ScoredResult>> {
        self.best.subscribe()
    }

    pub fn progress(&self) -> RunProgress {
        RunProgress {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Runs batch and continuous aggregations against a scheduler.
#[derive(Debug, Clone)]
pub struct ResultAggregator {
    scheduler: Scheduler,
    score_field: String,
    metrics: MetricsCollector,
}

impl ResultAggregator {
    /// Creates an aggregator ranking by the scheduler's configured score field.
    pub fn new(scheduler: Scheduler) -> Self {
        let score_field = scheduler.config().score_field.clone();
        Self {
            scheduler,
            score_field,
            metrics: MetricsCollector::new(),
        }
    }

    /// Overrides the score field for this aggregator.
    pub fn with_score_field(mut self, field: impl Into<String>) -> Self {
        self.score_field = field.into();
        self
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn score_field(&self) -> &str {
        &self.score_field
    }
}
