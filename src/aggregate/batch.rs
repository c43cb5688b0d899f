//! Batch aggregation: best of `k` independent runs.

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::JobError;

use super::{AggregateError, AggregationMode, AggregationRun, ResultAggregator, RunProgress, ScoredResult};

/// Result of a successful batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchOutcome {
    /// Highest-scoring result; the earliest submitted wins ties.
    pub best: ScoredResult,
    /// Jobs submitted.
    pub attempts: usize,
    /// Final counters.
    pub progress: RunProgress,
    /// Why the other members produced no candidate.
    pub failures: Vec<String>,
}

impl ResultAggregator {
    /// Runs `unit_count` optimise jobs from the same request and returns the best.
    ///
    /// `unit_count` defaults to the scheduler's free-unit count, and is never
    /// less than 1. Cancelling `cancel` cancels every member.
    ///
    /// # Errors
    ///
    /// Returns `AggregateError::Cancelled` if the batch was cancelled before any
    /// member produced a result, and `AggregateError::AllFailed` if every
    /// member failed.
    pub async fn run_batch(
        &self,
        payload: Value,
        unit_count: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome, AggregateError> {
        let attempts = unit_count
            .unwrap_or_else(|| self.scheduler.free_unit_count())
            .max(1);
        let run = AggregationRun::new(AggregationMode::Batch);

        info!(attempts, "Starting batch optimisation");

        let handles: Vec<_> = (0..attempts)
            .map(|_| {
                run.record_dispatched();
                self.scheduler.optimise(payload.clone(), cancel)
            })
            .collect();
        let ids: Vec<_> = handles.iter().map(|handle| handle.id()).collect();

        let outcomes = futures::future::join_all(handles).await;

        let mut failures = Vec::new();
        for (job_id, outcome) in ids.into_iter().zip(outcomes) {
            match outcome {
                Ok(response) => match ScoredResult::from_response(job_id, response, &self.score_field) {
                    Ok(candidate) => {
                        run.record_succeeded();
                        run.offer(candidate);
                    }
                    Err(reason) => {
                        debug!(job_id = %job_id, reason = %reason, "Batch member has no usable score");
                        run.record_failed();
                        failures.push(reason);
                    }
                },
                Err(JobError::Cancelled) => {
                    run.record_cancelled();
                    failures.push(JobError::Cancelled.to_string());
                }
                Err(e) => {
                    debug!(job_id = %job_id, error = %e, "Batch member failed");
                    run.record_failed();
                    failures.push(e.to_string());
                }
            }
        }

        let progress = run.progress();
        match run.best() {
            Some(best) => {
                info!(
                    score = best.score,
                    succeeded = progress.succeeded,
                    attempts,
                    "Batch optimisation finished"
                );
                self.metrics.record_best_score(AggregationMode::Batch.as_str(), best.score);
                Ok(BatchOutcome {
                    best,
                    attempts,
                    progress,
                    failures,
                })
            }
            None if cancel.is_cancelled() => Err(AggregateError::Cancelled),
            None => {
                warn!(attempts, "Every batch member failed");
                Err(AggregateError::AllFailed {
                    attempts,
                    reasons: failures,
                })
            }
        }
    }
}
