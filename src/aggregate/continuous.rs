//! Continuous aggregation: keep improving until cancelled.
//!
//! Each slot is a task looping submit → await → offer. Per-iteration failures
//! are counted, never surfaced. A slot stops when the run is cancelled or the
//! scheduler can no longer accept work.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::MetricsCollector;
use crate::scheduler::Scheduler;

use super::{AggregationMode, AggregationRun, ResultAggregator, RunProgress, ScoredResult};

/// Final state of a continuous run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContinuousSummary {
    pub best: Option<ScoredResult>,
    pub progress: RunProgress,
}

/// A running continuous aggregation.
///
/// Dropping the run does not stop it; call [`ContinuousRun::cancel`] or cancel
/// the token it was started with.
#[derive(Debug)]
pub struct ContinuousRun {
    run: Arc<AggregationRun>,
    slots: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl ContinuousRun {
    /// Returns the best result so far.
    pub fn best(&self) -> Option<ScoredResult> {
        self.run.best()
    }

    /// Returns a receiver notified on every improvement.
    pub fn subscribe(&self) -> watch::Receiver<Option<ScoredResult>> {
        self.run.subscribe()
    }

    pub fn progress(&self) -> RunProgress {
        self.run.progress()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Stops every slot. Jobs in flight are cancelled.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Returns whether every slot has exited.
    pub fn is_finished(&self) -> bool {
        self.slots.iter().all(JoinHandle::is_finished)
    }

    /// Waits for every slot to exit and returns the final state.
    ///
    /// Does not cancel the run by itself.
    pub async fn join(self) -> ContinuousSummary {
        for result in futures::future::join_all(self.slots).await {
            if let Err(e) = result {
                warn!(error = %e, "Continuous slot task failed");
            }
        }

        let summary = ContinuousSummary {
            best: self.run.best(),
            progress: self.run.progress(),
        };
        info!(
            best = ?summary.best.as_ref().map(|b| b.score),
            completed = summary.progress.completed,
            "Continuous optimisation finished"
        );
        summary
    }
}

impl ResultAggregator {
    /// Starts `slots` loops that repeatedly optimise `payload` and keep the best.
    ///
    /// `slots` defaults to the scheduler's current target size, and is never
    /// less than 1.
    /// The run stops when `cancel` (or [`ContinuousRun::cancel`]) fires, or
    /// when the scheduler closes or becomes unavailable.
    pub fn run_continuous(
        &self,
        payload: Value,
        slots: Option<usize>,
        cancel: &CancellationToken,
    ) -> ContinuousRun {
        let slot_count = slots
            .unwrap_or_else(|| self.scheduler.target_size())
            .max(1);
        let run = Arc::new(AggregationRun::new(AggregationMode::Continuous));
        let cancel = cancel.child_token();

        info!(slots = slot_count, "Starting continuous optimisation");

        let handles = (0..slot_count)
            .map(|slot| {
                tokio::spawn(run_slot(
                    slot,
                    self.scheduler.clone(),
                    payload.clone(),
                    self.score_field.clone(),
                    Arc::clone(&run),
                    cancel.clone(),
                    self.metrics.clone(),
                ))
            })
            .collect();

        ContinuousRun {
            run,
            slots: handles,
            cancel,
        }
    }
}

async fn run_slot(
    slot: usize,
    scheduler: Scheduler,
    payload: Value,
    score_field: String,
    run: Arc<AggregationRun>,
    cancel: CancellationToken,
    metrics: MetricsCollector,
) {
    while !cancel.is_cancelled() {
        run.record_dispatched();
        let handle = scheduler.optimise(payload.clone(), &cancel);
        let job_id = handle.id();

        match handle.await {
            Ok(response) => match ScoredResult::from_response(job_id, response, &score_field) {
                Ok(candidate) => {
                    run.record_succeeded();
                    let score = candidate.score;
                    if run.offer(candidate) {
                        debug!(slot, score, "New best result");
                        metrics.record_best_score(run.mode().as_str(), score);
                    }
                }
                Err(reason) => {
                    debug!(slot, reason = %reason, "Response has no usable score");
                    run.record_failed();
                }
            },
            Err(e) if e.is_cancelled() => {
                run.record_cancelled();
                break;
            }
            Err(e) if e.is_terminal() => {
                warn!(slot, error = %e, "Scheduler cannot run more jobs, stopping slot");
                run.record_failed();
                break;
            }
            Err(e) => {
                debug!(slot, error = %e, "Iteration failed");
                run.record_failed();
            }
        }
    }

    debug!(slot, "Continuous slot exited");
}
