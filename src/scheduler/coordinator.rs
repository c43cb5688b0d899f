//! The scheduler front end and the coordinator task behind it.
//!
//! `Scheduler` is a cheap, cloneable handle. Every state change goes through
//! one coordinator task that owns the `WorkerPool`, the `JobQueue` and the
//! table of in-flight jobs, so none of them need locks. The coordinator reacts
//! to two channels:
//!
//! - commands from handles (submit, cancel, resize, shutdown)
//! - events from execution units (ready, completed, failed, faulted)
//!
//! After each message it hands queued jobs to free units and publishes a
//! `SchedulerStats` snapshot on a watch channel.
//!
//! Each submitted job gets a small watcher task bound to its cancellation
//! token. The watcher turns a cancellation into a `Cancel` command and is
//! aborted as soon as the job settles, so a job settles exactly once.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::JobError;
use crate::kernel::KernelFactory;
use crate::metrics::MetricsCollector;

use super::config::{ConfigError, SchedulerConfig};
use super::job::{Job, JobId, JobKind, JobOutcome, JobStatus};
use super::queue::{JobQueue, QueuedJob};
use super::unit::{UnitEvent, UnitId};
use super::worker_pool::{PoolStats, UnitStatus, WorkerPool};

/// Messages from `Scheduler` handles to the coordinator.
enum Command {
    Submit(QueuedJob),
    Cancel(JobId),
    SetTargetSize(usize),
    Shutdown(oneshot::Sender<()>),
}

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    /// Pool occupancy and lifetime counters.
    pub pool: PoolStats,
    /// Jobs waiting for a free unit.
    pub queued_jobs: usize,
    /// Jobs dispatched and not yet settled.
    pub in_flight: usize,
    /// Jobs accepted by the coordinator.
    pub jobs_submitted: u64,
    /// Jobs that produced a response.
    pub jobs_completed: u64,
    /// Jobs the kernel rejected.
    pub jobs_failed: u64,
    /// Jobs cancelled by their caller.
    pub jobs_cancelled: u64,
    /// Jobs whose execution unit faulted.
    pub jobs_lost: u64,
    /// Jobs rejected because the scheduler could not run them.
    pub jobs_aborted: u64,
    /// Whether the coordinator has stopped.
    pub closed: bool,
}

impl SchedulerStats {
    /// Returns the number of jobs that reached the kernel and settled.
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed + self.jobs_lost
    }

    /// Returns the percentage of processed jobs that completed.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_completed as f64 / total as f64) * 100.0
    }

    /// Returns the number of jobs that have settled for any reason.
    pub fn total_settled(&self) -> u64 {
        self.total_processed() + self.jobs_cancelled + self.jobs_aborted
    }
}

/// Handle to a submitted job. Resolves once the job settles.
///
/// Dropping the handle does not cancel the job; call [`JobHandle::cancel`].
#[derive(Debug)]
pub struct JobHandle {
    id: JobId,
    kind: JobKind,
    rx: oneshot::Receiver<JobOutcome>,
    cancel: CancellationToken,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Requests cancellation of this job only.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns a token that cancels this job when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Future for JobHandle {
    type Output = JobOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(JobError::SchedulerClosed)))
    }
}

/// Cloneable handle to a running scheduler.
///
/// The coordinator stops when [`Scheduler::shutdown`] is called or when the
/// last handle is dropped.
#[derive(Clone)]
pub struct Scheduler {
    commands: mpsc::UnboundedSender<Command>,
    stats: watch::Receiver<SchedulerStats>,
    config: Arc<SchedulerConfig>,
    target_size: Arc<AtomicUsize>,
}

impl Scheduler {
    /// Validates `config`, spawns the coordinator and starts bringing up
    /// execution units.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` for an invalid configuration.
    pub fn start(
        config: SchedulerConfig,
        factory: Arc<dyn KernelFactory>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stats_tx, stats_rx) = watch::channel(SchedulerStats::default());

        info!(
            target_size = config.target_size,
            queue_order = %config.queue_order,
            "Starting scheduler"
        );

        let coordinator = Coordinator {
            pool: WorkerPool::new(&config, factory, events_tx),
            queue: JobQueue::new(config.queue_order),
            in_flight: HashMap::new(),
            watchers: HashMap::new(),
            stats: SchedulerStats::default(),
            stats_tx,
            commands: commands_tx.downgrade(),
            max_init_failures: config.max_init_failures,
            metrics: MetricsCollector::new(),
        };
        tokio::spawn(coordinator.run(commands_rx, events_rx));

        Ok(Self {
            commands: commands_tx,
            stats: stats_rx,
            target_size: Arc::new(AtomicUsize::new(config.target_size)),
            config: Arc::new(config),
        })
    }

    /// Queues a job and returns a handle that resolves when it settles.
    ///
    /// Cancelling `cancel` (or any parent of it) cancels the job. The handle
    /// gets its own child token so [`JobHandle::cancel`] affects only this job.
    pub fn submit(&self, kind: JobKind, payload: Value, cancel: &CancellationToken) -> JobHandle {
        let token = cancel.child_token();
        let job = Job::new(kind, payload, token.clone());
        let id = job.id;
        let (reply, rx) = oneshot::channel();

        if let Err(mpsc::error::SendError(command)) =
            self.commands.send(Command::Submit(QueuedJob::new(job, reply)))
        {
            if let Command::Submit(queued) = command {
                queued.settle(Err(JobError::SchedulerClosed));
            }
        }

        JobHandle {
            id,
            kind,
            rx,
            cancel: token,
        }
    }

    /// Submits an optimisation request.
    pub fn optimise(&self, request: Value, cancel: &CancellationToken) -> JobHandle {
        self.submit(JobKind::Optimise, request, cancel)
    }

    /// Submits a lookup of the items that fit `slot`.
    ///
    /// Lookups are cheap and not cancellable; drop the handle to lose interest.
    pub fn items_in_slot(&self, slot: u32) -> JobHandle {
        self.submit(JobKind::LookupSlot, json!({ "slot": slot }), &CancellationToken::new())
    }

    /// Submits a lookup of the full item catalogue.
    pub fn catalog(&self) -> JobHandle {
        self.submit(JobKind::LookupCatalog, Value::Null, &CancellationToken::new())
    }

    /// Submits a lookup of the known spells.
    pub fn spells(&self) -> JobHandle {
        self.submit(JobKind::LookupSpells, Value::Null, &CancellationToken::new())
    }

    /// Changes the desired number of execution units.
    pub fn set_target_size(&self, target_size: usize) {
        self.target_size.store(target_size, Ordering::Relaxed);
        let _ = self.commands.send(Command::SetTargetSize(target_size));
    }

    /// Returns the most recently requested number of execution units.
    ///
    /// Unlike [`Scheduler::stats`], this reflects `set_target_size` at once.
    pub fn target_size(&self) -> usize {
        self.target_size.load(Ordering::Relaxed)
    }

    /// Returns the latest published snapshot.
    pub fn stats(&self) -> SchedulerStats {
        self.stats.borrow().clone()
    }

    /// Returns the number of idle units as of the latest snapshot.
    pub fn free_unit_count(&self) -> usize {
        self.stats.borrow().pool.free_units
    }

    /// Returns the number of live units as of the latest snapshot.
    pub fn unit_count(&self) -> usize {
        self.stats.borrow().pool.units
    }

    /// Returns the number of queued jobs as of the latest snapshot.
    pub fn queued_job_count(&self) -> usize {
        self.stats.borrow().queued_jobs
    }

    /// Returns a receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<SchedulerStats> {
        self.stats.clone()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Returns whether the coordinator has stopped.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Stops the coordinator. Every pending job settles with
    /// `JobError::SchedulerClosed` and every unit is torn down.
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("target_size", &self.target_size())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A dispatched job awaiting its unit's report.
struct InFlight {
    unit: UnitId,
    kind: JobKind,
    created_at: DateTime<Utc>,
    reply: oneshot::Sender<JobOutcome>,
}

struct Coordinator {
    pool: WorkerPool,
    queue: JobQueue,
    in_flight: HashMap<JobId, InFlight>,
    watchers: HashMap<JobId, AbortHandle>,
    stats: SchedulerStats,
    stats_tx: watch::Sender<SchedulerStats>,
    commands: mpsc::WeakUnboundedSender<Command>,
    max_init_failures: u32,
    metrics: MetricsCollector,
}

impl Coordinator {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<UnitEvent>,
    ) {
        self.pool.balance();
        self.publish();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(done)) => {
                        self.shutdown(&mut commands);
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All scheduler handles dropped");
                        self.shutdown(&mut commands);
                        break;
                    }
                },
                Some(event) = events.recv() => self.handle_event(event),
            }

            self.try_assign();
            self.publish();
        }

        info!("Scheduler stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit(queued) => self.admit(queued),
            Command::Cancel(id) => self.cancel(id),
            Command::SetTargetSize(target_size) => self.pool.set_target_size(target_size),
            // Handled by the run loop.
            Command::Shutdown(_) => {}
        }
    }

    fn admit(&mut self, queued: QueuedJob) {
        self.stats.jobs_submitted += 1;

        if queued.job.is_cancelled() {
            self.settle_queued(queued, Err(JobError::Cancelled));
            return;
        }
        if self.pool.is_unavailable() {
            let reason = self.unavailable_reason();
            self.settle_queued(queued, Err(JobError::Unavailable(reason)));
            return;
        }

        let id = queued.job.id;
        let token = queued.job.cancel_token().clone();
        let commands = self.commands.clone();
        let watcher = tokio::spawn(async move {
            token.cancelled().await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::Cancel(id));
            }
        });
        self.watchers.insert(id, watcher.abort_handle());

        debug!(job_id = %id, kind = %queued.job.kind, "Job queued");
        self.queue.push(queued);
    }

    fn cancel(&mut self, id: JobId) {
        if let Some(queued) = self.queue.remove(id) {
            debug!(job_id = %id, "Cancelled queued job");
            self.settle_queued(queued, Err(JobError::Cancelled));
            return;
        }

        if let Some(entry) = self.in_flight.remove(&id) {
            // The kernel cannot be interrupted; sacrifice the unit.
            warn!(job_id = %id, unit = %entry.unit, "Cancelling running job, retiring its unit");
            self.pool.retire(entry.unit);
            self.settle(id, entry.kind, entry.created_at, entry.reply, Err(JobError::Cancelled));
        }
    }

    fn handle_event(&mut self, event: UnitEvent) {
        match event {
            UnitEvent::Ready { unit } => {
                self.pool.on_ready(unit);
            }
            UnitEvent::Completed {
                unit,
                job_id,
                response,
            } => self.finish_on_unit(unit, job_id, Ok(response)),
            UnitEvent::Failed {
                unit,
                job_id,
                reason,
            } => self.finish_on_unit(unit, job_id, Err(JobError::Rejected(reason))),
            UnitEvent::Faulted {
                unit,
                job_id,
                reason,
            } => self.on_fault(unit, job_id, reason),
        }
    }

    /// Settles the job a unit reported on and frees the unit.
    fn finish_on_unit(&mut self, unit: UnitId, job_id: JobId, outcome: JobOutcome) {
        if self.pool.busy_job(unit) != Some(job_id) {
            debug!(unit = %unit, job_id = %job_id, "Ignoring stale unit report");
            return;
        }

        self.pool.release(unit);
        if let Some(entry) = self.in_flight.remove(&job_id) {
            self.settle(job_id, entry.kind, entry.created_at, entry.reply, outcome);
        }
    }

    fn on_fault(&mut self, unit: UnitId, job_id: Option<JobId>, reason: String) {
        let Some(status) = self.pool.on_fault(unit) else {
            debug!(unit = %unit, "Ignoring fault from a retired unit");
            return;
        };
        self.metrics.record_unit_fault();

        match status {
            UnitStatus::Busy(running) => {
                warn!(unit = %unit, job_id = %running, reason = %reason, "Execution unit crashed");
                if let Some(entry) = self.in_flight.remove(&running) {
                    self.settle(
                        running,
                        entry.kind,
                        entry.created_at,
                        entry.reply,
                        Err(JobError::Lost { unit, reason }),
                    );
                }
            }
            _ => {
                warn!(
                    unit = %unit,
                    job_id = ?job_id,
                    reason = %reason,
                    "Execution unit failed to start"
                );
            }
        }
    }

    /// Hands queued jobs to free units until one side runs out.
    fn try_assign(&mut self) {
        if self.pool.is_unavailable() {
            self.reject_queued();
            return;
        }

        while self.pool.has_capacity() {
            let Some(queued) = self.queue.pop_next() else {
                break;
            };

            // Backstop for a cancellation whose command has not arrived yet.
            if queued.job.is_cancelled() {
                self.settle_queued(queued, Err(JobError::Cancelled));
                continue;
            }

            let Some(unit) = self.pool.acquire(queued.job.id) else {
                self.queue.requeue(queued);
                break;
            };

            let QueuedJob { job, reply } = queued;
            let (id, kind, created_at) = (job.id, job.kind, job.created_at);

            match self.pool.dispatch(unit, job.into_request()) {
                Ok(()) => {
                    debug!(job_id = %id, unit = %unit, kind = %kind, "Job dispatched");
                    self.in_flight.insert(
                        id,
                        InFlight {
                            unit,
                            kind,
                            created_at,
                            reply,
                        },
                    );
                }
                Err(e) => {
                    warn!(job_id = %id, unit = %unit, error = %e, "Dispatch failed");
                    self.pool.on_fault(unit);
                    self.metrics.record_unit_fault();
                    let lost = JobError::Lost {
                        unit,
                        reason: e.to_string(),
                    };
                    self.settle(id, kind, created_at, reply, Err(lost));
                }
            }
        }
    }

    /// Rejects every queued job once the pool can no longer run anything.
    fn reject_queued(&mut self) {
        if self.queue.is_empty() {
            return;
        }

        let reason = self.unavailable_reason();
        warn!(jobs = self.queue.len(), "Rejecting queued jobs, no execution unit can start");
        for queued in self.queue.drain() {
            self.settle_queued(queued, Err(JobError::Unavailable(reason.clone())));
        }
    }

    fn unavailable_reason(&self) -> String {
        format!(
            "solver kernel failed to initialize {} times in a row",
            self.max_init_failures
        )
    }

    fn settle_queued(&mut self, queued: QueuedJob, outcome: JobOutcome) {
        let QueuedJob { job, reply } = queued;
        self.settle(job.id, job.kind, job.created_at, reply, outcome);
    }

    /// Delivers a job's outcome. Every job passes through here exactly once.
    fn settle(
        &mut self,
        id: JobId,
        kind: JobKind,
        created_at: DateTime<Utc>,
        reply: oneshot::Sender<JobOutcome>,
        outcome: JobOutcome,
    ) {
        if let Some(watcher) = self.watchers.remove(&id) {
            watcher.abort();
        }

        let status = JobStatus::of(&outcome);
        match status {
            JobStatus::Completed => self.stats.jobs_completed += 1,
            JobStatus::Failed => self.stats.jobs_failed += 1,
            JobStatus::Cancelled => self.stats.jobs_cancelled += 1,
            JobStatus::Lost => self.stats.jobs_lost += 1,
            JobStatus::Aborted => self.stats.jobs_aborted += 1,
        }

        let elapsed = (Utc::now() - created_at).num_milliseconds().max(0) as f64 / 1000.0;
        self.metrics.record_job(kind.as_str(), status.as_str(), elapsed);
        debug!(job_id = %id, kind = %kind, status = %status, elapsed_secs = elapsed, "Job settled");

        let _ = reply.send(outcome);
    }

    fn shutdown(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) {
        info!(
            queued = self.queue.len(),
            in_flight = self.in_flight.len(),
            "Shutting down scheduler"
        );

        commands.close();
        while let Ok(command) = commands.try_recv() {
            match command {
                Command::Submit(queued) => {
                    self.stats.jobs_submitted += 1;
                    self.settle_queued(queued, Err(JobError::SchedulerClosed));
                }
                Command::Shutdown(done) => {
                    let _ = done.send(());
                }
                Command::Cancel(_) | Command::SetTargetSize(_) => {}
            }
        }

        for queued in self.queue.drain() {
            self.settle_queued(queued, Err(JobError::SchedulerClosed));
        }
        let in_flight: Vec<_> = self.in_flight.drain().collect();
        for (id, entry) in in_flight {
            self.settle(id, entry.kind, entry.created_at, entry.reply, Err(JobError::SchedulerClosed));
        }

        self.pool.shutdown();
        self.stats.closed = true;
        self.publish();
    }

    fn publish(&mut self) {
        self.stats.pool = self.pool.stats();
        self.stats.queued_jobs = self.queue.len();
        self.stats.in_flight = self.in_flight.len();

        self.metrics.set_pool_state(
            self.stats.queued_jobs,
            self.stats.pool.busy_units,
            self.stats.pool.units,
        );
        self.stats_tx.send_replace(self.stats.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KernelError;
    use crate::kernel::SolverKernel;
    use std::time::Duration;

    struct Doubler;

    impl SolverKernel for Doubler {
        fn initialize(&mut self) -> Result<(), KernelError> {
            Ok(())
        }

        fn run(

            &mut self,

            _kind: JobKind,

            payload: Value,

            _stop: &CancellationToken,

        ) -> Result<Value, KernelError> {
            match payload["value"].as_i64() {
                Some(value) => Ok(json!({ "energy": value * 2 })),
                None => Err(KernelError::Rejected("value is required".to_string())),
            }
        }
    }

    fn start(target_size: usize) -> Scheduler {
        Scheduler::start(SchedulerConfig::new(target_size), Arc::new(|| Doubler))
            .expect("valid config")
    }

    async fn settle(handle: JobHandle) -> JobOutcome {
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("job should settle")
    }

    #[test]
    fn test_stats_rates() {
        let stats = SchedulerStats {
            jobs_completed: 3,
            jobs_failed: 1,
            jobs_cancelled: 2,
            ..Default::default()
        };

        assert_eq!(stats.total_processed(), 4);
        assert_eq!(stats.total_settled(), 6);
        assert!((stats.success_rate() - 75.0).abs() < f64::EPSILON);
        assert_eq!(SchedulerStats::default().success_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_target_size_follows_resize() {
        let scheduler = start(1);
        let clone = scheduler.clone();
        assert_eq!(scheduler.target_size(), 1);

        clone.set_target_size(3);
        assert_eq!(scheduler.target_size(), 3);
        assert_eq!(scheduler.config().target_size, 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let config = SchedulerConfig::new(1).with_score_field("");
        let result = Scheduler::start(config, Arc::new(|| Doubler));
        assert!(matches!(result, Err(ConfigError::ValidationFailed(_))));
    }

    #[tokio::test]
    async fn test_submit_and_settle() {
        let scheduler = start(2);
        let cancel = CancellationToken::new();

        let ok = scheduler.optimise(json!({ "value": 21 }), &cancel);
        let rejected = scheduler.optimise(json!({}), &cancel);
        assert_eq!(ok.kind(), JobKind::Optimise);

        assert_eq!(settle(ok).await, Ok(json!({ "energy": 42 })));
        assert!(matches!(settle(rejected).await, Err(JobError::Rejected(_))));

        let stats = scheduler.stats();
        assert_eq!(stats.jobs_completed, 1);
        assert_eq!(stats.jobs_failed, 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_already_cancelled_job_settles_immediately() {
        let scheduler = start(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let handle = scheduler.optimise(json!({ "value": 1 }), &cancel);
        assert_eq!(settle(handle).await, Err(JobError::Cancelled));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_rejected() {
        let scheduler = start(1);
        scheduler.shutdown().await;
        scheduler.shutdown().await;

        assert!(scheduler.stats().closed);
        let handle = scheduler.catalog();
        assert_eq!(settle(handle).await, Err(JobError::SchedulerClosed));
    }

    #[tokio::test]
    async fn test_queued_jobs_rejected_on_shutdown() {
        let scheduler = start(0);
        let cancel = CancellationToken::new();
        let handle = scheduler.optimise(json!({ "value": 1 }), &cancel);

        let mut stats = scheduler.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            stats.wait_for(|s| s.queued_jobs == 1),
        )
        .await
        .expect("job should be queued")
        .expect("coordinator alive");

        scheduler.shutdown().await;
        assert_eq!(settle(handle).await, Err(JobError::SchedulerClosed));
    }

    #[tokio::test]
    async fn test_handle_cancel_is_scoped_to_one_job() {
        let scheduler = start(0);
        let cancel = CancellationToken::new();
        let first = scheduler.optimise(json!({ "value": 1 }), &cancel);
        let second = scheduler.optimise(json!({ "value": 2 }), &cancel);

        first.cancel();
        assert_eq!(settle(first).await, Err(JobError::Cancelled));

        scheduler.set_target_size(1);
        assert_eq!(settle(second).await, Ok(json!({ "energy": 4 })));
        scheduler.shutdown().await;
    }
}
