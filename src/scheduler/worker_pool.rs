//! Supervised pool of execution units.
//!
//! The pool owns every `ExecutionUnit` and tracks which are free. It is
//! owned by the coordinator task and never shared, so its methods take
//! `&mut self` and need no locking.
//!
//! # Features
//!
//! - Target size adjustable at runtime; units are created eagerly and
//!   removed when they next become idle
//! - Busy units never exceed the target size
//! - Faulted units are torn down and replaced without caller intervention
//! - Repeated initialization faults stop the respawn loop

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::kernel::KernelFactory;

use super::config::SchedulerConfig;
use super::job::{JobId, KernelRequest};
use super::unit::{ExecutionUnit, UnitEvent, UnitId};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The OS refused to create a unit thread.
    #[error("Failed to spawn execution unit: {0}")]
    SpawnFailed(String),

    /// The unit's thread is gone and cannot take more work.
    #[error("Execution unit {0} is no longer accepting jobs")]
    UnitGone(UnitId),

    /// The unit is not tracked by this pool.
    #[error("Unknown execution unit {0}")]
    UnknownUnit(UnitId),
}

/// Lifecycle state of a unit inside the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UnitStatus {
    /// Spawned; kernel still initializing.
    Initializing,
    /// Ready for a job.
    Idle,
    /// Running the given job.
    Busy(JobId),
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Desired number of units.
    pub target_size: usize,
    /// Live units in any state.
    pub units: usize,
    /// Units whose kernel is still initializing.
    pub initializing: usize,
    /// Units ready for a job.
    pub free_units: usize,
    /// Units running a job.
    pub busy_units: usize,
    /// Units created since the pool started.
    pub units_spawned: u64,
    /// Units that faulted (crash or failed initialization).
    pub unit_faults: u64,
    /// Units sacrificed because their running job was cancelled.
    pub units_retired: u64,
    /// Whether the pool stopped respawning after repeated initialization faults.
    pub exhausted: bool,
}

struct UnitSlot {
    unit: ExecutionUnit,
    status: UnitStatus,
}

/// Pool of execution units running solver kernels.
pub struct WorkerPool {
    target_size: usize,
    units: HashMap<UnitId, UnitSlot>,
    /// Idle units, most recently freed last.
    free: Vec<UnitId>,
    factory: Arc<dyn KernelFactory>,
    events: mpsc::UnboundedSender<UnitEvent>,
    name_prefix: String,
    next_id: u64,
    max_init_failures: u32,
    consecutive_init_failures: u32,
    units_spawned: u64,
    unit_faults: u64,
    units_retired: u64,
}

impl WorkerPool {
    /// Creates an empty pool. No units exist until [`WorkerPool::balance`] runs.
    pub fn new(
        config: &SchedulerConfig,
        factory: Arc<dyn KernelFactory>,
        events: mpsc::UnboundedSender<UnitEvent>,
    ) -> Self {
        Self {
            target_size: config.target_size,
            units: HashMap::new(),
            free: Vec::new(),
            factory,
            events,
            name_prefix: config.unit_name_prefix.clone(),
            next_id: 0,
            max_init_failures: config.max_init_failures,
            consecutive_init_failures: 0,
            units_spawned: 0,
            unit_faults: 0,
            units_retired: 0,
        }
    }

    /// Returns the desired number of units.
    pub fn target_size(&self) -> usize {
        self.target_size
    }

    /// Changes the desired number of units.
    ///
    /// Growing spawns units immediately. Shrinking tears down idle units now
    /// and busy ones when they finish. Also clears the exhausted state so
    /// initialization is retried.
    pub fn set_target_size(&mut self, target_size: usize) {
        info!(
            current = self.target_size,
            target = target_size,
            "Resizing worker pool"
        );
        self.target_size = target_size;
        self.consecutive_init_failures = 0;

        while self.units.len() > self.target_size {
            let Some(id) = self.free.pop() else {
                break;
            };
            self.remove_unit(id);
        }

        self.balance();
    }

    /// Spawns units until the pool reaches its target size.
    pub fn balance(&mut self) {
        while self.units.len() < self.target_size && !self.is_exhausted() {
            let id = UnitId(self.next_id);
            self.next_id += 1;

            match ExecutionUnit::spawn(
                id,
                &self.name_prefix,
                Arc::clone(&self.factory),
                self.events.clone(),
            ) {
                Ok(unit) => {
                    self.units.insert(
                        id,
                        UnitSlot {
                            unit,
                            status: UnitStatus::Initializing,
                        },
                    );
                    self.units_spawned += 1;
                }
                Err(e) => {
                    error!(unit = %id, error = %e, "Failed to spawn execution unit");
                    break;
                }
            }
        }
    }

    /// Returns whether repeated initialization faults stopped respawning.
    pub fn is_exhausted(&self) -> bool {
        self.max_init_failures > 0 && self.consecutive_init_failures >= self.max_init_failures
    }

    /// Returns whether the pool can never run a job in its current state.
    pub fn is_unavailable(&self) -> bool {
        self.units.is_empty() && self.is_exhausted()
    }

    /// Records that a unit finished initializing.
    ///
    /// Returns `true` if the unit joined the free list.
    pub fn on_ready(&mut self, id: UnitId) -> bool {
        let over_target = self.units.len() > self.target_size;
        let Some(slot) = self.units.get_mut(&id) else {
            debug!(unit = %id, "Ignoring ready event from a retired unit");
            return false;
        };
        if slot.status != UnitStatus::Initializing {
            warn!(unit = %id, status = ?slot.status, "Unexpected ready event");
            return false;
        }

        self.consecutive_init_failures = 0;
        if over_target {
            self.remove_unit(id);
            return false;
        }

        slot.status = UnitStatus::Idle;
        self.free.push(id);
        debug!(unit = %id, "Execution unit ready");
        true
    }

    /// Returns whether a job could be dispatched right now.
    pub fn has_capacity(&self) -> bool {
        !self.free.is_empty() && self.busy_count() < self.target_size
    }

    /// Marks one idle unit busy with `job_id` and returns it.
    ///
    /// Tops the pool up to its target size first. Returns `None` when no unit
    /// is idle or the busy count has reached the target size.
    pub fn acquire(&mut self, job_id: JobId) -> Option<UnitId> {
        self.balance();
        if !self.has_capacity() {
            return None;
        }

        let id = self.free.pop()?;
        match self.units.get_mut(&id) {
            Some(slot) => {
                slot.status = UnitStatus::Busy(job_id);
                Some(id)
            }
            None => None,
        }
    }

    /// Sends a request to a unit previously returned by [`WorkerPool::acquire`].
    ///
    /// # Errors
    ///
    /// Returns `PoolError::UnknownUnit` for untracked units and
    /// `PoolError::UnitGone` if the unit's thread exited.
    pub fn dispatch(&self, id: UnitId, request: KernelRequest) -> Result<(), PoolError> {
        let slot = self.units.get(&id).ok_or(PoolError::UnknownUnit(id))?;
        slot.unit.dispatch(request)
    }

    /// Returns a unit to the pool after its job settled.
    ///
    /// Over-target pools shrink here. Returns `true` if the unit joined the
    /// free list.
    pub fn release(&mut self, id: UnitId) -> bool {
        let over_target = self.units.len() > self.target_size;
        let Some(slot) = self.units.get_mut(&id) else {
            return false;
        };
        if !matches!(slot.status, UnitStatus::Busy(_)) {
            warn!(unit = %id, status = ?slot.status, "Released a unit that was not busy");
            return false;
        }

        if over_target {
            debug!(unit = %id, "Shrinking pool");
            self.remove_unit(id);
            return false;
        }

        slot.status = UnitStatus::Idle;
        self.free.push(id);
        true
    }

    /// Tears down a faulted unit and spawns a replacement if needed.
    ///
    /// Returns the unit's status at the time of the fault, or `None` if the
    /// unit was already gone.
    pub fn on_fault(&mut self, id: UnitId) -> Option<UnitStatus> {
        let status = self.remove_unit(id)?;
        self.unit_faults += 1;

        if status == UnitStatus::Initializing {
            self.consecutive_init_failures += 1;
            if self.is_exhausted() {
                error!(
                    failures = self.consecutive_init_failures,
                    "Solver kernel keeps failing to initialize, no longer respawning units"
                );
            }
        }

        self.balance();
        Some(status)
    }

    /// Sacrifices a unit whose job was cancelled mid-run, then replenishes.
    pub fn retire(&mut self, id: UnitId) -> Option<UnitStatus> {
        let status = self.remove_unit(id)?;
        self.units_retired += 1;
        self.balance();
        Some(status)
    }

    /// Returns the job a unit is running, if it is busy.
    pub fn busy_job(&self, id: UnitId) -> Option<JobId> {
        match self.units.get(&id)?.status {
            UnitStatus::Busy(job_id) => Some(job_id),
            _ => None,
        }
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn busy_count(&self) -> usize {
        self.units
            .values()
            .filter(|slot| matches!(slot.status, UnitStatus::Busy(_)))
            .count()
    }

    pub fn initializing_count(&self) -> usize {
        self.units
            .values()
            .filter(|slot| slot.status == UnitStatus::Initializing)
            .count()
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            target_size: self.target_size,
            units: self.units.len(),
            initializing: self.initializing_count(),
            free_units: self.free.len(),
            busy_units: self.busy_count(),
            units_spawned: self.units_spawned,
            unit_faults: self.unit_faults,
            units_retired: self.units_retired,
            exhausted: self.is_exhausted(),
        }
    }

    /// Tears down every unit and stops replenishing.
    pub fn shutdown(&mut self) {
        info!(units = self.units.len(), "Shutting down worker pool");
        self.target_size = 0;
        self.free.clear();
        for (_, slot) in self.units.drain() {
            slot.unit.teardown();
        }
    }

    fn remove_unit(&mut self, id: UnitId) -> Option<UnitStatus> {
        let slot = self.units.remove(&id)?;
        self.free.retain(|free| *free != id);
        slot.unit.teardown();
        Some(slot.status)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for (_, slot) in self.units.drain() {
            slot.unit.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KernelError;
    use crate::kernel::SolverKernel;
    use crate::scheduler::job::JobKind;
    use serde_json::Value;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    struct Echo;

    impl SolverKernel for Echo {
        fn initialize(&mut self) -> Result<(), KernelError> {
            Ok(())
        }

        fn run(

            &mut self,

            _kind: JobKind,

            payload: Value,

            _stop: &CancellationToken,

        ) -> Result<Value, KernelError> {
            Ok(payload)
        }
    }

    struct Broken;

    impl SolverKernel for Broken {
        fn initialize(&mut self) -> Result<(), KernelError> {
            Err(KernelError::Fatal("missing data".to_string()))
        }

        fn run(

            &mut self,

            _kind: JobKind,

            _payload: Value,

            _stop: &CancellationToken,

        ) -> Result<Value, KernelError> {
            unreachable!("never initialized")
        }
    }

    fn create_pool(
        target_size: usize,
        factory: Arc<dyn KernelFactory>,
    ) -> (WorkerPool, mpsc::UnboundedReceiver<UnitEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let config = SchedulerConfig::new(target_size).with_max_init_failures(3);
        (WorkerPool::new(&config, factory, events_tx), events_rx)
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<UnitEvent>) -> UnitEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event should arrive")
            .expect("channel open")
    }

    /// Feeds ready events into the pool until `count` units are free.
    async fn wait_ready(
        pool: &mut WorkerPool,
        events: &mut mpsc::UnboundedReceiver<UnitEvent>,
        count: usize,
    ) {
        while pool.free_count() < count {
            if let UnitEvent::Ready { unit } = next_event(events).await {
                pool.on_ready(unit);
            }
        }
    }

    #[test]
    fn test_pool_stats_default() {
        let stats = PoolStats::default();

        assert_eq!(stats.target_size, 0);
        assert_eq!(stats.units, 0);
        assert_eq!(stats.busy_units, 0);
        assert_eq!(stats.unit_faults, 0);
        assert!(!stats.exhausted);
    }

    #[test]
    fn test_pool_error_display() {
        let err = PoolError::SpawnFailed("resource limit".to_string());
        assert!(err.to_string().contains("resource limit"));

        let err = PoolError::UnitGone(UnitId(4));
        assert!(err.to_string().contains("unit-4"));

        let err = PoolError::UnknownUnit(UnitId(9));
        assert!(err.to_string().contains("unit-9"));
    }

    #[tokio::test]
    async fn test_balance_spawns_to_target() {
        let (mut pool, mut events) = create_pool(3, Arc::new(|| Echo));
        pool.balance();

        assert_eq!(pool.unit_count(), 3);
        assert_eq!(pool.initializing_count(), 3);
        assert!(!pool.has_capacity());

        wait_ready(&mut pool, &mut events, 3).await;
        let stats = pool.stats();
        assert_eq!(stats.free_units, 3);
        assert_eq!(stats.initializing, 0);
        assert_eq!(stats.units_spawned, 3);
    }

    #[tokio::test]
    async fn test_acquire_respects_target_size() {
        let (mut pool, mut events) = create_pool(2, Arc::new(|| Echo));
        pool.balance();
        wait_ready(&mut pool, &mut events, 2).await;

        let a = pool.acquire(Uuid::new_v4()).expect("first unit");
        let b = pool.acquire(Uuid::new_v4()).expect("second unit");
        assert_ne!(a, b);
        assert!(pool.acquire(Uuid::new_v4()).is_none());
        assert_eq!(pool.busy_count(), 2);

        assert!(pool.release(a));
        assert_eq!(pool.free_count(), 1);
        assert!(pool.busy_job(b).is_some());
        assert!(pool.busy_job(a).is_none());
    }

    #[tokio::test]
    async fn test_release_shrinks_over_target_pool() {
        let (mut pool, mut events) = create_pool(2, Arc::new(|| Echo));
        pool.balance();
        wait_ready(&mut pool, &mut events, 2).await;

        let a = pool.acquire(Uuid::new_v4()).expect("unit");
        let b = pool.acquire(Uuid::new_v4()).expect("unit");

        pool.set_target_size(1);
        assert_eq!(pool.unit_count(), 2, "busy units are not torn down");

        assert!(!pool.release(a), "first release shrinks the pool");
        assert_eq!(pool.unit_count(), 1);
        assert!(pool.release(b));
        assert_eq!(pool.unit_count(), 1);
        assert_eq!(pool.free_count(), 1);
    }

    #[tokio::test]
    async fn test_shrink_removes_idle_units_immediately() {
        let (mut pool, mut events) = create_pool(3, Arc::new(|| Echo));
        pool.balance();
        wait_ready(&mut pool, &mut events, 3).await;

        pool.set_target_size(1);
        assert_eq!(pool.unit_count(), 1);
        assert_eq!(pool.free_count(), 1);
    }

    #[tokio::test]
    async fn test_fault_replaces_unit() {
        let (mut pool, mut events) = create_pool(2, Arc::new(|| Echo));
        pool.balance();
        wait_ready(&mut pool, &mut events, 2).await;

        let job_id = Uuid::new_v4();
        let unit = pool.acquire(job_id).expect("unit");
        assert_eq!(pool.on_fault(unit), Some(UnitStatus::Busy(job_id)));

        assert_eq!(pool.unit_count(), 2);
        assert_eq!(pool.stats().unit_faults, 1);
        assert!(pool.busy_job(unit).is_none());
        assert!(pool.on_fault(unit).is_none(), "second fault is ignored");
    }

    #[tokio::test]
    async fn test_retire_replaces_unit_without_counting_fault() {
        let (mut pool, mut events) = create_pool(1, Arc::new(|| Echo));
        pool.balance();
        wait_ready(&mut pool, &mut events, 1).await;

        let unit = pool.acquire(Uuid::new_v4()).expect("unit");
        assert!(pool.retire(unit).is_some());

        let stats = pool.stats();
        assert_eq!(stats.units, 1);
        assert_eq!(stats.units_retired, 1);
        assert_eq!(stats.unit_faults, 0);
    }

    #[tokio::test]
    async fn test_repeated_init_faults_exhaust_pool() {
        let (mut pool, mut events) = create_pool(1, Arc::new(|| Broken));
        pool.balance();

        while !pool.is_exhausted() {
            if let UnitEvent::Faulted { unit, .. } = next_event(&mut events).await {
                pool.on_fault(unit);
            }
        }

        assert!(pool.is_unavailable());
        assert_eq!(pool.stats().unit_faults, 3);

        pool.set_target_size(1);
        assert!(!pool.is_exhausted());
        assert_eq!(pool.unit_count(), 1);
    }

    #[tokio::test]
    async fn test_zero_target_never_spawns() {
        let (mut pool, _events) = create_pool(0, Arc::new(|| Echo));
        pool.balance();

        assert_eq!(pool.unit_count(), 0);
        assert!(pool.acquire(Uuid::new_v4()).is_none());
        assert!(!pool.is_unavailable());
    }

    #[tokio::test]
    async fn test_shutdown_tears_down_everything() {
        let (mut pool, mut events) = create_pool(2, Arc::new(|| Echo));
        pool.balance();
        wait_ready(&mut pool, &mut events, 2).await;

        pool.shutdown();
        assert_eq!(pool.unit_count(), 0);
        assert_eq!(pool.target_size(), 0);
        pool.balance();
        assert_eq!(pool.unit_count(), 0);
    }
}
