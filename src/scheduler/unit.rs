//! Execution units: isolated threads that each own one solver kernel.
//!
//! A unit is a named OS thread. It creates its kernel, initializes it, reports
//! `Ready`, and then runs requests from its inbox one at a time. Every request
//! yields exactly one `Completed` or `Failed` event, unless the kernel fails
//! fatally or panics, in which case the unit reports `Faulted` and its thread
//! exits.
//!
//! ```text
//! spawn ──► Initializing ──► Ready ──► run ──► Completed / Failed ──► run ...
//!                │                      │
//!                └──────► Faulted ◄─────┘
//! ```
//!
//! Threads cannot be interrupted from outside. Tearing a unit down closes its
//! inbox, fires the stop token handed to the kernel, and detaches the thread.
//! A stopped unit reports nothing more; a kernel that ignores the token runs
//! to completion and its result is dropped.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::KernelError;
use crate::kernel::KernelFactory;

use super::job::{JobId, KernelRequest};
use super::worker_pool::PoolError;

/// Identifier of an execution unit, unique for the lifetime of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId(pub u64);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit-{}", self.0)
    }
}

/// Events an execution unit reports to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitEvent {
    /// The kernel initialized and the unit accepts jobs.
    Ready { unit: UnitId },
    /// The kernel returned a response.
    Completed {
        unit: UnitId,
        job_id: JobId,
        response: Value,
    },
    /// The kernel rejected the request; the unit stays usable.
    Failed {
        unit: UnitId,
        job_id: JobId,
        reason: String,
    },
    /// The unit is unusable. `job_id` is the job it was running, if any.
    Faulted {
        unit: UnitId,
        job_id: Option<JobId>,
        reason: String,
    },
}

impl UnitEvent {
    /// Returns the unit that emitted this event.
    pub fn unit(&self) -> UnitId {
        match self {
            UnitEvent::Ready { unit }
            | UnitEvent::Completed { unit, .. }
            | UnitEvent::Failed { unit, .. }
            | UnitEvent::Faulted { unit, .. } => *unit,
        }
    }
}

/// Handle to one running execution unit.
pub struct ExecutionUnit {
    id: UnitId,
    inbox: mpsc::UnboundedSender<KernelRequest>,
    stop: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl ExecutionUnit {
    /// Spawns the unit's thread. Initialization happens on that thread; its
    /// result arrives later as `Ready` or `Faulted`.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::SpawnFailed` if the OS refuses to create the thread.
    pub fn spawn(
        id: UnitId,
        name_prefix: &str,
        factory: Arc<dyn KernelFactory>,
        events: mpsc::UnboundedSender<UnitEvent>,
    ) -> Result<Self, PoolError> {
        let (inbox, requests) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let unit_stop = stop.clone();

        let thread = thread::Builder::new()
            .name(format!("{}-{}", name_prefix, id.0))
            .spawn(move || run_unit(id, factory, requests, events, unit_stop))
            .map_err(|e| PoolError::SpawnFailed(e.to_string()))?;

        debug!(unit = %id, "Execution unit spawned");

        Ok(Self {
            id,
            inbox,
            stop,
            thread: Some(thread),
        })
    }

    /// Returns the unit's identifier.
    pub fn id(&self) -> UnitId {
        self.id
    }

    /// Sends one request to the unit without waiting for it to run.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::UnitGone` if the unit's thread has already exited.
    pub fn dispatch(&self, request: KernelRequest) -> Result<(), PoolError> {
        self.inbox
            .send(request)
            .map_err(|_| PoolError::UnitGone(self.id))
    }

    /// Stops the kernel's current run, closes the inbox and detaches the thread.
    pub fn teardown(mut self) {
        self.stop.cancel();
        let finished = self
            .thread
            .take()
            .map(|handle| handle.is_finished())
            .unwrap_or(true);
        debug!(unit = %self.id, finished, "Execution unit torn down");
    }
}

impl fmt::Debug for ExecutionUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionUnit")
            .field("id", &self.id)
            .field("inbox_closed", &self.inbox.is_closed())
            .finish()
    }
}

/// Body of a unit thread.
fn run_unit(
    id: UnitId,
    factory: Arc<dyn KernelFactory>,
    mut requests: mpsc::UnboundedReceiver<KernelRequest>,
    events: mpsc::UnboundedSender<UnitEvent>,
    stop: CancellationToken,
) {
    let started = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut kernel = factory.create();
        kernel.initialize().map(|()| kernel)
    }));

    let mut kernel = match started {
        Ok(Ok(kernel)) => kernel,
        Ok(Err(e)) => {
            let _ = events.send(UnitEvent::Faulted {
                unit: id,
                job_id: None,
                reason: format!("initialization failed: {}", e),
            });
            return;
        }
        Err(panic) => {
            let _ = events.send(UnitEvent::Faulted {
                unit: id,
                job_id: None,
                reason: format!("initialization panicked: {}", panic_message(&*panic)),
            });
            return;
        }
    };

    if events.send(UnitEvent::Ready { unit: id }).is_err() {
        return;
    }

    while let Some(request) = requests.blocking_recv() {
        let job_id = request.job_id;
        let kind = request.kind;
        let outcome =
            panic::catch_unwind(AssertUnwindSafe(|| kernel.run(kind, request.payload, &stop)));

        if stop.is_cancelled() {
            debug!(unit = %id, job_id = %job_id, "Execution unit stopped mid-run");
            break;
        }

        let event = match outcome {
            Ok(Ok(response)) => UnitEvent::Completed {
                unit: id,
                job_id,
                response,
            },
            Ok(Err(KernelError::Rejected(reason))) => UnitEvent::Failed {
                unit: id,
                job_id,
                reason,
            },
            Ok(Err(KernelError::Fatal(reason))) => UnitEvent::Faulted {
                unit: id,
                job_id: Some(job_id),
                reason,
            },
            Ok(Err(KernelError::Interrupted)) => UnitEvent::Faulted {
                unit: id,
                job_id: Some(job_id),
                reason: "kernel interrupted without a stop request".to_string(),
            },
            Err(panic) => UnitEvent::Faulted {
                unit: id,
                job_id: Some(job_id),
                reason: format!("kernel panicked: {}", panic_message(&*panic)),
            },
        };

        let faulted = matches!(event, UnitEvent::Faulted { .. });
        if faulted {
            warn!(unit = %id, job_id = %job_id, kind = %kind, "Execution unit faulted");
        }
        if events.send(event).is_err() || faulted {
            break;
        }
    }

    debug!(unit = %id, "Execution unit thread exiting");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
