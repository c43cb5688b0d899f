//! Job dispatch over a supervised pool of solver kernels.
//!
//! This module provides the infrastructure that runs solver jobs concurrently:
//!
//! - **Scheduler**: cloneable front end; submits jobs and returns `JobHandle`s
//! - **JobQueue**: pending jobs, served LIFO by default
//! - **WorkerPool**: execution units sized to a runtime-adjustable target
//! - **ExecutionUnit**: one OS thread owning one `SolverKernel`
//!
//! # Architecture
//!
//! ```text
//!   Scheduler handles ──commands──► ┌──────────────┐
//!                                   │ Coordinator  │──► watch<SchedulerStats>
//!   JobHandle ◄──────oneshot─────── │ queue + pool │
//!                                   └──────┬───────┘
//!                                          │ requests ▼   ▲ events
//!                  ┌───────────────────────┼───────────────────────┐
//!                  ▼                       ▼                       ▼
//!             ┌─────────┐             ┌─────────┐             ┌─────────┐
//!             │ Unit 0  │             │ Unit 1  │     ...     │ Unit N  │
//!             └─────────┘             └─────────┘             └─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use set_forge::kernel::AnnealingKernel;
//! use set_forge::scheduler::{Scheduler, SchedulerConfig};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! let scheduler = Scheduler::start(SchedulerConfig::new(4), Arc::new(AnnealingKernel::new))?;
//! let cancel = CancellationToken::new();
//!
//! let response = scheduler.optimise(request, &cancel).await?;
//! println!("energy = {}", response["energy"]);
//!
//! scheduler.shutdown().await;
//! ```

pub mod config;
pub mod coordinator;
pub mod job;
pub mod queue;
pub mod unit;
pub mod worker_pool;

pub use config::{ConfigError, SchedulerConfig};
pub use coordinator::{JobHandle, Scheduler, SchedulerStats};
pub use job::{Job, JobId, JobKind, JobOutcome, JobStatus, KernelRequest};
pub use queue::QueueOrder;
pub use unit::{ExecutionUnit, UnitEvent, UnitId};
pub use worker_pool::{PoolError, PoolStats, UnitStatus, WorkerPool};
