//! set_forge: Job dispatch and worker pools for equipment set optimisation.
//!
//! This library runs black-box solver kernels on a supervised pool of
//! isolated execution units, queues and cancels jobs, and aggregates results
//! in batch ("best of N") or continuous ("keep improving") mode.

// Core modules
pub mod aggregate;
pub mod cli;
pub mod error;
pub mod kernel;
pub mod metrics;
pub mod scheduler;

// Re-export commonly used types
pub use aggregate::{AggregateError, ResultAggregator, ScoredResult};
pub use error::{JobError, KernelError};
pub use kernel::{KernelFactory, SolverKernel};
pub use scheduler::{JobHandle, JobKind, Scheduler, SchedulerConfig};
