//! Solver kernel boundary.
//!
//! The scheduler treats the solver as a black box. Each execution unit owns
//! one kernel instance created by a [`KernelFactory`], initializes it once,
//! and then feeds it requests one at a time.
//!
//! # Example
//!
//! ```ignore
//! use set_forge::kernel::{KernelFactory, SolverKernel};
//! use set_forge::error::KernelError;
//! use set_forge::scheduler::JobKind;
//! use serde_json::Value;
//! use tokio_util::sync::CancellationToken;
//!
//! struct Echo;
//!
//! impl SolverKernel for Echo {
//!     fn initialize(&mut self) -> Result<(), KernelError> {
//!         Ok(())
//!     }
//!
//!     fn run(
//!         &mut self,
//!         _kind: JobKind,
//!         payload: Value,
//!         _stop: &CancellationToken,
//!     ) -> Result<Value, KernelError> {
//!         Ok(payload)
//!     }
//! }
//!
//! // Any `Fn() -> K` closure is a factory.
//! let factory: std::sync::Arc<dyn KernelFactory> = std::sync::Arc::new(|| Echo);
//! ```

pub mod anneal;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::KernelError;
use crate::scheduler::JobKind;

pub use anneal::AnnealingKernel;

/// A solver instance living inside one execution unit.
///
/// Implementations run on the unit's dedicated thread and may block for as
/// long as the computation takes. A panic is treated the same as
/// [`KernelError::Fatal`]: the unit is discarded.
pub trait SolverKernel: Send {
    /// One-time setup, called before the first `run`.
    fn initialize(&mut self) -> Result<(), KernelError>;

    /// Runs one request. `payload` is exactly what the caller submitted.
    ///
    /// `stop` fires when the unit is torn down while this run is in progress,
    /// typically because the job was cancelled. Long computations should poll
    /// it and return [`KernelError::Interrupted`]; nobody reads the result.
    fn run(
        &mut self,
        kind: JobKind,
        payload: Value,
        stop: &CancellationToken,
    ) -> Result<Value, KernelError>;
}

/// Creates a fresh kernel for each execution unit.
pub trait KernelFactory: Send + Sync {
    fn create(&self) -> Box<dyn SolverKernel>;
}

impl<F, K> KernelFactory for F
where
    F: Fn() -> K + Send + Sync,
    K: SolverKernel + 'static,
{
    fn create(&self) -> Box<dyn SolverKernel> {
        Box::new(self())
    }
}
