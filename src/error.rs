//! Error types shared across the scheduler.
//!
//! Defines the two error surfaces that cross component boundaries:
//! - Solver kernel outcomes (business rejection vs. crash)
//! - Job settlement reasons seen by callers

use thiserror::Error;

use crate::scheduler::UnitId;

/// Errors a solver kernel reports from `initialize` or `run`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum KernelError {
    /// The kernel ran but refused the request (invalid input, out of range).
    /// The execution unit stays usable.
    #[error("Request rejected by solver: {0}")]
    Rejected(String),

    /// The kernel is no longer usable. The execution unit is torn down.
    #[error("Solver kernel failed fatally: {0}")]
    Fatal(String),

    /// The kernel saw its stop signal and abandoned the run.
    #[error("Solver run interrupted")]
    Interrupted,
}

/// Reasons a submitted job settles without a response.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum JobError {
    /// The kernel rejected the request.
    #[error("Job rejected: {0}")]
    Rejected(String),

    /// The caller cancelled the job, either while queued or while running.
    #[error("Job was cancelled")]
    Cancelled,

    /// The execution unit running the job faulted; the job's true outcome is unknown.
    #[error("Job lost: execution unit {unit} faulted: {reason}")]
    Lost { unit: UnitId, reason: String },

    /// The scheduler stopped before the job settled.
    #[error("Scheduler is shut down")]
    SchedulerClosed,

    /// The pool cannot bring up any execution unit.
    #[error("No execution units available: {0}")]
    Unavailable(String),
}

impl JobError {
    /// Returns whether this is a caller-initiated cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobError::Cancelled)
    }

    /// Returns whether resubmitting to the same scheduler can never succeed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobError::SchedulerClosed | JobError::Unavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_error_display() {
        let err = KernelError::Rejected("weights must have 8 entries".to_string());
        assert!(err.to_string().contains("weights must have 8 entries"));

        let err = KernelError::Fatal("out of memory".to_string());
        assert!(err.to_string().contains("fatally"));

        assert_eq!(KernelError::Interrupted.to_string(), "Solver run interrupted");
    }

    #[test]
    fn test_job_error_display() {
        let err = JobError::Lost {
            unit: UnitId(3),
            reason: "panicked".to_string(),
        };
        assert!(err.to_string().contains("unit-3"));
        assert!(err.to_string().contains("panicked"));

        assert!(JobError::Cancelled.to_string().contains("cancelled"));
        assert!(JobError::SchedulerClosed.to_string().contains("shut down"));
    }

    #[test]
    fn test_job_error_classification() {
        assert!(JobError::Cancelled.is_cancelled());
        assert!(!JobError::Rejected("bad".to_string()).is_cancelled());

        assert!(JobError::SchedulerClosed.is_terminal());
        assert!(JobError::Unavailable("exhausted".to_string()).is_terminal());
        assert!(!JobError::Cancelled.is_terminal());
    }
}
