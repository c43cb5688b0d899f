//! Job definitions for the scheduler.
//!
//! This module defines the core job types used in the scheduling system:
//!
//! - `Job`: A unit of work submitted by a caller
//! - `JobKind`: Which kernel entry point the job targets
//! - `KernelRequest`: What an execution unit actually receives
//! - `JobStatus`: How a job settled

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::JobError;

/// Unique identifier of a submitted job.
pub type JobId = Uuid;

/// Result a caller receives when a job settles.
pub type JobOutcome = Result<Value, JobError>;

/// Kernel entry point a job targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    /// Search for a high-scoring equipment set.
    Optimise,
    /// List the items that fit one equipment slot.
    LookupSlot,
    /// List every item the kernel knows about.
    LookupCatalog,
    /// List the spells the kernel can score damage for.
    LookupSpells,
}

impl JobKind {
    /// Returns the stable label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Optimise => "optimise",
            JobKind::LookupSlot => "lookup-slot",
            JobKind::LookupCatalog => "lookup-catalog",
            JobKind::LookupSpells => "lookup-spells",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job submitted to the scheduler.
///
/// Jobs are immutable once created. The payload is opaque to the scheduler
/// and handed to the kernel untouched.
#[derive(Debug)]
pub struct Job {
    /// Unique identifier for this job.
    pub id: JobId,
    /// Kernel entry point.
    pub kind: JobKind,
    /// Request body passed through to the kernel.
    pub payload: Value,
    /// When this job was created.
    pub created_at: DateTime<Utc>,
    cancel: CancellationToken,
}

impl Job {
    /// Creates a new job with a fresh id.
    pub fn new(kind: JobKind, payload: Value, cancel: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            payload,
            created_at: Utc::now(),
            cancel,
        }
    }

    /// Returns the token the caller uses to cancel this job.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns whether the caller has cancelled this job.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Returns how long ago the job was created.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }

    /// Splits the job into the message sent to an execution unit.
    pub fn into_request(self) -> KernelRequest {
        KernelRequest {
            job_id: self.id,
            kind: self.kind,
            payload: self.payload,
        }
    }
}

/// The message an execution unit receives for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelRequest {
    /// Job the response must be attributed to.
    pub job_id: JobId,
    /// Kernel entry point.
    pub kind: JobKind,
    /// Opaque request body.
    pub payload: Value,
}

/// How a job settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// The kernel returned a response.
    Completed,
    /// The kernel rejected the request.
    Failed,
    /// The caller cancelled the job.
    Cancelled,
    /// The execution unit faulted while running the job.
    Lost,
    /// The scheduler could not run the job at all.
    Aborted,
}

impl JobStatus {
    /// Classifies a settled outcome.
    pub fn of(outcome: &JobOutcome) -> Self {
        match outcome {
            Ok(_) => JobStatus::Completed,
            Err(JobError::Rejected(_)) => JobStatus::Failed,
            Err(JobError::Cancelled) => JobStatus::Cancelled,
            Err(JobError::Lost { .. }) => JobStatus::Lost,
            Err(JobError::SchedulerClosed | JobError::Unavailable(_)) => JobStatus::Aborted,
        }
    }

    /// Returns the stable label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Lost => "lost",
            JobStatus::Aborted => "aborted",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
