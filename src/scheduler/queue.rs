//! In-memory job queue owned by the coordinator.
//!
//! The queue holds submitted jobs together with the one-shot channel that
//! settles each caller's `JobHandle`. Only the coordinator task touches it, so
//! it needs no synchronisation.
//!
//! # Ordering
//!
//! Jobs are admitted in submission order. Which end is served first is a
//! policy choice:
//!
//! - `QueueOrder::Lifo` (default): the most recently queued job runs next.
//!   Under load this favours the request the user made last.
//! - `QueueOrder::Fifo`: jobs run in submission order.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use super::job::{Job, JobId, JobOutcome};

/// Order in which queued jobs are handed to free units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueOrder {
    /// Most recently queued first.
    #[default]
    Lifo,
    /// Oldest first.
    Fifo,
}

impl fmt::Display for QueueOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueOrder::Lifo => write!(f, "lifo"),
            QueueOrder::Fifo => write!(f, "fifo"),
        }
    }
}

impl FromStr for QueueOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "lifo" | "stack" => Ok(QueueOrder::Lifo),
            "fifo" | "queue" => Ok(QueueOrder::Fifo),
            other => Err(format!("unknown queue order '{}', expected lifo or fifo", other)),
        }
    }
}

/// A job waiting for a free unit, paired with its caller's result channel.
#[derive(Debug)]
pub(crate) struct QueuedJob {
    pub job: Job,
    pub reply: oneshot::Sender<JobOutcome>,
}

impl QueuedJob {
    pub fn new(job: Job, reply: oneshot::Sender<JobOutcome>) -> Self {
        Self { job, reply }
    }

    /// Settles the caller's handle. A caller that stopped listening is not an error.
    pub fn settle(self, outcome: JobOutcome) {
        let _ = self.reply.send(outcome);
    }
}

/// Pending jobs in submission order.
#[derive(Debug)]
pub(crate) struct JobQueue {
    order: QueueOrder,
    jobs: VecDeque<QueuedJob>,
}

impl JobQueue {
    pub fn new(order: QueueOrder) -> Self {
        Self {
            order,
            jobs: VecDeque::new(),
        }
    }

    pub fn push(&mut self, job: QueuedJob) {
        self.jobs.push_back(job);
    }

    /// Removes the next job according to the queue order.
    pub fn pop_next(&mut self) -> Option<QueuedJob> {
        match self.order {
            QueueOrder::Lifo => self.jobs.pop_back(),
            QueueOrder::Fifo => self.jobs.pop_front(),
        }
    }

    /// Puts back a job taken by `pop_next` so it is served next again.
    pub fn requeue(&mut self, job: QueuedJob) {
        match self.order {
            QueueOrder::Lifo => self.jobs.push_back(job),
            QueueOrder::Fifo => self.jobs.push_front(job),
        }
    }

    /// Removes a specific job, wherever it sits.
    pub fn remove(&mut self, id: JobId) -> Option<QueuedJob> {
        let position = self.jobs.iter().position(|queued| queued.job.id == id)?;
        self.jobs.remove(position)
    }

    /// Removes every job, oldest first.
    pub fn drain(&mut self) -> Vec<QueuedJob> {
        self.jobs.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
