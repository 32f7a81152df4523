//! Error types for the scheduler.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{JobId, JobStatus};

/// Errors returned by a [`JobStore`](crate::JobStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// No job with this id.
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// A job with this id already exists.
    #[error("job already exists: {0}")]
    Duplicate(JobId),

    /// The requested status change is not allowed from the current status.
    #[error("invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    /// A claim found the job pending but not yet due.
    #[error("job {id} is not due until {due_at}")]
    NotDue { id: JobId, due_at: DateTime<Utc> },

    /// The store could not be reached or failed to execute the operation.
    #[error("job store unavailable: {0}")]
    Unavailable(String),

    /// A stored record could not be decoded.
    #[error("corrupt job record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

impl StoreError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// The job already reached a terminal status.
    #[error("job {id} is already {status}")]
    AlreadyTerminal { id: JobId, status: JobStatus },

    /// The job is executing; it may still complete.
    #[error("job {0} is in flight and cannot be changed; it may still execute")]
    InFlight(JobId),

    /// Payload rejected at enqueue time.
    #[error("invalid job payload: {0}")]
    InvalidPayload(String),

    /// The dispatcher is shut down.
    #[error("dispatcher is closed")]
    DispatcherClosed,

    /// Job store error.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SchedulerError {
    /// Whether a cancel or reschedule lost the race against execution.
    pub fn is_too_late(&self) -> bool {
        matches!(
            self,
            SchedulerError::InFlight(_) | SchedulerError::AlreadyTerminal { .. }
        )
    }

    /// Map a failed CAS against `Pending` into the caller-facing error.
    pub(crate) fn from_lost_race(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => SchedulerError::JobNotFound(id),
            StoreError::InvalidTransition {
                id,
                from: JobStatus::Running,
                ..
            } => SchedulerError::InFlight(id),
            StoreError::InvalidTransition { id, from, .. } => {
                SchedulerError::AlreadyTerminal { id, status: from }
            }
            other => SchedulerError::Store(other),
        }
    }
}
