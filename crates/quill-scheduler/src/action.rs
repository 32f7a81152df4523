//! External capabilities invoked by workers, and the hook that hears about
//! finished jobs.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Job, Platform};

/// Identifier assigned by a platform to a delivered post.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalPostId(String);

impl ExternalPostId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExternalPostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A failed publish call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct PublishError {
    /// Whether trying again later may succeed.
    pub retryable: bool,
    pub reason: String,
}

impl PublishError {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self {
            retryable: true,
            reason: reason.into(),
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self {
            retryable: false,
            reason: reason.into(),
        }
    }
}

/// A failed notification send.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct NotifyError {
    /// Whether trying again later may succeed.
    pub retryable: bool,
    pub reason: String,
}

impl NotifyError {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self {
            retryable: true,
            reason: reason.into(),
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self {
            retryable: false,
            reason: reason.into(),
        }
    }
}

/// Delivers content to a publishing platform.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, platform: &Platform, content: &str)
    -> Result<ExternalPostId, PublishError>;
}

/// Sends a notification to a user.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, user_id: &str, message: &str) -> Result<(), NotifyError>;
}

/// Why one execution of a job failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// Transient failure or timeout; the job may be retried.
    #[error("{0}")]
    Retryable(String),

    /// The action can never succeed as submitted.
    #[error("{0}")]
    Terminal(String),
}

impl ExecutionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecutionError::Retryable(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            ExecutionError::Retryable(reason) | ExecutionError::Terminal(reason) => reason,
        }
    }
}

impl From<PublishError> for ExecutionError {
    fn from(e: PublishError) -> Self {
        if e.retryable {
            ExecutionError::Retryable(e.reason)
        } else {
            ExecutionError::Terminal(e.reason)
        }
    }
}

impl From<NotifyError> for ExecutionError {
    fn from(e: NotifyError) -> Self {
        if e.retryable {
            ExecutionError::Retryable(e.reason)
        } else {
            ExecutionError::Terminal(e.reason)
        }
    }
}

/// What a successful execution produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Published(ExternalPostId),
    Notified,
}

/// Error type returned by observers.
pub type ObserverError = Box<dyn std::error::Error + Send + Sync>;

/// Hears about jobs that reached a terminal status through execution.
///
/// Called after the status is persisted. Errors are retried with backoff,
/// so implementations must tolerate being called more than once.
#[async_trait]
pub trait JobObserver: Send + Sync {
    async fn on_succeeded(&self, job: &Job, outcome: &JobOutcome) -> Result<(), ObserverError>;

    async fn on_failed(&self, job: &Job, reason: &str) -> Result<(), ObserverError>;
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

#[async_trait]
impl JobObserver for NoopObserver {
    async fn on_succeeded(&self, _job: &Job, _outcome: &JobOutcome) -> Result<(), ObserverError> {
        Ok(())
    }

    async fn on_failed(&self, _job: &Job, _reason: &str) -> Result<(), ObserverError> {
        Ok(())
    }
}
