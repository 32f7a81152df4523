//! Scheduler types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a post owned by the application layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostId(String);

impl PostId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PostId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PostId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A publishing target, e.g. `twitter` or `mastodon`.
///
/// Names are normalized to trimmed lowercase so `Twitter` and `twitter`
/// address the same target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Platform(String);

impl Platform {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Discriminant of a job's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    PublishPost,
    SendNotification,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::PublishPost => "publish_post",
            JobKind::SendNotification => "send_notification",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific job data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    /// Deliver a post's content to one platform.
    PublishPost {
        post_id: PostId,
        platform: Platform,
        content: String,
    },
    /// Remind a user about an upcoming post.
    SendNotification {
        user_id: String,
        message: String,
        post_id: PostId,
    },
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::PublishPost { .. } => JobKind::PublishPost,
            JobPayload::SendNotification { .. } => JobKind::SendNotification,
        }
    }

    pub fn post_id(&self) -> &PostId {
        match self {
            JobPayload::PublishPost { post_id, .. } => post_id,
            JobPayload::SendNotification { post_id, .. } => post_id,
        }
    }

    /// Check the payload shape before it is persisted.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            JobPayload::PublishPost {
                post_id,
                platform,
                content,
            } => {
                if post_id.as_str().trim().is_empty() {
                    return Err("publish job requires a post id".to_string());
                }
                if platform.as_str().is_empty() {
                    return Err("publish job requires a platform".to_string());
                }
                if content.trim().is_empty() {
                    return Err("publish job requires non-empty content".to_string());
                }
            }
            JobPayload::SendNotification {
                user_id,
                message,
                post_id,
            } => {
                if user_id.trim().is_empty() {
                    return Err("notification job requires a user id".to_string());
                }
                if message.trim().is_empty() {
                    return Err("notification job requires a message".to_string());
                }
                if post_id.as_str().trim().is_empty() {
                    return Err("notification job requires a post id".to_string());
                }
            }
        }
        Ok(())
    }
}

/// Current status of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its due time.
    #[default]
    Pending,
    /// Claimed by a worker and executing.
    Running,
    /// Action completed successfully.
    Succeeded,
    /// Action failed permanently.
    Failed,
    /// Cancelled before it ran.
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether a stored job may move from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Pending)
                | (Pending, Cancelled)
                | (Running, Succeeded)
                | (Running, Pending)
                | (Running, Failed)
                | (Succeeded, Succeeded)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// A scheduled unit of deferred work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub payload: JobPayload,
    /// When this job becomes eligible to run.
    pub due_at: DateTime<Utc>,
    /// Number of executions started so far.
    pub attempt: u32,
    pub status: JobStatus,
    /// Reason captured on the most recent failure.
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new pending job.
    pub fn new(payload: JobPayload, due_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::generate(),
            payload,
            due_at,
            attempt: 0,
            status: JobStatus::Pending,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }

    /// Check if this job is due to run at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.due_at <= now
    }

    /// Apply a status update to this record.
    pub(crate) fn apply(&mut self, update: &StatusUpdate) {
        self.status = update.status;
        self.attempt = update.attempt;
        self.due_at = update.due_at;
        self.last_error = update.last_error.clone();
        self.updated_at = update.at;
    }
}

/// New values for a job's mutable fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: JobStatus,
    pub attempt: u32,
    pub due_at: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Time of the update, recorded as `updated_at`.
    pub at: DateTime<Utc>,
}

impl StatusUpdate {
    /// Start from a job's current values.
    pub fn from_job(job: &Job, at: DateTime<Utc>) -> Self {
        Self {
            status: job.status,
            attempt: job.attempt,
            due_at: job.due_at,
            last_error: job.last_error.clone(),
            at,
        }
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = status;
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn due_at(mut self, due_at: DateTime<Utc>) -> Self {
        self.due_at = due_at;
        self
    }

    pub fn last_error(mut self, last_error: Option<String>) -> Self {
        self.last_error = last_error;
        self
    }
}

/// Filter for listing jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub post_id: Option<PostId>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn for_post(post_id: PostId) -> Self {
        Self {
            post_id: Some(post_id),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| s == job.status)
            && self
                .post_id
                .as_ref()
                .is_none_or(|p| p == job.payload.post_id())
    }
}
