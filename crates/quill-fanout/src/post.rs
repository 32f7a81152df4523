//! Posts, their delivery targets, and the transitions between them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use quill_scheduler::{ExternalPostId, JobId, Platform, PostId};

/// Delivery status of one target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    /// No job exists yet.
    #[default]
    Pending,
    /// A publish job is waiting or running.
    Scheduled,
    Published,
    Failed,
    Cancelled,
}

impl TargetStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TargetStatus::Published | TargetStatus::Failed | TargetStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetStatus::Pending => "pending",
            TargetStatus::Scheduled => "scheduled",
            TargetStatus::Published => "published",
            TargetStatus::Failed => "failed",
            TargetStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall status of a post, derived from its targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostStatus {
    #[default]
    Draft,
    Pending,
    Scheduled,
    Published,
    Failed,
    Cancelled,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Draft => "draft",
            PostStatus::Pending => "pending",
            PostStatus::Scheduled => "scheduled",
            PostStatus::Published => "published",
            PostStatus::Failed => "failed",
            PostStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for PostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PostStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(PostStatus::Draft),
            "pending" => Ok(PostStatus::Pending),
            "scheduled" => Ok(PostStatus::Scheduled),
            "published" => Ok(PostStatus::Published),
            "failed" => Ok(PostStatus::Failed),
            "cancelled" => Ok(PostStatus::Cancelled),
            other => Err(format!("unknown post status '{}'", other)),
        }
    }
}

/// One publishing destination of a post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostTarget {
    pub platform: Platform,
    pub status: TargetStatus,
    pub job_id: Option<JobId>,
    pub external_id: Option<ExternalPostId>,
    pub failure_reason: Option<String>,
}

impl PostTarget {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            status: TargetStatus::Pending,
            job_id: None,
            external_id: None,
            failure_reason: None,
        }
    }
}

/// A piece of content to deliver to one or more platforms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: PostId,
    pub user_id: String,
    pub content: String,
    pub targets: Vec<PostTarget>,
    /// Resolved delivery time; `None` until the post is scheduled.
    pub publish_at: Option<DateTime<Utc>>,
    /// How long before `publish_at` the reminder goes out.
    pub reminder_offset_secs: Option<i64>,
    pub reminder_job_id: Option<JobId>,
    pub status: PostStatus,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One atomic change to a post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostChange {
    /// Job ids were reserved for the listed targets.
    Scheduled {
        publish_at: DateTime<Utc>,
        jobs: Vec<(Platform, JobId)>,
        reminder_offset: Option<Duration>,
        reminder_job_id: Option<JobId>,
    },
    /// Scheduling was rolled back for the listed targets, whose jobs were
    /// never created or were cancelled.
    Unscheduled { platforms: Vec<Platform> },
    /// The delivery time moved.
    Rescheduled { publish_at: DateTime<Utc> },
    TargetPublished {
        platform: Platform,
        job_id: JobId,
        external_id: ExternalPostId,
    },
    TargetFailed {
        platform: Platform,
        job_id: JobId,
        reason: String,
    },
    TargetCancelled { platform: Platform },
    CancelRequested,
}

/// A change that does not apply to the post's current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRejected(pub String);

impl fmt::Display for ChangeRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Post {
    /// Create a draft post. Duplicate platforms are collapsed.
    pub fn new(
        user_id: impl Into<String>,
        content: impl Into<String>,
        platforms: impl IntoIterator<Item = Platform>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut targets: Vec<PostTarget> = Vec::new();
        for platform in platforms {
            if !targets.iter().any(|t| t.platform == platform) {
                targets.push(PostTarget::new(platform));
            }
        }

        Self {
            id: PostId::generate(),
            user_id: user_id.into(),
            content: content.into(),
            targets,
            publish_at: None,
            reminder_offset_secs: None,
            reminder_job_id: None,
            status: PostStatus::Draft,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn target(&self, platform: &Platform) -> Option<&PostTarget> {
        self.targets.iter().find(|t| &t.platform == platform)
    }

    fn target_mut(&mut self, platform: &Platform) -> Result<&mut PostTarget, ChangeRejected> {
        let post_id = self.id.clone();
        self.targets
            .iter_mut()
            .find(|t| &t.platform == platform)
            .ok_or_else(|| ChangeRejected(format!("post {} has no target {}", post_id, platform)))
    }

    pub fn reminder_offset(&self) -> Option<Duration> {
        self.reminder_offset_secs.map(Duration::seconds)
    }

    pub fn is_scheduled(&self) -> bool {
        self.publish_at.is_some()
    }

    /// Compute the overall status from the targets.
    pub fn derive_status(&self) -> PostStatus {
        let any = |s: TargetStatus| self.targets.iter().any(|t| t.status == s);

        if !self.is_scheduled() && self.targets.iter().all(|t| t.status == TargetStatus::Pending) {
            PostStatus::Draft
        } else if any(TargetStatus::Pending) {
            PostStatus::Pending
        } else if any(TargetStatus::Scheduled) {
            PostStatus::Scheduled
        } else if self
            .targets
            .iter()
            .all(|t| t.status == TargetStatus::Published)
        {
            PostStatus::Published
        } else if any(TargetStatus::Failed) {
            PostStatus::Failed
        } else {
            PostStatus::Cancelled
        }
    }

    /// Whether every target ended up cancelled.
    pub fn all_targets_cancelled(&self) -> bool {
        !self.targets.is_empty()
            && self
                .targets
                .iter()
                .all(|t| t.status == TargetStatus::Cancelled)
    }

    /// Apply a change, refreshing the derived status and `updated_at`.
    ///
    /// Repeating a result that is already recorded is accepted, since the
    /// tracker may deliver it more than once.
    pub fn apply(&mut self, change: PostChange, at: DateTime<Utc>) -> Result<(), ChangeRejected> {
        match change {
            PostChange::Scheduled {
                publish_at,
                jobs,
                reminder_offset,
                reminder_job_id,
            } => {
                if self.is_scheduled() {
                    return Err(ChangeRejected(format!("post {} is already scheduled", self.id)));
                }
                for (platform, job_id) in jobs {
                    let target = self.target_mut(&platform)?;
                    if target.job_id.is_none() {
                        target.job_id = Some(job_id);
                    }
                    if target.status == TargetStatus::Pending {
                        target.status = TargetStatus::Scheduled;
                    }
                }
                self.publish_at = Some(publish_at);
                self.reminder_offset_secs = reminder_offset.map(|d| d.num_seconds());
                self.reminder_job_id = reminder_job_id;
            }
            PostChange::Unscheduled { platforms } => {
                for platform in &platforms {
                    let target = self.target_mut(platform)?;
                    if target.status == TargetStatus::Scheduled {
                        target.status = TargetStatus::Pending;
                        target.job_id = None;
                    }
                }
                if self.targets.iter().all(|t| t.status == TargetStatus::Pending) {
                    self.publish_at = None;
                    self.reminder_offset_secs = None;
                    self.reminder_job_id = None;
                }
            }
            PostChange::Rescheduled { publish_at } => {
                if !self.is_scheduled() {
                    return Err(ChangeRejected(format!("post {} is not scheduled", self.id)));
                }
                self.publish_at = Some(publish_at);
            }
            PostChange::TargetPublished {
                platform,
                job_id,
                external_id,
            } => {
                let target = self.target_mut(&platform)?;
                match target.status {
                    TargetStatus::Pending | TargetStatus::Scheduled => {
                        target.status = TargetStatus::Published;
                        target.job_id.get_or_insert(job_id);
                        target.external_id = Some(external_id);
                        target.failure_reason = None;
                    }
                    TargetStatus::Published => {}
                    other => {
                        return Err(ChangeRejected(format!(
                            "target {} is {} and cannot become published",
                            platform, other
                        )));
                    }
                }
            }
            PostChange::TargetFailed {
                platform,
                job_id,
                reason,
            } => {
                let target = self.target_mut(&platform)?;
                match target.status {
                    TargetStatus::Pending | TargetStatus::Scheduled => {
                        target.status = TargetStatus::Failed;
                        target.job_id.get_or_insert(job_id);
                        target.failure_reason = Some(reason);
                    }
                    TargetStatus::Failed => {}
                    other => {
                        return Err(ChangeRejected(format!(
                            "target {} is {} and cannot become failed",
                            platform, other
                        )));
                    }
                }
            }
            PostChange::TargetCancelled { platform } => {
                let target = self.target_mut(&platform)?;
                match target.status {
                    TargetStatus::Pending | TargetStatus::Scheduled => {
                        target.status = TargetStatus::Cancelled;
                    }
                    TargetStatus::Cancelled => {}
                    other => {
                        return Err(ChangeRejected(format!(
                            "target {} is already {}",
                            platform, other
                        )));
                    }
                }
            }
            PostChange::CancelRequested => {
                self.cancel_requested = true;
            }
        }

        self.status = self.derive_status();
        self.updated_at = at;
        Ok(())
    }
}
