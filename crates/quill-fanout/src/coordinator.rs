//! Expands posts into per-target jobs and manages them as a unit.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use quill_scheduler::{
    JobId, JobPayload, JobStatus, Platform, PostId, Scheduler, SchedulerError,
};

use crate::{FanoutError, Post, PostChange, PostStore, PostStoreError, TargetStatus};

/// Which bulk operation a [`TargetReport`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Cancel,
    Reschedule,
}

impl ReportKind {
    fn verb(&self) -> &'static str {
        match self {
            ReportKind::Cancel => "cancel",
            ReportKind::Reschedule => "reschedule",
        }
    }

    fn past(&self) -> &'static str {
        match self {
            ReportKind::Cancel => "cancelled",
            ReportKind::Reschedule => "rescheduled",
        }
    }
}

/// Per-target result of cancelling or rescheduling a post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetReport {
    pub kind: ReportKind,
    /// Targets the operation applied to.
    pub changed: Vec<Platform>,
    /// Targets whose job was already running.
    pub in_flight: Vec<Platform>,
    /// Targets that had already finished.
    pub finished: Vec<Platform>,
    /// Whether the reminder was cancelled or moved as well.
    pub reminder_changed: bool,
}

impl TargetReport {
    fn new(kind: ReportKind) -> Self {
        Self {
            kind,
            changed: Vec::new(),
            in_flight: Vec::new(),
            finished: Vec::new(),
            reminder_changed: false,
        }
    }

    pub fn total(&self) -> usize {
        self.changed.len() + self.in_flight.len() + self.finished.len()
    }

    /// Targets the operation could not apply to.
    pub fn missed(&self) -> usize {
        self.in_flight.len() + self.finished.len()
    }

    pub fn is_complete(&self) -> bool {
        self.missed() == 0
    }
}

impl fmt::Display for TargetReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_complete() {
            write!(f, "{} all {} targets", self.kind.past(), self.total())?;
        } else {
            write!(
                f,
                "could not {} {} of {} targets",
                self.kind.verb(),
                self.missed(),
                self.total()
            )?;
            if !self.in_flight.is_empty() {
                write!(f, " ({} in flight)", join(&self.in_flight))?;
            }
        }
        Ok(())
    }
}

fn join(platforms: &[Platform]) -> String {
    platforms
        .iter()
        .map(Platform::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// How a job-level cancel or reschedule ended.
enum Outcome {
    Applied,
    /// The job id is reserved on the post but the job does not exist yet.
    NotCreated,
    InFlight,
    Finished,
}

fn classify(result: Result<(), SchedulerError>) -> Result<Outcome, FanoutError> {
    match result {
        Ok(()) => Ok(Outcome::Applied),
        Err(SchedulerError::InFlight(_)) => Ok(Outcome::InFlight),
        Err(SchedulerError::AlreadyTerminal { .. }) => Ok(Outcome::Finished),
        Err(e) => Err(e.into()),
    }
}

/// The jobs one `schedule_post` call creates, with ids chosen up front.
struct FanoutPlan {
    publish_at: DateTime<Utc>,
    reminder_offset: Option<Duration>,
    targets: Vec<(Platform, JobId, JobPayload)>,
    reminder: Option<(JobId, JobPayload, DateTime<Utc>)>,
}

impl FanoutPlan {
    fn new(
        post: &Post,
        publish_at: DateTime<Utc>,
        reminder_offset: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Self {
        let targets = post
            .targets
            .iter()
            .filter(|t| t.status == TargetStatus::Pending)
            .map(|target| {
                let payload = JobPayload::PublishPost {
                    post_id: post.id.clone(),
                    platform: target.platform.clone(),
                    content: post.content.clone(),
                };
                (target.platform.clone(), JobId::generate(), payload)
            })
            .collect();

        let reminder = match reminder_offset {
            Some(offset) if publish_at > now => {
                let remind_at = publish_at
                    .checked_sub_signed(offset)
                    .unwrap_or(now)
                    .max(now);
                let payload = JobPayload::SendNotification {
                    user_id: post.user_id.clone(),
                    message: format!(
                        "Your post is scheduled to go out at {}",
                        publish_at.to_rfc3339()
                    ),
                    post_id: post.id.clone(),
                };
                Some((JobId::generate(), payload, remind_at))
            }
            _ => None,
        };

        Self {
            publish_at,
            reminder_offset,
            targets,
            reminder,
        }
    }

    /// The post change reserving every planned job id.
    fn reservation(&self) -> PostChange {
        PostChange::Scheduled {
            publish_at: self.publish_at,
            jobs: self
                .targets
                .iter()
                .map(|(platform, job_id, _)| (platform.clone(), job_id.clone()))
                .collect(),
            reminder_offset: self.reminder_offset,
            reminder_job_id: self.reminder.as_ref().map(|(job_id, _, _)| job_id.clone()),
        }
    }
}

/// Creates one publish job per target plus an optional reminder, and
/// cancels or moves them together.
pub struct FanoutCoordinator {
    scheduler: Arc<Scheduler>,
    posts: Arc<dyn PostStore>,
}

impl FanoutCoordinator {
    pub fn new(scheduler: Arc<Scheduler>, posts: Arc<dyn PostStore>) -> Self {
        Self { scheduler, posts }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    fn now(&self) -> DateTime<Utc> {
        self.scheduler.clock().now()
    }

    /// Store a new draft post.
    #[tracing::instrument(skip(self, content, platforms))]
    pub async fn create_post(
        &self,
        user_id: &str,
        content: &str,
        platforms: impl IntoIterator<Item = Platform>,
    ) -> Result<Post, FanoutError> {
        if user_id.trim().is_empty() {
            return Err(FanoutError::InvalidPost("user id is empty".to_string()));
        }
        let post = Post::new(user_id, content, platforms, self.now());
        if post.targets.is_empty() {
            return Err(FanoutError::InvalidPost("post has no targets".to_string()));
        }

        self.posts.insert(post.clone()).await?;
        info!(post_id = %post.id, targets = post.targets.len(), "created post");
        Ok(post)
    }

    pub async fn get_post(&self, post_id: &PostId) -> Result<Post, FanoutError> {
        Ok(self.posts.get(post_id).await?)
    }

    /// Create a publish job for every pending target, due at `publish_at`
    /// (now when `None`), and a reminder `reminder_offset` before it.
    ///
    /// The job ids are recorded on the post before any job exists, so of
    /// two concurrent calls only one creates jobs. If creating them fails
    /// the ones already created are cancelled and the post returns to draft.
    #[tracing::instrument(skip(self), fields(post_id = %post_id))]
    pub async fn schedule_post(
        &self,
        post_id: &PostId,
        publish_at: Option<DateTime<Utc>>,
        reminder_offset: Option<Duration>,
    ) -> Result<Post, FanoutError> {
        let post = self.get_post(post_id).await?;
        if post.is_scheduled() {
            return Err(FanoutError::AlreadyScheduled(post_id.clone()));
        }

        let now = self.now();
        let plan = FanoutPlan::new(&post, publish_at.unwrap_or(now), reminder_offset, now);

        match self.posts.update(post_id, plan.reservation(), now).await {
            Ok(_) => {}
            Err(PostStoreError::Rejected { .. }) => {
                return Err(FanoutError::AlreadyScheduled(post_id.clone()));
            }
            Err(e) => return Err(e.into()),
        }

        let mut created = Vec::new();
        if let Err(e) = self.create_jobs(&plan, &mut created).await {
            warn!(error = %e, created = created.len(), "fan-out failed, rolling back");
            self.rollback(post_id, &plan, &created).await;
            return Err(e);
        }

        let post = self.withdraw_cancelled(post_id, &plan).await?;
        info!(
            publish_at = %plan.publish_at,
            jobs = created.len(),
            status = %post.status,
            "scheduled post"
        );
        Ok(post)
    }

    async fn create_jobs(
        &self,
        plan: &FanoutPlan,
        created: &mut Vec<JobId>,
    ) -> Result<(), FanoutError> {
        for (_, job_id, payload) in &plan.targets {
            self.scheduler
                .schedule_with_id(job_id.clone(), payload.clone(), plan.publish_at)
                .await?;
            created.push(job_id.clone());
        }
        if let Some((job_id, payload, remind_at)) = &plan.reminder {
            self.scheduler
                .schedule_with_id(job_id.clone(), payload.clone(), *remind_at)
                .await?;
            created.push(job_id.clone());
        }
        Ok(())
    }

    /// Cancel jobs for targets a concurrent cancel marked while they were
    /// being created.
    async fn withdraw_cancelled(&self, post_id: &PostId, plan: &FanoutPlan) -> Result<Post, FanoutError> {
        let post = self.get_post(post_id).await?;
        for (platform, job_id, _) in &plan.targets {
            let cancelled = post
                .target(platform)
                .is_some_and(|t| t.status == TargetStatus::Cancelled);
            if !cancelled {
                continue;
            }
            match self.scheduler.cancel(job_id).await {
                Ok(_) => debug!(%job_id, %platform, "withdrew job for cancelled target"),
                Err(SchedulerError::AlreadyTerminal {
                    status: JobStatus::Cancelled,
                    ..
                }) => {}
                Err(e) if e.is_too_late() => {
                    warn!(%job_id, %platform, error = %e, "cancelled target's job already started");
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.cancel_reminder_if_unused(post_id).await?;
        self.get_post(post_id).await
    }

    /// Cancel the created jobs and release the reservation for every target
    /// whose job will not run.
    async fn rollback(&self, post_id: &PostId, plan: &FanoutPlan, created: &[JobId]) {
        let mut released = Vec::new();
        for (platform, job_id, _) in &plan.targets {
            if !created.contains(job_id) {
                released.push(platform.clone());
                continue;
            }
            match self.scheduler.cancel(job_id).await {
                Ok(_) | Err(SchedulerError::JobNotFound(_)) => released.push(platform.clone()),
                Err(e) => warn!(%job_id, error = %e, "could not cancel job during rollback"),
            }
        }
        let reminder = plan
            .reminder
            .as_ref()
            .filter(|(job_id, _, _)| created.contains(job_id));
        if let Some((job_id, _, _)) = reminder {
            if let Err(e) = self.scheduler.cancel(job_id).await {
                warn!(%job_id, error = %e, "could not cancel reminder during rollback");
            }
        }

        let change = PostChange::Unscheduled {
            platforms: released,
        };
        if let Err(e) = self.posts.update(post_id, change, self.now()).await {
            warn!(error = %e, "could not release post reservation");
        }
    }

    /// Cancel every target that has not started.
    ///
    /// Running or finished targets are left alone and reported. The
    /// reminder is cancelled once every target is cancelled.
    #[tracing::instrument(skip(self), fields(post_id = %post_id))]
    pub async fn cancel_post(&self, post_id: &PostId) -> Result<TargetReport, FanoutError> {
        let post = self
            .posts
            .update(post_id, PostChange::CancelRequested, self.now())
            .await?;
        let mut report = TargetReport::new(ReportKind::Cancel);

        for target in &post.targets {
            let platform = target.platform.clone();
            if target.status == TargetStatus::Cancelled {
                report.changed.push(platform);
                continue;
            }
            if target.status.is_terminal() {
                report.finished.push(platform);
                continue;
            }

            match self.cancel_job(target.job_id.as_ref()).await? {
                Outcome::Applied => {
                    self.mark_cancelled(post_id, &platform).await?;
                    report.changed.push(platform);
                }
                Outcome::NotCreated => {
                    self.mark_cancelled(post_id, &platform).await?;
                    self.cancel_created_late(target.job_id.as_ref()).await?;
                    report.changed.push(platform);
                }
                Outcome::InFlight => report.in_flight.push(platform),
                Outcome::Finished => report.finished.push(platform),
            }
        }

        report.reminder_changed = self.cancel_reminder_if_unused(post_id).await?;

        if report.is_complete() {
            info!(%report, "cancelled post");
        } else {
            warn!(%report, "post partially cancelled");
        }
        Ok(report)
    }

    /// Cancel a single target.
    ///
    /// Fails with the scheduler's too-late error when its job has started.
    #[tracing::instrument(skip(self), fields(post_id = %post_id, platform = %platform))]
    pub async fn cancel_target(
        &self,
        post_id: &PostId,
        platform: &Platform,
    ) -> Result<Post, FanoutError> {
        let post = self.get_post(post_id).await?;
        let target = post
            .target(platform)
            .ok_or_else(|| FanoutError::UnknownTarget {
                post_id: post_id.clone(),
                platform: platform.clone(),
            })?;
        if target.status == TargetStatus::Cancelled {
            return Ok(post);
        }

        let job_id = target.job_id.clone();
        let outcome = match &job_id {
            Some(job_id) => match self.scheduler.cancel(job_id).await {
                Ok(_) => Outcome::Applied,
                Err(SchedulerError::JobNotFound(_)) => Outcome::NotCreated,
                Err(e) => return Err(e.into()),
            },
            None => Outcome::Applied,
        };
        self.mark_cancelled(post_id, platform).await?;
        if matches!(outcome, Outcome::NotCreated) {
            self.cancel_created_late(job_id.as_ref()).await?;
        }
        self.cancel_reminder_if_unused(post_id).await?;

        let post = self.get_post(post_id).await?;
        info!(status = %post.status, "cancelled target");
        Ok(post)
    }

    /// Move every pending target job, and the reminder, to a new time.
    #[tracing::instrument(skip(self), fields(post_id = %post_id))]
    pub async fn reschedule_post(
        &self,
        post_id: &PostId,
        publish_at: DateTime<Utc>,
    ) -> Result<TargetReport, FanoutError> {
        let post = self.get_post(post_id).await?;
        if !post.is_scheduled() {
            return Err(FanoutError::NotScheduled(post_id.clone()));
        }
        let mut report = TargetReport::new(ReportKind::Reschedule);

        for target in &post.targets {
            let platform = target.platform.clone();
            let job_id = match (&target.job_id, target.status.is_terminal()) {
                (Some(job_id), false) => job_id,
                _ => {
                    report.finished.push(platform);
                    continue;
                }
            };

            let result = self.scheduler.reschedule(job_id, publish_at).await.map(|_| ());
            match classify(result)? {
                Outcome::Applied | Outcome::NotCreated => report.changed.push(platform),
                Outcome::InFlight => report.in_flight.push(platform),
                Outcome::Finished => report.finished.push(platform),
            }
        }

        report.reminder_changed = self.move_reminder(&post, publish_at).await?;
        self.posts
            .update(post_id, PostChange::Rescheduled { publish_at }, self.now())
            .await?;

        if report.is_complete() {
            info!(%publish_at, %report, "rescheduled post");
        } else {
            warn!(%publish_at, %report, "post partially rescheduled");
        }
        Ok(report)
    }

    async fn cancel_job(&self, job_id: Option<&JobId>) -> Result<Outcome, FanoutError> {
        let Some(job_id) = job_id else {
            // No job yet; only the post record needs changing.
            return Ok(Outcome::Applied);
        };
        match self.scheduler.cancel(job_id).await {
            Err(SchedulerError::JobNotFound(_)) => Ok(Outcome::NotCreated),
            other => classify(other.map(|_| ())),
        }
    }

    /// Cancel a reserved job that may have been created since it was first
    /// found missing. A job created after the target was marked is withdrawn
    /// by the scheduling call itself.
    async fn cancel_created_late(&self, job_id: Option<&JobId>) -> Result<(), FanoutError> {
        let Some(job_id) = job_id else {
            return Ok(());
        };
        match self.scheduler.cancel(job_id).await {
            Ok(_) => {
                debug!(%job_id, "cancelled job created during cancel");
                Ok(())
            }
            Err(SchedulerError::JobNotFound(_)) => Ok(()),
            Err(e) if e.is_too_late() => {
                warn!(%job_id, error = %e, "job created during cancel already started");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn mark_cancelled(&self, post_id: &PostId, platform: &Platform) -> Result<(), FanoutError> {
        self.posts
            .update(
                post_id,
                PostChange::TargetCancelled {
                    platform: platform.clone(),
                },
                self.now(),
            )
            .await?;
        Ok(())
    }

    /// Cancel the reminder once no target will be delivered.
    async fn cancel_reminder_if_unused(&self, post_id: &PostId) -> Result<bool, FanoutError> {
        let post = self.get_post(post_id).await?;
        let Some(reminder) = post.reminder_job_id.as_ref() else {
            return Ok(false);
        };
        if !post.all_targets_cancelled() {
            return Ok(false);
        }

        match self.scheduler.cancel(reminder).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_too_late() => Ok(false),
            Err(SchedulerError::JobNotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Reschedule the reminder relative to the new time, or cancel it when
    /// the post now goes out immediately.
    async fn move_reminder(&self, post: &Post, publish_at: DateTime<Utc>) -> Result<bool, FanoutError> {
        let (Some(reminder), Some(offset)) = (post.reminder_job_id.as_ref(), post.reminder_offset())
        else {
            return Ok(false);
        };

        let now = self.now();
        let result = if publish_at > now {
            let remind_at = publish_at.checked_sub_signed(offset).unwrap_or(now).max(now);
            self.scheduler.reschedule(reminder, remind_at).await.map(|_| ())
        } else {
            self.scheduler.cancel(reminder).await.map(|_| ())
        };

        match result {
            Ok(()) => Ok(true),
            Err(e) if e.is_too_late() => Ok(false),
            Err(SchedulerError::JobNotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use quill_scheduler::{
        Clock, JobFilter, JobKind, JobStore, ManualClock, MemoryJobStore, SchedulerConfig,
        StatusUpdate,
    };

    use super::*;
    use crate::{MemoryPostStore, PostStatus};

    struct Fixture {
        jobs: Arc<MemoryJobStore>,
        clock: Arc<ManualClock>,
        coordinator: FanoutCoordinator,
    }

    fn fixture() -> Fixture {
        let jobs = Arc::new(MemoryJobStore::new());
        let clock = Arc::new(ManualClock::default());
        let scheduler = Arc::new(Scheduler::new(
            jobs.clone(),
            clock.clone(),
            SchedulerConfig::default(),
        ));
        Fixture {
            coordinator: FanoutCoordinator::new(scheduler, Arc::new(MemoryPostStore::new())),
            jobs,
            clock,
        }
    }

    fn platforms(names: &[&str]) -> Vec<Platform> {
        names.iter().map(Platform::new).collect()
    }

    async fn claim(jobs: &MemoryJobStore, id: &JobId, now: DateTime<Utc>) {
        let job = jobs.get(id).await.unwrap();
        jobs.compare_and_swap(
            id,
            JobStatus::Pending,
            StatusUpdate::from_job(&job, now)
                .status(JobStatus::Running)
                .attempt(job.attempt + 1),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_create_post_requires_targets() {
        let f = fixture();
        let err = f
            .coordinator
            .create_post("user-1", "hello", Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FanoutError::InvalidPost(_)));
    }

    #[tokio::test]
    async fn test_schedule_post_fans_out() {
        let f = fixture();
        let post = f
            .coordinator
            .create_post("user-1", "hello", platforms(&["twitter", "mastodon"]))
            .await
            .unwrap();
        let publish_at = f.clock.now() + Duration::hours(2);

        let post = f
            .coordinator
            .schedule_post(&post.id, Some(publish_at), Some(Duration::minutes(30)))
            .await
            .unwrap();

        assert_eq!(post.status, PostStatus::Scheduled);
        assert_eq!(post.publish_at, Some(publish_at));

        let jobs = f
            .jobs
            .list(&JobFilter::for_post(post.id.clone()))
            .await
            .unwrap();
        assert_eq!(jobs.len(), 3);
        let reminder = jobs
            .iter()
            .find(|j| j.kind() == JobKind::SendNotification)
            .unwrap();
        assert_eq!(reminder.due_at, publish_at - Duration::minutes(30));
        assert_eq!(post.reminder_job_id.as_ref(), Some(&reminder.id));
        for target in &post.targets {
            let job = f.jobs.get(target.job_id.as_ref().unwrap()).await.unwrap();
            assert_eq!(job.due_at, publish_at);
        }
    }

    #[tokio::test]
    async fn test_reminder_clamped_and_skipped_for_now() {
        let f = fixture();
        let soon = f
            .coordinator
            .create_post("user-1", "hello", platforms(&["twitter"]))
            .await
            .unwrap();
        let publish_at = f.clock.now() + Duration::minutes(5);
        let soon = f
            .coordinator
            .schedule_post(&soon.id, Some(publish_at), Some(Duration::hours(1)))
            .await
            .unwrap();
        let reminder = f.jobs.get(soon.reminder_job_id.as_ref().unwrap()).await.unwrap();
        assert_eq!(reminder.due_at, f.clock.now());

        let now_post = f
            .coordinator
            .create_post("user-1", "hello", platforms(&["twitter"]))
            .await
            .unwrap();
        let now_post = f
            .coordinator
            .schedule_post(&now_post.id, None, Some(Duration::hours(1)))
            .await
            .unwrap();
        assert!(now_post.reminder_job_id.is_none());
        assert_eq!(now_post.publish_at, Some(f.clock.now()));
    }

    #[tokio::test]
    async fn test_schedule_twice_is_rejected() {
        let f = fixture();
        let post = f
            .coordinator
            .create_post("user-1", "hello", platforms(&["twitter"]))
            .await
            .unwrap();
        f.coordinator.schedule_post(&post.id, None, None).await.unwrap();

        let err = f
            .coordinator
            .schedule_post(&post.id, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, FanoutError::AlreadyScheduled(_)));
        assert_eq!(f.jobs.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_schedules_create_one_set_of_jobs() {
        let f = Arc::new(fixture());
        let post = f
            .coordinator
            .create_post("user-1", "hello", platforms(&["twitter", "mastodon"]))
            .await
            .unwrap();

        let calls: Vec<_> = (0..4)
            .map(|_| {
                let f = Arc::clone(&f);
                let post_id = post.id.clone();
                tokio::spawn(async move { f.coordinator.schedule_post(&post_id, None, None).await })
            })
            .collect();

        let mut scheduled = 0;
        for call in calls {
            match call.await.unwrap() {
                Ok(_) => scheduled += 1,
                Err(FanoutError::AlreadyScheduled(_)) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(scheduled, 1);
        assert_eq!(f.jobs.len(), 2);

        let post = f.coordinator.get_post(&post.id).await.unwrap();
        for target in &post.targets {
            let job_id = target.job_id.as_ref().unwrap();
            assert!(f.jobs.get(job_id).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_cancel_between_reservation_and_creation() {
        let f = fixture();
        let post = f
            .coordinator
            .create_post("user-1", "hello", platforms(&["twitter"]))
            .await
            .unwrap();
        let now = f.clock.now();
        let plan = FanoutPlan::new(&post, now, None, now);
        f.coordinator
            .posts
            .update(&post.id, plan.reservation(), now)
            .await
            .unwrap();

        // The reserved job does not exist yet; the target is still cancelled.
        let report = f.coordinator.cancel_post(&post.id).await.unwrap();
        assert!(report.is_complete());

        let mut created = Vec::new();
        f.coordinator.create_jobs(&plan, &mut created).await.unwrap();
        let post = f
            .coordinator
            .withdraw_cancelled(&post.id, &plan)
            .await
            .unwrap();

        assert_eq!(post.status, PostStatus::Cancelled);
        assert_eq!(
            f.jobs.get(&created[0]).await.unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_failed_fan_out_rolls_back() {
        let f = fixture();
        // Empty content passes post creation but fails payload validation
        let post = f
            .coordinator
            .create_post("user-1", "  ", platforms(&["twitter", "mastodon"]))
            .await
            .unwrap();

        let err = f
            .coordinator
            .schedule_post(&post.id, None, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FanoutError::Scheduler(SchedulerError::InvalidPayload(_))
        ));
        assert!(f.jobs.is_empty());

        let post = f.coordinator.get_post(&post.id).await.unwrap();
        assert_eq!(post.status, PostStatus::Draft);
        assert!(!post.is_scheduled());
        assert!(post.targets.iter().all(|t| t.job_id.is_none()));
    }

    #[tokio::test]
    async fn test_cancel_post_reports_in_flight_targets() {
        let f = fixture();
        let post = f
            .coordinator
            .create_post("user-1", "hello", platforms(&["a", "b", "c"]))
            .await
            .unwrap();
        let publish_at = f.clock.now() + Duration::hours(1);
        let post = f
            .coordinator
            .schedule_post(&post.id, Some(publish_at), Some(Duration::minutes(10)))
            .await
            .unwrap();

        let running = post.targets[1].job_id.clone().unwrap();
        claim(&f.jobs, &running, f.clock.now()).await;

        let report = f.coordinator.cancel_post(&post.id).await.unwrap();
        assert_eq!(report.changed, platforms(&["a", "c"]));
        assert_eq!(report.in_flight, platforms(&["b"]));
        assert!(!report.reminder_changed);
        assert_eq!(report.to_string(), "could not cancel 1 of 3 targets (b in flight)");

        let post = f.coordinator.get_post(&post.id).await.unwrap();
        assert!(post.cancel_requested);
        assert_eq!(post.status, PostStatus::Scheduled);
        // The reminder stays while a target may still go out
        let reminder = f.jobs.get(post.reminder_job_id.as_ref().unwrap()).await.unwrap();
        assert_eq!(reminder.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_cancel_post_cancels_everything() {
        let f = fixture();
        let post = f
            .coordinator
            .create_post("user-1", "hello", platforms(&["a", "b"]))
            .await
            .unwrap();
        let post = f
            .coordinator
            .schedule_post(
                &post.id,
                Some(f.clock.now() + Duration::hours(1)),
                Some(Duration::minutes(10)),
            )
            .await
            .unwrap();

        let report = f.coordinator.cancel_post(&post.id).await.unwrap();
        assert!(report.is_complete());
        assert!(report.reminder_changed);
        assert_eq!(report.to_string(), "cancelled all 2 targets");

        let post = f.coordinator.get_post(&post.id).await.unwrap();
        assert_eq!(post.status, PostStatus::Cancelled);
        for job in f.jobs.list(&JobFilter::default()).await.unwrap() {
            assert_eq!(job.status, JobStatus::Cancelled);
        }
    }

    #[tokio::test]
    async fn test_cancel_draft_post() {
        let f = fixture();
        let post = f
            .coordinator
            .create_post("user-1", "hello", platforms(&["a"]))
            .await
            .unwrap();
        let report = f.coordinator.cancel_post(&post.id).await.unwrap();
        assert!(report.is_complete());
        let post = f.coordinator.get_post(&post.id).await.unwrap();
        assert_eq!(post.status, PostStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_target_keeps_shared_reminder() {
        let f = fixture();
        let post = f
            .coordinator
            .create_post("user-1", "hello", platforms(&["a", "b"]))
            .await
            .unwrap();
        let post = f
            .coordinator
            .schedule_post(
                &post.id,
                Some(f.clock.now() + Duration::hours(1)),
                Some(Duration::minutes(10)),
            )
            .await
            .unwrap();
        let reminder = post.reminder_job_id.clone().unwrap();

        let post = f
            .coordinator
            .cancel_target(&post.id, &Platform::new("a"))
            .await
            .unwrap();
        assert_eq!(
            post.target(&Platform::new("a")).unwrap().status,
            TargetStatus::Cancelled
        );
        assert_eq!(f.jobs.get(&reminder).await.unwrap().status, JobStatus::Pending);

        let post = f
            .coordinator
            .cancel_target(&post.id, &Platform::new("b"))
            .await
            .unwrap();
        assert_eq!(post.status, PostStatus::Cancelled);
        assert_eq!(f.jobs.get(&reminder).await.unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_target_in_flight_fails() {
        let f = fixture();
        let post = f
            .coordinator
            .create_post("user-1", "hello", platforms(&["a"]))
            .await
            .unwrap();
        let post = f.coordinator.schedule_post(&post.id, None, None).await.unwrap();
        claim(&f.jobs, post.targets[0].job_id.as_ref().unwrap(), f.clock.now()).await;

        let err = f
            .coordinator
            .cancel_target(&post.id, &Platform::new("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, FanoutError::Scheduler(SchedulerError::InFlight(_))));

        let err = f
            .coordinator
            .cancel_target(&post.id, &Platform::new("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, FanoutError::UnknownTarget { .. }));
    }

    #[tokio::test]
    async fn test_reschedule_post_moves_jobs_and_reminder() {
        let f = fixture();
        let post = f
            .coordinator
            .create_post("user-1", "hello", platforms(&["a", "b"]))
            .await
            .unwrap();
        let post = f
            .coordinator
            .schedule_post(
                &post.id,
                Some(f.clock.now() + Duration::hours(1)),
                Some(Duration::minutes(10)),
            )
            .await
            .unwrap();

        let later = f.clock.now() + Duration::days(1);
        let report = f.coordinator.reschedule_post(&post.id, later).await.unwrap();
        assert!(report.is_complete());
        assert!(report.reminder_changed);
        assert_eq!(report.changed.len(), 2);

        let post = f.coordinator.get_post(&post.id).await.unwrap();
        assert_eq!(post.publish_at, Some(later));
        for target in &post.targets {
            let job = f.jobs.get(target.job_id.as_ref().unwrap()).await.unwrap();
            assert_eq!(job.due_at, later);
        }
        let reminder = f.jobs.get(post.reminder_job_id.as_ref().unwrap()).await.unwrap();
        assert_eq!(reminder.due_at, later - Duration::minutes(10));
        assert_eq!(f.jobs.len(), 3);
    }

    #[tokio::test]
    async fn test_reschedule_unscheduled_post_fails() {
        let f = fixture();
        let post = f
            .coordinator
            .create_post("user-1", "hello", platforms(&["a"]))
            .await
            .unwrap();
        let err = f
            .coordinator
            .reschedule_post(&post.id, f.clock.now())
            .await
            .unwrap_err();
        assert!(matches!(err, FanoutError::NotScheduled(_)));
    }
}
