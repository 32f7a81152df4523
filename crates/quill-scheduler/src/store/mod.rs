//! Job persistence.
//!
//! The store is the single source of truth for job state. Claims, cancels
//! and reschedules go through [`JobStore::apply_change`], which derives the
//! new state from the stored record under the store's own lock, so two
//! schedulers sharing a store can never both claim the same job and a write
//! never carries a stale attempt or due time back into the record.

mod memory;
mod sqlite;

pub use memory::MemoryJobStore;
pub use sqlite::SqliteJobStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{Job, JobFilter, JobId, JobStatus, StatusUpdate, StoreError};

/// Durable storage for jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job.
    async fn put(&self, job: Job) -> Result<(), StoreError>;

    /// Fetch a job by id.
    async fn get(&self, id: &JobId) -> Result<Job, StoreError>;

    /// Apply an update if the transition from the current status is allowed.
    ///
    /// `Succeeded -> Succeeded` is accepted and leaves the record untouched.
    async fn update_status(&self, id: &JobId, update: StatusUpdate) -> Result<Job, StoreError>;

    /// Apply an update only if the job's current status is `expected`.
    async fn compare_and_swap(
        &self,
        id: &JobId,
        expected: JobStatus,
        update: StatusUpdate,
    ) -> Result<Job, StoreError>;

    /// Resolve `change` against the job as stored and write the result, as
    /// one atomic step.
    async fn apply_change(
        &self,
        id: &JobId,
        change: JobChange,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError>;

    /// Delete a job record.
    async fn remove(&self, id: &JobId) -> Result<(), StoreError>;

    /// Pending jobs with `due_at <= before`, oldest due first, FIFO on ties.
    async fn list_due(&self, before: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;

    /// Earliest due time among pending jobs.
    async fn next_due_at(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Jobs matching a filter, in insertion order.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;

    /// Move `Running` jobs not updated since `running_since` back to
    /// `Pending`, due at `now`. Returns the requeued ids.
    async fn requeue_stale(
        &self,
        running_since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StoreError>;
}

/// A status change whose fields depend on the record at write time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobChange {
    /// `Pending -> Running` for a due job, counting one more attempt.
    Claim,
    /// `Pending -> Cancelled`.
    Cancel,
    /// Move a pending job's due time, keeping its id and attempt.
    Reschedule(DateTime<Utc>),
    /// Hand a claim back: `Running -> Pending`, uncounting the attempt.
    Release,
}

impl JobChange {
    /// The update this change makes to `job`, or why it cannot apply.
    pub(crate) fn resolve(self, job: &Job, now: DateTime<Utc>) -> Result<StatusUpdate, StoreError> {
        let base = StatusUpdate::from_job(job, now);
        let (expected, update) = match self {
            JobChange::Claim => (
                JobStatus::Pending,
                base.status(JobStatus::Running)
                    .attempt(job.attempt.saturating_add(1)),
            ),
            JobChange::Cancel => (JobStatus::Pending, base.status(JobStatus::Cancelled)),
            JobChange::Reschedule(due_at) => (JobStatus::Pending, base.due_at(due_at)),
            JobChange::Release => (
                JobStatus::Running,
                base.status(JobStatus::Pending)
                    .attempt(job.attempt.saturating_sub(1)),
            ),
        };
        check_cas(job, expected, &update)?;

        if self == JobChange::Claim && !job.is_due(now) {
            return Err(StoreError::NotDue {
                id: job.id.clone(),
                due_at: job.due_at,
            });
        }
        Ok(update)
    }
}

/// Check an update against the transition table.
pub(crate) fn check_transition(job: &Job, update: &StatusUpdate) -> Result<(), StoreError> {
    if job.status.can_transition_to(update.status) {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition {
            id: job.id.clone(),
            from: job.status,
            to: update.status,
        })
    }
}

/// Check a CAS precondition and the transition table.
pub(crate) fn check_cas(
    job: &Job,
    expected: JobStatus,
    update: &StatusUpdate,
) -> Result<(), StoreError> {
    if job.status != expected {
        return Err(StoreError::InvalidTransition {
            id: job.id.clone(),
            from: job.status,
            to: update.status,
        });
    }
    check_transition(job, update)
}

/// Whether an update is the idempotent success no-op.
pub(crate) fn is_noop(job: &Job, update: &StatusUpdate) -> bool {
    job.status == JobStatus::Succeeded && update.status == JobStatus::Succeeded
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behaviour every `JobStore` implementation must share.

    use chrono::Duration;

    use super::*;
    use crate::{JobPayload, Platform, PostId};

    pub fn publish_job(post: &str, platform: &str, due_at: DateTime<Utc>) -> Job {
        Job::new(
            JobPayload::PublishPost {
                post_id: PostId::from(post),
                platform: Platform::new(platform),
                content: "hello world".to_string(),
            },
            due_at,
            due_at,
        )
    }

    pub async fn get_missing_is_not_found(store: &dyn JobStore) {
        let err = store.get(&JobId::from("nope")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    pub async fn put_rejects_duplicates(store: &dyn JobStore, now: DateTime<Utc>) {
        let job = publish_job("p", "twitter", now);
        store.put(job.clone()).await.unwrap();
        let err = store.put(job).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
    }

    pub async fn list_due_orders_by_due_then_fifo(store: &dyn JobStore, now: DateTime<Utc>) {
        let late = publish_job("p", "late", now + Duration::seconds(10));
        let tie_a = publish_job("p", "tie-a", now);
        let tie_b = publish_job("p", "tie-b", now);
        let early = publish_job("p", "early", now - Duration::seconds(10));
        let future = publish_job("p", "future", now + Duration::hours(1));

        for job in [&late, &tie_a, &tie_b, &early, &future] {
            store.put((*job).clone()).await.unwrap();
        }

        let due = store.list_due(now + Duration::seconds(10)).await.unwrap();
        let ids: Vec<_> = due.iter().map(|j| j.id.clone()).collect();
        assert_eq!(ids, vec![early.id, tie_a.id, tie_b.id, late.id]);

        let next = store.next_due_at().await.unwrap().unwrap();
        assert_eq!(
            next.timestamp_millis(),
            (now - Duration::seconds(10)).timestamp_millis()
        );
    }

    pub async fn list_due_skips_non_pending(store: &dyn JobStore, now: DateTime<Utc>) {
        let job = publish_job("p", "twitter", now);
        store.put(job.clone()).await.unwrap();
        store
            .compare_and_swap(
                &job.id,
                JobStatus::Pending,
                StatusUpdate::from_job(&job, now)
                    .status(JobStatus::Running)
                    .attempt(1),
            )
            .await
            .unwrap();

        assert!(store.list_due(now).await.unwrap().is_empty());
        assert!(store.next_due_at().await.unwrap().is_none());
    }

    pub async fn cas_claims_once(store: &dyn JobStore, now: DateTime<Utc>) {
        let job = publish_job("p", "twitter", now);
        store.put(job.clone()).await.unwrap();

        let claim = StatusUpdate::from_job(&job, now)
            .status(JobStatus::Running)
            .attempt(1);

        let claimed = store
            .compare_and_swap(&job.id, JobStatus::Pending, claim.clone())
            .await
            .unwrap();
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.attempt, 1);

        let err = store
            .compare_and_swap(&job.id, JobStatus::Pending, claim)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                from: JobStatus::Running,
                ..
            }
        ));
    }

    pub async fn changes_read_stored_record(store: &dyn JobStore, now: DateTime<Utc>) {
        let job = publish_job("p", "twitter", now);
        store.put(job.clone()).await.unwrap();

        let later = now + Duration::hours(1);
        let moved = store
            .apply_change(&job.id, JobChange::Reschedule(later), now)
            .await
            .unwrap();
        assert_eq!(moved.status, JobStatus::Pending);
        assert_eq!(moved.due_at.timestamp_millis(), later.timestamp_millis());

        let err = store
            .apply_change(&job.id, JobChange::Claim, now)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotDue { .. }));

        let running = store
            .apply_change(&job.id, JobChange::Claim, later)
            .await
            .unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert_eq!(running.attempt, 1);

        // Retry written by the worker: attempt stays, due moves on.
        let retry_at = later + Duration::seconds(5);
        store
            .compare_and_swap(
                &job.id,
                JobStatus::Running,
                StatusUpdate::from_job(&running, later)
                    .status(JobStatus::Pending)
                    .due_at(retry_at)
                    .last_error(Some("503".to_string())),
            )
            .await
            .unwrap();

        let again = store
            .apply_change(&job.id, JobChange::Claim, retry_at)
            .await
            .unwrap();
        assert_eq!(again.attempt, 2);
        assert_eq!(again.last_error.as_deref(), Some("503"));

        let released = store
            .apply_change(&job.id, JobChange::Release, retry_at)
            .await
            .unwrap();
        assert_eq!(released.status, JobStatus::Pending);
        assert_eq!(released.attempt, 1);

        let cancelled = store
            .apply_change(&job.id, JobChange::Cancel, retry_at)
            .await
            .unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert_eq!(cancelled.attempt, 1);

        let err = store
            .apply_change(&job.id, JobChange::Claim, retry_at)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                from: JobStatus::Cancelled,
                ..
            }
        ));
        let err = store
            .apply_change(&JobId::from("nope"), JobChange::Cancel, now)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    pub async fn terminal_is_final(store: &dyn JobStore, now: DateTime<Utc>) {
        let job = publish_job("p", "twitter", now);
        store.put(job.clone()).await.unwrap();

        let cancelled = store
            .update_status(
                &job.id,
                StatusUpdate::from_job(&job, now).status(JobStatus::Cancelled),
            )
            .await
            .unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);

        let err = store
            .update_status(
                &job.id,
                StatusUpdate::from_job(&cancelled, now).status(JobStatus::Running),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        assert_eq!(
            store.get(&job.id).await.unwrap().status,
            JobStatus::Cancelled
        );
    }

    pub async fn succeeded_is_idempotent(store: &dyn JobStore, now: DateTime<Utc>) {
        let job = publish_job("p", "twitter", now);
        store.put(job.clone()).await.unwrap();
        let running = store
            .update_status(
                &job.id,
                StatusUpdate::from_job(&job, now)
                    .status(JobStatus::Running)
                    .attempt(1),
            )
            .await
            .unwrap();
        let done = store
            .update_status(
                &job.id,
                StatusUpdate::from_job(&running, now).status(JobStatus::Succeeded),
            )
            .await
            .unwrap();

        let again = store
            .update_status(
                &job.id,
                StatusUpdate::from_job(&done, now + Duration::seconds(5))
                    .status(JobStatus::Succeeded)
                    .attempt(99),
            )
            .await
            .unwrap();
        assert_eq!(again.status, JobStatus::Succeeded);
        assert_eq!(again.attempt, 1);
    }

    pub async fn remove_and_list(store: &dyn JobStore, now: DateTime<Utc>) {
        let a = publish_job("post-a", "twitter", now);
        let b = publish_job("post-a", "mastodon", now);
        let c = publish_job("post-b", "twitter", now);
        for job in [&a, &b, &c] {
            store.put((*job).clone()).await.unwrap();
        }

        let for_a = store
            .list(&JobFilter::for_post(PostId::from("post-a")))
            .await
            .unwrap();
        assert_eq!(for_a.len(), 2);
        assert_eq!(for_a[0].id, a.id);

        let limited = store
            .list(&JobFilter::default().with_limit(1))
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);

        store.remove(&b.id).await.unwrap();
        let err = store.remove(&b.id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert_eq!(store.list(&JobFilter::default()).await.unwrap().len(), 2);
    }

    pub async fn requeue_stale_running(store: &dyn JobStore, now: DateTime<Utc>) {
        let stale = publish_job("p", "stale", now);
        let fresh = publish_job("p", "fresh", now);
        store.put(stale.clone()).await.unwrap();
        store.put(fresh.clone()).await.unwrap();

        let old = now - Duration::minutes(30);
        store
            .compare_and_swap(
                &stale.id,
                JobStatus::Pending,
                StatusUpdate {
                    status: JobStatus::Running,
                    attempt: 1,
                    due_at: stale.due_at,
                    last_error: None,
                    at: old,
                },
            )
            .await
            .unwrap();
        store
            .compare_and_swap(
                &fresh.id,
                JobStatus::Pending,
                StatusUpdate::from_job(&fresh, now)
                    .status(JobStatus::Running)
                    .attempt(1),
            )
            .await
            .unwrap();

        let requeued = store
            .requeue_stale(now - Duration::minutes(10), now)
            .await
            .unwrap();
        assert_eq!(requeued, vec![stale.id.clone()]);

        let stale = store.get(&stale.id).await.unwrap();
        assert_eq!(stale.status, JobStatus::Pending);
        assert_eq!(stale.attempt, 1);
        assert_eq!(
            store.get(&fresh.id).await.unwrap().status,
            JobStatus::Running
        );
    }
}
