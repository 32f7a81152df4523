//! Test doubles: scripted publishers and notifiers, a publisher that
//! detects overlapping deliveries, and a job store that fails on demand.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::action::{ExternalPostId, NotifyError, Notifier, PublishError, Publisher};
use crate::{
    Job, JobChange, JobFilter, JobId, JobStatus, JobStore, Platform, StatusUpdate, StoreError,
};

/// Publisher that plays back queued failures, then succeeds.
///
/// Failures can be queued for every platform or for one platform only.
#[derive(Debug, Default)]
pub struct ScriptedPublisher {
    failures: Mutex<VecDeque<(Option<Platform>, PublishError)>>,
    published: Mutex<Vec<(Platform, String)>>,
    calls: AtomicUsize,
}

impl ScriptedPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next call, whatever the platform.
    pub fn push_failure(&self, error: PublishError) {
        self.lock_failures().push_back((None, error));
    }

    /// Fail the next call made for `platform`.
    pub fn push_failure_for(&self, platform: &str, error: PublishError) {
        self.lock_failures()
            .push_back((Some(Platform::new(platform)), error));
    }

    /// Number of publish calls made, successful or not.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Successful deliveries, in order.
    pub fn published(&self) -> Vec<(Platform, String)> {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn lock_failures(&self) -> std::sync::MutexGuard<'_, VecDeque<(Option<Platform>, PublishError)>> {
        self.failures.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Publisher for ScriptedPublisher {
    async fn publish(
        &self,
        platform: &Platform,
        content: &str,
    ) -> Result<ExternalPostId, PublishError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        {
            let mut failures = self.lock_failures();
            let hit = failures
                .iter()
                .position(|(only, _)| only.as_ref().is_none_or(|p| p == platform));
            if let Some((_, error)) = hit.and_then(|i| failures.remove(i)) {
                return Err(error);
            }
        }

        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((platform.clone(), content.to_string()));
        Ok(ExternalPostId::new(format!("{}-{}", platform, n)))
    }
}

/// Publisher that tracks how many deliveries of the same content are in
/// progress at once.
///
/// Give every job distinct content and [`peak`](Self::peak) is the largest
/// number of concurrent executions any one job saw.
#[derive(Debug, Default)]
pub struct OverlapPublisher {
    hold: Duration,
    state: Mutex<OverlapState>,
}

#[derive(Debug, Default)]
struct OverlapState {
    active: HashMap<String, usize>,
    delivered: HashMap<String, usize>,
    peak: usize,
}

impl OverlapPublisher {
    /// Each delivery stays in progress for `hold`.
    pub fn new(hold: Duration) -> Self {
        Self {
            hold,
            state: Mutex::default(),
        }
    }

    pub fn peak(&self) -> usize {
        self.lock().peak
    }

    /// Completed deliveries per content.
    pub fn delivered(&self) -> HashMap<String, usize> {
        self.lock().delivered.clone()
    }

    pub fn calls(&self) -> usize {
        self.lock().delivered.values().sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, OverlapState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Publisher for OverlapPublisher {
    async fn publish(
        &self,
        platform: &Platform,
        content: &str,
    ) -> Result<ExternalPostId, PublishError> {
        {
            let mut state = self.lock();
            let active = state.active.entry(content.to_string()).or_insert(0);
            *active += 1;
            let active = *active;
            state.peak = state.peak.max(active);
        }

        tokio::time::sleep(self.hold).await;

        let mut state = self.lock();
        if let Some(active) = state.active.get_mut(content) {
            *active -= 1;
        }
        *state.delivered.entry(content.to_string()).or_insert(0) += 1;
        Ok(ExternalPostId::new(format!("{}-{}", platform, content)))
    }
}

/// Notifier that records every message it was asked to send.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    failures: Mutex<VecDeque<NotifyError>>,
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_failure(&self, error: NotifyError) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(error);
    }

    /// `(user_id, message)` pairs delivered so far.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, user_id: &str, message: &str) -> Result<(), NotifyError> {
        if let Some(error) = self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
        {
            return Err(error);
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((user_id.to_string(), message.to_string()));
        Ok(())
    }
}

/// Job store wrapper whose next calls fail as if the backend were down.
pub struct FlakyJobStore {
    inner: Arc<dyn JobStore>,
    failures: AtomicUsize,
}

impl FlakyJobStore {
    pub fn new(inner: Arc<dyn JobStore>) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(0),
        }
    }

    /// Fail the next `n` calls with [`StoreError::Unavailable`].
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    fn trip(&self) -> Result<(), StoreError> {
        let tripped = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            Err(StoreError::Unavailable("injected outage".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl JobStore for FlakyJobStore {
    async fn put(&self, job: Job) -> Result<(), StoreError> {
        self.trip()?;
        self.inner.put(job).await
    }

    async fn get(&self, id: &JobId) -> Result<Job, StoreError> {
        self.trip()?;
        self.inner.get(id).await
    }

    async fn update_status(&self, id: &JobId, update: StatusUpdate) -> Result<Job, StoreError> {
        self.trip()?;
        self.inner.update_status(id, update).await
    }

    async fn compare_and_swap(
        &self,
        id: &JobId,
        expected: JobStatus,
        update: StatusUpdate,
    ) -> Result<Job, StoreError> {
        self.trip()?;
        self.inner.compare_and_swap(id, expected, update).await
    }

    async fn apply_change(
        &self,
        id: &JobId,
        change: JobChange,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        self.trip()?;
        self.inner.apply_change(id, change, now).await
    }

    async fn remove(&self, id: &JobId) -> Result<(), StoreError> {
        self.trip()?;
        self.inner.remove(id).await
    }

    async fn list_due(&self, before: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        self.trip()?;
        self.inner.list_due(before).await
    }

    async fn next_due_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.trip()?;
        self.inner.next_due_at().await
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        self.trip()?;
        self.inner.list(filter).await
    }

    async fn requeue_stale(
        &self,
        running_since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StoreError> {
        self.trip()?;
        self.inner.requeue_stale(running_since, now).await
    }
}
