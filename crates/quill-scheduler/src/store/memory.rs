//! In-process job store.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{JobChange, JobStore, check_cas, check_transition, is_noop};
use crate::{Job, JobFilter, JobId, JobStatus, StatusUpdate, StoreError};

#[derive(Debug, Clone)]
struct Slot {
    seq: u64,
    job: Job,
}

/// Job store backed by a concurrent map.
///
/// Per-entry locking makes every update atomic, which is all the CAS
/// contract needs. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: DashMap<JobId, Slot>,
    next_seq: AtomicU64,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn sorted<F>(&self, filter: F) -> Vec<Slot>
    where
        F: Fn(&Job) -> bool,
    {
        let mut slots: Vec<Slot> = self
            .jobs
            .iter()
            .filter(|entry| filter(&entry.value().job))
            .map(|entry| entry.value().clone())
            .collect();
        slots.sort_by_key(|slot| slot.seq);
        slots
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn put(&self, job: Job) -> Result<(), StoreError> {
        match self.jobs.entry(job.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(job.id)),
            Entry::Vacant(slot) => {
                let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
                slot.insert(Slot { seq, job });
                Ok(())
            }
        }
    }

    async fn get(&self, id: &JobId) -> Result<Job, StoreError> {
        self.jobs
            .get(id)
            .map(|slot| slot.job.clone())
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn update_status(&self, id: &JobId, update: StatusUpdate) -> Result<Job, StoreError> {
        let mut slot = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        if is_noop(&slot.job, &update) {
            return Ok(slot.job.clone());
        }
        check_transition(&slot.job, &update)?;
        slot.job.apply(&update);
        Ok(slot.job.clone())
    }

    async fn compare_and_swap(
        &self,
        id: &JobId,
        expected: JobStatus,
        update: StatusUpdate,
    ) -> Result<Job, StoreError> {
        let mut slot = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        check_cas(&slot.job, expected, &update)?;
        if !is_noop(&slot.job, &update) {
            slot.job.apply(&update);
        }
        Ok(slot.job.clone())
    }

    async fn apply_change(
        &self,
        id: &JobId,
        change: JobChange,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let mut slot = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        let update = change.resolve(&slot.job, now)?;
        slot.job.apply(&update);
        Ok(slot.job.clone())
    }

    async fn remove(&self, id: &JobId) -> Result<(), StoreError> {
        self.jobs
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn list_due(&self, before: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let mut due = self.sorted(|job| job.is_due(before));
        // Stable sort keeps insertion order among equal due times.
        due.sort_by_key(|slot| slot.job.due_at);
        Ok(due.into_iter().map(|slot| slot.job).collect())
    }

    async fn next_due_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .jobs
            .iter()
            .filter(|entry| entry.value().job.status == JobStatus::Pending)
            .map(|entry| entry.value().job.due_at)
            .min())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let jobs = self
            .sorted(|job| filter.matches(job))
            .into_iter()
            .map(|slot| slot.job);
        Ok(match filter.limit {
            Some(limit) => jobs.take(limit).collect(),
            None => jobs.collect(),
        })
    }

    async fn requeue_stale(
        &self,
        running_since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StoreError> {
        let mut requeued = Vec::new();
        for mut entry in self.jobs.iter_mut() {
            let job = &mut entry.value_mut().job;
            if job.status == JobStatus::Running && job.updated_at < running_since {
                let update = StatusUpdate::from_job(job, now)
                    .status(JobStatus::Pending)
                    .due_at(now);
                job.apply(&update);
                requeued.push(job.id.clone());
            }
        }
        requeued.sort();
        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::super::contract;
    use super::*;

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        contract::get_missing_is_not_found(&MemoryJobStore::new()).await;
    }

    #[tokio::test]
    async fn test_put_rejects_duplicates() {
        contract::put_rejects_duplicates(&MemoryJobStore::new(), Utc::now()).await;
    }

    #[tokio::test]
    async fn test_list_due_orders_by_due_then_fifo() {
        contract::list_due_orders_by_due_then_fifo(&MemoryJobStore::new(), Utc::now()).await;
    }

    #[tokio::test]
    async fn test_list_due_skips_non_pending() {
        contract::list_due_skips_non_pending(&MemoryJobStore::new(), Utc::now()).await;
    }

    #[tokio::test]
    async fn test_cas_claims_once() {
        contract::cas_claims_once(&MemoryJobStore::new(), Utc::now()).await;
    }

    #[tokio::test]
    async fn test_changes_read_stored_record() {
        contract::changes_read_stored_record(&MemoryJobStore::new(), Utc::now()).await;
    }

    #[tokio::test]
    async fn test_terminal_is_final() {
        contract::terminal_is_final(&MemoryJobStore::new(), Utc::now()).await;
    }

    #[tokio::test]
    async fn test_succeeded_is_idempotent() {
        contract::succeeded_is_idempotent(&MemoryJobStore::new(), Utc::now()).await;
    }

    #[tokio::test]
    async fn test_remove_and_list() {
        contract::remove_and_list(&MemoryJobStore::new(), Utc::now()).await;
    }

    #[tokio::test]
    async fn test_requeue_stale_running() {
        contract::requeue_stale_running(&MemoryJobStore::new(), Utc::now()).await;
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        use std::sync::Arc;

        let store = Arc::new(MemoryJobStore::new());
        let now = Utc::now();
        let job = contract::publish_job("p", "twitter", now);
        store.put(job.clone()).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            let job = job.clone();
            handles.push(tokio::spawn(async move {
                store
                    .compare_and_swap(
                        &job.id,
                        JobStatus::Pending,
                        StatusUpdate::from_job(&job, now)
                            .status(JobStatus::Running)
                            .attempt(1),
                    )
                    .await
                    .is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
