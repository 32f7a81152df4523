//! Job scheduler implementation.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use chrono::{DateTime, Utc};
use tokio::sync::{Notify, watch};
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use crate::config::MAX_STORE_BACKOFF;
use crate::{
    Clock, Dispatcher, Job, JobChange, JobFilter, JobId, JobPayload, JobStore, SchedulerConfig,
    SchedulerError, StoreError,
};

/// Minimum sleep between scans.
const MIN_SLEEP: Duration = Duration::from_millis(10);

/// Finds due jobs, claims them and hands them to a [`Dispatcher`].
///
/// Holds no timers of its own: every scan re-reads due times from the
/// store, so cancel and reschedule take effect on the next tick.
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    wake: Notify,
    last_recovery: Mutex<Option<DateTime<Utc>>>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>, config: SchedulerConfig) -> Self {
        Self {
            store,
            clock,
            config,
            wake: Notify::new(),
            last_recovery: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Persist a new pending job. A past `due_at` runs on the next scan.
    pub async fn schedule(
        &self,
        payload: JobPayload,
        due_at: DateTime<Utc>,
    ) -> Result<JobId, SchedulerError> {
        self.schedule_with_id(JobId::generate(), payload, due_at).await
    }

    /// Persist a new pending job under an id the caller reserved earlier.
    #[tracing::instrument(skip(self, payload), fields(kind = %payload.kind(), post_id = %payload.post_id()))]
    pub async fn schedule_with_id(
        &self,
        id: JobId,
        payload: JobPayload,
        due_at: DateTime<Utc>,
    ) -> Result<JobId, SchedulerError> {
        payload.validate().map_err(SchedulerError::InvalidPayload)?;

        let mut job = Job::new(payload, due_at, self.clock.now());
        job.id = id.clone();
        self.store.put(job).await?;
        self.wake.notify_one();

        info!(job_id = %id, %due_at, "scheduled job");
        Ok(id)
    }

    /// Cancel a job that has not started.
    ///
    /// Fails with [`SchedulerError::InFlight`] once a worker has claimed it.
    #[tracing::instrument(skip(self), fields(job_id = %id))]
    pub async fn cancel(&self, id: &JobId) -> Result<Job, SchedulerError> {
        let cancelled = self
            .store
            .apply_change(id, JobChange::Cancel, self.clock.now())
            .await
            .map_err(SchedulerError::from_lost_race)?;

        info!("cancelled job");
        Ok(cancelled)
    }

    /// Move a pending job to a new due time, keeping its id and attempt.
    #[tracing::instrument(skip(self), fields(job_id = %id))]
    pub async fn reschedule(
        &self,
        id: &JobId,
        due_at: DateTime<Utc>,
    ) -> Result<Job, SchedulerError> {
        let moved = self
            .store
            .apply_change(id, JobChange::Reschedule(due_at), self.clock.now())
            .await
            .map_err(SchedulerError::from_lost_race)?;
        self.wake.notify_one();

        info!(to = %due_at, attempt = moved.attempt, "rescheduled job");
        Ok(moved)
    }

    pub async fn get(&self, id: &JobId) -> Result<Job, SchedulerError> {
        self.store.get(id).await.map_err(|e| match e {
            StoreError::NotFound(id) => SchedulerError::JobNotFound(id),
            other => SchedulerError::Store(other),
        })
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, SchedulerError> {
        Ok(self.store.list(filter).await?)
    }

    /// Requeue `Running` jobs whose worker stopped updating them.
    #[tracing::instrument(skip(self))]
    pub async fn recover_stale(&self) -> Result<Vec<JobId>, SchedulerError> {
        let now = self.clock.now();
        let cutoff = chrono::Duration::from_std(self.config.effective_stale_after())
            .ok()
            .and_then(|threshold| now.checked_sub_signed(threshold))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let requeued = self.store.requeue_stale(cutoff, now).await?;
        *self.last_recovery.lock().unwrap_or_else(|e| e.into_inner()) = Some(now);

        if requeued.is_empty() {
            debug!("no stale jobs");
        } else {
            warn!(count = requeued.len(), ids = ?requeued, "requeued stale jobs");
            self.wake.notify_one();
        }
        Ok(requeued)
    }

    fn recovery_due(&self, now: DateTime<Utc>) -> bool {
        let last = *self.last_recovery.lock().unwrap_or_else(|e| e.into_inner());
        match last {
            None => true,
            Some(last) => (now - last)
                .to_std()
                .is_ok_and(|elapsed| elapsed >= self.config.effective_stale_after()),
        }
    }

    /// Scan once: claim every due job and submit it.
    ///
    /// Returns the number of jobs claimed. Each claim is decided against the
    /// stored record, so a job another claimer took, or one cancelled or
    /// moved since the scan, is skipped.
    pub async fn poll_once(&self, dispatcher: &Dispatcher) -> Result<usize, SchedulerError> {
        let now = self.clock.now();
        if self.recovery_due(now) {
            self.recover_stale().await?;
        }

        let due = self.store.list_due(now).await?;
        let mut claimed = 0;

        for job in due {
            let running = match self.store.apply_change(&job.id, JobChange::Claim, now).await {
                Ok(running) => running,
                Err(
                    StoreError::NotFound(_)
                    | StoreError::InvalidTransition { .. }
                    | StoreError::NotDue { .. },
                ) => {
                    trace!(job_id = %job.id, "lost claim race");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if let Err(e) = dispatcher.submit(running.clone()) {
                self.release(&running, now).await;
                return Err(e);
            }
            debug!(job_id = %job.id, attempt = running.attempt, "claimed job");
            claimed += 1;
        }

        Ok(claimed)
    }

    /// Undo a claim that could not be handed to a worker.
    async fn release(&self, job: &Job, now: DateTime<Utc>) {
        if let Err(e) = self.store.apply_change(&job.id, JobChange::Release, now).await {
            warn!(job_id = %job.id, error = %e, "could not release claim; stale recovery will requeue it");
        }
    }

    /// How long to sleep until the next job is due, within the tick interval.
    pub async fn calculate_sleep_duration(&self) -> Result<Duration, StoreError> {
        let now = self.clock.now();
        let tick = self.config.tick_interval.max(MIN_SLEEP);

        Ok(match self.store.next_due_at().await? {
            Some(next) => (next - now).to_std().unwrap_or(MIN_SLEEP).clamp(MIN_SLEEP, tick),
            None => tick,
        })
    }

    /// Backoff between scans while the store is failing.
    fn store_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.config.tick_interval.max(MIN_SLEEP),
            max_interval: MAX_STORE_BACKOFF,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Run the scheduler loop until shutdown is signalled.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>, dispatcher: &Dispatcher) {
        info!(
            tick = ?self.config.tick_interval,
            stale_after = ?self.config.effective_stale_after(),
            "scheduler starting"
        );
        let mut backoff = self.store_backoff();
        let mut failing = false;

        loop {
            if *shutdown_rx.borrow() {
                info!("scheduler shutting down");
                break;
            }

            let scan = match self.poll_once(dispatcher).await {
                Ok(claimed) => {
                    if claimed > 0 {
                        debug!(claimed, "dispatched due jobs");
                    }
                    self.calculate_sleep_duration().await.map_err(SchedulerError::from)
                }
                Err(e) => Err(e),
            };

            let sleep_duration = match scan {
                Ok(duration) => {
                    if failing {
                        info!("job store reachable again");
                        failing = false;
                        backoff.reset();
                    }
                    duration
                }
                Err(SchedulerError::DispatcherClosed) => {
                    warn!("dispatcher closed, stopping scheduler");
                    break;
                }
                Err(e) => {
                    failing = true;
                    // Always Some since max_elapsed_time is None
                    let next = backoff.next_backoff().unwrap_or(MAX_STORE_BACKOFF);
                    warn!(error = %e, retry_in = ?next, "scan failed, backing off");
                    next
                }
            };

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("scheduler received shutdown signal");
                        break;
                    }
                }
                _ = self.wake.notified() => {
                    trace!("scheduler woken early");
                }
                _ = sleep(sleep_duration) => {}
            }
        }

        info!("scheduler shut down gracefully");
    }
}
