//! Worker pool that executes claimed jobs.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::action::{ExecutionError, JobObserver, JobOutcome, NoopObserver, Notifier, Publisher};
use crate::{
    Clock, Job, JobPayload, JobStatus, JobStore, RetryDecision, RetryPolicy, SchedulerError,
    StatusUpdate, StoreError,
};

const PERSIST_INITIAL_INTERVAL: Duration = Duration::from_millis(50);
const PERSIST_MAX_INTERVAL: Duration = Duration::from_secs(2);
const OBSERVER_MAX_ELAPSED: Duration = Duration::from_secs(60);

/// Status writes retry until the store comes back.
fn persist_backoff() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(PERSIST_INITIAL_INTERVAL)
        .with_max_interval(PERSIST_MAX_INTERVAL)
        .with_max_elapsed_time(None)
        .build()
}

fn observer_backoff() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(PERSIST_INITIAL_INTERVAL)
        .with_max_interval(PERSIST_MAX_INTERVAL)
        .with_max_elapsed_time(Some(OBSERVER_MAX_ELAPSED))
        .build()
}

/// Runs one claimed job and records the result.
pub struct JobExecutor {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    publisher: Arc<dyn Publisher>,
    notifier: Arc<dyn Notifier>,
    observer: Arc<dyn JobObserver>,
    policy: RetryPolicy,
    call_timeout: Duration,
}

impl JobExecutor {
    pub fn new(
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        publisher: Arc<dyn Publisher>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            clock,
            publisher,
            notifier,
            observer: Arc::new(NoopObserver),
            policy: RetryPolicy::default(),
            call_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn JobObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Execute a job already claimed as `Running` and persist the outcome.
    ///
    /// Returns the status written. Execution failures never surface here;
    /// only a status write that could not be made does.
    #[tracing::instrument(skip(self, job), fields(job_id = %job.id, kind = %job.kind(), attempt = job.attempt))]
    pub async fn execute(&self, job: Job) -> Result<JobStatus, StoreError> {
        debug!("executing job");

        match self.perform(&job).await {
            Ok(outcome) => {
                let update = StatusUpdate::from_job(&job, self.clock.now())
                    .status(JobStatus::Succeeded)
                    .last_error(None);
                let done = self.persist(&job, update).await?;
                info!(post_id = %job.payload.post_id(), "job succeeded");
                self.notify_succeeded(&done, &outcome).await;
                Ok(JobStatus::Succeeded)
            }
            Err(failure) => self.handle_failure(&job, failure).await,
        }
    }

    async fn perform(&self, job: &Job) -> Result<JobOutcome, ExecutionError> {
        let call = async {
            match &job.payload {
                JobPayload::PublishPost {
                    platform, content, ..
                } => self
                    .publisher
                    .publish(platform, content)
                    .await
                    .map(JobOutcome::Published)
                    .map_err(ExecutionError::from),
                JobPayload::SendNotification {
                    user_id, message, ..
                } => self
                    .notifier
                    .send(user_id, message)
                    .await
                    .map(|()| JobOutcome::Notified)
                    .map_err(ExecutionError::from),
            }
        };

        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ExecutionError::Retryable(format!(
                "call timed out after {:?}",
                self.call_timeout
            ))),
        }
    }

    async fn handle_failure(
        &self,
        job: &Job,
        failure: ExecutionError,
    ) -> Result<JobStatus, StoreError> {
        let now = self.clock.now();
        let reason = failure.reason().to_string();

        match self.policy.decide(job.attempt, failure.is_retryable()) {
            RetryDecision::Retry { delay } => {
                let due_at = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|d| now.checked_add_signed(d))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                let update = StatusUpdate::from_job(job, now)
                    .status(JobStatus::Pending)
                    .due_at(due_at)
                    .last_error(Some(reason.clone()));
                self.persist(job, update).await?;
                warn!(error = %reason, retry_in = ?delay, %due_at, "job failed, will retry");
                Ok(JobStatus::Pending)
            }
            RetryDecision::GiveUp => {
                let update = StatusUpdate::from_job(job, now)
                    .status(JobStatus::Failed)
                    .last_error(Some(reason.clone()));
                let failed = self.persist(job, update).await?;
                error!(
                    error = %reason,
                    retryable = failure.is_retryable(),
                    "job failed permanently"
                );
                self.notify_failed(&failed, &reason).await;
                Ok(JobStatus::Failed)
            }
        }
    }

    /// CAS the job out of `Running`, retrying for as long as the store is
    /// unavailable.
    async fn persist(&self, job: &Job, update: StatusUpdate) -> Result<Job, StoreError> {
        let op = || {
            let update = update.clone();
            async move {
                self.store
                    .compare_and_swap(&job.id, JobStatus::Running, update)
                    .await
                    .map_err(|e| {
                        if e.is_transient() {
                            warn!(error = %e, "status write failed, retrying");
                            backoff::Error::transient(e)
                        } else {
                            backoff::Error::permanent(e)
                        }
                    })
            }
        };
        backoff::future::retry(persist_backoff(), op)
            .await
            .inspect_err(|e| {
                error!(error = %e, to = %update.status, "could not record job result");
            })
    }

    async fn notify_succeeded(&self, job: &Job, outcome: &JobOutcome) {
        let op = || async move {
            self.observer
                .on_succeeded(job, outcome)
                .await
                .map_err(backoff::Error::transient)
        };
        if let Err(e) = backoff::future::retry(observer_backoff(), op).await {
            error!(error = %e, "observer rejected success");
        }
    }

    async fn notify_failed(&self, job: &Job, reason: &str) {
        let op = || async move {
            self.observer
                .on_failed(job, reason)
                .await
                .map_err(backoff::Error::transient)
        };
        if let Err(e) = backoff::future::retry(observer_backoff(), op).await {
            error!(error = %e, "observer rejected failure");
        }
    }
}

/// Fixed pool of workers fed by an unbounded queue.
///
/// Admission is bounded by the worker count; the queue only holds jobs
/// that are already claimed.
pub struct Dispatcher {
    tx: std::sync::Mutex<Option<mpsc::UnboundedSender<Job>>>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl Dispatcher {
    /// Spawn `workers` tasks running jobs through `executor`.
    pub fn start(executor: Arc<JobExecutor>, workers: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(Mutex::new(rx));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let idle = Arc::new(Notify::new());

        let handles = (0..workers.max(1))
            .map(|worker| {
                tokio::spawn(worker_loop(
                    worker,
                    Arc::clone(&rx),
                    Arc::clone(&executor),
                    Arc::clone(&in_flight),
                    Arc::clone(&idle),
                ))
            })
            .collect();

        info!(workers = workers.max(1), "dispatcher started");
        Self {
            tx: std::sync::Mutex::new(Some(tx)),
            workers: std::sync::Mutex::new(handles),
            in_flight,
            idle,
        }
    }

    /// Queue a claimed job. Never blocks.
    pub fn submit(&self, job: Job) -> Result<(), SchedulerError> {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = tx.as_ref() else {
            return Err(SchedulerError::DispatcherClosed);
        };

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if tx.send(job).is_err() {
            self.finish_one();
            return Err(SchedulerError::DispatcherClosed);
        }
        Ok(())
    }

    /// Jobs submitted but not yet finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until every submitted job has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting jobs, let workers drain the queue, then join them.
    pub async fn shutdown(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        let handles: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task ended abnormally");
            }
        }
        info!("dispatcher shut down");
    }

    fn finish_one(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

async fn worker_loop(
    worker: usize,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>,
    executor: Arc<JobExecutor>,
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
) {
    loop {
        let job = { rx.lock().await.recv().await };
        let Some(job) = job else {
            debug!(worker, "queue closed, worker exiting");
            break;
        };

        let job_id = job.id.clone();
        let executor = Arc::clone(&executor);
        // A panicking action must not take the worker down with it.
        match tokio::spawn(async move { executor.execute(job).await }).await {
            Ok(Ok(status)) => debug!(worker, %job_id, %status, "job finished"),
            Ok(Err(e)) => error!(worker, %job_id, error = %e, "job result lost"),
            Err(e) => error!(worker, %job_id, error = %e, "job execution panicked"),
        }

        if in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            idle.notify_waiters();
        }
    }
}
