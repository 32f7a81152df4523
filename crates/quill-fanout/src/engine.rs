//! Wires the job store, post store, scheduler and workers together.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use quill_scheduler::{
    Clock, Dispatcher, JobExecutor, JobStore, Notifier, Publisher, RetryPolicy, Scheduler,
    SchedulerConfig, SystemClock,
};

use crate::{FanoutCoordinator, FanoutError, PostStore, StatusTracker};

/// Builder for an [`Engine`].
pub struct EngineBuilder {
    jobs: Arc<dyn JobStore>,
    posts: Arc<dyn PostStore>,
    publisher: Option<Arc<dyn Publisher>>,
    notifier: Option<Arc<dyn Notifier>>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    policy: RetryPolicy,
}

impl EngineBuilder {
    pub fn publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> Result<Engine, FanoutError> {
        let publisher = self
            .publisher
            .ok_or(FanoutError::MissingComponent("publisher"))?;
        let notifier = self
            .notifier
            .ok_or(FanoutError::MissingComponent("notifier"))?;

        let tracker = StatusTracker::new(Arc::clone(&self.posts), Arc::clone(&self.clock));
        let executor = JobExecutor::new(
            Arc::clone(&self.jobs),
            Arc::clone(&self.clock),
            publisher,
            notifier,
        )
        .with_observer(Arc::new(tracker))
        .with_policy(self.policy)
        .with_call_timeout(self.config.call_timeout);

        let scheduler = Arc::new(Scheduler::new(self.jobs, self.clock, self.config));
        let coordinator = Arc::new(FanoutCoordinator::new(Arc::clone(&scheduler), self.posts));

        Ok(Engine {
            scheduler,
            coordinator,
            executor: Arc::new(executor),
        })
    }
}

/// A configured scheduler with its coordinator and executor.
///
/// Several engines may share one job store; the store's compare-and-swap
/// keeps each job to a single claimer.
pub struct Engine {
    scheduler: Arc<Scheduler>,
    coordinator: Arc<FanoutCoordinator>,
    executor: Arc<JobExecutor>,
}

impl Engine {
    pub fn builder(jobs: Arc<dyn JobStore>, posts: Arc<dyn PostStore>) -> EngineBuilder {
        EngineBuilder {
            jobs,
            posts,
            publisher: None,
            notifier: None,
            clock: Arc::new(SystemClock),
            config: SchedulerConfig::default(),
            policy: RetryPolicy::default(),
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn coordinator(&self) -> &Arc<FanoutCoordinator> {
        &self.coordinator
    }

    /// Start a worker pool for driving the scheduler by hand with
    /// [`Scheduler::poll_once`].
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::start(Arc::clone(&self.executor), self.scheduler.config().workers())
    }

    /// Spawn the scan loop and its workers.
    pub fn start(&self) -> EngineHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = Arc::new(self.dispatcher());

        let scheduler = Arc::clone(&self.scheduler);
        let loop_dispatcher = Arc::clone(&dispatcher);
        let task = tokio::spawn(async move {
            scheduler.run(shutdown_rx, &loop_dispatcher).await;
        });

        info!(workers = self.scheduler.config().workers(), "engine started");
        EngineHandle {
            shutdown_tx,
            task,
            dispatcher,
        }
    }
}

/// Handle to a running engine.
pub struct EngineHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    dispatcher: Arc<Dispatcher>,
}

impl EngineHandle {
    /// A sender that stops the engine when `true` is sent, for signal handlers.
    pub fn shutdown_sender(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Wait until every claimed job has finished.
    pub async fn wait_idle(&self) {
        self.dispatcher.wait_idle().await;
    }

    /// Wait for the scan loop to exit, whoever signalled it.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!(error = %e, "scheduler task ended abnormally");
        }
        self.dispatcher.shutdown().await;
        info!("engine stopped");
    }

    /// Stop scanning, let running jobs finish, and join every task.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        self.join().await;
    }
}
