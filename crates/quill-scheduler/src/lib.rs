//! Durable delayed-job scheduler for Quill.
//!
//! This crate provides:
//! - A job model with an enforced status transition table
//! - Memory and SQLite job stores with atomic claim and compare-and-swap
//! - A scheduler that claims due jobs and survives restarts
//! - A bounded worker pool with per-call timeouts and exponential backoff

pub mod action;
mod clock;
mod config;
mod dispatcher;
mod error;
mod retry;
mod scheduler;
mod store;
pub mod testing;
mod types;

pub use action::{
    ExecutionError, ExternalPostId, JobObserver, JobOutcome, NoopObserver, NotifyError, Notifier,
    ObserverError, PublishError, Publisher,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SchedulerConfig;
pub use dispatcher::{Dispatcher, JobExecutor};
pub use error::{SchedulerError, StoreError};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::Scheduler;
pub use store::{JobChange, JobStore, MemoryJobStore, SqliteJobStore};
pub use types::{
    Job, JobFilter, JobId, JobKind, JobPayload, JobStatus, Platform, PostId, StatusUpdate,
};
