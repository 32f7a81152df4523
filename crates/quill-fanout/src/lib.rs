//! Post fan-out for Quill.
//!
//! A post names several target platforms. This crate turns a post into one
//! publish job per target plus an optional reminder, tracks each target's
//! outcome, and derives the post's overall status from them.

mod coordinator;
mod engine;
mod error;
mod post;
mod store;
mod tracker;

pub use coordinator::{FanoutCoordinator, ReportKind, TargetReport};
pub use engine::{Engine, EngineBuilder, EngineHandle};
pub use error::{FanoutError, PostStoreError};
pub use post::{ChangeRejected, Post, PostChange, PostStatus, PostTarget, TargetStatus};
pub use store::{MemoryPostStore, PostStore, SqlitePostStore};
pub use tracker::StatusTracker;
