//! Post persistence.

mod memory;
mod sqlite;

pub use memory::MemoryPostStore;
pub use sqlite::SqlitePostStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{Post, PostChange, PostStoreError};
use quill_scheduler::PostId;

/// Durable storage for posts.
#[async_trait]
pub trait PostStore: Send + Sync {
    /// Insert a new post.
    async fn insert(&self, post: Post) -> Result<(), PostStoreError>;

    /// Fetch a post by id.
    async fn get(&self, id: &PostId) -> Result<Post, PostStoreError>;

    /// Apply one change atomically and return the updated post.
    async fn update(
        &self,
        id: &PostId,
        change: PostChange,
        at: DateTime<Utc>,
    ) -> Result<Post, PostStoreError>;
}
