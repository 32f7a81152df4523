//! Error types for post fan-out.

use thiserror::Error;

use quill_scheduler::{Platform, PostId, SchedulerError};

/// Errors returned by a [`PostStore`](crate::PostStore).
#[derive(Debug, Error)]
pub enum PostStoreError {
    /// No post with this id.
    #[error("post not found: {0}")]
    NotFound(PostId),

    /// A post with this id already exists.
    #[error("post already exists: {0}")]
    Duplicate(PostId),

    /// The change does not apply to the post's current state.
    #[error("cannot update post {post_id}: {reason}")]
    Rejected { post_id: PostId, reason: String },

    /// The store could not be reached or failed to execute the operation.
    #[error("post store unavailable: {0}")]
    Unavailable(String),

    /// A stored record could not be decoded.
    #[error("corrupt post record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

impl PostStoreError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, PostStoreError::Unavailable(_))
    }
}

impl From<rusqlite::Error> for PostStoreError {
    fn from(e: rusqlite::Error) -> Self {
        PostStoreError::Unavailable(e.to_string())
    }
}

/// Errors that can occur in coordinator and engine operations.
#[derive(Debug, Error)]
pub enum FanoutError {
    /// Post not found.
    #[error("post not found: {0}")]
    PostNotFound(PostId),

    /// The post has no target for this platform.
    #[error("post {post_id} has no target {platform}")]
    UnknownTarget { post_id: PostId, platform: Platform },

    /// Jobs were already created for this post.
    #[error("post {0} is already scheduled")]
    AlreadyScheduled(PostId),

    /// The post has not been scheduled yet.
    #[error("post {0} is not scheduled")]
    NotScheduled(PostId),

    /// The post cannot be created as given.
    #[error("invalid post: {0}")]
    InvalidPost(String),

    /// A required engine component was not supplied.
    #[error("engine is missing a {0}")]
    MissingComponent(&'static str),

    /// Scheduler error.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// Post store error.
    #[error(transparent)]
    PostStore(PostStoreError),
}

impl From<PostStoreError> for FanoutError {
    fn from(e: PostStoreError) -> Self {
        match e {
            PostStoreError::NotFound(id) => FanoutError::PostNotFound(id),
            other => FanoutError::PostStore(other),
        }
    }
}
