//! In-process post store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::PostStore;
use crate::{Post, PostChange, PostStoreError};
use quill_scheduler::PostId;

/// Post store backed by a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryPostStore {
    posts: DashMap<PostId, Post>,
}

impl MemoryPostStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PostStore for MemoryPostStore {
    async fn insert(&self, post: Post) -> Result<(), PostStoreError> {
        match self.posts.entry(post.id.clone()) {
            Entry::Occupied(_) => Err(PostStoreError::Duplicate(post.id)),
            Entry::Vacant(slot) => {
                slot.insert(post);
                Ok(())
            }
        }
    }

    async fn get(&self, id: &PostId) -> Result<Post, PostStoreError> {
        self.posts
            .get(id)
            .map(|post| post.clone())
            .ok_or_else(|| PostStoreError::NotFound(id.clone()))
    }

    async fn update(
        &self,
        id: &PostId,
        change: PostChange,
        at: DateTime<Utc>,
    ) -> Result<Post, PostStoreError> {
        let mut post = self
            .posts
            .get_mut(id)
            .ok_or_else(|| PostStoreError::NotFound(id.clone()))?;

        // Work on a copy so a rejected change leaves the record untouched.
        let mut next = post.clone();
        next.apply(change, at)
            .map_err(|e| PostStoreError::Rejected {
                post_id: id.clone(),
                reason: e.0,
            })?;
        *post = next.clone();
        Ok(next)
    }
}
