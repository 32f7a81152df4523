//! Records job outcomes on their posts.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use quill_scheduler::{Clock, Job, JobObserver, JobOutcome, JobPayload, ObserverError};

use crate::{Post, PostChange, PostStore, PostStoreError};

/// Observer that turns finished publish jobs into target status changes.
///
/// Only the store's transient errors are handed back for retry; a change
/// the post rejects is logged and dropped.
pub struct StatusTracker {
    posts: Arc<dyn PostStore>,
    clock: Arc<dyn Clock>,
}

impl StatusTracker {
    pub fn new(posts: Arc<dyn PostStore>, clock: Arc<dyn Clock>) -> Self {
        Self { posts, clock }
    }

    async fn record(&self, job: &Job, change: PostChange) -> Result<(), ObserverError> {
        let post_id = job.payload.post_id();
        match self.posts.update(post_id, change, self.clock.now()).await {
            Ok(post) => {
                self.check_late(&post, job);
                info!(%post_id, status = %post.status, "post status updated");
                Ok(())
            }
            Err(e) if e.is_transient() => Err(Box::new(e)),
            Err(PostStoreError::NotFound(_)) => {
                warn!(%post_id, job_id = %job.id, "result for unknown post dropped");
                Ok(())
            }
            Err(e) => {
                error!(%post_id, job_id = %job.id, error = %e, "result could not be recorded");
                Ok(())
            }
        }
    }

    fn check_late(&self, post: &Post, job: &Job) {
        if post.cancel_requested {
            warn!(
                post_id = %post.id,
                job_id = %job.id,
                "job finished after its post was cancelled; outcome recorded"
            );
        }
    }
}

#[async_trait]
impl JobObserver for StatusTracker {
    async fn on_succeeded(&self, job: &Job, outcome: &JobOutcome) -> Result<(), ObserverError> {
        match (&job.payload, outcome) {
            (JobPayload::PublishPost { platform, .. }, JobOutcome::Published(external_id)) => {
                self.record(
                    job,
                    PostChange::TargetPublished {
                        platform: platform.clone(),
                        job_id: job.id.clone(),
                        external_id: external_id.clone(),
                    },
                )
                .await
            }
            (JobPayload::SendNotification { post_id, .. }, _) => {
                debug!(%post_id, job_id = %job.id, "reminder delivered");
                Ok(())
            }
            (JobPayload::PublishPost { .. }, other) => {
                error!(job_id = %job.id, outcome = ?other, "publish job produced no post id");
                Ok(())
            }
        }
    }

    async fn on_failed(&self, job: &Job, reason: &str) -> Result<(), ObserverError> {
        match &job.payload {
            JobPayload::PublishPost { platform, .. } => {
                self.record(
                    job,
                    PostChange::TargetFailed {
                        platform: platform.clone(),
                        job_id: job.id.clone(),
                        reason: reason.to_string(),
                    },
                )
                .await
            }
            JobPayload::SendNotification { post_id, .. } => {
                warn!(%post_id, job_id = %job.id, error = %reason, "reminder could not be delivered");
                Ok(())
            }
        }
    }
}
