//! Publishers and notifiers the daemon delivers through.
//!
//! Outside a dry run everything goes over HTTP, and a platform without a
//! webhook fails permanently so its target is reported as failed. A dry run
//! logs every delivery and reports it as sent.

use async_trait::async_trait;
use tracing::info;

use quill_scheduler::{ExternalPostId, NotifyError, Notifier, Platform, PublishError, Publisher};
use quill_webhook::{WebhookError, WebhookNotifier, WebhookPublisher};

/// Publisher that only logs what it would have sent.
#[derive(Debug, Default)]
pub struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    async fn publish(
        &self,
        platform: &Platform,
        content: &str,
    ) -> Result<ExternalPostId, PublishError> {
        let id = ExternalPostId::new(format!("dry-run-{}", uuid::Uuid::new_v4()));
        info!(%platform, external_id = %id, chars = content.chars().count(), "dry run: post not sent");
        Ok(id)
    }
}

/// Notifier that only logs what it would have sent.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, user_id: &str, message: &str) -> Result<(), NotifyError> {
        info!(%user_id, %message, "dry run: notification not sent");
        Ok(())
    }
}

/// Webhook publishing, or the log in a dry run.
pub enum RoutingPublisher {
    Webhook(WebhookPublisher),
    Log(LogPublisher),
}

#[async_trait]
impl Publisher for RoutingPublisher {
    async fn publish(
        &self,
        platform: &Platform,
        content: &str,
    ) -> Result<ExternalPostId, PublishError> {
        match self {
            RoutingPublisher::Webhook(webhook) => webhook.publish(platform, content).await,
            RoutingPublisher::Log(log) => log.publish(platform, content).await,
        }
    }
}

/// Webhook notifier, the log in a dry run, or nothing when no notify URL
/// is configured.
pub enum RoutingNotifier {
    Webhook(WebhookNotifier),
    Log(LogNotifier),
    Unconfigured,
}

#[async_trait]
impl Notifier for RoutingNotifier {
    async fn send(&self, user_id: &str, message: &str) -> Result<(), NotifyError> {
        match self {
            RoutingNotifier::Webhook(webhook) => webhook.send(user_id, message).await,
            RoutingNotifier::Log(log) => log.send(user_id, message).await,
            RoutingNotifier::Unconfigured => {
                Err(WebhookError::NoEndpoint("notifications".to_string()).into())
            }
        }
    }
}
