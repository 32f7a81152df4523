//! Sends user notifications to a single webhook.

use async_trait::async_trait;
use reqwest::Url;
use serde::Serialize;
use tracing::warn;

use quill_scheduler::{NotifyError, Notifier};

use crate::client::{WebhookClient, parse_url};
use crate::{WebhookConfig, WebhookError};

#[derive(Serialize)]
struct NotifyRequest<'a> {
    user_id: &'a str,
    message: &'a str,
}

/// [`Notifier`] that POSTs `{"user_id", "message"}` to the notify URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: WebhookClient,
    url: Url,
}

impl WebhookNotifier {
    /// Build a notifier; the config must carry a notify URL.
    pub fn new(config: &WebhookConfig) -> Result<Self, WebhookError> {
        let url = config
            .notify_url
            .as_deref()
            .ok_or_else(|| WebhookError::NoEndpoint("notifications".to_string()))?;
        Ok(Self {
            url: parse_url(url)?,
            client: WebhookClient::new(config.timeout, config.auth_token.clone())?,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, user_id: &str, message: &str) -> Result<(), NotifyError> {
        self.client
            .post_json(&self.url, &NotifyRequest { user_id, message })
            .await
            .map(|_| ())
            .map_err(|e| {
                warn!(%user_id, error = %e, retryable = e.is_retryable(), "webhook notify failed");
                NotifyError::from(e)
            })
    }
}
