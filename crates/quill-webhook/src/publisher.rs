//! Publishes posts by POSTing them to a per-platform webhook.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use quill_scheduler::{ExternalPostId, Platform, PublishError, Publisher};

use crate::client::{WebhookClient, parse_url};
use crate::{WebhookConfig, WebhookError};

#[derive(Serialize)]
struct PublishRequest<'a> {
    platform: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct PublishResponse {
    id: Option<Value>,
}

/// [`Publisher`] that sends `{"platform", "content"}` to the endpoint
/// configured for the target platform and expects `{"id"}` back.
#[derive(Debug, Clone)]
pub struct WebhookPublisher {
    client: WebhookClient,
    endpoints: HashMap<Platform, Url>,
}

impl WebhookPublisher {
    /// Build a publisher from the configured endpoints.
    ///
    /// Fails if any endpoint is not an http(s) URL.
    pub fn new(config: &WebhookConfig) -> Result<Self, WebhookError> {
        let endpoints = config
            .endpoints
            .iter()
            .map(|(platform, url)| Ok((Platform::new(platform), parse_url(url)?)))
            .collect::<Result<HashMap<_, _>, WebhookError>>()?;
        let client = WebhookClient::new(config.timeout, config.auth_token.clone())?;
        Ok(Self { client, endpoints })
    }

    /// Whether an endpoint is configured for `platform`.
    pub fn handles(&self, platform: &Platform) -> bool {
        self.endpoints.contains_key(platform)
    }

    #[tracing::instrument(skip(self, content), fields(platform = %platform))]
    async fn try_publish(
        &self,
        platform: &Platform,
        content: &str,
    ) -> Result<ExternalPostId, WebhookError> {
        let url = self
            .endpoints
            .get(platform)
            .ok_or_else(|| WebhookError::NoEndpoint(platform.to_string()))?;

        let response = self
            .client
            .post_json(
                url,
                &PublishRequest {
                    platform: platform.as_str(),
                    content,
                },
            )
            .await?;

        let body: PublishResponse = response
            .json()
            .await
            .map_err(|e| WebhookError::InvalidResponse(format!("unreadable body: {}", e)))?;
        let id = match body.id {
            Some(Value::String(id)) if !id.is_empty() => id,
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(WebhookError::InvalidResponse(
                    "response has no post id".to_string(),
                ));
            }
        };

        debug!(external_id = %id, "published via webhook");
        Ok(ExternalPostId::new(id))
    }
}

#[async_trait]
impl Publisher for WebhookPublisher {
    async fn publish(
        &self,
        platform: &Platform,
        content: &str,
    ) -> Result<ExternalPostId, PublishError> {
        self.try_publish(platform, content).await.map_err(|e| {
            warn!(%platform, error = %e, retryable = e.is_retryable(), "webhook publish failed");
            PublishError::from(e)
        })
    }
}
