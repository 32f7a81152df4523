//! Webhook endpoint configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::WebhookError;

/// Where to deliver posts and notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Publish endpoint per platform name.
    pub endpoints: BTreeMap<String, String>,
    /// Endpoint for user notifications.
    pub notify_url: Option<String>,
    /// Sent as a bearer token when set.
    pub auth_token: Option<String>,
    /// Timeout for a whole request.
    pub timeout: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            endpoints: BTreeMap::new(),
            notify_url: None,
            auth_token: None,
            timeout: Duration::from_secs(30),
        }
    }
}

impl WebhookConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endpoint(mut self, platform: impl Into<String>, url: impl Into<String>) -> Self {
        self.endpoints.insert(platform.into(), url.into());
        self
    }

    pub fn with_notify_url(mut self, url: impl Into<String>) -> Self {
        self.notify_url = Some(url.into());
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Parse a `platform=url` pair as given on the command line.
pub fn parse_endpoint(s: &str) -> Result<(String, String), WebhookError> {
    let (platform, url) = s.split_once('=').ok_or_else(|| WebhookError::InvalidUrl {
        url: s.to_string(),
        reason: "expected platform=url".to_string(),
    })?;
    let platform = platform.trim();
    if platform.is_empty() {
        return Err(WebhookError::InvalidUrl {
            url: s.to_string(),
            reason: "platform name is empty".to_string(),
        });
    }
    Ok((platform.to_string(), url.trim().to_string()))
}
