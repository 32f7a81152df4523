//! Shared HTTP plumbing for the adapters.

use std::time::Duration;

use reqwest::{Client, Response, Url};
use serde::Serialize;
use tracing::debug;

use crate::WebhookError;

/// Longest error body kept in an error message.
const MAX_ERROR_BODY: usize = 512;

pub(crate) fn parse_url(url: &str) -> Result<Url, WebhookError> {
    let parsed = Url::parse(url).map_err(|e| WebhookError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(WebhookError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme {}", other),
        }),
    }
}

#[derive(Debug, Clone)]
pub(crate) struct WebhookClient {
    http: Client,
    auth_token: Option<String>,
}

impl WebhookClient {
    pub(crate) fn new(timeout: Duration, auth_token: Option<String>) -> Result<Self, WebhookError> {
        let http = Client::builder()
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .timeout(timeout)
            .build()?;
        Ok(Self { http, auth_token })
    }

    /// POST `body` as JSON; any non-2xx status becomes an error.
    pub(crate) async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &Url,
        body: &T,
    ) -> Result<Response, WebhookError> {
        let mut request = self.http.post(url.clone()).json(body);
        if let Some(token) = &self.auth_token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request.send().await?;
        let status = response.status();
        debug!(%url, %status, "webhook responded");
        if status.is_success() {
            return Ok(response);
        }

        let mut body = response
            .text()
            .await
            .unwrap_or_else(|e| format!("<unreadable body: {}>", e));
        if body.len() > MAX_ERROR_BODY {
            let mut end = MAX_ERROR_BODY;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
        }
        Err(WebhookError::Status {
            status: status.as_u16(),
            body,
        })
    }
}
