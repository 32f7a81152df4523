//! Error types for the webhook adapters.

use thiserror::Error;

use quill_scheduler::{NotifyError, PublishError};

/// Errors that can occur when calling a webhook.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// The request could not be sent or the response not read.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The endpoint answered with a non-success status.
    #[error("webhook returned {status}: {body}")]
    Status { status: u16, body: String },

    /// A success response did not carry what we need.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// A configured endpoint is not a usable URL.
    #[error("invalid webhook url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// No endpoint is configured for this platform.
    #[error("no webhook endpoint configured for {0}")]
    NoEndpoint(String),
}

impl WebhookError {
    /// Whether the same request may succeed later.
    ///
    /// Transport failures, timeouts, 408, 429 and 5xx are retryable. Every
    /// other failure is permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            WebhookError::Http(e) => !e.is_builder() && !e.is_decode(),
            WebhookError::Status { status, .. } => {
                matches!(status, 408 | 429) || (500..600).contains(status)
            }
            WebhookError::InvalidResponse(_)
            | WebhookError::InvalidUrl { .. }
            | WebhookError::NoEndpoint(_) => false,
        }
    }
}

impl From<WebhookError> for PublishError {
    fn from(e: WebhookError) -> Self {
        if e.is_retryable() {
            PublishError::retryable(e.to_string())
        } else {
            PublishError::permanent(e.to_string())
        }
    }
}

impl From<WebhookError> for NotifyError {
    fn from(e: WebhookError) -> Self {
        if e.is_retryable() {
            NotifyError::retryable(e.to_string())
        } else {
            NotifyError::permanent(e.to_string())
        }
    }
}
