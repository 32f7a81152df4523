//! HTTP adapters for Quill.
//!
//! [`WebhookPublisher`] and [`WebhookNotifier`] deliver posts and
//! notifications as JSON POSTs, so the engine can be hosted against any
//! service that accepts a webhook.

mod client;
mod config;
mod error;
mod notifier;
mod publisher;

pub use config::{WebhookConfig, parse_endpoint};
pub use error::WebhookError;
pub use notifier::WebhookNotifier;
pub use publisher::WebhookPublisher;
