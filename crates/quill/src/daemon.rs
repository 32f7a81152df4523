//! The `run` command: host the engine until interrupted.

use std::path::Path;
use std::sync::Arc;

use miette::Result;
use tracing::{info, warn};

use quill_fanout::{Engine, SqlitePostStore};
use quill_scheduler::{RetryPolicy, SchedulerConfig, SqliteJobStore};
use quill_webhook::{WebhookConfig, WebhookNotifier, WebhookPublisher};

use crate::adapters::{LogNotifier, LogPublisher, RoutingNotifier, RoutingPublisher};

/// Everything the daemon needs besides the database path.
pub struct DaemonConfig {
    pub scheduler: SchedulerConfig,
    pub retry: RetryPolicy,
    pub webhooks: WebhookConfig,
    /// Log every delivery instead of sending it.
    pub dry_run: bool,
}

pub async fn run(db: &Path, config: DaemonConfig) -> Result<()> {
    let jobs = SqliteJobStore::open(db)
        .map_err(|e| miette::miette!("failed to open job store: {}", e))?;
    let posts = SqlitePostStore::open(db)
        .map_err(|e| miette::miette!("failed to open post store: {}", e))?;

    let (publisher, notifier) = if config.dry_run {
        info!("dry run, nothing will be delivered");
        (
            RoutingPublisher::Log(LogPublisher),
            RoutingNotifier::Log(LogNotifier),
        )
    } else {
        build_adapters(&config.webhooks)?
    };

    let engine = Engine::builder(Arc::new(jobs), Arc::new(posts))
        .publisher(Arc::new(publisher))
        .notifier(Arc::new(notifier))
        .config(config.scheduler)
        .retry_policy(config.retry)
        .build()
        .map_err(|e| miette::miette!("failed to build engine: {}", e))?;

    let handle = engine.start();

    // Handle shutdown signals
    let shutdown_tx = handle.shutdown_sender();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    info!(db = %db.display(), "quill daemon running");
    handle.join().await;
    Ok(())
}

fn build_adapters(webhooks: &WebhookConfig) -> Result<(RoutingPublisher, RoutingNotifier)> {
    if webhooks.endpoints.is_empty() {
        warn!("no publish webhooks configured, every target will fail");
    } else {
        info!(
            platforms = ?webhooks.endpoints.keys().collect::<Vec<_>>(),
            "publishing via webhooks"
        );
    }
    let publisher = WebhookPublisher::new(webhooks)
        .map_err(|e| miette::miette!("invalid webhook configuration: {}", e))?;

    let notifier = match webhooks.notify_url {
        Some(_) => RoutingNotifier::Webhook(
            WebhookNotifier::new(webhooks)
                .map_err(|e| miette::miette!("invalid notify webhook: {}", e))?,
        ),
        None => {
            warn!("no notify webhook configured, reminders will fail");
            RoutingNotifier::Unconfigured
        }
    };

    Ok((RoutingPublisher::Webhook(publisher), notifier))
}
