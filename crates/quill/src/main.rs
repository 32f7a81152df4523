//! Quill: scheduled multi-platform post delivery
//!
//! Main binary with subcommands:
//! - `run`: Host the scheduler and workers until interrupted
//! - `post`: Create, schedule, inspect, cancel and reschedule posts
//! - `job`: Inspect and manage individual jobs

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quill_scheduler::{JobStatus, RetryPolicy, SchedulerConfig};
use quill_webhook::{WebhookConfig, parse_endpoint};

mod adapters;
mod commands;
mod daemon;

use commands::{parse_duration, parse_time};

/// Parse boolean from environment variable, accepting common truthy values.
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Accepts "0", "false", "no", "off", "" (case-insensitive) as false.
fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

fn parse_job_status(s: &str) -> Result<JobStatus, String> {
    s.parse()
}

#[derive(Parser)]
#[command(name = "quill")]
#[command(about = "Scheduled multi-platform post delivery", long_about = None)]
struct Cli {
    /// SQLite database holding jobs and posts
    #[arg(long, global = true, env = "QUILL_DB", default_value = "quill.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler and workers until interrupted
    Run {
        /// Number of concurrent workers
        #[arg(long, env = "QUILL_WORKERS", default_value = "10")]
        workers: usize,

        /// Longest time between scans, in milliseconds
        #[arg(long, env = "QUILL_TICK_MS", default_value = "1000")]
        tick_ms: u64,

        /// Timeout for a single publish or notify call, in seconds
        #[arg(long, env = "QUILL_CALL_TIMEOUT", default_value = "30")]
        call_timeout: u64,

        /// Requeue running jobs not updated for this many seconds
        #[arg(long, env = "QUILL_STALE_AFTER", default_value = "600")]
        stale_after: u64,

        /// Delay before the first retry, in seconds
        #[arg(long, env = "QUILL_RETRY_BASE", default_value = "5")]
        retry_base: u64,

        /// Attempts after which a job fails
        #[arg(long, env = "QUILL_MAX_ATTEMPTS", default_value = "5")]
        max_attempts: u32,

        /// Upper bound on a single retry delay, in seconds
        #[arg(long, env = "QUILL_RETRY_MAX")]
        retry_max: Option<u64>,

        /// Publish webhook as platform=url; repeatable
        #[arg(long = "webhook", env = "QUILL_WEBHOOKS", value_delimiter = ',')]
        webhooks: Vec<String>,

        /// Webhook receiving reminder notifications
        #[arg(long, env = "QUILL_NOTIFY_URL")]
        notify_url: Option<String>,

        /// Bearer token sent to every webhook
        #[arg(long, env = "QUILL_WEBHOOK_TOKEN", hide_env_values = true)]
        webhook_token: Option<String>,

        /// Log deliveries instead of sending them.
        /// Accepts "1", "true", "yes", or "on".
        #[arg(long, env = "QUILL_DRY_RUN", value_parser = parse_bool_env, default_value = "false")]
        dry_run: bool,
    },

    /// Manage posts
    Post {
        #[command(subcommand)]
        command: PostCommand,
    },

    /// Manage individual jobs
    Job {
        #[command(subcommand)]
        command: JobCommand,
    },
}

#[derive(Subcommand)]
enum PostCommand {
    /// Create a post and schedule it unless --draft is given
    Create {
        /// Owner of the post; receives reminders
        #[arg(long)]
        user: String,

        /// Text to publish
        #[arg(long)]
        content: String,

        /// Target platform; repeatable or comma separated
        #[arg(long = "platform", required = true, value_delimiter = ',')]
        platforms: Vec<String>,

        /// When to publish: now, +15m, or an RFC 3339 time (default now)
        #[arg(long, value_parser = parse_time)]
        at: Option<DateTime<Utc>>,

        /// Remind the user this long before publishing, e.g. 30m
        #[arg(long, value_parser = parse_duration)]
        remind: Option<chrono::Duration>,

        /// Only store the post
        #[arg(long)]
        draft: bool,
    },

    /// Schedule a draft post
    Schedule {
        id: String,

        #[arg(long, value_parser = parse_time)]
        at: Option<DateTime<Utc>>,

        #[arg(long, value_parser = parse_duration)]
        remind: Option<chrono::Duration>,
    },

    /// Show a post and its targets
    Show { id: String },

    /// Cancel a post, or a single target with --platform
    Cancel {
        id: String,

        #[arg(long)]
        platform: Option<String>,
    },

    /// Move a scheduled post to a new time
    Reschedule {
        id: String,

        #[arg(long, value_parser = parse_time)]
        at: DateTime<Utc>,
    },
}

#[derive(Subcommand)]
enum JobCommand {
    /// List jobs in creation order
    List {
        /// Only jobs with this status
        #[arg(long, value_parser = parse_job_status)]
        status: Option<JobStatus>,

        /// Only jobs for this post
        #[arg(long)]
        post: Option<String>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Cancel a pending job
    Cancel { id: String },

    /// Move a pending job to a new due time
    Reschedule {
        id: String,

        #[arg(long, value_parser = parse_time)]
        at: DateTime<Utc>,
    },
}

#[allow(clippy::too_many_arguments)]
fn daemon_config(
    workers: usize,
    tick_ms: u64,
    call_timeout: u64,
    stale_after: u64,
    retry_base: u64,
    max_attempts: u32,
    retry_max: Option<u64>,
    webhooks: &[String],
    notify_url: Option<String>,
    webhook_token: Option<String>,
    dry_run: bool,
) -> Result<daemon::DaemonConfig> {
    let scheduler = SchedulerConfig::new()
        .with_workers(workers)
        .with_tick_interval(Duration::from_millis(tick_ms))
        .with_call_timeout(Duration::from_secs(call_timeout))
        .with_stale_after(Duration::from_secs(stale_after));

    let mut retry = RetryPolicy::new()
        .with_base_delay(Duration::from_secs(retry_base))
        .with_max_attempts(max_attempts);
    if let Some(max) = retry_max {
        retry = retry.with_max_delay(Duration::from_secs(max));
    }

    let mut hooks = WebhookConfig::new().with_timeout(Duration::from_secs(call_timeout));
    for entry in webhooks.iter().filter(|s| !s.trim().is_empty()) {
        let (platform, url) = parse_endpoint(entry).map_err(|e| miette::miette!("{}", e))?;
        hooks = hooks.with_endpoint(platform, url);
    }
    if let Some(url) = notify_url {
        hooks = hooks.with_notify_url(url);
    }
    if let Some(token) = webhook_token {
        hooks = hooks.with_auth_token(token);
    }

    Ok(daemon::DaemonConfig {
        scheduler,
        retry,
        webhooks: hooks,
        dry_run,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "quill=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let db = cli.db;

    match cli.command {
        Commands::Run {
            workers,
            tick_ms,
            call_timeout,
            stale_after,
            retry_base,
            max_attempts,
            retry_max,
            webhooks,
            notify_url,
            webhook_token,
            dry_run,
        } => {
            let config = daemon_config(
                workers,
                tick_ms,
                call_timeout,
                stale_after,
                retry_base,
                max_attempts,
                retry_max,
                &webhooks,
                notify_url,
                webhook_token,
                dry_run,
            )?;
            daemon::run(&db, config).await
        }

        Commands::Post { command } => match command {
            PostCommand::Create {
                user,
                content,
                platforms,
                at,
                remind,
                draft,
            } => commands::post_create(&db, &user, &content, &platforms, at, remind, draft).await,
            PostCommand::Schedule { id, at, remind } => {
                commands::post_schedule(&db, &id, at, remind).await
            }
            PostCommand::Show { id } => commands::post_show(&db, &id).await,
            PostCommand::Cancel { id, platform } => {
                commands::post_cancel(&db, &id, platform.as_deref()).await
            }
            PostCommand::Reschedule { id, at } => commands::post_reschedule(&db, &id, at).await,
        },

        Commands::Job { command } => match command {
            JobCommand::List {
                status,
                post,
                limit,
            } => commands::job_list(&db, status, post.as_deref(), limit).await,
            JobCommand::Cancel { id } => commands::job_cancel(&db, &id).await,
            JobCommand::Reschedule { id, at } => commands::job_reschedule(&db, &id, at).await,
        },
    }
}
