//! One-shot `post` and `job` commands against the database.
//!
//! These share the daemon's database file; a running daemon sees their
//! changes on its next scan.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use miette::Result;

use quill_fanout::{FanoutCoordinator, Post, SqlitePostStore};
use quill_scheduler::{
    Job, JobFilter, JobId, JobPayload, JobStatus, Platform, PostId, Scheduler, SchedulerConfig,
    SqliteJobStore, SystemClock,
};

/// Parse a duration such as `90s`, `15m`, `2h` or `1d`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("missing unit in '{}', expected s/m/h/d", s))?;
    let (amount, unit) = s.split_at(split);
    let amount: i64 = amount
        .parse()
        .map_err(|_| format!("invalid duration '{}'", s))?;
    match unit {
        "s" => Ok(Duration::seconds(amount)),
        "m" => Ok(Duration::minutes(amount)),
        "h" => Ok(Duration::hours(amount)),
        "d" => Ok(Duration::days(amount)),
        _ => Err(format!("unknown unit '{}' in '{}', expected s/m/h/d", unit, s)),
    }
}

/// Parse `now`, `+<duration>` relative to now, or an RFC 3339 timestamp.
pub fn parse_time(s: &str) -> Result<DateTime<Utc>, String> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("now") {
        return Ok(Utc::now());
    }
    if let Some(relative) = s.strip_prefix('+') {
        return Ok(Utc::now() + parse_duration(relative)?);
    }
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid time '{}': {}", s, e))
}

struct Handles {
    scheduler: Arc<Scheduler>,
    coordinator: FanoutCoordinator,
}

fn open(db: &Path) -> Result<Handles> {
    let jobs = SqliteJobStore::open(db)
        .map_err(|e| miette::miette!("failed to open job store: {}", e))?;
    let posts = SqlitePostStore::open(db)
        .map_err(|e| miette::miette!("failed to open post store: {}", e))?;
    let scheduler = Arc::new(Scheduler::new(
        Arc::new(jobs),
        Arc::new(SystemClock),
        SchedulerConfig::default(),
    ));
    Ok(Handles {
        coordinator: FanoutCoordinator::new(Arc::clone(&scheduler), Arc::new(posts)),
        scheduler,
    })
}

fn print_post(post: &Post) {
    println!("post {}", post.id);
    println!("  user:      {}", post.user_id);
    println!("  status:    {}", post.status);
    match post.publish_at {
        Some(at) => println!("  publish:   {}", at.to_rfc3339()),
        None => println!("  publish:   (not scheduled)"),
    }
    if let Some(offset) = post.reminder_offset() {
        println!("  reminder:  {}m before", offset.num_minutes());
    }
    if post.cancel_requested {
        println!("  cancel requested");
    }
    for target in &post.targets {
        let detail = match (&target.external_id, &target.failure_reason) {
            (Some(id), _) => format!(" ({})", id),
            (None, Some(reason)) => format!(" ({})", reason),
            (None, None) => String::new(),
        };
        println!("  - {:<12} {}{}", target.platform.as_str(), target.status, detail);
    }
}

fn print_job(job: &Job) {
    let what = match &job.payload {
        JobPayload::PublishPost { platform, .. } => format!("publish {}", platform),
        JobPayload::SendNotification { user_id, .. } => format!("notify {}", user_id),
    };
    print!(
        "{}  {:<9}  attempt {}  due {}  post {}  {}",
        job.id,
        job.status,
        job.attempt,
        job.due_at.to_rfc3339(),
        job.payload.post_id(),
        what,
    );
    match &job.last_error {
        Some(error) => println!("  [{}]", error),
        None => println!(),
    }
}

pub async fn post_create(
    db: &Path,
    user: &str,
    content: &str,
    platforms: &[String],
    at: Option<DateTime<Utc>>,
    reminder: Option<Duration>,
    draft: bool,
) -> Result<()> {
    let handles = open(db)?;
    let post = handles
        .coordinator
        .create_post(user, content, platforms.iter().map(Platform::new))
        .await
        .map_err(|e| miette::miette!("failed to create post: {}", e))?;

    let post = if draft {
        post
    } else {
        handles
            .coordinator
            .schedule_post(&post.id, at, reminder)
            .await
            .map_err(|e| miette::miette!("failed to schedule post {}: {}", post.id, e))?
    };

    print_post(&post);
    Ok(())
}

pub async fn post_schedule(
    db: &Path,
    id: &str,
    at: Option<DateTime<Utc>>,
    reminder: Option<Duration>,
) -> Result<()> {
    let handles = open(db)?;
    let post = handles
        .coordinator
        .schedule_post(&PostId::from(id), at, reminder)
        .await
        .map_err(|e| miette::miette!("failed to schedule post {}: {}", id, e))?;
    print_post(&post);
    Ok(())
}

pub async fn post_show(db: &Path, id: &str) -> Result<()> {
    let handles = open(db)?;
    let post = handles
        .coordinator
        .get_post(&PostId::from(id))
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    print_post(&post);
    Ok(())
}

pub async fn post_cancel(db: &Path, id: &str, platform: Option<&str>) -> Result<()> {
    let handles = open(db)?;
    let post_id = PostId::from(id);

    match platform {
        Some(platform) => {
            let post = handles
                .coordinator
                .cancel_target(&post_id, &Platform::new(platform))
                .await
                .map_err(|e| miette::miette!("failed to cancel {} on {}: {}", id, platform, e))?;
            print_post(&post);
        }
        None => {
            let report = handles
                .coordinator
                .cancel_post(&post_id)
                .await
                .map_err(|e| miette::miette!("failed to cancel post {}: {}", id, e))?;
            println!("{}", report);
        }
    }
    Ok(())
}

pub async fn post_reschedule(db: &Path, id: &str, at: DateTime<Utc>) -> Result<()> {
    let handles = open(db)?;
    let report = handles
        .coordinator
        .reschedule_post(&PostId::from(id), at)
        .await
        .map_err(|e| miette::miette!("failed to reschedule post {}: {}", id, e))?;
    println!("{}", report);
    Ok(())
}

pub async fn job_list(
    db: &Path,
    status: Option<JobStatus>,
    post: Option<&str>,
    limit: Option<usize>,
) -> Result<()> {
    let handles = open(db)?;
    let mut filter = match post {
        Some(post) => JobFilter::for_post(PostId::from(post)),
        None => JobFilter::default(),
    };
    if let Some(status) = status {
        filter = filter.with_status(status);
    }
    if let Some(limit) = limit {
        filter = filter.with_limit(limit);
    }

    let jobs = handles
        .scheduler
        .list(&filter)
        .await
        .map_err(|e| miette::miette!("failed to list jobs: {}", e))?;
    if jobs.is_empty() {
        println!("No jobs.");
    }
    for job in &jobs {
        print_job(job);
    }
    Ok(())
}

pub async fn job_cancel(db: &Path, id: &str) -> Result<()> {
    let handles = open(db)?;
    let job = handles
        .scheduler
        .cancel(&JobId::from(id))
        .await
        .map_err(|e| miette::miette!("failed to cancel job {}: {}", id, e))?;
    print_job(&job);
    Ok(())
}

pub async fn job_reschedule(db: &Path, id: &str, at: DateTime<Utc>) -> Result<()> {
    let handles = open(db)?;
    let job = handles
        .scheduler
        .reschedule(&JobId::from(id), at)
        .await
        .map_err(|e| miette::miette!("failed to reschedule job {}: {}", id, e))?;
    print_job(&job);
    Ok(())
}
