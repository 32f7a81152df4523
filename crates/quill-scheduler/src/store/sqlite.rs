//! SQLite-backed durable job store.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior, params};
use tracing::info;

use super::{JobChange, JobStore, check_cas, check_transition, is_noop};
use crate::{Job, JobFilter, JobId, JobPayload, JobStatus, StatusUpdate, StoreError};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS jobs (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        kind TEXT NOT NULL,
        payload TEXT NOT NULL,
        post_id TEXT NOT NULL,
        due_at INTEGER NOT NULL,
        attempt INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        last_error TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs(status, due_at, seq);
    CREATE INDEX IF NOT EXISTS idx_jobs_post ON jobs(post_id);
";

const COLUMNS: &str = "id, payload, due_at, attempt, status, last_error, created_at, updated_at";

/// Job store persisted in a SQLite database file.
///
/// Timestamps are stored as epoch milliseconds. Calls run on the blocking
/// pool so a slow disk never stalls the scheduler loop.
#[derive(Clone)]
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Self::init(Connection::open(path)?)?;
        info!(path = %path.display(), "opened sqlite job store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Self::init(Connection::open_in_memory()?)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init(conn: Connection) -> Result<Connection, StoreError> {
        let conn = Self::configure(conn)?;
        conn.execute_batch(SCHEMA)?;
        Ok(conn)
    }

    fn configure(conn: Connection) -> Result<Connection, StoreError> {
        // WAL lets readers proceed while a writer holds the lock
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;",
        )?;
        Ok(conn)
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("connection lock poisoned".to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {}", e)))?
    }
}

/// A row as stored, before decoding.
struct RawJob {
    id: String,
    payload: String,
    due_at: i64,
    attempt: i64,
    status: String,
    last_error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl RawJob {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            payload: row.get(1)?,
            due_at: row.get(2)?,
            attempt: row.get(3)?,
            status: row.get(4)?,
            last_error: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_job(self) -> Result<Job, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            id: self.id.clone(),
            reason,
        };
        let payload: JobPayload =
            serde_json::from_str(&self.payload).map_err(|e| corrupt(e.to_string()))?;
        let status: JobStatus = self.status.parse().map_err(corrupt)?;
        let attempt =
            u32::try_from(self.attempt).map_err(|_| corrupt(format!("attempt {}", self.attempt)))?;
        let due_at = from_millis(self.due_at).ok_or_else(|| corrupt("due_at".to_string()))?;
        let created_at =
            from_millis(self.created_at).ok_or_else(|| corrupt("created_at".to_string()))?;
        let updated_at =
            from_millis(self.updated_at).ok_or_else(|| corrupt("updated_at".to_string()))?;

        Ok(Job {
            id: JobId::from(self.id),
            payload,
            due_at,
            attempt,
            status,
            last_error: self.last_error,
            created_at,
            updated_at,
        })
    }
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

fn select_one(conn: &Connection, id: &JobId) -> Result<Job, StoreError> {
    conn.query_row(
        &format!("SELECT {} FROM jobs WHERE id = ?1", COLUMNS),
        [id.as_str()],
        RawJob::from_row,
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound(id.clone()))?
    .into_job()
}

fn write_update(conn: &Connection, id: &JobId, update: &StatusUpdate) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE jobs
         SET status = ?2, attempt = ?3, due_at = ?4, last_error = ?5, updated_at = ?6
         WHERE id = ?1",
        params![
            id.as_str(),
            update.status.as_str(),
            update.attempt,
            update.due_at.timestamp_millis(),
            update.last_error,
            update.at.timestamp_millis(),
        ],
    )?;
    Ok(())
}

fn collect_jobs(
    rows: impl Iterator<Item = rusqlite::Result<RawJob>>,
) -> Result<Vec<Job>, StoreError> {
    rows.map(|row| row.map_err(StoreError::from).and_then(RawJob::into_job))
        .collect()
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn put(&self, job: Job) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&job.payload).map_err(|e| StoreError::Corrupt {
            id: job.id.to_string(),
            reason: e.to_string(),
        })?;
        self.with_conn(move |conn| {
            let result = conn.execute(
                "INSERT INTO jobs (id, kind, payload, post_id, due_at, attempt, status, last_error, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    job.id.as_str(),
                    job.kind().as_str(),
                    payload,
                    job.payload.post_id().as_str(),
                    job.due_at.timestamp_millis(),
                    job.attempt,
                    job.status.as_str(),
                    job.last_error,
                    job.created_at.timestamp_millis(),
                    job.updated_at.timestamp_millis(),
                ],
            );
            match result {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::Duplicate(job.id))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn get(&self, id: &JobId) -> Result<Job, StoreError> {
        let id = id.clone();
        self.with_conn(move |conn| select_one(conn, &id)).await
    }

    async fn update_status(&self, id: &JobId, update: StatusUpdate) -> Result<Job, StoreError> {
        let id = id.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut job = select_one(&tx, &id)?;
            if is_noop(&job, &update) {
                return Ok(job);
            }
            check_transition(&job, &update)?;
            write_update(&tx, &id, &update)?;
            tx.commit()?;
            job.apply(&update);
            Ok(job)
        })
        .await
    }

    async fn compare_and_swap(
        &self,
        id: &JobId,
        expected: JobStatus,
        update: StatusUpdate,
    ) -> Result<Job, StoreError> {
        let id = id.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut job = select_one(&tx, &id)?;
            check_cas(&job, expected, &update)?;
            if is_noop(&job, &update) {
                return Ok(job);
            }
            write_update(&tx, &id, &update)?;
            tx.commit()?;
            job.apply(&update);
            Ok(job)
        })
        .await
    }

    async fn apply_change(
        &self,
        id: &JobId,
        change: JobChange,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let id = id.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut job = select_one(&tx, &id)?;
            let update = change.resolve(&job, now)?;
            write_update(&tx, &id, &update)?;
            tx.commit()?;
            job.apply(&update);
            Ok(job)
        })
        .await
    }

    async fn remove(&self, id: &JobId) -> Result<(), StoreError> {
        let id = id.clone();
        self.with_conn(move |conn| {
            let deleted = conn.execute("DELETE FROM jobs WHERE id = ?1", [id.as_str()])?;
            if deleted == 0 {
                Err(StoreError::NotFound(id))
            } else {
                Ok(())
            }
        })
        .await
    }

    async fn list_due(&self, before: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM jobs
                 WHERE status = 'pending' AND due_at <= ?1
                 ORDER BY due_at ASC, seq ASC",
                COLUMNS
            ))?;
            let rows = stmt.query_map([before.timestamp_millis()], RawJob::from_row)?;
            collect_jobs(rows)
        })
        .await
    }

    async fn next_due_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.with_conn(|conn| {
            let ms: Option<i64> = conn.query_row(
                "SELECT MIN(due_at) FROM jobs WHERE status = 'pending'",
                [],
                |row| row.get(0),
            )?;
            Ok(ms.and_then(from_millis))
        })
        .await
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let status = filter.status.map(|s| s.as_str().to_string());
        let post_id = filter.post_id.as_ref().map(|p| p.as_str().to_string());
        // LIMIT -1 means no limit in SQLite
        let limit = filter
            .limit
            .map(|l| i64::try_from(l).unwrap_or(i64::MAX))
            .unwrap_or(-1);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM jobs
                 WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR post_id = ?2)
                 ORDER BY seq ASC
                 LIMIT ?3",
                COLUMNS
            ))?;
            let rows = stmt.query_map(params![status, post_id, limit], RawJob::from_row)?;
            collect_jobs(rows)
        })
        .await
    }

    async fn requeue_stale(
        &self,
        running_since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StoreError> {
        let cutoff = running_since.timestamp_millis();
        let now = now.timestamp_millis();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut ids: Vec<JobId> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM jobs WHERE status = 'running' AND updated_at < ?1",
                )?;
                let rows = stmt.query_map([cutoff], |row| row.get::<_, String>(0))?;
                rows.map(|r| r.map(JobId::from))
                    .collect::<rusqlite::Result<_>>()?
            };
            tx.execute(
                "UPDATE jobs SET status = 'pending', due_at = ?2, updated_at = ?2
                 WHERE status = 'running' AND updated_at < ?1",
                params![cutoff, now],
            )?;
            tx.commit()?;
            ids.sort();
            Ok(ids)
        })
        .await
    }
}
