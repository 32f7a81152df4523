//! SQLite-backed post store.
//!
//! Posts are stored as JSON documents; the status column is kept alongside
//! for operators querying the file directly.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, TransactionBehavior, params};
use tracing::info;

use super::PostStore;
use crate::{Post, PostChange, PostStoreError};
use quill_scheduler::PostId;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS posts (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        status TEXT NOT NULL,
        body TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_posts_user ON posts(user_id);
";

/// Post store persisted in a SQLite database file.
///
/// Can share a file with the job store; each uses its own table.
#[derive(Clone)]
pub struct SqlitePostStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqlitePostStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PostStoreError> {
        let path = path.as_ref();
        let conn = Self::init(Connection::open(path)?)?;
        info!(path = %path.display(), "opened sqlite post store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create a private in-memory database.
    pub fn open_in_memory() -> Result<Self, PostStoreError> {
        let conn = Self::init(Connection::open_in_memory()?)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init(conn: Connection) -> Result<Connection, PostStoreError> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;",
        )?;
        conn.execute_batch(SCHEMA)?;
        Ok(conn)
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, PostStoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, PostStoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| PostStoreError::Unavailable("connection lock poisoned".to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| PostStoreError::Unavailable(format!("store task failed: {}", e)))?
    }
}

fn encode(post: &Post) -> Result<String, PostStoreError> {
    serde_json::to_string(post).map_err(|e| PostStoreError::Corrupt {
        id: post.id.to_string(),
        reason: e.to_string(),
    })
}

fn select_one(conn: &Connection, id: &PostId) -> Result<Post, PostStoreError> {
    let body: String = conn
        .query_row("SELECT body FROM posts WHERE id = ?1", [id.as_str()], |row| {
            row.get(0)
        })
        .optional()?
        .ok_or_else(|| PostStoreError::NotFound(id.clone()))?;
    serde_json::from_str(&body).map_err(|e| PostStoreError::Corrupt {
        id: id.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl PostStore for SqlitePostStore {
    async fn insert(&self, post: Post) -> Result<(), PostStoreError> {
        let body = encode(&post)?;
        self.with_conn(move |conn| {
            let result = conn.execute(
                "INSERT INTO posts (id, user_id, status, body, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    post.id.as_str(),
                    post.user_id,
                    post.status.as_str(),
                    body,
                    post.created_at.timestamp_millis(),
                    post.updated_at.timestamp_millis(),
                ],
            );
            match result {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    Err(PostStoreError::Duplicate(post.id))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn get(&self, id: &PostId) -> Result<Post, PostStoreError> {
        let id = id.clone();
        self.with_conn(move |conn| select_one(conn, &id)).await
    }

    async fn update(
        &self,
        id: &PostId,
        change: PostChange,
        at: DateTime<Utc>,
    ) -> Result<Post, PostStoreError> {
        let id = id.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut post = select_one(&tx, &id)?;
            post.apply(change, at)
                .map_err(|e| PostStoreError::Rejected {
                    post_id: id.clone(),
                    reason: e.0,
                })?;
            tx.execute(
                "UPDATE posts SET status = ?2, body = ?3, updated_at = ?4 WHERE id = ?1",
                params![
                    id.as_str(),
                    post.status.as_str(),
                    encode(&post)?,
                    post.updated_at.timestamp_millis(),
                ],
            )?;
            tx.commit()?;
            Ok(post)
        })
        .await
    }
}
