// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local SQLite mirror of remote checkpoints.
//!
//! The mirror remembers the last sequence this process saved to each remote
//! `_local/<id>` document. At session start a mismatch between the mirror
//! and the remote record means one of them was reset, so the remote value is
//! not trusted.
//!
//! # Debounced Writes
//!
//! - `set()` updates the in-memory cache immediately and marks the id dirty
//! - `flush_dirty()` persists all dirty entries in one pass
//! - the checkpointer flushes at batch boundaries and `close()` flushes too
//!
//! A crash between `set()` and `flush_dirty()` leaves the mirror one save
//! behind the remote. The next start sees a mismatch and replays from the
//! beginning, which is idempotent.
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY/SQLITE_LOCKED are retried with exponential backoff (5
//! attempts, 10ms doubling to 500ms). The cache is updated first, so a
//! failed flush only leaves the entry dirty for the next one.

use crate::error::{ReplicationError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Path that selects a private in-memory database.
pub const IN_MEMORY_PATH: &str = ":memory:";

fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

async fn execute_with_retry<F, Fut, T>(operation: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_mirror_retry(operation);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

/// SQLite-backed checkpoint mirror with debounced writes.
pub struct CheckpointMirror {
    pool: SqlitePool,
    cache: Arc<RwLock<HashMap<String, String>>>,
    dirty: Arc<RwLock<HashSet<String>>>,
    path: String,
}

impl CheckpointMirror {
    /// Open (creating if needed) the mirror at `path`. [`IN_MEMORY_PATH`]
    /// gives a private database that lives as long as this value.
    pub async fn open(path: &str) -> Result<Self> {
        info!(path, "Opening checkpoint mirror");

        let pool = if path == IN_MEMORY_PATH {
            let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
            // One pinned connection; a second would see a different database.
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}?mode=rwc"))
                .map_err(|e| ReplicationError::Configuration(format!("invalid mirror path: {e}")))?
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
                .create_if_missing(true);
            SqlitePoolOptions::new()
                .max_connections(2)
                .connect_with(options)
                .await?
        };

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                checkpoint_id TEXT PRIMARY KEY,
                last_sequence TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT checkpoint_id, last_sequence FROM checkpoints")
                .fetch_all(&pool)
                .await?;
        let cache: HashMap<String, String> = rows.into_iter().collect();
        if !cache.is_empty() {
            info!(count = cache.len(), "Restored mirrored checkpoints");
        }

        Ok(Self {
            pool,
            cache: Arc::new(RwLock::new(cache)),
            dirty: Arc::new(RwLock::new(HashSet::new())),
            path: path.to_string(),
        })
    }

    /// Mirrored sequence for a checkpoint id.
    pub async fn get(&self, checkpoint_id: &str) -> Option<String> {
        self.cache.read().await.get(checkpoint_id).cloned()
    }

    /// Record a sequence saved remotely (debounced).
    pub async fn set(&self, checkpoint_id: &str, last_sequence: &str) {
        self.cache
            .write()
            .await
            .insert(checkpoint_id.to_string(), last_sequence.to_string());
        self.dirty.write().await.insert(checkpoint_id.to_string());
        debug!(checkpoint_id, seq = last_sequence, "Mirror updated (pending flush)");
    }

    /// Persist every dirty entry. Returns how many were written.
    pub async fn flush_dirty(&self) -> Result<usize> {
        let dirty_ids: Vec<String> = self.dirty.write().await.drain().collect();
        if dirty_ids.is_empty() {
            return Ok(0);
        }

        let now = chrono::Utc::now().timestamp_millis();
        let cache = self.cache.read().await;
        let pool = &self.pool;
        let mut flushed = 0;
        let mut errors = 0;

        for checkpoint_id in &dirty_ids {
            let Some(seq) = cache.get(checkpoint_id) else {
                continue;
            };
            let (id, seq) = (checkpoint_id.as_str(), seq.as_str());
            let result = execute_with_retry("mirror_flush", || async move {
                sqlx::query(
                    r#"
                    INSERT INTO checkpoints (checkpoint_id, last_sequence, updated_at)
                    VALUES (?, ?, ?)
                    ON CONFLICT(checkpoint_id) DO UPDATE SET
                        last_sequence = excluded.last_sequence,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(id)
                .bind(seq)
                .bind(now)
                .execute(pool)
                .await
            })
            .await;

            match result {
                Ok(_) => flushed += 1,
                Err(e) => {
                    errors += 1;
                    warn!(checkpoint_id, error = %e, "Failed to flush mirrored checkpoint");
                    self.dirty.write().await.insert(checkpoint_id.clone());
                }
            }
        }

        crate::metrics::record_mirror_flush(flushed, errors);
        if errors > 0 {
            return Err(ReplicationError::Internal(format!(
                "failed to flush {errors} mirrored checkpoints"
            )));
        }
        Ok(flushed)
    }

    pub async fn has_dirty(&self) -> bool {
        !self.dirty.read().await.is_empty()
    }

    pub async fn dirty_count(&self) -> usize {
        self.dirty.read().await.len()
    }

    /// Forget a checkpoint id.
    pub async fn delete(&self, checkpoint_id: &str) -> Result<()> {
        self.cache.write().await.remove(checkpoint_id);
        self.dirty.write().await.remove(checkpoint_id);
        let pool = &self.pool;
        execute_with_retry("mirror_delete", || async move {
            sqlx::query("DELETE FROM checkpoints WHERE checkpoint_id = ?")
                .bind(checkpoint_id)
                .execute(pool)
                .await
        })
        .await?;
        Ok(())
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Flush the WAL into the main database file.
    pub async fn checkpoint_wal(&self) -> Result<()> {
        if self.path == IN_MEMORY_PATH {
            return Ok(());
        }
        let pool = &self.pool;
        execute_with_retry("mirror_wal_checkpoint", || async move {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;
        Ok(())
    }

    /// Flush, checkpoint the WAL and close the pool.
    pub async fn close(&self) {
        if self.has_dirty().await {
            if let Err(e) = self.flush_dirty().await {
                warn!(error = %e, "Failed to flush mirror on close");
            }
        }
        if let Err(e) = self.checkpoint_wal().await {
            warn!(error = %e, "Failed to checkpoint mirror WAL on close");
        }
        self.pool.close().await;
        debug!(path = %self.path, "Checkpoint mirror closed");
    }
}
