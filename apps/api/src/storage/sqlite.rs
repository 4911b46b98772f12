//! SQLite backend for local and self-hosted deployments.
//!
//! The database file runs in WAL mode with a bounded busy timeout, so
//! concurrent writers queue behind SQLite's lock for at most
//! `BUSY_TIMEOUT` before giving up.
//!
//! Every write runs inside `BEGIN IMMEDIATE`, which takes the write lock
//! before any row is touched. Lock contention can therefore only surface on
//! the `BEGIN`, and that is the one step retried. A write statement is never
//! run twice, so a request is never counted twice. If the second `BEGIN`
//! also times out the backend fails open.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Sqlite, SqliteConnection, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::storage::backend::{
    log_absorbed, Database, DatabaseType, DateRange, RateLimitDecision, StorageError,
    StorageResult, UsageStats,
};
use crate::storage::window::{SharedClock, WindowKey};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS rate_limits (
        client_identifier TEXT NOT NULL,
        endpoint TEXT NOT NULL,
        window_key TEXT NOT NULL,
        request_count INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        PRIMARY KEY (client_identifier, endpoint, window_key)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_rate_limits_window ON rate_limits(window_key)",
    r#"
    CREATE TABLE IF NOT EXISTS usage_stats (
        id TEXT PRIMARY KEY,
        date TEXT NOT NULL UNIQUE,
        polish_count INTEGER NOT NULL DEFAULT 0,
        dau INTEGER NOT NULL DEFAULT 0,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_usage_stats_date ON usage_stats(date)",
];

/// A write transaction opened with `BEGIN IMMEDIATE`.
///
/// Dropped without `commit` (error or cancelled request), the connection is
/// detached from the pool and closed, which rolls the transaction back.
struct WriteTransaction {
    conn: Option<PoolConnection<Sqlite>>,
}

impl WriteTransaction {
    fn conn(&mut self) -> StorageResult<&mut SqliteConnection> {
        self.conn
            .as_deref_mut()
            .ok_or(StorageError::Database(sqlx::Error::PoolClosed))
    }

    async fn commit(mut self) -> StorageResult<()> {
        sqlx::query("COMMIT").execute(self.conn()?).await?;
        // Committed: hand the connection back to the pool.
        drop(self.conn.take());
        Ok(())
    }
}

impl Drop for WriteTransaction {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            drop(conn.detach());
        }
    }
}

/// Embedded SQLite storage.
#[derive(Clone)]
pub struct SqliteDatabase {
    pool: SqlitePool,
    clock: SharedClock,
    path: PathBuf,
}

impl SqliteDatabase {
    /// Opens (creating if needed) the database file at `path` and its schema.
    pub async fn open(
        path: &Path,
        max_connections: u32,
        clock: SharedClock,
    ) -> StorageResult<Self> {
        Self::open_with_busy_timeout(path, max_connections, BUSY_TIMEOUT, clock).await
    }

    async fn open_with_busy_timeout(
        path: &Path,
        max_connections: u32,
        busy_timeout: Duration,
        clock: SharedClock,
    ) -> StorageResult<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(busy_timeout)
            .connect_with(options)
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        info!("SQLite database ready at {}", path.display());
        Ok(Self {
            pool,
            clock,
            path: path.to_path_buf(),
        })
    }

    async fn begin_immediate(&self) -> StorageResult<WriteTransaction> {
        let mut tx = WriteTransaction {
            conn: Some(self.pool.acquire().await?),
        };
        let begun = sqlx::query("BEGIN IMMEDIATE").execute(tx.conn()?).await;
        if let Err(e) = begun {
            // No transaction was opened, so the connection can go back as is.
            drop(tx.conn.take());
            return Err(e.into());
        }
        Ok(tx)
    }

    /// Takes the write lock, retrying once on lock contention. Nothing has
    /// been written when `BEGIN` fails, so the retry cannot double-apply.
    async fn begin_write(&self, op_name: &str) -> StorageResult<WriteTransaction> {
        match self.begin_immediate().await {
            Err(e) if e.is_lock_contention() => {
                debug!("SQLite {op_name} hit lock contention, retrying once: {e}");
                self.begin_immediate().await
            }
            other => other,
        }
    }

    /// Runs a read or an idempotent statement, retrying once on lock contention.
    async fn with_retry<T, F, Fut>(&self, op_name: &str, op: F) -> StorageResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        match op().await {
            Err(e) if e.is_lock_contention() => {
                debug!("SQLite {op_name} hit lock contention, retrying once: {e}");
                op().await
            }
            other => other,
        }
    }

    async fn upsert_rate_limit(
        &self,
        identifier: &str,
        endpoint: &str,
        window: &WindowKey,
        max_requests: u32,
    ) -> StorageResult<Option<i64>> {
        // A conflicting row is bumped only while under the limit; a row at the
        // limit is left untouched and RETURNING yields nothing.
        let mut tx = self.begin_write("rate limit check").await?;
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO rate_limits (client_identifier, endpoint, window_key, request_count)
            VALUES (?1, ?2, ?3, 1)
            ON CONFLICT (client_identifier, endpoint, window_key)
            DO UPDATE SET request_count = rate_limits.request_count + 1
            WHERE rate_limits.request_count < ?4
            RETURNING request_count
            "#,
        )
        .bind(identifier)
        .bind(endpoint)
        .bind(window.as_str())
        .bind(i64::from(max_requests))
        .fetch_optional(tx.conn()?)
        .await?;
        tx.commit().await?;
        Ok(count)
    }

    async fn upsert_usage(&self, date: NaiveDate) -> StorageResult<()> {
        let mut tx = self.begin_write("usage increment").await?;
        sqlx::query(
            r#"
            INSERT INTO usage_stats (id, date, polish_count, dau, updated_at)
            VALUES (?1, ?2, 1, 1, ?3)
            ON CONFLICT (date)
            DO UPDATE SET polish_count = usage_stats.polish_count + 1,
                          dau = usage_stats.dau + 1,
                          updated_at = excluded.updated_at
            "#,
        )
        .bind(Uuid::new_v4().simple().to_string())
        .bind(date)
        .bind(Utc::now())
        .execute(tx.conn()?)
        .await?;
        tx.commit().await
    }

    async fn select_usage(&self, range: Option<DateRange>) -> StorageResult<Vec<UsageStats>> {
        let rows = match range {
            Some(range) => {
                sqlx::query_as::<_, UsageStats>(
                    r#"
                    SELECT id, date, polish_count, dau, updated_at
                    FROM usage_stats
                    WHERE date >= ?1 AND date <= ?2
                    ORDER BY date DESC
                    "#,
                )
                .bind(range.start)
                .bind(range.end)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, UsageStats>(
                    "SELECT id, date, polish_count, dau, updated_at FROM usage_stats ORDER BY date DESC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }

    async fn delete_before(&self, cutoff: &WindowKey) -> StorageResult<u64> {
        let result = sqlx::query("DELETE FROM rate_limits WHERE window_key < ?1")
            .bind(cutoff.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    async fn check_rate_limit(
        &self,
        identifier: &str,
        endpoint: &str,
        max_requests: u32,
    ) -> StorageResult<RateLimitDecision> {
        if max_requests == 0 {
            return Err(StorageError::InvalidLimit);
        }
        let window = WindowKey::current(self.clock.as_ref())?;

        match self
            .upsert_rate_limit(identifier, endpoint, &window, max_requests)
            .await
        {
            Ok(Some(count)) => Ok(RateLimitDecision::admitted(max_requests, count)),
            Ok(None) => Ok(RateLimitDecision::denied()),
            Err(e) => {
                log_absorbed(
                    format_args!("Rate limit check failed for {identifier} on {endpoint}, allowing request"),
                    &e,
                );
                Ok(RateLimitDecision::fail_open(max_requests))
            }
        }
    }

    async fn increment_usage_stats(&self, date: NaiveDate) -> StorageResult<()> {
        if let Err(e) = self.upsert_usage(date).await {
            log_absorbed(format_args!("Failed to record usage for {date}"), &e);
        }
        Ok(())
    }

    async fn get_usage_stats(&self, range: Option<DateRange>) -> StorageResult<Vec<UsageStats>> {
        match self
            .with_retry("usage query", || self.select_usage(range))
            .await
        {
            Ok(rows) => Ok(rows),
            Err(e) => {
                log_absorbed(format_args!("Failed to load usage stats"), &e);
                Ok(Vec::new())
            }
        }
    }

    async fn cleanup(&self, retention_minutes: u32) -> StorageResult<u64> {
        let cutoff = WindowKey::cutoff(self.clock.now(), retention_minutes)?;
        match self
            .with_retry("cleanup", || self.delete_before(&cutoff))
            .await
        {
            Ok(removed) => {
                debug!("Removed {removed} rate limit rows older than {cutoff}");
                Ok(removed)
            }
            Err(e) => {
                log_absorbed(format_args!("Rate limit cleanup failed"), &e);
                Ok(0)
            }
        }
    }

    async fn close(&self) {
        if !self.pool.is_closed() {
            self.pool.close().await;
            info!("SQLite database at {} closed", self.path.display());
        }
    }

    fn kind(&self) -> DatabaseType {
        DatabaseType::Sqlite
    }
}
