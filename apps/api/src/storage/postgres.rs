//! PostgreSQL backend for hosted deployments (Supabase).
//!
//! Every call crosses the network, so each one runs under `op_timeout` and
//! gets exactly one attempt. Any failure is logged and answered with the
//! fail-open value: a broken limiter must never lock legitimate users out.

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use tracing::{debug, info};

use crate::storage::backend::{
    log_absorbed, Database, DatabaseType, DateRange, RateLimitDecision, StorageError,
    StorageResult, UsageStats,
};
use crate::storage::window::{SharedClock, WindowKey};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS rate_limits (
        client_identifier TEXT NOT NULL,
        endpoint TEXT NOT NULL,
        window_key TEXT NOT NULL,
        request_count INTEGER NOT NULL DEFAULT 1,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (client_identifier, endpoint, window_key)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_rate_limits_window ON rate_limits(window_key)",
    r#"
    CREATE TABLE IF NOT EXISTS usage_stats (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        date DATE NOT NULL UNIQUE,
        polish_count BIGINT NOT NULL DEFAULT 0,
        dau BIGINT NOT NULL DEFAULT 0,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_usage_stats_date ON usage_stats(date)",
];

/// Remote PostgreSQL storage.
#[derive(Clone)]
pub struct PostgresDatabase {
    pool: PgPool,
    clock: SharedClock,
    op_timeout: Duration,
}

impl PostgresDatabase {
    /// Builds a lazily connecting pool. Only the URL is validated here; an
    /// unreachable server shows up later as fail-open warnings.
    pub fn connect_lazy(
        database_url: &str,
        max_connections: u32,
        op_timeout: Duration,
        clock: SharedClock,
    ) -> StorageResult<Self> {
        let options = PgConnectOptions::from_str(database_url)
            .map_err(|e| StorageError::Configuration(format!("Invalid DATABASE_URL: {e}")))?;

        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(op_timeout)
            .connect_lazy_with(options);

        info!("PostgreSQL pool configured (timeout {op_timeout:?})");
        Ok(Self {
            pool,
            clock,
            op_timeout,
        })
    }

    /// Creates the tables if they are missing.
    pub async fn ensure_schema(&self) -> StorageResult<()> {
        for statement in SCHEMA {
            self.timed(sqlx::query(statement).execute(&self.pool))
                .await?;
        }
        Ok(())
    }

    async fn timed<T, F>(&self, fut: F) -> StorageResult<T>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StorageError::Timeout(self.op_timeout)),
        }
    }

    async fn upsert_rate_limit(
        &self,
        identifier: &str,
        endpoint: &str,
        window: &WindowKey,
        max_requests: u32,
    ) -> StorageResult<Option<i32>> {
        let limit = i32::try_from(max_requests).unwrap_or(i32::MAX);
        self.timed(
            sqlx::query_scalar::<_, i32>(
                r#"
                INSERT INTO rate_limits (client_identifier, endpoint, window_key, request_count)
                VALUES ($1, $2, $3, 1)
                ON CONFLICT (client_identifier, endpoint, window_key)
                DO UPDATE SET request_count = rate_limits.request_count + 1
                WHERE rate_limits.request_count < $4
                RETURNING request_count
                "#,
            )
            .bind(identifier)
            .bind(endpoint)
            .bind(window.as_str())
            .bind(limit)
            .fetch_optional(&self.pool),
        )
        .await
    }
}

#[async_trait]
impl Database for PostgresDatabase {
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
            Ok(Some(count)) => Ok(RateLimitDecision::admitted(max_requests, i64::from(count))),
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
        let result = self
            .timed(
                sqlx::query(
                    r#"
                    INSERT INTO usage_stats (date, polish_count, dau, updated_at)
                    VALUES ($1, 1, 1, $2)
                    ON CONFLICT (date)
                    DO UPDATE SET polish_count = usage_stats.polish_count + 1,
                                  dau = usage_stats.dau + 1,
                                  updated_at = EXCLUDED.updated_at
                    "#,
                )
                .bind(date)
                .bind(Utc::now())
                .execute(&self.pool),
            )
            .await;

        if let Err(e) = result {
            log_absorbed(format_args!("Failed to record usage for {date}"), &e);
        }
        Ok(())
    }

    async fn get_usage_stats(&self, range: Option<DateRange>) -> StorageResult<Vec<UsageStats>> {
        let result = match range {
            Some(range) => {
                self.timed(
                    sqlx::query_as::<_, UsageStats>(
                        r#"
                        SELECT id::text AS id, date, polish_count, dau, updated_at
                        FROM usage_stats
                        WHERE date >= $1 AND date <= $2
                        ORDER BY date DESC
                        "#,
                    )
                    .bind(range.start)
                    .bind(range.end)
                    .fetch_all(&self.pool),
                )
                .await
            }
            None => {
                self.timed(
                    sqlx::query_as::<_, UsageStats>(
                        "SELECT id::text AS id, date, polish_count, dau, updated_at FROM usage_stats ORDER BY date DESC",
                    )
                    .fetch_all(&self.pool),
                )
                .await
            }
        };

        match result {
            Ok(rows) => Ok(rows),
            Err(e) => {
                log_absorbed(format_args!("Failed to load usage stats"), &e);
                Ok(Vec::new())
            }
        }
    }

    async fn cleanup(&self, retention_minutes: u32) -> StorageResult<u64> {
        let cutoff = WindowKey::cutoff(self.clock.now(), retention_minutes)?;
        let result = self
            .timed(
                sqlx::query("DELETE FROM rate_limits WHERE window_key < $1")
                    .bind(cutoff.as_str())
                    .execute(&self.pool),
            )
            .await;

        match result {
            Ok(done) => {
                debug!(
                    "Removed {} rate limit rows older than {cutoff}",
                    done.rows_affected()
                );
                Ok(done.rows_affected())
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
            info!("PostgreSQL pool closed");
        }
    }

    fn kind(&self) -> DatabaseType {
        DatabaseType::Supabase
    }
}
