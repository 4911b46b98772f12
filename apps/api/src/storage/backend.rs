//! The storage contract shared by the embedded and remote backends.
//!
//! Every method is safe to call concurrently on one shared instance. Backend
//! failures (lock waits, timeouts, lost connections) are absorbed inside the
//! backend according to its availability policy; the `Err` side of these
//! methods is reserved for caller mistakes such as a zero request limit.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;
use tracing::{error, warn};

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid window key: {0:?}")]
    InvalidWindowKey(String),

    #[error("Invalid date {0:?}, expected YYYY-MM-DD")]
    InvalidDate(String),

    #[error("max_requests must be greater than zero")]
    InvalidLimit,
}

impl StorageError {
    /// Failures that are expected to clear up on their own.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Timeout(_) | StorageError::Io(_) => true,
            StorageError::Database(e) => is_transient_sqlx(e),
            _ => false,
        }
    }

    /// Lock contention in an embedded engine (SQLITE_BUSY / SQLITE_LOCKED),
    /// or the pool's bounded wait for a connection running out.
    pub fn is_lock_contention(&self) -> bool {
        match self {
            StorageError::Database(sqlx::Error::PoolTimedOut) => true,
            StorageError::Database(sqlx::Error::Database(db)) => {
                // Extended result codes keep the primary code in the low byte.
                let primary = db
                    .code()
                    .and_then(|c| c.parse::<i32>().ok())
                    .map(|c| c & 0xff);
                matches!(primary, Some(5) | Some(6))
                    || db.message().contains("database is locked")
            }
            _ => false,
        }
    }
}

/// Logs a failure a backend absorbs instead of returning: expected outages
/// at `warn`, anything else at `error`.
pub fn log_absorbed(what: fmt::Arguments<'_>, e: &StorageError) {
    if e.is_transient() {
        warn!("{what}: {e}");
    } else {
        error!("{what}: {e}");
    }
}

fn is_transient_sqlx(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Tls(_)
            | sqlx::Error::Database(_)
    )
}

/// Which backing store is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    /// Local SQLite file, for self-hosted deployments.
    Sqlite,
    /// Managed PostgreSQL (Supabase), for hosted deployments.
    Supabase,
}

impl DatabaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseType::Sqlite => "sqlite",
            DatabaseType::Supabase => "supabase",
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatabaseType {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" | "embedded" => Ok(DatabaseType::Sqlite),
            "supabase" | "postgres" | "postgresql" | "remote" => Ok(DatabaseType::Supabase),
            other => Err(StorageError::Configuration(format!(
                "Unknown DATABASE_TYPE '{other}' (expected 'sqlite' or 'supabase')"
            ))),
        }
    }
}

/// Outcome of one rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
}

impl RateLimitDecision {
    pub fn denied() -> Self {
        Self {
            allowed: false,
            remaining: 0,
        }
    }

    /// Used when the store cannot be consulted.
    pub fn fail_open(max_requests: u32) -> Self {
        Self {
            allowed: true,
            remaining: max_requests,
        }
    }

    /// Decision after the upsert reported `count` requests in the window.
    pub fn admitted(max_requests: u32, count: i64) -> Self {
        let used = u32::try_from(count.max(0)).unwrap_or(u32::MAX);
        Self {
            allowed: true,
            remaining: max_requests.saturating_sub(used),
        }
    }
}

/// One calendar day of aggregate usage.
///
/// `dau` counts events recorded on the day, not distinct visitors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct UsageStats {
    pub id: String,
    pub date: NaiveDate,
    pub polish_count: i64,
    pub dau: i64,
    pub updated_at: DateTime<Utc>,
}

/// Inclusive date range for usage queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn parse(start: &str, end: &str) -> StorageResult<Self> {
        Ok(Self::new(parse_usage_date(start)?, parse_usage_date(end)?))
    }
}

/// Parses a strict `YYYY-MM-DD` date.
pub fn parse_usage_date(raw: &str) -> StorageResult<NaiveDate> {
    if raw.len() != 10 {
        return Err(StorageError::InvalidDate(raw.to_string()));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| StorageError::InvalidDate(raw.to_string()))
}

/// Storage contract implemented by every backend.
///
/// Carried in `AppState` as `Arc<dyn Database>`.
#[async_trait]
pub trait Database: Send + Sync {
    /// Counts one request against the current window and reports whether it
    /// fits under `max_requests`. Denied requests are not counted.
    async fn check_rate_limit(
        &self,
        identifier: &str,
        endpoint: &str,
        max_requests: u32,
    ) -> StorageResult<RateLimitDecision>;

    /// Records one event for `date`, creating the row on first use.
    async fn increment_usage_stats(&self, date: NaiveDate) -> StorageResult<()>;

    /// Usage rows, newest date first, optionally limited to an inclusive range.
    async fn get_usage_stats(&self, range: Option<DateRange>) -> StorageResult<Vec<UsageStats>>;

    /// Deletes rate-limit rows whose window is older than `retention_minutes`.
    /// Returns the number of rows removed.
    async fn cleanup(&self, retention_minutes: u32) -> StorageResult<u64>;

    /// Releases the backend's connections. Safe to call more than once.
    async fn close(&self);

    fn kind(&self) -> DatabaseType;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_type_aliases() {
        assert_eq!("sqlite".parse::<DatabaseType>().unwrap(), DatabaseType::Sqlite);
        assert_eq!("Embedded".parse::<DatabaseType>().unwrap(), DatabaseType::Sqlite);
        assert_eq!("SUPABASE".parse::<DatabaseType>().unwrap(), DatabaseType::Supabase);
        assert_eq!("postgres".parse::<DatabaseType>().unwrap(), DatabaseType::Supabase);
        assert_eq!(" remote ".parse::<DatabaseType>().unwrap(), DatabaseType::Supabase);
    }

    #[test]
    fn test_unknown_database_type_is_configuration_error() {
        let err = "mysql".parse::<DatabaseType>().unwrap_err();
        assert!(matches!(err, StorageError::Configuration(_)));
    }

    #[test]
    fn test_admitted_remaining() {
        assert_eq!(RateLimitDecision::admitted(5, 1).remaining, 4);
        assert_eq!(RateLimitDecision::admitted(5, 5).remaining, 0);
        assert_eq!(RateLimitDecision::admitted(5, 9).remaining, 0);
    }

    #[test]
    fn test_parse_usage_date() {
        assert_eq!(
            parse_usage_date("2024-02-29").unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()
        );
        for raw in ["2024-2-29", "2023-02-29", "29/02/2024", "", "2024-02-29T00:00"] {
            assert!(matches!(parse_usage_date(raw), Err(StorageError::InvalidDate(_))));
        }
    }

    #[test]
    fn test_date_range_parses_both_bounds() {
        let range = DateRange::parse("2024-01-02", "2024-01-04").unwrap();
        assert_eq!(range.start, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(range.end, NaiveDate::from_ymd_opt(2024, 1, 4).unwrap());
        assert!(matches!(
            DateRange::parse("2024-01-02", "2024-1-4"),
            Err(StorageError::InvalidDate(_))
        ));
    }

    #[test]
    fn test_lock_contention_classification() {
        assert!(StorageError::Database(sqlx::Error::PoolTimedOut).is_lock_contention());
        assert!(!StorageError::Database(sqlx::Error::RowNotFound).is_lock_contention());
        assert!(!StorageError::Timeout(Duration::from_secs(1)).is_lock_contention());
        assert!(StorageError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!StorageError::InvalidLimit.is_transient());
    }
}
