//! Fixed-window bucketing.
//!
//! A window key names one wall-clock minute as `YYYY-MM-DD-HH-MM` (UTC).
//! Every field is zero-padded, so comparing two keys as strings gives the
//! same answer as comparing the minutes they name. Cleanup relies on this
//! to delete by range without parsing.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDateTime, Timelike, Utc};

use crate::storage::backend::{StorageError, StorageResult};

const WINDOW_KEY_FORMAT: &str = "%Y-%m-%d-%H-%M";
const WINDOW_KEY_LEN: usize = 16;

/// Source of wall-clock time for window computation.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub type SharedClock = Arc<dyn Clock>;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WindowKey(String);

impl WindowKey {
    /// Key of the minute containing `at`.
    ///
    /// Years outside 0000..=9999 do not fit the fixed-width format and are
    /// rejected rather than producing a key that sorts out of order.
    pub fn from_datetime(at: DateTime<Utc>) -> StorageResult<Self> {
        Self::parse(&at.format(WINDOW_KEY_FORMAT).to_string())
    }

    /// Key of the minute containing the clock's current time.
    pub fn current(clock: &dyn Clock) -> StorageResult<Self> {
        Self::from_datetime(clock.now())
    }

    /// Oldest key that survives a cleanup run at `now` with the given retention.
    pub fn cutoff(now: DateTime<Utc>, retention_minutes: u32) -> StorageResult<Self> {
        Self::from_datetime(now - Duration::minutes(i64::from(retention_minutes)))
    }

    /// Validates a key against the `YYYY-MM-DD-HH-MM` format.
    pub fn parse(raw: &str) -> StorageResult<Self> {
        if raw.len() != WINDOW_KEY_LEN {
            return Err(StorageError::InvalidWindowKey(raw.to_string()));
        }
        NaiveDateTime::parse_from_str(raw, WINDOW_KEY_FORMAT)
            .map_err(|_| StorageError::InvalidWindowKey(raw.to_string()))?;
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whole seconds until the next minute boundary, never zero.
pub fn seconds_until_next_window(now: DateTime<Utc>) -> u64 {
    u64::from(60 - now.second())
}
