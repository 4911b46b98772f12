use std::sync::Arc;

use chrono::NaiveDate;

use crate::storage::backend::{Database, DateRange, StorageResult, UsageStats};
use crate::storage::window::SharedClock;

/// Daily usage counting on top of whichever backend is active.
///
/// One call per completed billable action; failed actions are not counted.
#[derive(Clone)]
pub struct UsageCounter {
    db: Arc<dyn Database>,
    clock: SharedClock,
}

impl UsageCounter {
    pub fn new(db: Arc<dyn Database>, clock: SharedClock) -> Self {
        Self { db, clock }
    }

    /// Today's date in UTC, the same calendar the window keys use.
    pub fn today(&self) -> NaiveDate {
        self.clock.now().date_naive()
    }

    /// Counts one completed billable action against today.
    pub async fn record_success(&self) -> StorageResult<()> {
        self.db.increment_usage_stats(self.today()).await
    }

    pub async fn stats(&self, range: Option<DateRange>) -> StorageResult<Vec<UsageStats>> {
        self.db.get_usage_stats(range).await
    }
}
