//! Background garbage collection of expired rate-limit windows.
//!
//! Checks only ever look at the current window, so this is purely about
//! bounding table growth; nothing depends on it having run.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::storage::backend::Database;

pub const DEFAULT_RETENTION_MINUTES: u32 = 5;

/// Runs `cleanup(retention_minutes)` every `every` until the task is aborted.
pub fn spawn_cleanup_task(
    db: Arc<dyn Database>,
    every: Duration,
    retention_minutes: u32,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match db.cleanup(retention_minutes).await {
                Ok(0) => {}
                Ok(removed) => debug!("Cleanup removed {removed} expired rate limit rows"),
                Err(e) => warn!("Cleanup pass failed: {e}"),
            }
        }
    })
}
