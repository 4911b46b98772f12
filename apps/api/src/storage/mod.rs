//! Rate limiting and usage storage.
//!
//! Two interchangeable backends sit behind the `Database` trait:
//! - SQLite (embedded file, self-hosted)
//! - PostgreSQL (remote, hosted on Supabase)
//!
//! Rate limiting is a fixed one-minute window per (client, endpoint), not a
//! sliding window or token bucket.

pub mod backend;
pub mod cleanup;
pub mod factory;
pub mod postgres;
pub mod sqlite;
pub mod usage;
pub mod window;

pub use backend::{Database, DatabaseType, DateRange, StorageError, UsageStats};
pub use cleanup::{spawn_cleanup_task, DEFAULT_RETENTION_MINUTES};
pub use factory::{DatabaseFactory, DatabaseSettings};
pub use usage::UsageCounter;
pub use window::{seconds_until_next_window, SharedClock, SystemClock};
