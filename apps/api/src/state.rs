use std::sync::Arc;

use crate::config::Config;
use crate::storage::{Database, SharedClock, UsageCounter};

/// Shared application state injected into all route handlers via Axum extractors.
///
/// The storage backend is built once at startup by `DatabaseFactory` and
/// passed in here; nothing reaches it through a global.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn Database>,
    pub usage: UsageCounter,
    pub clock: SharedClock,
    pub config: Config,
}

impl AppState {
    pub fn new(db: Arc<dyn Database>, clock: SharedClock, config: Config) -> Self {
        let usage = UsageCounter::new(db.clone(), clock.clone());
        Self {
            db,
            usage,
            clock,
            config,
        }
    }
}

#[cfg(test)]
pub mod testing {
    use std::sync::Arc;
    use std::time::Duration;

    use tempfile::TempDir;

    use super::AppState;
    use crate::config::Config;
    use crate::storage::sqlite::SqliteDatabase;
    use crate::storage::{DatabaseSettings, SharedClock};

    /// State backed by a throwaway SQLite file inside `dir`.
    pub async fn sqlite_state(dir: &TempDir, clock: SharedClock, max_requests: u32) -> AppState {
        let settings = DatabaseSettings {
            sqlite_path: dir.path().join("app.db"),
            ..DatabaseSettings::default()
        };
        let db = SqliteDatabase::open(&settings.sqlite_path, 2, clock.clone())
            .await
            .unwrap();
        let config = Config {
            database: settings,
            rate_limit_max_requests: max_requests,
            cleanup_interval: Duration::from_secs(60),
            cleanup_retention_minutes: 5,
            port: 0,
            rust_log: "info".to_string(),
        };
        AppState::new(Arc::new(db), clock, config)
    }
}
