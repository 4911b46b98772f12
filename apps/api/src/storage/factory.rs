//! Backend selection.
//!
//! `DatabaseFactory` is built once at startup from configuration and handed
//! to whoever needs storage. It constructs the selected backend on first
//! use, hands out clones of that one instance afterwards, and can be reset
//! (closing the instance) so tests start from a clean slate.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::storage::backend::{Database, DatabaseType, StorageError, StorageResult};
use crate::storage::postgres::PostgresDatabase;
use crate::storage::sqlite::SqliteDatabase;
use crate::storage::window::SharedClock;

pub const DEFAULT_SQLITE_PATH: &str = "./data/resume-alchemist.db";

/// Connection parameters for both backends; only the selected one is used.
#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub kind: DatabaseType,
    pub sqlite_path: PathBuf,
    pub sqlite_max_connections: u32,
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub op_timeout: Duration,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            kind: DatabaseType::Sqlite,
            sqlite_path: PathBuf::from(DEFAULT_SQLITE_PATH),
            sqlite_max_connections: 4,
            database_url: None,
            max_connections: 10,
            op_timeout: Duration::from_millis(3000),
        }
    }
}

impl DatabaseSettings {
    /// Fails fast when the selected backend lacks its connection parameters.
    pub fn validate(&self) -> StorageResult<()> {
        match self.kind {
            DatabaseType::Sqlite => {
                if self.sqlite_path.as_os_str().is_empty() {
                    return Err(StorageError::Configuration(
                        "SQLITE_DB_PATH must not be empty".to_string(),
                    ));
                }
            }
            DatabaseType::Supabase => {
                if self.database_url.as_deref().map_or(true, |u| u.trim().is_empty()) {
                    return Err(StorageError::Configuration(
                        "DATABASE_URL is required when DATABASE_TYPE=supabase".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Constructs the backend named by `settings`.
pub async fn create_database(
    settings: &DatabaseSettings,
    clock: SharedClock,
) -> StorageResult<Arc<dyn Database>> {
    settings.validate()?;

    match settings.kind {
        DatabaseType::Sqlite => {
            let db = SqliteDatabase::open(
                &settings.sqlite_path,
                settings.sqlite_max_connections,
                clock,
            )
            .await?;
            Ok(Arc::new(db))
        }
        DatabaseType::Supabase => {
            let url = settings.database_url.as_deref().unwrap_or_default();
            let db = PostgresDatabase::connect_lazy(
                url,
                settings.max_connections,
                settings.op_timeout,
                clock,
            )?;
            if let Err(e) = db.ensure_schema().await {
                warn!("Could not verify PostgreSQL schema, continuing: {e}");
            }
            Ok(Arc::new(db))
        }
    }
}

pub struct DatabaseFactory {
    settings: DatabaseSettings,
    clock: SharedClock,
    instance: Mutex<Option<Arc<dyn Database>>>,
}

impl DatabaseFactory {
    pub fn new(settings: DatabaseSettings, clock: SharedClock) -> Self {
        Self {
            settings,
            clock,
            instance: Mutex::new(None),
        }
    }

    pub fn database_type(&self) -> DatabaseType {
        self.settings.kind
    }

    /// Returns the shared backend, constructing it on first call.
    pub async fn get(&self) -> StorageResult<Arc<dyn Database>> {
        let mut slot = self.instance.lock().await;
        if let Some(db) = slot.as_ref() {
            return Ok(db.clone());
        }

        info!("Initializing {} database backend", self.settings.kind);
        let db = create_database(&self.settings, self.clock.clone()).await?;
        *slot = Some(db.clone());
        Ok(db)
    }

    #[cfg(test)]
    pub async fn is_initialized(&self) -> bool {
        self.instance.lock().await.is_some()
    }

    /// Closes and forgets the cached backend. The next `get` builds a new one.
    pub async fn reset(&self) {
        let previous = self.instance.lock().await.take();
        if let Some(db) = previous {
            db.close().await;
        }
    }
}
