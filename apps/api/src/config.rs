use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::storage::factory::DEFAULT_SQLITE_PATH;
use crate::storage::{DatabaseSettings, DatabaseType, DEFAULT_RETENTION_MINUTES};

/// Application configuration loaded from environment variables.
/// Fails at startup if the selected database is missing its parameters.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseSettings,
    /// Requests per client per endpoint per minute.
    pub rate_limit_max_requests: u32,
    pub cleanup_interval: Duration,
    pub cleanup_retention_minutes: u32,
    pub port: u16,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let kind = DatabaseType::from_str(&env_or("DATABASE_TYPE", "sqlite"))?;
        let database = DatabaseSettings {
            kind,
            sqlite_path: PathBuf::from(env_or("SQLITE_DB_PATH", DEFAULT_SQLITE_PATH)),
            sqlite_max_connections: parse_env("SQLITE_MAX_CONNECTIONS", 4)?,
            database_url: match kind {
                DatabaseType::Supabase => Some(require_env("DATABASE_URL")?),
                DatabaseType::Sqlite => std::env::var("DATABASE_URL").ok(),
            },
            max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 10)?,
            op_timeout: Duration::from_millis(parse_env("DATABASE_TIMEOUT_MS", 3000)?),
        };
        database.validate()?;

        let rate_limit_max_requests: u32 = parse_env("RATE_LIMIT_MAX_REQUESTS", 10)?;
        anyhow::ensure!(
            rate_limit_max_requests > 0,
            "RATE_LIMIT_MAX_REQUESTS must be greater than zero"
        );

        Ok(Config {
            database,
            rate_limit_max_requests,
            cleanup_interval: Duration::from_secs(parse_env::<u64>("CLEANUP_INTERVAL_SECS", 60)?.max(1)),
            cleanup_retention_minutes: parse_env(
                "CLEANUP_RETENTION_MINUTES",
                DEFAULT_RETENTION_MINUTES,
            )?,
            port: parse_env("PORT", 8000)?,
            rust_log: env_or("RUST_LOG", "info"),
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{key} must be a valid number, got '{raw}'")),
        Err(_) => Ok(default),
    }
}
