mod config;
mod errors;
mod rate_limit;
mod routes;
mod state;
mod storage;

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::routes::build_router;
use crate::state::AppState;
use crate::storage::{spawn_cleanup_task, DatabaseFactory, SharedClock, SystemClock};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing connection parameters)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Resume Alchemist API v{}", env!("CARGO_PKG_VERSION"));

    // Initialize storage once; everything below receives it explicitly
    let clock: SharedClock = Arc::new(SystemClock);
    let factory = DatabaseFactory::new(config.database.clone(), clock.clone());
    let db = factory.get().await?;
    info!("Database: {}", factory.database_type());

    let cleanup = spawn_cleanup_task(
        db.clone(),
        config.cleanup_interval,
        config.cleanup_retention_minutes,
    );
    info!(
        "Rate limit: {} requests/minute, cleanup every {:?} (retention {} min)",
        config.rate_limit_max_requests, config.cleanup_interval, config.cleanup_retention_minutes
    );

    // Build app state
    let state = AppState::new(db, clock, config.clone());

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    cleanup.abort();
    factory.reset().await;
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
