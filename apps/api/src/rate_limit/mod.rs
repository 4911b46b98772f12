//! Per-client throttling for billable endpoints.
//!
//! Each request is charged against the client's current one-minute window
//! before the handler runs. Denied requests get a 429 with `Retry-After`
//! pointing at the next window. A handler response in the 2xx range counts
//! as one completed billable action in the daily usage stats.

mod client;

pub use client::client_identifier;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderValue,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{info, warn};

use crate::errors::AppError;
use crate::state::AppState;
use crate::storage::{seconds_until_next_window, Database, SharedClock, UsageCounter};

/// Middleware state for one billable endpoint.
#[derive(Clone)]
pub struct RateLimitGuard {
    db: Arc<dyn Database>,
    usage: UsageCounter,
    clock: SharedClock,
    endpoint: &'static str,
    max_requests: u32,
}

impl RateLimitGuard {
    pub fn new(state: &AppState, endpoint: &'static str) -> Self {
        Self {
            db: state.db.clone(),
            usage: state.usage.clone(),
            clock: state.clock.clone(),
            endpoint,
            max_requests: state.config.rate_limit_max_requests,
        }
    }
}

fn set_limit_headers(response: &mut Response, limit: u32, remaining: u32) {
    let headers = response.headers_mut();
    headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(remaining));
}

pub async fn enforce_rate_limit(
    State(guard): State<RateLimitGuard>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip());
    let client = client_identifier(req.headers(), peer);

    let decision = guard
        .db
        .check_rate_limit(&client, guard.endpoint, guard.max_requests)
        .await?;

    if !decision.allowed {
        info!("Rate limit exceeded for {client} on {}", guard.endpoint);
        let mut response = AppError::RateLimited {
            retry_after_secs: seconds_until_next_window(guard.clock.now()),
        }
        .into_response();
        set_limit_headers(&mut response, guard.max_requests, 0);
        return Ok(response);
    }

    let mut response = next.run(req).await;
    set_limit_headers(&mut response, guard.max_requests, decision.remaining);

    if response.status().is_success() {
        if let Err(e) = guard.usage.record_success().await {
            warn!("Could not record usage for {}: {e}", guard.endpoint);
        }
    }

    Ok(response)
}
