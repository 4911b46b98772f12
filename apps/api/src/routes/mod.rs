pub mod health;
pub mod usage;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::errors::AppError;
use crate::rate_limit::{enforce_rate_limit, RateLimitGuard};
use crate::state::AppState;

/// Endpoint names used as the rate-limit bucket for the AI routes.
pub const RESUME_AI: &str = "resume-ai";
pub const RESUME_AI_STREAM: &str = "resume-ai-stream";

// The AI handlers live in the prompt service; only the throttled routes exist here.
async fn not_implemented() -> Result<(), AppError> {
    Err(AppError::NotImplemented)
}

async fn not_found() -> AppError {
    AppError::NotFound("Not Found".to_string())
}

/// POST routes for one billable endpoint, each behind its rate limit.
fn billable(state: &AppState, endpoint: &'static str, paths: &[&str]) -> Router<AppState> {
    let guard = RateLimitGuard::new(state, endpoint);
    paths
        .iter()
        .fold(Router::new(), |router, path| {
            router.route(path, post(not_implemented))
        })
        .route_layer(middleware::from_fn_with_state(guard, enforce_rate_limit))
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health::health_handler))
        .route("/health", get(health::health_handler))
        .route("/api/v1/usage", get(usage::handle_usage))
        .merge(billable(
            &state,
            RESUME_AI,
            &["/resume-ai", "/functions/v1/resume-ai"],
        ))
        .merge(billable(
            &state,
            RESUME_AI_STREAM,
            &["/resume-ai-stream", "/functions/v1/resume-ai-stream"],
        ))
        .fallback(not_found)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use chrono::{NaiveDate, TimeZone, Utc};
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::*;
    use crate::state::testing::sqlite_state;
    use crate::storage::window::testing::ManualClock;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
        ))
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_database() {
        let dir = TempDir::new().unwrap();
        let app = build_router(sqlite_state(&dir, clock(), 5).await);

        let response = app.oneshot(get_request("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["database"], "sqlite");
    }

    #[tokio::test]
    async fn test_usage_endpoint_filters_and_orders() {
        let dir = TempDir::new().unwrap();
        let state = sqlite_state(&dir, clock(), 5).await;
        for day in [1, 2, 3, 4] {
            state
                .db
                .increment_usage_stats(NaiveDate::from_ymd_opt(2024, 5, day).unwrap())
                .await
                .unwrap();
        }
        let app = build_router(state);

        let response = app
            .clone()
            .oneshot(get_request("/api/v1/usage?start=2024-05-02&end=2024-05-03"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        let dates: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|row| row["date"].as_str().unwrap())
            .collect();
        assert_eq!(dates, vec!["2024-05-03", "2024-05-02"]);

        let all = json_body(app.oneshot(get_request("/api/v1/usage")).await.unwrap()).await;
        assert_eq!(all.as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_usage_endpoint_rejects_bad_ranges() {
        let dir = TempDir::new().unwrap();
        let app = build_router(sqlite_state(&dir, clock(), 5).await);

        let half = app
            .clone()
            .oneshot(get_request("/api/v1/usage?start=2024-05-02"))
            .await
            .unwrap();
        assert_eq!(half.status(), StatusCode::BAD_REQUEST);

        let malformed = app
            .oneshot(get_request("/api/v1/usage?start=2024-5-2&end=2024-05-03"))
            .await
            .unwrap();
        assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_ai_routes_are_throttled_per_endpoint() {
        let dir = TempDir::new().unwrap();
        let app = build_router(sqlite_state(&dir, clock(), 1).await);

        let ai_request = |uri: &str| {
            Request::post(uri)
                .header("x-forwarded-for", "203.0.113.7")
                .body(Body::empty())
                .unwrap()
        };

        let first = app.clone().oneshot(ai_request("/resume-ai")).await.unwrap();
        assert_eq!(first.status(), StatusCode::NOT_IMPLEMENTED);

        // The alias shares the bucket with the primary path.
        let second = app.clone().oneshot(ai_request("/functions/v1/resume-ai")).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);

        let stream = app.clone().oneshot(ai_request("/resume-ai-stream")).await.unwrap();
        assert_eq!(stream.status(), StatusCode::NOT_IMPLEMENTED);

        let missing = app.oneshot(get_request("/nope")).await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
