use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;

use crate::errors::AppError;
use crate::state::AppState;
use crate::storage::{DateRange, UsageStats};

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    pub start: Option<String>,
    pub end: Option<String>,
}

/// GET /api/v1/usage?start=YYYY-MM-DD&end=YYYY-MM-DD
/// Daily usage, newest first. Both bounds are inclusive and must be given together.
pub async fn handle_usage(
    State(state): State<AppState>,
    Query(params): Query<UsageQuery>,
) -> Result<Json<Vec<UsageStats>>, AppError> {
    let range = match (params.start.as_deref(), params.end.as_deref()) {
        (Some(start), Some(end)) => Some(DateRange::parse(start, end)?),
        (None, None) => None,
        _ => {
            return Err(AppError::Validation(
                "start and end must be provided together".to_string(),
            ))
        }
    };
    Ok(Json(state.usage.stats(range).await?))
}
