use crate::error::ApiError;
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, State};
use serde_json::Value;

/// `GET /chart/{task_id}/{ticker}`: serves a cached detail record verbatim,
/// or 404 if it's missing or its TTL has expired.
pub async fn chart_handler(
    State(state): State<AppState>,
    Path((task_id, ticker)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let mut cache = state.cache.clone();
    match cache.get_detail(&task_id, &ticker).await? {
        Some(value) => Ok(Json(value)),
        None => Err(ApiError::NotFound),
    }
}
