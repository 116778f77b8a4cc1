//! Group and message listing endpoints.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::core::error::AppError;
use crate::web::{ApiError, ApiResult, AppState};

fn require_session_key(state: &AppState, headers: &HeaderMap, explicit: Option<&str>) -> ApiResult<String> {
    state
        .resolve_session_key(headers, explicit)
        .ok_or_else(|| ApiError(AppError::AuthRequired))
}

pub async fn list_groups(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<serde_json::Value>> {
    let session_key = require_session_key(&state, &headers, None)?;
    let groups = state.runtime.broker.list_groups(&session_key).await?;
    Ok(Json(json!({ "success": true, "groups": groups })))
}

#[derive(Deserialize)]
pub struct MessagesRequest {
    pub chat_id: i64,
    #[serde(default)]
    pub session_key: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset_id: i64,
    #[serde(default)]
    pub media_only: bool,
}

fn default_limit() -> usize {
    50
}

pub async fn list_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<MessagesRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let session_key = require_session_key(&state, &headers, req.session_key.as_deref())?;
    let messages = state
        .runtime
        .broker
        .list_messages(&session_key, req.chat_id, req.limit, req.offset_id, req.media_only)
        .await?;
    Ok(Json(json!({
        "success": true,
        "count": messages.len(),
        "messages": messages,
    })))
}

#[derive(Deserialize)]
pub struct MediaStatisticsRequest {
    pub chat_id: i64,
    #[serde(default)]
    pub session_key: Option<String>,
}

pub async fn media_statistics(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<MediaStatisticsRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let session_key = require_session_key(&state, &headers, req.session_key.as_deref())?;
    let statistics = state
        .runtime
        .broker
        .get_media_statistics(&session_key, req.chat_id)
        .await?;
    Ok(Json(json!({ "success": true, "statistics": statistics })))
}
