//! ZIP packaging endpoints.
//!
//! A job is created per request; its status endpoint is side-effect free
//! until `?download=true`, which streams the archive exactly once and purges
//! the manager. Subsequent requests answer 410 Gone.

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio_util::io::ReaderStream;

use crate::core::error::AppError;
use crate::download::zip::ZipPackager;
use crate::web::{ApiError, ApiResult, AppState};

#[derive(Deserialize)]
pub struct ZipRequest {
    pub chat_id: i64,
    pub message_ids: Vec<i64>,
    #[serde(default)]
    pub session_key: Option<String>,
}

pub async fn create_zip_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ZipRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if req.message_ids.is_empty() {
        return Err(ApiError(AppError::InvalidInput(
            "provide a chat id and a message id list".to_string(),
        )));
    }

    let session_key = state.resolve_session_key(&headers, req.session_key.as_deref());
    let client = match &session_key {
        Some(key) => state.runtime.broker.session_client(key),
        None => state.runtime.broker.any_client().map(|(_, c)| c),
    };
    let Some(client) = client else {
        return Err(ApiError(AppError::AuthRequired));
    };

    let packager = ZipPackager::new(req.chat_id, req.message_ids, &state.runtime.settings.zip_staging_root)?;
    packager.prepare(&client).await;
    state.runtime.zips.insert(Arc::clone(&packager));

    let manager_id = packager.manager_id.clone();
    let expected = packager.expected_zip_filename();

    let runtime = Arc::clone(&state.runtime);
    tokio::spawn(async move {
        if let Err(e) = packager.start_downloads(&runtime, &client).await {
            log::error!("ZIP job {} failed to submit: {}", packager.manager_id, e);
        }
    });

    Ok(Json(json!({
        "success": true,
        "manager_id": manager_id,
        "expected_zip_filename": expected,
    })))
}

#[derive(Deserialize)]
pub struct ZipStatusQuery {
    #[serde(default)]
    pub download: bool,
}

pub async fn zip_status(
    State(state): State<AppState>,
    Path(manager_id): Path<String>,
    Query(query): Query<ZipStatusQuery>,
) -> Response {
    let Some(manager) = state.runtime.zips.get(&manager_id) else {
        return (
            StatusCode::GONE,
            Json(json!({ "success": false, "error": "archive no longer available" })),
        )
            .into_response();
    };

    let status = manager.status();
    if !query.download {
        return Json(json!({
            "success": true,
            "manager_id": status.manager_id,
            "total": status.total,
            "downloaded": status.downloaded,
            "failed": status.failed,
            "completed": status.completed,
            "ready": status.ready,
            "cancelled": status.cancelled,
            "zip_filename": status.zip_filename,
        }))
        .into_response();
    }

    if !status.ready {
        return Json(json!({
            "success": false,
            "error": "archive is not ready",
            "completed": status.completed,
            "ready": false,
        }))
        .into_response();
    }

    let Some(zip_path) = manager.zip_path() else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "error": "archive path missing" })),
        )
            .into_response();
    };
    let nonempty = std::fs::metadata(&zip_path).map(|m| m.len() > 0).unwrap_or(false);
    if !nonempty {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "error": "archive is empty" })),
        )
            .into_response();
    }

    let file = match tokio::fs::File::open(&zip_path).await {
        Ok(f) => f,
        Err(e) => {
            log::error!("Failed to open archive {}: {}", zip_path.display(), e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": "archive unreadable" })),
            )
                .into_response();
        }
    };

    // Served exactly once: purge before the stream finishes, the open file
    // handle keeps the bytes alive. State cleanup follows once the stream
    // has had time to drain.
    state.runtime.zips.remove(&manager_id);
    state.runtime.tracker.release_zip_claims(&manager_id);
    let cleanup = Arc::clone(&manager);
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        cleanup.cleanup_files();
    });

    let filename = status.zip_filename.unwrap_or_else(|| "archive.zip".to_string());
    let stream = ReaderStream::new(file);
    let mut response = Body::from_stream(stream).into_response();
    let response_headers = response.headers_mut();
    if let Ok(value) = "application/zip".parse() {
        response_headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = format!("attachment; filename=\"{}\"", filename).parse() {
        response_headers.insert(header::CONTENT_DISPOSITION, value);
    }
    response
}

#[derive(Deserialize)]
pub struct ZipCancelRequest {
    pub manager_id: String,
}

pub async fn cancel_zip_job(
    State(state): State<AppState>,
    Json(req): Json<ZipCancelRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let Some(manager) = state.runtime.zips.remove(&req.manager_id) else {
        return Err(ApiError(AppError::InvalidInput("unknown manager id".to_string())));
    };
    manager.cancel(&state.runtime.tracker);
    Ok(Json(json!({ "success": true })))
}
