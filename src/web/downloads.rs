//! Fast-download endpoints: target submission, progress polling, run-state
//! control and cleanup.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::error::AppError;
use crate::download::custom;
use crate::progress::DownloadState;
use crate::storage::{custom as custom_repo, queue as durable_queue};
use crate::web::{ApiError, ApiResult, AppState};

#[derive(Deserialize)]
pub struct AddTasksRequest {
    pub chat_id: i64,
    pub message_ids: Vec<i64>,
    #[serde(default)]
    pub session_key: Option<String>,
    /// Set by the bot relay: the user whose chat receives the files
    #[serde(default)]
    pub from_user_id: Option<i64>,
    /// Set by the bot relay: the reply message the notifier keeps editing
    #[serde(default)]
    pub bot_reply_message_id: Option<i64>,
}

pub async fn add_tasks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<AddTasksRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if req.message_ids.is_empty() {
        return Err(ApiError(AppError::InvalidInput("message_ids is empty".to_string())));
    }
    let chat_key = req.chat_id.to_string();
    let added = custom_repo::add_targets(&state.runtime.db, &chat_key, &req.message_ids)?;
    let total = custom_repo::find(&state.runtime.db, &chat_key)?
        .map(|c| c.target_message_ids.len())
        .unwrap_or(0);

    // Kick the backlog off right away unless a run is already active.
    let runtime = &state.runtime;
    let download_triggered = match runtime.tracker.state() {
        DownloadState::Idle | DownloadState::Completed => {
            let session_key = state.resolve_session_key(&headers, req.session_key.as_deref());
            let client = match &session_key {
                Some(key) => runtime.broker.session_client(key),
                None => runtime.broker.any_client().map(|(_, c)| c),
            };
            match client {
                Some(client) => {
                    runtime.tracker.set_state(DownloadState::Downloading);
                    // Bot-relayed requests get an aggregate job node; the run
                    // spawns the reply-message notifier for it and per-message
                    // nodes inherit the identity.
                    let job = if req.from_user_id.is_some() || req.bot_reply_message_id.is_some() {
                        Some(runtime.tasks.alloc_with(req.chat_id, |n| {
                            n.from_user_id = req.from_user_id;
                            n.bot_reply_message_id = req.bot_reply_message_id;
                            n.client_key = session_key.clone();
                        }))
                    } else {
                        None
                    };
                    let rt = Arc::clone(runtime);
                    tokio::spawn(async move {
                        let summary = custom::run_custom_download(&rt, &client, job).await;
                        match summary {
                            Ok(summary) => log::info!(
                                "Fast download finished: {} ok, {} failed",
                                summary.successful,
                                summary.failed
                            ),
                            Err(e) => log::error!("Fast download run failed: {}", e),
                        }
                        // Cancel wins over completion.
                        if rt.tracker.state() == DownloadState::Downloading {
                            rt.tracker.set_state(DownloadState::Completed);
                        }
                    });
                    true
                }
                None => {
                    log::warn!("Tasks added but no authenticated client to run them");
                    false
                }
            }
        }
        _ => false,
    };

    Ok(Json(json!({
        "success": true,
        "added_count": added,
        "total_count": total,
        "download_triggered": download_triggered,
    })))
}

pub async fn status(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<serde_json::Value>> {
    let runtime = &state.runtime;
    let nodes = runtime.tasks.all_nodes();
    let total_task: u64 = nodes.iter().map(|n| n.total_task()).sum();
    let completed_task: u64 = nodes.iter().map(|n| n.finish_task()).sum();
    let active = nodes.iter().any(|n| n.is_running());

    let entries = runtime.tracker.snapshot();
    let downloaded_size: u64 = entries.iter().map(|(_, _, p)| p.down_byte).sum();
    let total_size: u64 = entries.iter().map(|(_, _, p)| p.total_size).sum();
    let download_speed = runtime.tracker.total_download_speed();
    let remaining = total_size.saturating_sub(downloaded_size);
    let eta_seconds = if download_speed > 0 { remaining / download_speed } else { 0 };

    let current_files: Vec<serde_json::Value> = entries
        .iter()
        .map(|(chat_id, message_id, p)| {
            json!({
                "chat_id": chat_id,
                "message_id": message_id,
                "file_name": p.file_name,
                "downloaded": p.down_byte,
                "total": p.total_size,
                "percent": p.percent(),
                "speed": p.download_speed,
                "task_id": p.task_id,
            })
        })
        .collect();

    let session = state.session(&headers).map(|s| {
        json!({
            "authenticated": s.authenticated,
            "user_id": s.user_id,
        })
    });

    Ok(Json(json!({
        "success": true,
        "progress": {
            "active": active,
            "total_task": total_task,
            "completed_task": completed_task,
            "downloaded_size": downloaded_size,
            "total_size": total_size,
            "download_speed": download_speed,
            "remaining_files": total_task.saturating_sub(completed_task),
            "current_files": current_files,
            "eta_seconds": eta_seconds,
        },
        "session": session,
        "download_state": runtime.tracker.state().as_str(),
    })))
}

pub async fn cleanup(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let runtime = &state.runtime;
    let pruned_tasks = runtime.tasks.prune_finished();
    let pruned_queue = durable_queue::prune_terminal(&runtime.db)?;
    if runtime.tasks.running_nodes().is_empty() {
        runtime.tracker.clear();
        runtime.tracker.set_state(DownloadState::Idle);
    }
    Ok(Json(json!({
        "success": true,
        "pruned_tasks": pruned_tasks,
        "pruned_queue_entries": pruned_queue,
    })))
}

#[derive(Deserialize)]
pub struct StateRequest {
    pub action: String,
    #[serde(default)]
    pub session_key: Option<String>,
}

/// Run-state machine:
///
/// ```text
/// Idle --start--> Downloading --pause--> StopDownload --continue--> Downloading
///   ^                |                        |
///   |                +--cancel--> Cancelled   +--cancel--> Cancelled
///   +---- reset (new session) ----------------------------+
///                Downloading --all-done--> Completed --reset--> Idle
/// ```
pub async fn set_state(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<StateRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let runtime = &state.runtime;
    let tracker = &runtime.tracker;
    let current = tracker.state();

    match req.action.as_str() {
        "start" => {
            if matches!(current, DownloadState::Idle | DownloadState::Completed) {
                let session_key = state.resolve_session_key(&headers, req.session_key.as_deref());
                let client = match &session_key {
                    Some(key) => runtime.broker.session_client(key),
                    None => runtime.broker.any_client().map(|(_, c)| c),
                };
                let Some(client) = client else {
                    return Err(ApiError(AppError::AuthRequired));
                };
                tracker.set_state(DownloadState::Downloading);
                let rt = Arc::clone(runtime);
                tokio::spawn(async move {
                    if let Err(e) = custom::run_custom_download(&rt, &client, None).await {
                        log::error!("Download run failed: {}", e);
                    }
                    if rt.tracker.state() == DownloadState::Downloading {
                        rt.tracker.set_state(DownloadState::Completed);
                    }
                });
            }
        }
        "pause" => {
            if current == DownloadState::Downloading {
                tracker.set_state(DownloadState::StopDownload);
            }
        }
        "continue" => {
            if current == DownloadState::StopDownload {
                tracker.set_state(DownloadState::Downloading);
            }
        }
        "cancel" => {
            tracker.set_state(DownloadState::Cancelled);
            // Cooperative teardown: stop every job, drop queued work, clear
            // progress and discard all ZIP state including temp dirs.
            runtime.tasks.stop_all();
            let drained = runtime.queue.drain().await;
            log::info!("Cancel drained {} queued entries", drained);
            runtime.zips.cancel_all(tracker);
            runtime.zips.sweep_orphan_temp_dirs(&runtime.settings.zip_staging_root);
            tracker.clear();
        }
        "reset" => {
            tracker.clear();
            runtime.tasks.prune_finished();
            runtime.zips.sweep_orphan_temp_dirs(&runtime.settings.zip_staging_root);
            tracker.set_state(DownloadState::Idle);
        }
        other => {
            return Err(ApiError(AppError::InvalidInput(format!("unknown action: {}", other))));
        }
    }

    Ok(Json(json!({
        "success": true,
        "download_state": runtime.tracker.state().as_str(),
    })))
}

/// Targets listing used by the selection UI.
pub async fn list_targets(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let targets: HashMap<String, Vec<i64>> = custom_repo::all_targets(&state.runtime.db)?;
    Ok(Json(json!({ "success": true, "targets": targets })))
}
