//! The axum application and server entry point.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

use crate::core::runtime::Runtime;
use crate::web::{auth, downloads, groups, zip_api, AppState};

/// Builds the control-surface router.
pub fn build_router(runtime: Arc<Runtime>) -> Router {
    let state = AppState::new(runtime);

    Router::new()
        .route("/api/auth/send_code", post(auth::send_code))
        .route("/api/auth/verify_code", post(auth::verify_code))
        .route("/api/auth/verify_password", post(auth::verify_password))
        .route("/api/auth/qr_login", post(auth::qr_login))
        .route("/api/auth/check_qr_status", post(auth::check_qr_status))
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/groups/list", get(groups::list_groups))
        .route("/api/groups/messages", post(groups::list_messages))
        .route("/api/groups/media_statistics", post(groups::media_statistics))
        .route("/api/fast_download/add_tasks", post(downloads::add_tasks))
        .route("/api/fast_download/status", get(downloads::status))
        .route("/api/fast_download/cleanup", post(downloads::cleanup))
        .route("/api/fast_download/targets", get(downloads::list_targets))
        .route("/api/download/state", post(downloads::set_state))
        .route("/api/download/zip", post(zip_api::create_zip_job))
        .route("/api/download/zip/status/{manager_id}", get(zip_api::zip_status))
        .route("/api/download/zip/cancel", post(zip_api::cancel_zip_job))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Starts the web server. Returns when the listener fails or the process
/// shuts down.
pub async fn start_web_server(runtime: Arc<Runtime>, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = build_router(runtime);

    log::info!("Starting web server on http://{}", addr);
    log::info!("  /api/auth/*          - login flows");
    log::info!("  /api/groups/*        - dialog and message listing");
    log::info!("  /api/fast_download/* - batch downloads and progress");
    log::info!("  /api/download/zip    - ZIP packaging");
    log::info!("  /health              - health check");

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
