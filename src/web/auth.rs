//! Authentication endpoints: phone + code (+ optional 2FA) and QR login.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::core::config;
use crate::core::error::AppError;
use crate::storage::users;
use crate::web::{with_session_cookie, ApiError, ApiResult, AppState};

fn api_credentials() -> ApiResult<(i32, String)> {
    match (*config::API_ID, config::API_HASH.clone()) {
        (Some(id), Some(hash)) => Ok((id, hash)),
        _ => Err(ApiError(AppError::InvalidInput(
            "TG_API_ID / TG_API_HASH are not configured".to_string(),
        ))),
    }
}

#[derive(Deserialize)]
pub struct SendCodeRequest {
    pub phone: String,
}

pub async fn send_code(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SendCodeRequest>,
) -> ApiResult<Response> {
    let (api_id, api_hash) = api_credentials()?;
    let start = state.runtime.broker.start_auth(&req.phone, api_id, &api_hash).await?;

    let (cookie_id, fresh) = state.ensure_session(&headers);
    state.update_session(&cookie_id, |s| {
        s.session_key = Some(start.session_key.clone());
        s.phone_code_hash = Some(start.phone_code_hash.clone());
        s.authenticated = false;
    });

    let body = Json(json!({
        "success": true,
        "session_key": start.session_key,
        "phone_code_hash": start.phone_code_hash,
    }));
    Ok(with_session_cookie(body.into_response(), &cookie_id, fresh))
}

#[derive(Deserialize)]
pub struct VerifyCodeRequest {
    pub session_key: String,
    pub verification_code: String,
    #[serde(default)]
    pub phone_code_hash: Option<String>,
}

pub async fn verify_code(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<VerifyCodeRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let phone_code_hash = req
        .phone_code_hash
        .or_else(|| state.session(&headers).and_then(|s| s.phone_code_hash))
        .ok_or_else(|| ApiError(AppError::InvalidInput("missing phone_code_hash".to_string())))?;

    let verify = state
        .runtime
        .broker
        .verify_code(&req.session_key, &req.verification_code, &phone_code_hash)
        .await?;

    if verify.requires_password {
        return Ok(Json(json!({ "success": true, "requires_password": true })));
    }

    let user = verify.user_info;
    if let Some(user) = &user {
        record_authenticated_user(&state, &headers, &req.session_key, user);
    }
    Ok(Json(json!({ "success": true, "user_info": user })))
}

#[derive(Deserialize)]
pub struct VerifyPasswordRequest {
    pub session_key: String,
    pub password: String,
}

pub async fn verify_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<VerifyPasswordRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let user = state
        .runtime
        .broker
        .verify_password(&req.session_key, &req.password)
        .await?;
    record_authenticated_user(&state, &headers, &req.session_key, &user);
    Ok(Json(json!({ "success": true, "user_info": user })))
}

pub async fn qr_login(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Response> {
    let (api_id, api_hash) = api_credentials()?;
    let start = state.runtime.broker.start_qr_login(api_id, &api_hash).await?;

    let (cookie_id, fresh) = state.ensure_session(&headers);
    state.update_session(&cookie_id, |s| {
        s.session_key = Some(start.session_key.clone());
        s.authenticated = false;
    });

    let body = Json(json!({
        "success": true,
        "session_key": start.session_key,
        "qr_token": start.qr_token,
        "expires": start.expires_at,
    }));
    Ok(with_session_cookie(body.into_response(), &cookie_id, fresh))
}

#[derive(Deserialize)]
pub struct QrStatusRequest {
    pub session_key: String,
}

pub async fn check_qr_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<QrStatusRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let status = state.runtime.broker.check_qr_status(&req.session_key).await?;
    if let Some(user) = &status.user_info {
        record_authenticated_user(&state, &headers, &req.session_key, user);
    }
    Ok(Json(json!({
        "success": true,
        "authenticated": status.authenticated,
        "expired": status.expired,
        "user_info": status.user_info,
    })))
}

pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<serde_json::Value>> {
    if let Some(cookie_id) = AppState::cookie_id(&headers) {
        let session = state.sessions.remove(&cookie_id).map(|(_, s)| s);
        if let Some(session) = session {
            if let Some(key) = session.session_key {
                state.runtime.broker.logout(&key).await?;
            }
        }
    }
    Ok(Json(json!({ "success": true })))
}

/// Marks the web session authenticated and records the authorized user.
fn record_authenticated_user(
    state: &AppState,
    headers: &HeaderMap,
    session_key: &str,
    user: &crate::client::types::UserInfo,
) {
    if let Some(cookie_id) = AppState::cookie_id(headers) {
        state.update_session(&cookie_id, |s| {
            s.session_key = Some(session_key.to_string());
            s.user_id = Some(user.id);
            s.authenticated = true;
            s.phone_code_hash = None;
        });
    }
    if let Err(e) = users::upsert(
        &state.runtime.db,
        user.id,
        user.username.as_deref(),
        user.first_name.as_deref(),
        user.last_name.as_deref(),
    ) {
        log::warn!("Failed to record authorized user {}: {}", user.id, e);
    }
}
