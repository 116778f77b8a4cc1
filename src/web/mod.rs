//! HTTP control surface: stateless wrappers over the broker, the custom
//! download manager, the ZIP registry and the progress tracker.

pub mod auth;
pub mod downloads;
pub mod groups;
pub mod server;
pub mod zip_api;

use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::core::error::AppError;
use crate::core::runtime::Runtime;

/// Cookie carrying the opaque web session id.
pub const SESSION_COOKIE: &str = "tgdl_session";

/// Server-side state bound to one browser session.
#[derive(Debug, Clone, Default)]
pub struct WebSession {
    /// Broker session key for the upstream client of this browser
    pub session_key: Option<String>,
    /// phone_code_hash stashed between send_code and verify_code
    pub phone_code_hash: Option<String>,
    pub user_id: Option<i64>,
    pub authenticated: bool,
}

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<Runtime>,
    pub sessions: Arc<DashMap<String, WebSession>>,
}

impl AppState {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self {
            runtime,
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Reads the web session id from the request cookie.
    pub fn cookie_id(headers: &HeaderMap) -> Option<String> {
        let raw = headers.get(header::COOKIE)?.to_str().ok()?;
        raw.split(';').find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name == SESSION_COOKIE).then(|| value.to_string())
        })
    }

    /// The web session for a request, if one exists.
    pub fn session(&self, headers: &HeaderMap) -> Option<WebSession> {
        let id = Self::cookie_id(headers)?;
        self.sessions.get(&id).map(|s| s.clone())
    }

    /// Existing session id, or a fresh one. Returns `(id, set_cookie)`.
    pub fn ensure_session(&self, headers: &HeaderMap) -> (String, bool) {
        if let Some(id) = Self::cookie_id(headers) {
            if self.sessions.contains_key(&id) {
                return (id, false);
            }
            self.sessions.insert(id.clone(), WebSession::default());
            return (id, false);
        }
        let id = Uuid::new_v4().to_string();
        self.sessions.insert(id.clone(), WebSession::default());
        (id, true)
    }

    pub fn update_session(&self, id: &str, update: impl FnOnce(&mut WebSession)) {
        let mut entry = self.sessions.entry(id.to_string()).or_default();
        update(&mut entry);
    }

    /// The broker session key for this request, from the web session or an
    /// explicit body field.
    pub fn resolve_session_key(&self, headers: &HeaderMap, explicit: Option<&str>) -> Option<String> {
        if let Some(key) = explicit {
            if !key.is_empty() {
                return Some(key.to_string());
            }
        }
        self.session(headers).and_then(|s| s.session_key)
    }
}

/// Attaches the session cookie to a response when a new session was created.
pub fn with_session_cookie(response: Response, id: &str, set_cookie: bool) -> Response {
    if !set_cookie {
        return response;
    }
    let mut response = response;
    let cookie = format!("{}={}; Path=/; HttpOnly; SameSite=Lax", SESSION_COOKIE, id);
    if let Ok(value) = cookie.parse() {
        response.headers_mut().insert(header::SET_COOKIE, value);
    }
    response
}

/// Error type returned by every handler. Maps error kinds to status codes
/// and the uniform `{success: false, ...}` envelope; the process never
/// crashes on a handler error.
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        if err.is_auth_expired() {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({
                    "success": false,
                    "error": "authentication required",
                    "auth_required": true,
                })),
            )
                .into_response();
        }
        match &err {
            AppError::InvalidInput(msg) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "success": false, "error": msg })),
            )
                .into_response(),
            other => {
                log::error!("Handler error ({}): {}", other.category(), other);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "success": false, "error": "internal server error" })),
                )
                    .into_response()
            }
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
