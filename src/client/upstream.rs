//! The abstract upstream client port.
//!
//! The concrete MTProto transport lives outside this crate; everything the
//! engine needs from it is captured here. Tests drive the engine through a
//! mock implementation of [`UpstreamClient`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use thiserror::Error;

use crate::client::types::{ChatInfo, Dialog, Message, UserInfo};

/// Error classes the engine reacts to. Everything else folds into `Other`.
#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    /// Rate limited; the requested wait is honored verbatim
    #[error("flood wait: retry after {0}s")]
    FloodWait(u64),

    /// Cached file reference expired; re-fetch the message and retry
    #[error("stale file reference")]
    StaleReference,

    /// The stored authorization is no longer valid
    #[error("authorization key unregistered")]
    AuthKeyUnregistered,

    /// Transient network timeout
    #[error("request timed out")]
    Timeout,

    /// The requested entity does not exist
    #[error("not found")]
    NotFound,

    /// The dialog is private or otherwise inaccessible
    #[error("forbidden")]
    Forbidden,

    /// The transfer was stopped by the progress callback
    #[error("transmission stopped")]
    TransmissionStopped,

    #[error("{0}")]
    Other(String),
}

impl UpstreamError {
    /// True for errors that invalidate the stored user session.
    pub fn invalidates_session(&self) -> bool {
        matches!(self, UpstreamError::AuthKeyUnregistered)
    }
}

/// Decision returned by progress callbacks: keep transferring or stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferControl {
    Continue,
    Stop,
}

/// Progress callback handed to `download_media`. Invoked by the client on its
/// own task with `(downloaded_bytes, total_bytes)`; returning
/// [`TransferControl::Stop`] aborts the transfer.
pub type ProgressFn = Arc<dyn Fn(u64, u64) -> BoxFuture<'static, TransferControl> + Send + Sync>;

/// Outcome of a code sign-in attempt.
#[derive(Debug, Clone)]
pub enum SignInOutcome {
    Authorized(UserInfo),
    /// Two-factor password required; the session is retained
    PasswordNeeded,
}

/// Outcome of exporting a QR login token.
#[derive(Debug, Clone)]
pub enum QrLogin {
    Token {
        token: String,
        expires_at: DateTime<Utc>,
    },
    Success(UserInfo),
}

/// Operations the engine consumes from an authenticated upstream connection.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn get_chat(&self, chat_id: i64) -> Result<ChatInfo, UpstreamError>;

    /// Batch fetch, at most 100 ids per call. Ids missing upstream are simply
    /// absent from the reply.
    async fn get_messages(&self, chat_id: i64, message_ids: &[i64]) -> Result<Vec<Message>, UpstreamError>;

    /// One page of the dialog list, using the upstream's native paging.
    /// An empty page means the listing is exhausted.
    async fn iter_dialogs(&self, offset: usize, limit: usize) -> Result<Vec<Dialog>, UpstreamError>;

    /// A window of chat history, newest-first from `offset_id` (0 = latest).
    async fn get_chat_history(
        &self,
        chat_id: i64,
        limit: usize,
        offset_id: i64,
    ) -> Result<Vec<Message>, UpstreamError>;

    /// Re-fetches a message to refresh its file references.
    async fn fetch_message(&self, message: &Message) -> Result<Message, UpstreamError>;

    /// Downloads the media of a message to `file_name`. Returns the path the
    /// bytes landed at, or `None` when the client produced nothing.
    async fn download_media(
        &self,
        message: &Message,
        file_name: &str,
        progress: Option<ProgressFn>,
    ) -> Result<Option<String>, UpstreamError>;

    async fn send_message(&self, chat_id: i64, text: &str) -> Result<i64, UpstreamError>;

    async fn edit_message_text(&self, chat_id: i64, message_id: i64, text: &str) -> Result<(), UpstreamError>;

    /// Serializes the authorization for persistence.
    async fn export_session_string(&self) -> Result<String, UpstreamError>;

    /// Requests a login code; returns the phone_code_hash.
    async fn send_code(&self, phone: &str) -> Result<String, UpstreamError>;

    async fn sign_in(&self, phone: &str, phone_code_hash: &str, code: &str)
        -> Result<SignInOutcome, UpstreamError>;

    async fn check_password(&self, password: &str) -> Result<UserInfo, UpstreamError>;

    /// Exports (or re-checks) a QR login token.
    async fn export_login_token(&self) -> Result<QrLogin, UpstreamError>;

    /// The authorized account, if any.
    async fn me(&self) -> Result<UserInfo, UpstreamError>;

    async fn disconnect(&self);
}

/// Produces connected clients. Implemented by the transport adapter; tests
/// inject mocks through this seam.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn connect(
        &self,
        api_id: i32,
        api_hash: &str,
        session: Option<&str>,
        max_concurrent_transmissions: usize,
    ) -> Result<Arc<dyn UpstreamClient>, UpstreamError>;
}
