//! Per-user session/auth broker.
//!
//! Owns the authenticated upstream connections and multiplexes them to job
//! requests. Interactive flows (phone + code + optional 2FA, and QR) park an
//! in-memory client under an opaque session key until authentication
//! completes, at which point the session blob is persisted and the client is
//! additionally keyed by its user id.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::client::session::SessionStore;
use crate::client::types::{ChatKind, Message, UserInfo};
use crate::client::upstream::{ClientFactory, QrLogin, SignInOutcome, UpstreamClient, UpstreamError};
use crate::core::config;
use crate::core::error::{AppError, AppResult};

/// Dialog page size used when listing groups.
const DIALOG_PAGE_SIZE: usize = 100;

struct ActiveEntry {
    client: Arc<dyn UpstreamClient>,
    phone: Option<String>,
    user: Option<UserInfo>,
    qr_token: Option<String>,
    qr_expires_at: Option<chrono::DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthStart {
    pub session_key: String,
    pub phone_code_hash: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CodeVerify {
    pub requires_password: bool,
    pub user_info: Option<UserInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QrStart {
    pub session_key: String,
    pub qr_token: String,
    pub expires_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct QrStatus {
    pub authenticated: bool,
    pub expired: bool,
    pub user_info: Option<UserInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupInfo {
    pub id: i64,
    pub title: String,
    #[serde(rename = "type")]
    pub kind: ChatKind,
    pub username: Option<String>,
    pub members_count: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MediaStatistics {
    pub total: usize,
    pub by_kind: HashMap<String, usize>,
}

pub struct ClientBroker {
    factory: Arc<dyn ClientFactory>,
    sessions: SessionStore,
    active: Mutex<HashMap<String, ActiveEntry>>,
    max_concurrent_transmissions: usize,
    api_id: Option<i32>,
    api_hash: Option<String>,
}

impl ClientBroker {
    pub fn new(factory: Arc<dyn ClientFactory>, sessions: SessionStore, max_concurrent_transmissions: usize) -> Self {
        Self {
            factory,
            sessions,
            active: Mutex::new(HashMap::new()),
            max_concurrent_transmissions,
            api_id: *config::API_ID,
            api_hash: config::API_HASH.clone(),
        }
    }

    /// Overrides the application credentials used for blob-based reconnects.
    #[must_use]
    pub fn with_api_credentials(mut self, api_id: i32, api_hash: &str) -> Self {
        self.api_id = Some(api_id);
        self.api_hash = Some(api_hash.to_string());
        self
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<String, ActiveEntry>> {
        match self.active.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn client_for(&self, key: &str) -> Option<Arc<dyn UpstreamClient>> {
        self.lock_active().get(key).map(|e| Arc::clone(&e.client))
    }

    fn api_credentials(&self) -> AppResult<(i32, String)> {
        match (self.api_id, self.api_hash.clone()) {
            (Some(id), Some(hash)) => Ok((id, hash)),
            _ => Err(AppError::InvalidInput(
                "TG_API_ID / TG_API_HASH are not configured".to_string(),
            )),
        }
    }

    /// Starts a phone+code login: connects a fresh client and requests a code.
    pub async fn start_auth(&self, phone: &str, api_id: i32, api_hash: &str) -> AppResult<AuthStart> {
        if phone.trim().is_empty() {
            return Err(AppError::InvalidInput("phone number is required".to_string()));
        }
        let client = self
            .factory
            .connect(api_id, api_hash, None, self.max_concurrent_transmissions)
            .await?;
        let phone_code_hash = client.send_code(phone).await?;

        let session_key = Uuid::new_v4().to_string();
        self.lock_active().insert(
            session_key.clone(),
            ActiveEntry {
                client,
                phone: Some(phone.to_string()),
                user: None,
                qr_token: None,
                qr_expires_at: None,
            },
        );
        log::info!("Auth started for {} (session {})", phone, session_key);
        Ok(AuthStart {
            session_key,
            phone_code_hash,
        })
    }

    /// Verifies the login code. On `PasswordNeeded` the session is retained
    /// and the caller is told to supply the 2FA password.
    pub async fn verify_code(&self, session_key: &str, code: &str, phone_code_hash: &str) -> AppResult<CodeVerify> {
        let (client, phone) = {
            let guard = self.lock_active();
            let entry = guard
                .get(session_key)
                .ok_or_else(|| AppError::InvalidInput("unknown session key".to_string()))?;
            (Arc::clone(&entry.client), entry.phone.clone().unwrap_or_default())
        };

        match client.sign_in(&phone, phone_code_hash, code).await? {
            SignInOutcome::Authorized(user) => {
                self.complete_authentication(session_key, &user).await?;
                Ok(CodeVerify {
                    requires_password: false,
                    user_info: Some(user),
                })
            }
            SignInOutcome::PasswordNeeded => Ok(CodeVerify {
                requires_password: true,
                user_info: None,
            }),
        }
    }

    /// Completes a 2FA login.
    pub async fn verify_password(&self, session_key: &str, password: &str) -> AppResult<UserInfo> {
        let client = self
            .client_for(session_key)
            .ok_or_else(|| AppError::InvalidInput("unknown session key".to_string()))?;
        let user = client.check_password(password).await?;
        self.complete_authentication(session_key, &user).await?;
        Ok(user)
    }

    /// Starts a QR login by exporting a login token.
    pub async fn start_qr_login(&self, api_id: i32, api_hash: &str) -> AppResult<QrStart> {
        let client = self
            .factory
            .connect(api_id, api_hash, None, self.max_concurrent_transmissions)
            .await?;
        let (token, expires_at) = match client.export_login_token().await? {
            QrLogin::Token { token, expires_at } => (token, expires_at),
            QrLogin::Success(user) => {
                // Some transports resolve instantly when the device already
                // confirmed a previous token.
                let session_key = Uuid::new_v4().to_string();
                self.lock_active().insert(
                    session_key.clone(),
                    ActiveEntry {
                        client,
                        phone: None,
                        user: Some(user.clone()),
                        qr_token: None,
                        qr_expires_at: None,
                    },
                );
                self.complete_authentication(&session_key, &user).await?;
                return Ok(QrStart {
                    session_key,
                    qr_token: String::new(),
                    expires_at: Utc::now().to_rfc3339(),
                });
            }
        };

        let session_key = Uuid::new_v4().to_string();
        self.lock_active().insert(
            session_key.clone(),
            ActiveEntry {
                client,
                phone: None,
                user: None,
                qr_token: Some(token.clone()),
                qr_expires_at: Some(expires_at),
            },
        );
        log::info!("QR login started (session {})", session_key);
        Ok(QrStart {
            session_key,
            qr_token: token,
            expires_at: expires_at.to_rfc3339(),
        })
    }

    /// Polls QR login state. Proactively re-invokes the token export so a
    /// confirmation is detected even if the push path missed it.
    pub async fn check_qr_status(&self, session_key: &str) -> AppResult<QrStatus> {
        let (client, user, expires_at) = {
            let guard = self.lock_active();
            let entry = guard
                .get(session_key)
                .ok_or_else(|| AppError::InvalidInput("unknown session key".to_string()))?;
            (Arc::clone(&entry.client), entry.user.clone(), entry.qr_expires_at)
        };

        if let Some(user) = user {
            return Ok(QrStatus {
                authenticated: true,
                expired: false,
                user_info: Some(user),
            });
        }

        match client.export_login_token().await? {
            QrLogin::Success(user) => {
                self.complete_authentication(session_key, &user).await?;
                Ok(QrStatus {
                    authenticated: true,
                    expired: false,
                    user_info: Some(user),
                })
            }
            QrLogin::Token { token, expires_at: fresh } => {
                // The transport may rotate the token while we wait.
                {
                    let mut guard = self.lock_active();
                    if let Some(entry) = guard.get_mut(session_key) {
                        entry.qr_token = Some(token);
                        entry.qr_expires_at = Some(fresh);
                    }
                }
                let expired = expires_at.map(|t| t < Utc::now()).unwrap_or(false);
                Ok(QrStatus {
                    authenticated: false,
                    expired,
                    user_info: None,
                })
            }
        }
    }

    /// Persists the session blob and re-keys the client under the user id.
    async fn complete_authentication(&self, session_key: &str, user: &UserInfo) -> AppResult<()> {
        let client = self
            .client_for(session_key)
            .ok_or_else(|| AppError::InvalidInput("unknown session key".to_string()))?;
        let blob = client.export_session_string().await?;
        self.sessions.put(user.id, &blob, user.username.as_deref())?;

        let mut guard = self.lock_active();
        if let Some(entry) = guard.get_mut(session_key) {
            entry.user = Some(user.clone());
            entry.qr_token = None;
        }
        // Loan-outs by user id resolve to the same connection.
        guard.insert(
            user.id.to_string(),
            ActiveEntry {
                client,
                phone: None,
                user: Some(user.clone()),
                qr_token: None,
                qr_expires_at: None,
            },
        );
        log::info!("User {} authenticated, session blob saved", user.id);
        Ok(())
    }

    /// Returns an active connection for a user, reconnecting from the stored
    /// session blob when needed. An invalidated authorization removes the
    /// stored blob.
    pub async fn get_user_client(&self, user_id: i64) -> AppResult<Option<Arc<dyn UpstreamClient>>> {
        if let Some(client) = self.client_for(&user_id.to_string()) {
            return Ok(Some(client));
        }

        let Some(stored) = self.sessions.get(user_id) else {
            return Ok(None);
        };
        let (api_id, api_hash) = self.api_credentials()?;
        match self
            .factory
            .connect(api_id, &api_hash, Some(&stored.session_string), self.max_concurrent_transmissions)
            .await
        {
            Ok(client) => {
                let user = client.me().await.ok();
                self.lock_active().insert(
                    user_id.to_string(),
                    ActiveEntry {
                        client: Arc::clone(&client),
                        phone: None,
                        user,
                        qr_token: None,
                        qr_expires_at: None,
                    },
                );
                log::info!("Restored upstream connection for user {}", user_id);
                Ok(Some(client))
            }
            Err(e) if e.invalidates_session() => {
                log::warn!("Stored session for user {} is invalid, removing", user_id);
                self.sessions.remove(user_id)?;
                Err(AppError::AuthRequired)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Any active authenticated client; used by job submitters that are not
    /// bound to one user.
    pub fn any_client(&self) -> Option<(String, Arc<dyn UpstreamClient>)> {
        let guard = self.lock_active();
        guard
            .iter()
            .find(|(_, e)| e.user.is_some())
            .map(|(k, e)| (k.clone(), Arc::clone(&e.client)))
    }

    /// The client parked under a session key.
    pub fn session_client(&self, session_key: &str) -> Option<Arc<dyn UpstreamClient>> {
        self.client_for(session_key)
    }

    /// The authenticated user attached to a session key.
    pub fn session_user(&self, session_key: &str) -> Option<UserInfo> {
        self.lock_active().get(session_key).and_then(|e| e.user.clone())
    }

    /// Pages through dialogs, skipping forbidden/private ones, and returns
    /// group-like chats.
    pub async fn list_groups(&self, session_key: &str) -> AppResult<Vec<GroupInfo>> {
        let client = self
            .client_for(session_key)
            .ok_or_else(|| AppError::InvalidInput("unknown session key".to_string()))?;

        let mut groups = Vec::new();
        let mut offset = 0usize;
        loop {
            let page = match client.iter_dialogs(offset, DIALOG_PAGE_SIZE).await {
                Ok(page) => page,
                Err(UpstreamError::Forbidden) => break,
                Err(e) => return Err(e.into()),
            };
            if page.is_empty() {
                break;
            }
            offset += page.len();
            for dialog in page {
                match dialog.chat.kind {
                    ChatKind::Group | ChatKind::Supergroup | ChatKind::Channel => {
                        groups.push(GroupInfo {
                            id: dialog.chat.id,
                            title: dialog.chat.title.unwrap_or_else(|| format!("Chat_{}", dialog.chat.id)),
                            kind: dialog.chat.kind,
                            username: dialog.username,
                            members_count: dialog.members_count,
                        });
                    }
                    ChatKind::Bot | ChatKind::User => continue,
                }
            }
        }
        Ok(groups)
    }

    /// A window of chat messages. When the window ends inside a media group,
    /// keeps reading until the group changes or the lookahead budget is
    /// spent, so a group is never split across pages.
    pub async fn list_messages(
        &self,
        session_key: &str,
        chat_id: i64,
        limit: usize,
        offset_id: i64,
        media_only: bool,
    ) -> AppResult<Vec<Message>> {
        let client = self
            .client_for(session_key)
            .ok_or_else(|| AppError::InvalidInput("unknown session key".to_string()))?;

        let mut messages = client.get_chat_history(chat_id, limit, offset_id).await?;

        if let Some(group_id) = messages.last().and_then(|m| m.media_group_id.clone()) {
            let mut lookahead = 0usize;
            let mut cursor = messages.last().map(|m| m.id).unwrap_or(0);
            while lookahead < config::batch::MEDIA_GROUP_LOOKAHEAD {
                let extra = client.get_chat_history(chat_id, 1, cursor).await?;
                let Some(next) = extra.into_iter().next() else { break };
                cursor = next.id;
                lookahead += 1;
                if next.media_group_id.as_deref() == Some(group_id.as_str()) {
                    messages.push(next);
                } else {
                    break;
                }
            }
        }

        if media_only {
            messages.retain(|m| m.has_media());
        }
        Ok(messages)
    }

    /// Media-kind counts over a recent history window. UI-facing; opaque to
    /// the download pipeline.
    pub async fn get_media_statistics(&self, session_key: &str, chat_id: i64) -> AppResult<MediaStatistics> {
        let messages = self.list_messages(session_key, chat_id, 200, 0, true).await?;
        let mut by_kind: HashMap<String, usize> = HashMap::new();
        for message in &messages {
            if let Some(kind) = message.media_kind() {
                *by_kind.entry(kind.as_str().to_string()).or_default() += 1;
            }
        }
        Ok(MediaStatistics {
            total: messages.len(),
            by_kind,
        })
    }

    /// Disconnects and forgets a parked session. The stored blob, if any,
    /// is removed as well (logout).
    pub async fn logout(&self, session_key: &str) -> AppResult<()> {
        let entry = self.lock_active().remove(session_key);
        if let Some(entry) = entry {
            if let Some(user) = &entry.user {
                self.lock_active().remove(&user.id.to_string());
                self.sessions.remove(user.id)?;
            }
            entry.client.disconnect().await;
            log::info!("Session {} disconnected", session_key);
        }
        Ok(())
    }

    /// Drops every active connection without touching stored blobs.
    pub async fn disconnect_all(&self) {
        let entries: Vec<ActiveEntry> = {
            let mut guard = self.lock_active();
            guard.drain().map(|(_, e)| e).collect()
        };
        for entry in entries {
            entry.client.disconnect().await;
        }
    }

    /// Number of live connections, for diagnostics.
    pub fn active_count(&self) -> usize {
        self.lock_active().len()
    }
}
