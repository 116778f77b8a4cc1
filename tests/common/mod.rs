//! Shared test fixtures: a scriptable mock upstream client and runtime
//! builders driving the real queue, workers, tracker and storage.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use tgdl::client::broker::ClientBroker;
use tgdl::client::session::SessionStore;
use tgdl::client::types::{ChatInfo, ChatKind, Dialog, MediaInfo, MediaKind, Message, UserInfo};
use tgdl::client::upstream::{
    ClientFactory, ProgressFn, QrLogin, SignInOutcome, TransferControl, UpstreamClient, UpstreamError,
};
use tgdl::core::settings::Settings;
use tgdl::storage::db::create_pool;
use tgdl::Runtime;

fn lock<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Scriptable in-memory upstream.
pub struct MockUpstream {
    pub user: UserInfo,
    chats: Mutex<HashMap<i64, ChatInfo>>,
    messages: Mutex<HashMap<i64, HashMap<i64, Message>>>,
    /// Scripted errors consumed per download attempt for a (chat, message)
    download_errors: Mutex<HashMap<(i64, i64), VecDeque<UpstreamError>>>,
    download_attempts: Mutex<HashMap<(i64, i64), u32>>,
    /// Chat-level access error (e.g. AuthKeyUnregistered)
    chat_errors: Mutex<HashMap<i64, UpstreamError>>,
    /// Progress steps per download; more steps = slower download
    pub chunks: usize,
    /// Delay between progress steps
    pub chunk_delay: Duration,
    password_needed: Mutex<bool>,
    qr_script: Mutex<VecDeque<QrLogin>>,
    /// (chat_id, message_id, text) for every edit_message_text call
    edits: Mutex<Vec<(i64, i64, String)>>,
}

impl MockUpstream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            user: UserInfo {
                id: 777,
                username: Some("tester".to_string()),
                first_name: Some("Test".to_string()),
                last_name: None,
                phone: Some("+100200300".to_string()),
            },
            chats: Mutex::new(HashMap::new()),
            messages: Mutex::new(HashMap::new()),
            download_errors: Mutex::new(HashMap::new()),
            download_attempts: Mutex::new(HashMap::new()),
            chat_errors: Mutex::new(HashMap::new()),
            chunks: 4,
            chunk_delay: Duration::from_millis(5),
            password_needed: Mutex::new(false),
            qr_script: Mutex::new(VecDeque::new()),
            edits: Mutex::new(Vec::new()),
        })
    }

    pub fn slow(chunks: usize, chunk_delay: Duration) -> Arc<Self> {
        let mut mock = Self::new();
        // Arc::new above; rebuild with custom pacing
        let inner = Arc::get_mut(&mut mock).expect("fresh arc");
        inner.chunks = chunks;
        inner.chunk_delay = chunk_delay;
        mock
    }

    pub fn add_chat(&self, chat_id: i64, title: &str) {
        lock(&self.chats).insert(
            chat_id,
            ChatInfo {
                id: chat_id,
                title: Some(title.to_string()),
                kind: ChatKind::Supergroup,
                has_protected_content: false,
            },
        );
    }

    /// Registers an arbitrary chat shape (add_chat always makes supergroups).
    pub fn set_chat(&self, chat: ChatInfo) {
        lock(&self.chats).insert(chat.id, chat);
    }

    pub fn add_message(&self, message: Message) {
        lock(&self.messages)
            .entry(message.chat_id)
            .or_default()
            .insert(message.id, message);
    }

    /// Queues errors returned by successive download attempts for a message.
    pub fn script_download_errors(&self, chat_id: i64, message_id: i64, errors: Vec<UpstreamError>) {
        lock(&self.download_errors).insert((chat_id, message_id), errors.into());
    }

    pub fn script_chat_error(&self, chat_id: i64, error: UpstreamError) {
        lock(&self.chat_errors).insert(chat_id, error);
    }

    pub fn set_password_needed(&self, needed: bool) {
        *lock(&self.password_needed) = needed;
    }

    pub fn script_qr(&self, steps: Vec<QrLogin>) {
        *lock(&self.qr_script) = steps.into();
    }

    pub fn attempts(&self, chat_id: i64, message_id: i64) -> u32 {
        lock(&self.download_attempts).get(&(chat_id, message_id)).copied().unwrap_or(0)
    }

    pub fn edits(&self) -> Vec<(i64, i64, String)> {
        lock(&self.edits).clone()
    }
}

#[async_trait]
impl UpstreamClient for MockUpstream {
    async fn get_chat(&self, chat_id: i64) -> Result<ChatInfo, UpstreamError> {
        if let Some(err) = lock(&self.chat_errors).get(&chat_id) {
            return Err(err.clone());
        }
        lock(&self.chats)
            .get(&chat_id)
            .cloned()
            .ok_or(UpstreamError::NotFound)
    }

    async fn get_messages(&self, chat_id: i64, message_ids: &[i64]) -> Result<Vec<Message>, UpstreamError> {
        if let Some(err) = lock(&self.chat_errors).get(&chat_id) {
            return Err(err.clone());
        }
        let guard = lock(&self.messages);
        let chat = guard.get(&chat_id);
        Ok(message_ids
            .iter()
            .filter_map(|id| chat.and_then(|c| c.get(id)).cloned())
            .collect())
    }

    async fn iter_dialogs(&self, offset: usize, limit: usize) -> Result<Vec<Dialog>, UpstreamError> {
        let guard = lock(&self.chats);
        let mut chats: Vec<&ChatInfo> = guard.values().collect();
        chats.sort_by_key(|c| c.id);
        Ok(chats
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|chat| Dialog {
                chat: chat.clone(),
                top_message_id: 0,
                username: None,
                members_count: Some(10),
            })
            .collect())
    }

    async fn get_chat_history(
        &self,
        chat_id: i64,
        limit: usize,
        offset_id: i64,
    ) -> Result<Vec<Message>, UpstreamError> {
        let guard = lock(&self.messages);
        let Some(chat) = guard.get(&chat_id) else {
            return Ok(vec![]);
        };
        let mut messages: Vec<Message> = chat.values().cloned().collect();
        messages.sort_by_key(|m| std::cmp::Reverse(m.id));
        Ok(messages
            .into_iter()
            .filter(|m| offset_id == 0 || m.id < offset_id)
            .take(limit)
            .collect())
    }

    async fn fetch_message(&self, message: &Message) -> Result<Message, UpstreamError> {
        let guard = lock(&self.messages);
        Ok(guard
            .get(&message.chat_id)
            .and_then(|c| c.get(&message.id))
            .cloned()
            .unwrap_or_else(|| message.clone()))
    }

    async fn download_media(
        &self,
        message: &Message,
        file_name: &str,
        progress: Option<ProgressFn>,
    ) -> Result<Option<String>, UpstreamError> {
        let key = (message.chat_id, message.id);
        *lock(&self.download_attempts).entry(key).or_insert(0) += 1;

        if let Some(err) = lock(&self.download_errors).get_mut(&key).and_then(|q| q.pop_front()) {
            return Err(err);
        }

        let Some(media) = &message.media else {
            return Ok(None);
        };
        let total = media.file_size;

        if let Some(progress) = &progress {
            let chunks = self.chunks.max(1) as u64;
            for step in 1..=chunks {
                let down = total * step / chunks;
                if (progress.as_ref())(down, total).await == TransferControl::Stop {
                    return Err(UpstreamError::TransmissionStopped);
                }
                tokio::time::sleep(self.chunk_delay).await;
            }
        }

        let path = Path::new(file_name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| UpstreamError::Other(e.to_string()))?;
        }
        std::fs::write(path, vec![0u8; total as usize]).map_err(|e| UpstreamError::Other(e.to_string()))?;
        Ok(Some(file_name.to_string()))
    }

    async fn send_message(&self, _chat_id: i64, _text: &str) -> Result<i64, UpstreamError> {
        Ok(1)
    }

    async fn edit_message_text(&self, chat_id: i64, message_id: i64, text: &str) -> Result<(), UpstreamError> {
        lock(&self.edits).push((chat_id, message_id, text.to_string()));
        Ok(())
    }

    async fn export_session_string(&self) -> Result<String, UpstreamError> {
        Ok(format!("session-{}", self.user.id))
    }

    async fn send_code(&self, phone: &str) -> Result<String, UpstreamError> {
        Ok(format!("hash-{}", phone))
    }

    async fn sign_in(
        &self,
        _phone: &str,
        _phone_code_hash: &str,
        code: &str,
    ) -> Result<SignInOutcome, UpstreamError> {
        if code == "wrong" {
            return Err(UpstreamError::Other("PHONE_CODE_INVALID".to_string()));
        }
        if *lock(&self.password_needed) {
            Ok(SignInOutcome::PasswordNeeded)
        } else {
            Ok(SignInOutcome::Authorized(self.user.clone()))
        }
    }

    async fn check_password(&self, password: &str) -> Result<UserInfo, UpstreamError> {
        if password == "wrong" {
            return Err(UpstreamError::Other("PASSWORD_HASH_INVALID".to_string()));
        }
        Ok(self.user.clone())
    }

    async fn export_login_token(&self) -> Result<QrLogin, UpstreamError> {
        let mut script = lock(&self.qr_script);
        match script.pop_front() {
            Some(step) => Ok(step),
            None => Ok(QrLogin::Token {
                token: "qr-token".to_string(),
                expires_at: Utc::now() + chrono::Duration::seconds(30),
            }),
        }
    }

    async fn me(&self) -> Result<UserInfo, UpstreamError> {
        Ok(self.user.clone())
    }

    async fn disconnect(&self) {}
}

/// Factory handing out a fixed mock client; records the sessions it saw.
pub struct MockFactory {
    pub client: Arc<MockUpstream>,
    pub seen_sessions: Mutex<Vec<Option<String>>>,
    /// Session strings rejected as unregistered
    pub invalid_sessions: Mutex<Vec<String>>,
}

impl MockFactory {
    pub fn new(client: Arc<MockUpstream>) -> Arc<Self> {
        Arc::new(Self {
            client,
            seen_sessions: Mutex::new(Vec::new()),
            invalid_sessions: Mutex::new(Vec::new()),
        })
    }

    pub fn invalidate_session(&self, session: &str) {
        lock(&self.invalid_sessions).push(session.to_string());
    }
}

#[async_trait]
impl ClientFactory for MockFactory {
    async fn connect(
        &self,
        _api_id: i32,
        _api_hash: &str,
        session: Option<&str>,
        _max_concurrent_transmissions: usize,
    ) -> Result<Arc<dyn UpstreamClient>, UpstreamError> {
        lock(&self.seen_sessions).push(session.map(str::to_string));
        if let Some(session) = session {
            if lock(&self.invalid_sessions).iter().any(|s| s == session) {
                return Err(UpstreamError::AuthKeyUnregistered);
            }
        }
        Ok(Arc::clone(&self.client) as Arc<dyn UpstreamClient>)
    }
}

/// Settings rooted under a temp dir.
pub fn test_settings(dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.save_path = dir.join("save");
    settings.bot_save_path = dir.join("bot");
    settings.temp_save_path = dir.join("tmp");
    settings.custom_history_path = dir.join("custom_download_history.yaml");
    settings.zip_staging_root = dir.join("zip_staging");
    settings.max_download_task = 3;
    settings
}

/// Runtime wired to a mock factory, with the database under `dir`.
pub fn test_runtime(dir: &Path, factory: Arc<dyn ClientFactory>) -> Arc<Runtime> {
    let pool = Arc::new(create_pool(dir.join("tgdl.db").to_str().unwrap()).unwrap());
    let settings = test_settings(dir);
    let broker = Arc::new(
        ClientBroker::new(
            factory,
            SessionStore::open(dir.join("sessions.json")),
            settings.max_concurrent_transmissions(),
        )
        .with_api_credentials(1, "test-hash"),
    );
    Runtime::new(pool, settings, broker)
}

/// Runs the phone+code flow so the broker has an authenticated client for
/// the workers to borrow.
pub async fn authenticate(runtime: &Arc<Runtime>) {
    let auth = runtime.broker.start_auth("+100200300", 1, "hash").await.unwrap();
    runtime
        .broker
        .verify_code(&auth.session_key, "12345", &auth.phone_code_hash)
        .await
        .unwrap();
}

/// A message carrying one video attachment of `size` bytes.
pub fn video_message(chat_id: i64, id: i64, size: u64) -> Message {
    Message {
        id,
        chat_id,
        chat_title: Some("Test Group".to_string()),
        date: Some(Utc.with_ymd_and_hms(2026, 7, 15, 10, 0, 0).unwrap()),
        text: None,
        caption: None,
        caption_entities: None,
        media_group_id: None,
        media: Some(MediaInfo {
            kind: MediaKind::Video,
            file_id: format!("file-{}", id),
            file_unique_id: format!("uniq-{}", id),
            file_name: Some(format!("clip_{}.mp4", id)),
            file_size: size,
            mime_type: Some("video/mp4".to_string()),
            date: None,
            width: Some(1280),
            height: Some(720),
            duration: Some(30),
            thumbs: vec![],
        }),
    }
}

/// A text-only message.
pub fn text_message(chat_id: i64, id: i64, text: &str) -> Message {
    Message {
        id,
        chat_id,
        chat_title: Some("Test Group".to_string()),
        date: Some(Utc.with_ymd_and_hms(2026, 7, 15, 10, 0, 0).unwrap()),
        text: Some(text.to_string()),
        caption: None,
        caption_entities: None,
        media_group_id: None,
        media: None,
    }
}

/// Polls until `predicate` holds or the deadline passes.
pub async fn wait_until(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    predicate()
}
