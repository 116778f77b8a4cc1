//! Persistent per-user session blobs.
//!
//! A single JSON file maps user ids to opaque session strings. Writes go
//! through a temp file and an atomic rename so a crash never leaves a
//! truncated file behind.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::core::error::AppResult;
use crate::storage::now_iso;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSession {
    pub session_string: String,
    pub username: Option<String>,
    pub saved_at: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionFile {
    #[serde(default)]
    sessions: HashMap<String, StoredSession>,
}

pub struct SessionStore {
    path: PathBuf,
    inner: Mutex<SessionFile>,
}

impl SessionStore {
    /// Opens the store, loading existing sessions if the file is present.
    /// A corrupt file is logged and treated as empty rather than refusing to
    /// start.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let inner = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<SessionFile>(&raw) {
                Ok(file) => {
                    log::info!("Loaded {} stored session(s) from {}", file.sessions.len(), path.display());
                    file
                }
                Err(e) => {
                    log::warn!("Session file {} is corrupt ({}), starting empty", path.display(), e);
                    SessionFile::default()
                }
            },
            Err(_) => SessionFile::default(),
        };
        Self {
            path,
            inner: Mutex::new(inner),
        }
    }

    pub fn get(&self, user_id: i64) -> Option<StoredSession> {
        let guard = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.sessions.get(&user_id.to_string()).cloned()
    }

    pub fn user_ids(&self) -> Vec<i64> {
        let guard = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.sessions.keys().filter_map(|k| k.parse().ok()).collect()
    }

    /// Stores a session blob and persists synchronously.
    pub fn put(&self, user_id: i64, session_string: &str, username: Option<&str>) -> AppResult<()> {
        let mut guard = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.sessions.insert(
            user_id.to_string(),
            StoredSession {
                session_string: session_string.to_string(),
                username: username.map(str::to_string),
                saved_at: now_iso(),
            },
        );
        self.persist(&guard)
    }

    /// Removes a user's blob (auth invalidated) and persists.
    pub fn remove(&self, user_id: i64) -> AppResult<bool> {
        let mut guard = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let removed = guard.sessions.remove(&user_id.to_string()).is_some();
        if removed {
            self.persist(&guard)?;
        }
        Ok(removed)
    }

    fn persist(&self, file: &SessionFile) -> AppResult<()> {
        let encoded = serde_json::to_string_pretty(file)?;
        let tmp = self.path.with_extension("json.tmp");
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&tmp, encoded)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path().join("sessions.json"));
        store.put(42, "blob-42", Some("alice")).unwrap();

        let loaded = store.get(42).unwrap();
        assert_eq!(loaded.session_string, "blob-42");
        assert_eq!(loaded.username.as_deref(), Some("alice"));
        assert!(store.get(1).is_none());
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        {
            let store = SessionStore::open(&path);
            store.put(1, "a", None).unwrap();
            store.put(2, "b", None).unwrap();
        }
        let reopened = SessionStore::open(&path);
        let mut ids = reopened.user_ids();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(reopened.get(2).unwrap().session_string, "b");
    }

    #[test]
    fn test_remove_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let store = SessionStore::open(&path);
        store.put(1, "a", None).unwrap();
        assert!(store.remove(1).unwrap());
        assert!(!store.remove(1).unwrap());

        let reopened = SessionStore::open(&path);
        assert!(reopened.get(1).is_none());
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = SessionStore::open(&path);
        assert!(store.user_ids().is_empty());
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let store = SessionStore::open(&path);
        store.put(1, "a", None).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
        assert!(path.exists());
    }
}
