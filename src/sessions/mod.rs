//! Durable chat sessions and their message history.
//!
//! Each session owns a directory under `<work_dir>/<data_dir>/sessions/<id>/`
//! holding `meta.json` (the [`Session`] record) and `history.json` (the
//! ordered message array). Every mutation rewrites the affected file in full
//! via a sibling temp file and an atomic rename, so readers never observe a
//! torn write. All sessions are loaded once at startup.
//!
//! Concurrency: the store keeps one async mutex per session, so writes to a
//! session are serialised while other sessions proceed independently. Reads
//! clone a snapshot and hold no lock afterwards.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

/// Monotonic counter to uniquify temp file names across concurrent writes.
static WRITE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Session metadata, persisted as `meta.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub work_dir: String,
    pub created_at: DateTime<Utc>,
    /// Advances on any history mutation; drives `session.list` ordering.
    pub updated_at: DateTime<Utc>,
}

/// Author of a [`HistoryMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Lifecycle of a [`ToolCall`] within an assistant message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Pending,
    Completed,
    Error,
}

/// One tool invocation recorded on an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    pub status: ToolCallStatus,
}

/// One entry in a session's history, persisted in insertion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    pub timestamp: DateTime<Utc>,
}

impl HistoryMessage {
    /// A fresh message with a random id, stamped now.
    pub fn new(role: Role, content: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content,
            tool_calls: Vec::new(),
            timestamp: Utc::now(),
        }
    }
}

/// Store failures surfaced to RPC/REST callers.
#[derive(Debug)]
pub enum StoreError {
    /// The session id is not known to the store.
    NotFound,
    Io(std::io::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound => write!(f, "Session not found"),
            StoreError::Io(e) => write!(f, "Session store I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

struct SessionEntry {
    session: Session,
    history: Vec<HistoryMessage>,
}

/// Durable session store. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct SessionStore {
    sessions_dir: PathBuf,
    work_dir: String,
    entries: Arc<RwLock<HashMap<String, Arc<Mutex<SessionEntry>>>>>,
}

impl SessionStore {
    /// Open the store rooted at `<work_dir>/<data_dir>/sessions` and load all
    /// persisted sessions.
    pub async fn open(work_dir: &str, data_dir: &str) -> std::io::Result<Self> {
        let sessions_dir = Path::new(work_dir).join(data_dir).join("sessions");
        tokio::fs::create_dir_all(&sessions_dir).await?;

        let store = Self {
            sessions_dir,
            work_dir: work_dir.to_string(),
            entries: Arc::new(RwLock::new(HashMap::new())),
        };
        store.load_from_disk().await;
        Ok(store)
    }

    /// Load every session directory found on disk. Unreadable entries are
    /// skipped with a warning rather than failing startup.
    async fn load_from_disk(&self) {
        let Ok(mut read_dir) = tokio::fs::read_dir(&self.sessions_dir).await else {
            return;
        };
        let mut loaded = 0usize;
        while let Ok(Some(dir_entry)) = read_dir.next_entry().await {
            let is_dir = dir_entry
                .file_type()
                .await
                .is_ok_and(|t| t.is_dir());
            if !is_dir {
                continue;
            }
            let session_dir = dir_entry.path();
            let meta = match tokio::fs::read(session_dir.join("meta.json")).await {
                Ok(data) => data,
                Err(_) => continue,
            };
            let session: Session = match serde_json::from_slice(&meta) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Skipping session at {}: bad meta.json: {e}", session_dir.display());
                    continue;
                }
            };
            let history: Vec<HistoryMessage> =
                match tokio::fs::read(session_dir.join("history.json")).await {
                    Ok(data) => serde_json::from_slice(&data).unwrap_or_default(),
                    Err(_) => Vec::new(),
                };

            self.entries.write().await.insert(
                session.id.clone(),
                Arc::new(Mutex::new(SessionEntry { session, history })),
            );
            loaded += 1;
        }
        if loaded > 0 {
            info!("Loaded {loaded} sessions from disk");
        }
    }

    fn session_dir(&self, id: &str) -> PathBuf {
        self.sessions_dir.join(id)
    }

    /// Marshal in memory, write to a sibling temp file, then rename over the
    /// target. Same-filesystem rename makes the replace atomic.
    async fn write_json<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
        let data = serde_json::to_vec_pretty(value).map_err(std::io::Error::other)?;
        let parent = path.parent().unwrap_or(Path::new("."));
        let seq = WRITE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp = parent.join(format!(".devport_tmp_{}_{seq}", std::process::id()));
        tokio::fs::write(&temp, &data).await?;
        if let Err(e) = tokio::fs::rename(&temp, path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e);
        }
        Ok(())
    }

    async fn persist_entry(&self, entry: &SessionEntry) -> std::io::Result<()> {
        let dir = self.session_dir(&entry.session.id);
        tokio::fs::create_dir_all(&dir).await?;
        Self::write_json(&dir.join("meta.json"), &entry.session).await?;
        Self::write_json(&dir.join("history.json"), &entry.history).await
    }

    /// Create a new session and persist it.
    pub async fn create(&self, title: &str) -> Result<Session, StoreError> {
        let now = Utc::now();
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.to_string(),
            work_dir: self.work_dir.clone(),
            created_at: now,
            updated_at: now,
        };
        let entry = SessionEntry {
            session: session.clone(),
            history: Vec::new(),
        };
        self.persist_entry(&entry).await?;
        self.entries
            .write()
            .await
            .insert(session.id.clone(), Arc::new(Mutex::new(entry)));
        Ok(session)
    }

    async fn entry(&self, id: &str) -> Option<Arc<Mutex<SessionEntry>>> {
        self.entries.read().await.get(id).cloned()
    }

    /// Fetch a session's metadata.
    pub async fn get(&self, id: &str) -> Option<Session> {
        let entry = self.entry(id).await?;
        let entry = entry.lock().await;
        Some(entry.session.clone())
    }

    /// All sessions, newest activity first.
    pub async fn list(&self) -> Vec<Session> {
        let entries: Vec<_> = self.entries.read().await.values().cloned().collect();
        let mut sessions = Vec::with_capacity(entries.len());
        for entry in entries {
            sessions.push(entry.lock().await.session.clone());
        }
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sessions
    }

    /// Rename a session.
    pub async fn update_title(&self, id: &str, title: &str) -> Result<Session, StoreError> {
        let entry = self.entry(id).await.ok_or(StoreError::NotFound)?;
        let mut entry = entry.lock().await;
        entry.session.title = title.to_string();
        entry.session.updated_at = Utc::now();
        self.persist_entry(&entry).await?;
        Ok(entry.session.clone())
    }

    /// Remove a session from the store and delete its directory.
    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let removed = self.entries.write().await.remove(id);
        if removed.is_none() {
            return Err(StoreError::NotFound);
        }
        let dir = self.session_dir(id);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            warn!("Failed to remove session dir {}: {e}", dir.display());
        }
        Ok(())
    }

    /// Append a message to a session's history and advance `updated_at`.
    pub async fn append_message(
        &self,
        id: &str,
        message: HistoryMessage,
    ) -> Result<(), StoreError> {
        let entry = self.entry(id).await.ok_or(StoreError::NotFound)?;
        let mut entry = entry.lock().await;
        entry.history.push(message);
        entry.session.updated_at = Utc::now();
        self.persist_entry(&entry).await?;
        Ok(())
    }

    /// Snapshot of a session's full history.
    pub async fn history(&self, id: &str) -> Vec<HistoryMessage> {
        match self.entry(id).await {
            Some(entry) => entry.lock().await.history.clone(),
            None => Vec::new(),
        }
    }

    /// Messages strictly after the first occurrence of `after_id`. An unknown
    /// id yields an empty slice (the client should refetch in full).
    pub async fn history_after(&self, id: &str, after_id: &str) -> Vec<HistoryMessage> {
        let history = self.history(id).await;
        match history.iter().position(|m| m.id == after_id) {
            Some(idx) => history[idx + 1..].to_vec(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store(dir: &Path) -> SessionStore {
        SessionStore::open(dir.to_str().unwrap(), ".devport")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_then_list_puts_new_session_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;

        let first = store.create("T1").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = store.create("T2").await.unwrap();

        let listed = store.list().await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].id, first.id);
    }

    #[tokio::test]
    async fn history_appends_are_stable_and_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let session = store.create("chat").await.unwrap();

        for i in 0..5 {
            store
                .append_message(&session.id, HistoryMessage::new(Role::User, format!("m{i}")))
                .await
                .unwrap();
        }

        let history = store.history(&session.id).await;
        assert_eq!(history.len(), 5);
        for (i, msg) in history.iter().enumerate() {
            assert_eq!(msg.content, format!("m{i}"));
        }
    }

    #[tokio::test]
    async fn history_after_resumes_strictly_after_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let session = store.create("chat").await.unwrap();

        let mut ids = Vec::new();
        for i in 0..4 {
            let msg = HistoryMessage::new(Role::User, format!("m{i}"));
            ids.push(msg.id.clone());
            store.append_message(&session.id, msg).await.unwrap();
        }

        let tail = store.history_after(&session.id, &ids[1]).await;
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].content, "m2");
        assert_eq!(tail[1].content, "m3");

        assert!(store.history_after(&session.id, "nope").await.is_empty());
    }

    #[tokio::test]
    async fn appending_bumps_updated_at_and_reorders_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let a = store.create("A").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let b = store.create("B").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        store
            .append_message(&a.id, HistoryMessage::new(Role::User, "hi".to_string()))
            .await
            .unwrap();

        let listed = store.list().await;
        assert_eq!(listed[0].id, a.id);
        assert_eq!(listed[1].id, b.id);
    }

    #[tokio::test]
    async fn store_reloads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let session_id = {
            let store = store(dir.path()).await;
            let session = store.create("persisted").await.unwrap();
            let mut msg = HistoryMessage::new(Role::Assistant, "hello".to_string());
            msg.tool_calls.push(ToolCall {
                id: "t1".to_string(),
                name: "read_file".to_string(),
                input: serde_json::json!({"path": "a.rs"}),
                output: "ok".to_string(),
                status: ToolCallStatus::Completed,
            });
            store.append_message(&session.id, msg).await.unwrap();
            session.id
        };

        let reloaded = store(dir.path()).await;
        let session = reloaded.get(&session_id).await.unwrap();
        assert_eq!(session.title, "persisted");
        let history = reloaded.history(&session_id).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].tool_calls.len(), 1);
        assert_eq!(history[0].tool_calls[0].status, ToolCallStatus::Completed);
    }

    #[tokio::test]
    async fn update_title_persists_and_bumps_updated_at() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let session = store.create("old").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let renamed = store.update_title(&session.id, "new").await.unwrap();
        assert_eq!(renamed.title, "new");
        assert!(renamed.updated_at > session.updated_at);

        let reloaded = super::SessionStore::open(dir.path().to_str().unwrap(), ".devport")
            .await
            .unwrap();
        assert_eq!(reloaded.get(&session.id).await.unwrap().title, "new");
        assert!(matches!(
            store.update_title("missing", "x").await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn delete_removes_session_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let session = store.create("doomed").await.unwrap();
        let session_dir = dir
            .path()
            .join(".devport")
            .join("sessions")
            .join(&session.id);
        assert!(session_dir.exists());

        store.delete(&session.id).await.unwrap();
        assert!(store.get(&session.id).await.is_none());
        assert!(!session_dir.exists());
        assert!(matches!(
            store.delete(&session.id).await,
            Err(StoreError::NotFound)
        ));
    }
}
