//! File-backed store for OAuth artifacts.
//!
//! One JSON document per record under the sessions directory, named
//! `<kind-prefix><id>.json`. Keys are sanitized so no id can escape the
//! store root. Every read checks `expires_at`: an expired record reads as
//! absent and its file is deleted on the spot. Writes are serialized per
//! file with a `<path>.lock` advisory lock and land via temp-file + rename.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use tracing::warn;

use onemcp_core::error::ProxyError;

const LOCK_RETRIES: u32 = 10;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

const MAX_KEY_LEN: usize = 128;

pub const TOKEN_TTL: Duration = Duration::from_secs(86_400);
pub const AUTH_CODE_TTL: Duration = Duration::from_secs(600);
pub const CLIENT_TTL: Duration = Duration::from_secs(90 * 24 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// Access-token record; ids are prefixed `tk-`.
    Session,
    /// One-shot authorization code; ids are prefixed `code-`.
    AuthCode,
    /// Staged consent request; ids share the `code-` prefix.
    AuthRequest,
    /// Dynamically registered OAuth client; ids are prefixed `client-`.
    Client,
}

impl RecordKind {
    fn file_prefix(self) -> &'static str {
        match self {
            RecordKind::Session => "session_",
            RecordKind::AuthCode => "code_",
            RecordKind::AuthRequest => "auth_req_",
            RecordKind::Client => "client_",
        }
    }
}

pub trait StoredRecord: Serialize + DeserializeOwned {
    fn expires_at(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub token: String,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    pub scopes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl StoredRecord for SessionRecord {
    fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthCodeRecord {
    pub code: String,
    pub client_id: String,
    pub redirect_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    pub scopes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl StoredRecord for AuthCodeRecord {
    fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

/// A staged consent request: an auth code plus the client's `state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequestRecord {
    pub code: String,
    pub client_id: String,
    pub redirect_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl StoredRecord for AuthRequestRecord {
    fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRecord {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    pub redirect_uris: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl StoredRecord for ClientRecord {
    fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

pub struct FileSessionStore {
    root: PathBuf,
}

impl FileSessionStore {
    pub fn new(root: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn put<T: StoredRecord>(
        &self,
        kind: RecordKind,
        id: &str,
        record: &T,
    ) -> Result<(), ProxyError> {
        let path = self.record_path(kind, id)?;
        let _lock = FileLock::acquire(&path).await?;
        let json = serde_json::to_string_pretty(record)
            .map_err(|err| ProxyError::internal(format!("failed to encode record: {err}")))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .map_err(|err| ProxyError::internal(format!("failed to write record: {err}")))?;
        std::fs::rename(&tmp, &path)
            .map_err(|err| ProxyError::internal(format!("failed to replace record: {err}")))?;
        Ok(())
    }

    /// Lock-free read. Expired records read as absent and their files are
    /// deleted.
    pub fn get<T: StoredRecord>(
        &self,
        kind: RecordKind,
        id: &str,
    ) -> Result<Option<T>, ProxyError> {
        let path = self.record_path(kind, id)?;
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(ProxyError::internal(format!(
                    "failed to read record: {err}"
                )));
            }
        };
        let record: T = match serde_json::from_str(&text) {
            Ok(record) => record,
            Err(err) => {
                warn!("corrupt record {}: {err}", path.display());
                return Ok(None);
            }
        };
        if record.expires_at() <= Utc::now() {
            debug!("record {} expired; deleting", path.display());
            let _ = std::fs::remove_file(&path);
            return Ok(None);
        }
        Ok(Some(record))
    }

    pub async fn delete(&self, kind: RecordKind, id: &str) -> Result<bool, ProxyError> {
        let path = self.record_path(kind, id)?;
        let _lock = FileLock::acquire(&path).await?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(ProxyError::internal(format!(
                "failed to delete record: {err}"
            ))),
        }
    }

    /// Scan the store and remove every expired record file.
    pub fn sweep(&self) {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("sweep failed to read {}: {err}", self.root.display());
                return;
            }
        };
        let now = Utc::now();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(text) = std::fs::read_to_string(&path) else {
                continue;
            };
            let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) else {
                continue;
            };
            let expired = value
                .get("expires_at")
                .and_then(|v| v.as_str())
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc) <= now)
                .unwrap_or(false);
            if expired {
                debug!("sweeping expired record {}", path.display());
                let _ = std::fs::remove_file(&path);
            }
        }
    }

    pub fn spawn_sweeper(self: &Arc<Self>) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                store.sweep();
            }
        });
    }

    fn record_path(&self, kind: RecordKind, id: &str) -> Result<PathBuf, ProxyError> {
        sanitize_key(id)?;
        let path = self.root.join(format!("{}{id}.json", kind.file_prefix()));
        // The sanitized key cannot traverse, but verify containment anyway.
        if path.parent() != Some(self.root.as_path()) {
            return Err(ProxyError::validation(format!(
                "record id `{id}` escapes the store root"
            )));
        }
        Ok(path)
    }
}

fn sanitize_key(id: &str) -> Result<(), ProxyError> {
    if id.is_empty() || id.len() > MAX_KEY_LEN {
        return Err(ProxyError::validation("record id has an invalid length"));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ProxyError::validation(format!(
            "record id `{id}` contains forbidden characters"
        )));
    }
    Ok(())
}

/// Advisory per-file lock: `<path>.lock` created with `create_new`. Ten
/// attempts at 100 ms keeps the worst-case wait at one second.
struct FileLock {
    path: PathBuf,
}

impl FileLock {
    async fn acquire(target: &Path) -> Result<Self, ProxyError> {
        let mut lock_name = target.file_name().unwrap_or_default().to_os_string();
        lock_name.push(".lock");
        let lock_path = target.with_file_name(lock_name);

        for attempt in 0..LOCK_RETRIES {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(_) => return Ok(Self { path: lock_path }),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    debug!(
                        "lock {} busy (attempt {}/{LOCK_RETRIES})",
                        lock_path.display(),
                        attempt + 1
                    );
                    tokio::time::sleep(LOCK_RETRY_DELAY).await;
                }
                Err(err) => {
                    return Err(ProxyError::internal(format!(
                        "failed to create lock {}: {err}",
                        lock_path.display()
                    )));
                }
            }
        }
        Err(ProxyError::internal(format!(
            "could not acquire lock {} within {LOCK_RETRIES} attempts; \
             another writer is stuck or a stale lock file needs removing",
            lock_path.display()
        )))
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Generate a bearer token id: `tk-` plus 48 hex chars of entropy.
pub fn new_token_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 24];
    rand::rng().fill_bytes(&mut bytes);
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("tk-{hex}")
}

pub fn new_code_id() -> String {
    format!("code-{}", uuid::Uuid::new_v4())
}

pub fn new_client_id() -> String {
    format!("client-{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn store() -> (tempfile::TempDir, FileSessionStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileSessionStore::new(dir.path().join("sessions")).expect("store");
        (dir, store)
    }

    fn session_record(token: &str, ttl_secs: i64) -> SessionRecord {
        let now = Utc::now();
        SessionRecord {
            token: token.to_string(),
            client_id: "client-x".to_string(),
            resource: None,
            scopes: vec!["tag:web".to_string()],
            created_at: now,
            expires_at: now + chrono::Duration::seconds(ttl_secs),
        }
    }

    #[tokio::test]
    async fn put_get_round_trip() {
        let (_dir, store) = store();
        let record = session_record("tk-abc", 3600);
        store
            .put(RecordKind::Session, &record.token, &record)
            .await
            .expect("put");

        let loaded: SessionRecord = store
            .get(RecordKind::Session, "tk-abc")
            .expect("get")
            .expect("present");
        assert_eq!(loaded.client_id, "client-x");

        // File layout: sessions/session_tk-abc.json
        assert!(store.root().join("session_tk-abc.json").exists());
    }

    #[tokio::test]
    async fn expired_records_read_as_absent_and_are_deleted() {
        let (_dir, store) = store();
        let record = session_record("tk-old", -10);
        store
            .put(RecordKind::Session, &record.token, &record)
            .await
            .expect("put");

        let loaded: Option<SessionRecord> =
            store.get(RecordKind::Session, "tk-old").expect("get");
        assert!(loaded.is_none());
        assert!(!store.root().join("session_tk-old.json").exists());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (_dir, store) = store();
        let record = session_record("tk-gone", 3600);
        store
            .put(RecordKind::Session, &record.token, &record)
            .await
            .expect("put");
        assert!(store.delete(RecordKind::Session, "tk-gone").await.expect("delete"));
        assert!(!store.delete(RecordKind::Session, "tk-gone").await.expect("delete"));
    }

    #[tokio::test]
    async fn path_traversal_keys_are_rejected() {
        let (_dir, store) = store();
        for id in ["../escape", "a/b", "a\\b", "", "a.json"] {
            let result: Result<Option<SessionRecord>, _> = store.get(RecordKind::Session, id);
            assert!(result.is_err(), "id {id:?} must be rejected");
        }
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_files() {
        let (_dir, store) = store();
        let live = session_record("tk-live", 3600);
        let dead = session_record("tk-dead", -10);
        store
            .put(RecordKind::Session, &live.token, &live)
            .await
            .expect("put");
        store
            .put(RecordKind::Session, &dead.token, &dead)
            .await
            .expect("put");

        store.sweep();
        assert!(store.root().join("session_tk-live.json").exists());
        assert!(!store.root().join("session_tk-dead.json").exists());
    }

    #[tokio::test]
    async fn contended_lock_fails_with_a_descriptive_error() {
        tokio::time::pause();
        let (_dir, store) = store();
        let record = session_record("tk-x", 3600);
        // Simulate a stuck writer by pre-creating the lock file.
        std::fs::write(store.root().join("session_tk-x.json.lock"), b"")
            .expect("write lock");

        let err = store
            .put(RecordKind::Session, "tk-x", &record)
            .await
            .expect_err("lock contention");
        assert!(err.to_string().contains("lock"));
    }

    #[test]
    fn generated_ids_carry_their_prefixes() {
        assert!(new_token_id().starts_with("tk-"));
        assert!(new_code_id().starts_with("code-"));
        assert!(new_client_id().starts_with("client-"));
        assert_ne!(new_token_id(), new_token_id());
    }
}
