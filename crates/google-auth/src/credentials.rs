//! Token storage, one record per user
//!
//! [`CredentialStore`] is the seam the flow controller talks to. Two backends:
//!
//! - [`FileCredentialStore`]: one JSON file per user in a token directory.
//!   Writes go to a temp file that is fsynced and renamed over the target, so
//!   a reader sees either the old record or the new one, and a successful
//!   `put` survives a crash right after it returns.
//! - [`MemoryCredentialStore`]: a map behind an `RwLock`, for tests.
//!
//! Calls for the same user are serialized by a per-user async mutex; calls
//! for different users never wait on each other.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Boxed future returned by the store and exchanger traits so they stay
/// usable behind `Arc<dyn ...>`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A user's OAuth tokens.
///
/// `expires_at` and `obtained_at` are unix timestamps in milliseconds. The
/// access token is invalid at or after `expires_at`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub user_id: String,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scopes: BTreeSet<String>,
    pub expires_at: u64,
    pub obtained_at: u64,
}

impl TokenRecord {
    pub fn is_expired_at(&self, now_millis: u64) -> bool {
        now_millis >= self.expires_at
    }
}

impl fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRecord")
            .field("user_id", &self.user_id)
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("scopes", &self.scopes)
            .field("expires_at", &self.expires_at)
            .field("obtained_at", &self.obtained_at)
            .finish()
    }
}

/// Current time as unix milliseconds.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Durable, concurrency-safe storage of one [`TokenRecord`] per user.
pub trait CredentialStore: Send + Sync {
    /// Insert or replace the record for `user_id`. Persisted before returning.
    fn put<'a>(&'a self, user_id: &'a str, record: &'a TokenRecord) -> BoxFuture<'a, Result<()>>;

    /// Current record for `user_id`, or `None` if there is none.
    fn get<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Result<Option<TokenRecord>>>;

    /// Remove the record for `user_id`. Absent records are not an error.
    fn delete<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Result<()>>;
}

fn check_well_formed(user_id: &str, record: &TokenRecord) -> Result<()> {
    if user_id.is_empty() {
        return Err(Error::InvalidRecord("user_id must not be empty".into()));
    }
    if record.user_id != user_id {
        return Err(Error::InvalidRecord(format!(
            "record belongs to {}, not {user_id}",
            record.user_id
        )));
    }
    Ok(())
}

/// Per-key async mutexes. Entries are created on first use.
#[derive(Default)]
struct KeyLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(key.to_string()).or_default().clone()
    }

    /// Drop the entry for `key` unless another caller still holds a clone.
    fn release(&self, key: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(key);
        }
    }
}

/// File-per-user credential store.
pub struct FileCredentialStore {
    dir: PathBuf,
    locks: KeyLocks,
}

impl FileCredentialStore {
    /// Open (creating if needed) a token directory.
    pub async fn open(dir: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Io(format!("creating token directory {}: {e}", dir.display())))?;
        info!(path = %dir.display(), "credential store ready");
        Ok(Self {
            dir,
            locks: KeyLocks::default(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record file for `user_id`.
    ///
    /// The name is the URL-safe base64 of the id's SHA-256 digest: fixed
    /// length whatever the id, distinct per id, and unable to escape the
    /// directory.
    pub fn record_path(&self, user_id: &str) -> PathBuf {
        let digest = Sha256::digest(user_id.as_bytes());
        self.dir
            .join(format!("{}.json", URL_SAFE_NO_PAD.encode(digest)))
    }

    async fn put_record(&self, user_id: &str, record: &TokenRecord) -> Result<()> {
        check_well_formed(user_id, record)?;
        let lock = self.locks.lock_for(user_id);
        let written = {
            let _guard = lock.lock().await;
            write_atomic(&self.record_path(user_id), record).await
        };
        drop(lock);
        self.locks.release(user_id);
        written?;
        debug!(user_id, "stored token record");
        Ok(())
    }

    async fn get_record(&self, user_id: &str) -> Result<Option<TokenRecord>> {
        let lock = self.locks.lock_for(user_id);
        let record = {
            let _guard = lock.lock().await;
            read_record(&self.record_path(user_id)).await
        };
        drop(lock);
        self.locks.release(user_id);
        record
    }

    async fn delete_record(&self, user_id: &str) -> Result<()> {
        let lock = self.locks.lock_for(user_id);
        let removed = {
            let _guard = lock.lock().await;
            match tokio::fs::remove_file(self.record_path(user_id)).await {
                Ok(()) => {
                    debug!(user_id, "removed token record");
                    Ok(())
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(Error::Io(format!("removing token record: {e}"))),
            }
        };
        drop(lock);
        self.locks.release(user_id);
        removed
    }
}

impl CredentialStore for FileCredentialStore {
    fn put<'a>(&'a self, user_id: &'a str, record: &'a TokenRecord) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.put_record(user_id, record))
    }

    fn get<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Result<Option<TokenRecord>>> {
        Box::pin(self.get_record(user_id))
    }

    fn delete<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.delete_record(user_id))
    }
}

async fn read_record(path: &Path) -> Result<Option<TokenRecord>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Io(format!("reading token record: {e}"))),
    };
    let record = serde_json::from_str(&contents)
        .map_err(|e| Error::CredentialParse(format!("parsing {}: {e}", path.display())))?;
    Ok(Some(record))
}

/// Write a record atomically and durably.
///
/// Temp file in the same directory, fsync, rename over the target, then fsync
/// the directory so the rename itself is on disk. Permissions are 0600 since
/// the file holds OAuth tokens.
async fn write_atomic(path: &Path, record: &TokenRecord) -> Result<()> {
    let json = serde_json::to_vec_pretty(record)
        .map_err(|e| Error::CredentialParse(format!("serializing token record: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("token record path has no parent directory".into()))?;
    let tmp_path = dir.join(format!(".record.tmp.{}", uuid::Uuid::new_v4().as_simple()));

    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .map_err(|e| Error::Io(format!("creating temp token file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting token file permissions: {e}")))?;
    }

    let written = async {
        file.write_all(&json).await?;
        file.sync_all().await
    }
    .await;
    drop(file);
    if let Err(e) = written {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(Error::Io(format!("writing temp token file: {e}")));
    }

    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(Error::Io(format!("renaming temp token file: {e}")));
    }

    #[cfg(unix)]
    {
        let dir_handle = tokio::fs::File::open(dir)
            .await
            .map_err(|e| Error::Io(format!("opening token directory: {e}")))?;
        dir_handle
            .sync_all()
            .await
            .map_err(|e| Error::Io(format!("syncing token directory: {e}")))?;
    }

    Ok(())
}

/// In-memory credential store. Nothing survives the process.
#[derive(Default)]
pub struct MemoryCredentialStore {
    records: RwLock<HashMap<String, TokenRecord>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn put<'a>(&'a self, user_id: &'a str, record: &'a TokenRecord) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            check_well_formed(user_id, record)?;
            self.records
                .write()
                .await
                .insert(user_id.to_string(), record.clone());
            Ok(())
        })
    }

    fn get<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Result<Option<TokenRecord>>> {
        Box::pin(async move { Ok(self.records.read().await.get(user_id).cloned()) })
    }

    fn delete<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.records.write().await.remove(user_id);
            Ok(())
        })
    }
}
