//! Persistence collaborator
//!
//! Key-value storage that outlives an activation. Values are JSON, keys are
//! plain strings, every entry carries its own TTL.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::clock::{system_clock, Clock};
use crate::errors::WizardError;

#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Returns `None` for missing and expired keys. Expired keys are removed.
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, WizardError>;

    /// Replace the whole value stored under `key`
    async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Duration,
    ) -> Result<(), WizardError>;

    async fn remove(&self, key: &str) -> Result<(), WizardError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    value: serde_json::Value,
    expires_at: DateTime<Utc>,
}

impl Entry {
    fn new(value: serde_json::Value, ttl: Duration, now: DateTime<Utc>) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            value,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Store held in memory; shared between activations through an `Arc`
#[derive(Clone)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(system_clock())
    }
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait::async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, WizardError> {
        let mut entries = self.entries.lock().await;
        let now = self.clock.now();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                debug!(key, "Dropping expired entry");
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Duration,
    ) -> Result<(), WizardError> {
        let entry = Entry::new(value, ttl, self.clock.now());
        self.entries.lock().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), WizardError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

/// One JSON file per key under a state directory
///
/// Writes go to a temporary file that is renamed over the target, so a crash
/// mid-write leaves either the old value or the new one, never a torn file.
pub struct FileStore {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
    // serializes writers inside this host process
    write_lock: Mutex<()>,
}

impl FileStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, WizardError> {
        Self::with_clock(dir, system_clock()).await
    }

    pub async fn with_clock(
        dir: impl AsRef<Path>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, WizardError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            WizardError::Storage(format!("Failed to create state directory {dir:?}: {e}"))
        })?;
        Ok(Self {
            dir,
            clock,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(key)))
    }
}

/// Percent-escape every byte outside `[A-Za-z0-9.-]` so distinct keys never
/// share a file.
fn file_stem(key: &str) -> String {
    let mut stem = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'.' {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("%{byte:02X}"));
        }
    }
    stem
}

#[async_trait::async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, WizardError> {
        let path = self.path_for(key);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(WizardError::Storage(format!(
                    "Failed to read state file {path:?}: {e}"
                )))
            }
        };
        let entry: Entry = match serde_json::from_str(&content) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key, error = %e, "Discarding unreadable state file");
                self.remove(key).await?;
                return Ok(None);
            }
        };
        if entry.is_expired(self.clock.now()) {
            debug!(key, "Dropping expired state file");
            self.remove(key).await?;
            return Ok(None);
        }
        Ok(Some(entry.value))
    }

    async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Duration,
    ) -> Result<(), WizardError> {
        let entry = Entry::new(value, ttl, self.clock.now());
        let body = serde_json::to_string_pretty(&entry)?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");

        let _guard = self.write_lock.lock().await;
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| WizardError::Storage(format!("Failed to write state file: {e}")))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| WizardError::Storage(format!("Failed to replace state file: {e}")))?;
        debug!(key, path = ?path, "Saved state");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), WizardError> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WizardError::Storage(format!(
                "Failed to remove state file {path:?}: {e}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_expires_entries() {
        let clock = ManualClock::new(Utc::now());
        let store = MemoryStore::new(Arc::new(clock.clone()));
        store
            .set("k", json!({"a": 1}), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!({"a": 1})));

        clock.advance(Duration::from_secs(61));
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_file_store_round_trip_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        store
            .set("checkpoint:1058012-91-LP25", json!([3, 4]), Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(
            store.get("checkpoint:1058012-91-LP25").await.unwrap(),
            Some(json!([3, 4]))
        );
        // the key is escaped into a file name
        assert!(dir.path().join("checkpoint%3A1058012-91-LP25.json").exists());

        store.remove("checkpoint:1058012-91-LP25").await.unwrap();
        assert_eq!(store.get("checkpoint:1058012-91-LP25").await.unwrap(), None);
        // removing twice is fine
        store.remove("checkpoint:1058012-91-LP25").await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_keeps_similar_keys_apart() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let keys = ["checkpoint:a/b", "checkpoint:a_b", "checkpoint:a:b", "checkpoint_a_b"];
        for (n, key) in keys.iter().enumerate() {
            store.set(key, json!(n), Duration::from_secs(60)).await.unwrap();
        }
        for (n, key) in keys.iter().enumerate() {
            assert_eq!(store.get(key).await.unwrap(), Some(json!(n)), "{key}");
        }
        assert_eq!(file_stem("checkpoint:a/b"), "checkpoint%3Aa%2Fb");
        assert_eq!(file_stem("checkpoint:a_b"), "checkpoint%3Aa%5Fb");
        assert_eq!(file_stem("señal"), "se%C3%B1al");
    }

    #[tokio::test]
    async fn test_file_store_discards_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        tokio::fs::write(dir.path().join("broken.json"), "{not json")
            .await
            .unwrap();
        assert_eq!(store.get("broken").await.unwrap(), None);
        assert!(!dir.path().join("broken.json").exists());
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).await.unwrap();
            store
                .set("session:x", json!("kept"), Duration::from_secs(60))
                .await
                .unwrap();
        }
        let reopened = FileStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.get("session:x").await.unwrap(), Some(json!("kept")));
    }
}
