//! Key-value persistence
//!
//! Components that need to survive a restart (batch checkpoints, schedule
//! entries) persist JSON values through [`KeyValueStore`]. The medium is a
//! deployment decision: [`MemoryStore`] for tests and ephemeral runs,
//! [`FileStore`] for a directory of JSON documents.

use crate::config::StorageSettings;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Async key-value store for JSON documents
#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value, `None` if the key was never written or was removed
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Insert or overwrite a value
    async fn put(&self, key: &str, value: Value) -> Result<()>;

    /// Remove a value; removing a missing key is not an error
    async fn remove(&self, key: &str) -> Result<()>;

    /// List all keys currently stored
    async fn keys(&self) -> Result<Vec<String>>;
}

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.entries.read().await.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

/// On-disk envelope; keeps the original key since file names are sanitized
#[derive(Serialize, Deserialize)]
struct StoredDocument {
    key: String,
    value: Value,
}

/// Directory-backed store, one JSON file per key
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (and create if missing) a store rooted at `dir`
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Root directory of this store
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", file_name))
    }
}

#[async_trait::async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let path = self.path_for(key);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        };

        let document: StoredDocument = serde_json::from_str(&content)?;
        if document.key != key {
            // Two keys sanitized to the same file name; the newer write wins
            warn!(
                requested = key,
                stored = %document.key,
                "Store file holds a different key"
            );
            return Ok(None);
        }
        Ok(Some(document.value))
    }

    async fn put(&self, key: &str, value: Value) -> Result<()> {
        let path = self.path_for(key);
        let document = StoredDocument {
            key: key.to_string(),
            value,
        };
        let content = serde_json::to_vec_pretty(&document)?;

        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, content).await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        debug!(key, path = %path.display(), "Store value written");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<StoredDocument>(&content) {
                Ok(document) => keys.push(document.key),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable store file"),
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Store selected by the `[storage]` section
pub fn open_store(settings: &StorageSettings) -> Result<Arc<dyn KeyValueStore>> {
    match &settings.checkpoint_dir {
        Some(dir) => {
            debug!(dir = %dir.display(), "Using file-backed store");
            Ok(Arc::new(FileStore::open(dir)?))
        }
        None => Ok(Arc::new(MemoryStore::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_store_put_get_remove() {
        let store = MemoryStore::new();
        assert!(store.get("a").await.unwrap().is_none());

        store.put("a", json!({"n": 1})).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(json!({"n": 1})));

        store.remove("a").await.unwrap();
        store.remove("a").await.unwrap();
        assert!(store.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();

        {
            let store = FileStore::open(temp_dir.path()).unwrap();
            store
                .put("checkpoint:content_analysis", json!({"processedCount": 20}))
                .await
                .unwrap();
        }

        let reopened = FileStore::open(temp_dir.path()).unwrap();
        let value = reopened.get("checkpoint:content_analysis").await.unwrap();
        assert_eq!(value, Some(json!({"processedCount": 20})));
        assert_eq!(
            reopened.keys().await.unwrap(),
            vec!["checkpoint:content_analysis".to_string()]
        );
    }

    #[tokio::test]
    async fn test_open_store_follows_storage_settings() {
        let temp_dir = TempDir::new().unwrap();
        let settings = StorageSettings {
            checkpoint_dir: Some(temp_dir.path().join("checkpoints")),
        };
        let store = open_store(&settings).unwrap();
        store.put("k", json!(1)).await.unwrap();
        assert!(temp_dir.path().join("checkpoints").join("k.json").exists());

        let memory = open_store(&StorageSettings::default()).unwrap();
        assert!(memory.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_remove_missing_key_is_ok() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::open(temp_dir.path()).unwrap();
        store.remove("never-written").await.unwrap();
        assert!(store.keys().await.unwrap().is_empty());
    }
}
