// Shared Storage Layer
// Atomic JSON file persistence and an in-memory KV backend, used by every
// ledger and record store in the platform.

//! # Storage
//!
//! Two things live here:
//!
//! - [`StorageBackend`] / [`MemoryStorage`]: a minimal async KV abstraction,
//!   used where a component just needs a scratch map (tests, caches).
//! - [`JsonFileStore`]: the workhorse. Every ledger and record store
//!   (`perimeter-ledger.json`, `sdc-tokens.json`, ...) is one whole-document
//!   JSON file written with write-to-temp-then-rename atomicity. A missing
//!   or corrupt file on load falls back to the type's `Default` and logs a
//!   warning rather than failing startup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("key not found: {0}")]
    KeyNotFound(String),
}

/// Minimal async key-value backend.
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;
}

/// In-memory KV backend, used for tests and process-local caches.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    data: std::sync::Arc<tokio::sync::RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl StorageBackend for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.data.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.data.write().await.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.data.read().await.contains_key(key))
    }
}

/// Atomic whole-document JSON store, pretty-printed with 2-space indent,
/// backing each of the platform's persisted files (ledgers, intake,
/// tokens, export log, telecom registry, pending approvals).
pub struct JsonFileStore<T> {
    path: PathBuf,
    _marker: std::marker::PhantomData<T>,
}

impl<T> JsonFileStore<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: std::marker::PhantomData,
        }
    }

    /// Load the document. A missing file or one that fails to parse starts
    /// a fresh `T::default()` and logs a warning; it does not error.
    pub fn load(&self) -> T {
        match std::fs::read(&self.path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(value) => value,
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "corrupt store, starting fresh");
                    T::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => T::default(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "unreadable store, starting fresh");
                T::default()
            }
        }
    }

    /// Atomically persist the document: write to a sibling temp file, fsync
    /// it, then rename over the real path. On rename failure the caller's
    /// in-memory state is unaffected (the temp file is left for inspection
    /// rather than silently lost).
    pub fn save(&self, value: &T) -> Result<(), StorageError> {
        let json = serde_json::to_vec_pretty(value)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| StorageError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let tmp_path = tmp_path_for(&self.path);
        {
            let mut file = std::fs::File::create(&tmp_path).map_err(|source| StorageError::Io {
                path: tmp_path.clone(),
                source,
            })?;
            use std::io::Write;
            file.write_all(&json).map_err(|source| StorageError::Io {
                path: tmp_path.clone(),
                source,
            })?;
            file.sync_all().map_err(|source| StorageError::Io {
                path: tmp_path.clone(),
                source,
            })?;
        }

        std::fs::rename(&tmp_path, &self.path).map_err(|source| StorageError::Io {
            path: self.path.clone(),
            source,
        })?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}
