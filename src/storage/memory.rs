//! In-memory storage backend.

use async_trait::async_trait;
use dashmap::DashMap;

use super::{Storage, StorageError};

/// Process-local storage. State is lost on restart; useful for tests and
/// for brokers that rely entirely on client-side replay.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    blobs: DashMap<String, Vec<u8>>,
}

impl MemoryStorage {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// True when nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn save(&self, key: &str, blob: &[u8]) -> Result<(), StorageError> {
        self.blobs.insert(key.to_string(), blob.to_vec());
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.blobs.get(key).map(|b| b.value().clone()))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.blobs.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.blobs.contains_key(key))
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .blobs
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect())
    }
}
