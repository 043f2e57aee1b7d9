//! Pluggable blob storage.
//!
//! The broker persists room snapshots and the client persists its offline
//! queue through this interface. Blobs are opaque; keys are flat strings
//! with "/" used by convention for namespacing.

mod fs;
mod memory;

use async_trait::async_trait;
use thiserror::Error;

pub use fs::FileStorage;
pub use memory::MemoryStorage;

/// Storage failures. Callers that can run degraded treat these as
/// non-fatal (the offline queue falls back to memory-only).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("backend failure: {0}")]
    Backend(String),
}

/// A key-value store for opaque blobs.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Write `blob` under `key`, replacing any previous value.
    async fn save(&self, key: &str, blob: &[u8]) -> Result<(), StorageError>;

    /// Read the blob under `key`, or `None` when absent.
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Does `key` exist?
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// All keys starting with `prefix`.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Exercised against both backends to keep them behaviorally identical.
    async fn exercise(storage: &dyn Storage) {
        assert!(storage.load("missing").await.unwrap().is_none());
        assert!(!storage.exists("missing").await.unwrap());

        storage.save("rooms/lobby", b"state-1").await.unwrap();
        storage.save("rooms/dev", b"state-2").await.unwrap();
        storage.save("queue/alice", b"ops").await.unwrap();

        assert_eq!(storage.load("rooms/lobby").await.unwrap().unwrap(), b"state-1");
        assert!(storage.exists("rooms/dev").await.unwrap());

        let mut rooms = storage.list_keys("rooms/").await.unwrap();
        rooms.sort();
        assert_eq!(rooms, vec!["rooms/dev".to_string(), "rooms/lobby".to_string()]);

        // Overwrite.
        storage.save("rooms/lobby", b"state-3").await.unwrap();
        assert_eq!(storage.load("rooms/lobby").await.unwrap().unwrap(), b"state-3");

        // Delete is idempotent.
        storage.delete("rooms/lobby").await.unwrap();
        storage.delete("rooms/lobby").await.unwrap();
        assert!(!storage.exists("rooms/lobby").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_storage_contract() {
        exercise(&MemoryStorage::new()).await;
    }

    #[tokio::test]
    async fn test_file_storage_contract() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FileStorage::new(dir.path())).await;
    }
}
