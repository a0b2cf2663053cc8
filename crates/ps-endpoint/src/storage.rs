//! Blob storage collaborator.
//!
//! The endpoint delegates all local key/value operations to a [`Storage`]
//! implementation. Blobs are opaque bytes keyed by strings; semantics are
//! write-once-or-overwrite, read-many, no TTL, no cross-key ordering.
//! Implementations may persist or discard freely.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A `set` payload exceeded the configured maximum object size.
    #[error("object of {size} bytes exceeds the max object size of {max} bytes")]
    ObjectSizeExceeded { size: usize, max: usize },
    #[error("storage error: {0}")]
    Other(String),
}

/// Async byte-blob storage keyed by strings.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Value associated with `key`, or `None` if the key is absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    /// Associate `value` with `key`, overwriting any prior value.
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;
    /// Whether `key` is present.
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;
    /// Remove `key`. Evicting an absent key succeeds.
    async fn evict(&self, key: &str) -> Result<(), StorageError>;
    /// Release any resources held by the storage.
    async fn close(&self) -> Result<(), StorageError>;
}

/// In-memory [`Storage`] with an optional per-object size limit.
#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    max_object_size: Option<usize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage that refuses objects larger than `max_object_size` bytes.
    pub fn with_max_object_size(max_object_size: usize) -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            max_object_size: Some(max_object_size),
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.objects.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        if let Some(max) = self.max_object_size {
            if value.len() > max {
                return Err(StorageError::ObjectSizeExceeded {
                    size: value.len(),
                    max,
                });
            }
        }
        self.objects.lock().await.insert(key.to_owned(), value);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.objects.lock().await.contains_key(key))
    }

    async fn evict(&self, key: &str) -> Result<(), StorageError> {
        self.objects.lock().await.remove(key);
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.objects.lock().await.clear();
        Ok(())
    }
}
