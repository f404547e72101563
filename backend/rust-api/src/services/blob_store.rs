use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::FileUploadError;
use crate::services::file_keys::FileKey;

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// File content plus the content type it was uploaded with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub content: Vec<u8>,
    pub content_type: Option<String>,
}

impl StoredBlob {
    pub fn new(content: impl Into<Vec<u8>>) -> Self {
        Self {
            content: content.into(),
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn content_type_or_default(&self) -> &str {
        self.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE)
    }
}

/// Sidecar record stored next to the content.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlobMetadata {
    pub content_type: Option<String>,
}

/// Key-addressed durable storage for file content.
#[async_trait]
pub trait BlobStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn exists(&self, key: &FileKey) -> Result<bool, FileUploadError>;

    /// Overwrites any existing content for the key.
    async fn write(&self, key: &FileKey, blob: StoredBlob) -> Result<(), FileUploadError>;

    /// `NotFound` when nothing was ever written (or it was removed).
    async fn read(&self, key: &FileKey) -> Result<StoredBlob, FileUploadError>;

    /// Succeeds when the content is already gone.
    async fn remove(&self, key: &FileKey) -> Result<(), FileUploadError>;
}

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, StoredBlob>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn exists(&self, key: &FileKey) -> Result<bool, FileUploadError> {
        Ok(self.blobs.read().await.contains_key(key.logical_key()))
    }

    async fn write(&self, key: &FileKey, blob: StoredBlob) -> Result<(), FileUploadError> {
        self.blobs
            .write()
            .await
            .insert(key.logical_key().to_string(), blob);
        Ok(())
    }

    async fn read(&self, key: &FileKey) -> Result<StoredBlob, FileUploadError> {
        self.blobs
            .read()
            .await
            .get(key.logical_key())
            .cloned()
            .ok_or_else(|| FileUploadError::NotFound {
                key: key.logical_key().to_string(),
            })
    }

    async fn remove(&self, key: &FileKey) -> Result<(), FileUploadError> {
        self.blobs.write().await.remove(key.logical_key());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_overwrites_and_removes() {
        let store = MemoryBlobStore::new();
        let key = FileKey::parse("abc|notes.txt").unwrap();

        store.write(&key, StoredBlob::new(b"first".to_vec())).await.unwrap();
        store
            .write(&key, StoredBlob::new(b"second".to_vec()).with_content_type("text/plain"))
            .await
            .unwrap();

        let blob = store.read(&key).await.unwrap();
        assert_eq!(blob.content, b"second");
        assert_eq!(blob.content_type_or_default(), "text/plain");
        assert_eq!(store.len().await, 1);

        store.remove(&key).await.unwrap();
        store.remove(&key).await.unwrap();
        assert!(store.is_empty().await);
        assert!(!store.exists(&key).await.unwrap());
        assert!(matches!(
            store.read(&key).await,
            Err(FileUploadError::NotFound { .. })
        ));
    }

    #[test]
    fn test_default_content_type() {
        assert_eq!(
            StoredBlob::new(Vec::new()).content_type_or_default(),
            DEFAULT_CONTENT_TYPE
        );
    }
}
