//! Filesystem blob store.
//!
//! Layout: `<root>/<bucket>/<logical key>/content`, with an optional
//! `metadata.json` sibling holding the upload content type.
//!
//! Root directory and bucket name are resolved on first access rather than
//! at construction, so a misconfigured deployment fails on the first file
//! operation with a configuration error. The resolved bucket path is cached
//! for the life of the store.
//!
//! Content and metadata are two files replaced one after the other. Writers
//! and removers of the same key inside one process are serialized, so the
//! pair on disk always comes from a single upload; a reader racing a writer
//! may briefly see new content with the previous content type.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::FileUploadSettings;
use crate::error::FileUploadError;
use crate::metrics::track_blob_operation;
use crate::services::blob_store::{BlobMetadata, BlobStore, StoredBlob};
use crate::services::file_keys::FileKey;

const CONTENT_FILE: &str = "content";
const METADATA_FILE: &str = "metadata.json";
const WRITE_LOCK_STRIPES: usize = 64;

pub struct FilesystemBlobStore {
    settings: FileUploadSettings,
    bucket_path: OnceLock<PathBuf>,
    write_locks: Vec<Mutex<()>>,
}

impl FilesystemBlobStore {
    pub fn new(settings: FileUploadSettings) -> Self {
        Self {
            settings,
            bucket_path: OnceLock::new(),
            write_locks: (0..WRITE_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    /// `<root>/<bucket>`, made absolute against the working directory.
    fn bucket_path(&self) -> Result<&Path, FileUploadError> {
        if let Some(path) = self.bucket_path.get() {
            return Ok(path);
        }

        let root = self.settings.root_directory()?;
        let bucket = self.settings.bucket_name()?;
        let joined = root.join(bucket);
        let resolved = if joined.is_absolute() {
            joined
        } else {
            std::env::current_dir()?.join(joined)
        };

        tracing::debug!(bucket_path = %resolved.display(), "Resolved file upload bucket path");
        Ok(self.bucket_path.get_or_init(|| resolved))
    }

    fn data_path(&self, key: &FileKey) -> Result<PathBuf, FileUploadError> {
        Ok(self.bucket_path()?.join(key.logical_key()))
    }

    pub fn make_storage_path(&self, key: &FileKey) -> Result<PathBuf, FileUploadError> {
        Ok(self.data_path(key)?.join(CONTENT_FILE))
    }

    fn metadata_path(&self, key: &FileKey) -> Result<PathBuf, FileUploadError> {
        Ok(self.data_path(key)?.join(METADATA_FILE))
    }

    /// Lock stripe shared by every writer of `key`.
    fn write_lock(&self, key: &FileKey) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.logical_key().hash(&mut hasher);
        &self.write_locks[(hasher.finish() as usize) % self.write_locks.len()]
    }

    async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), FileUploadError> {
        let tmp_path = path.with_file_name(format!(
            ".{}.{}.tmp",
            path.file_name()
                .and_then(|name| name.to_str())
                .unwrap_or(CONTENT_FILE),
            Uuid::new_v4()
        ));

        let written = match fs::write(&tmp_path, bytes).await {
            Ok(()) => fs::rename(&tmp_path, path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            discard_temp_file(&tmp_path).await;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for FilesystemBlobStore {
    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    async fn exists(&self, key: &FileKey) -> Result<bool, FileUploadError> {
        let path = self.make_storage_path(key)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn write(&self, key: &FileKey, blob: StoredBlob) -> Result<(), FileUploadError> {
        let data_path = self.data_path(key)?;
        let content_path = data_path.join(CONTENT_FILE);
        let metadata_path = data_path.join(METADATA_FILE);

        let metadata = blob
            .content_type
            .as_ref()
            .map(|content_type| {
                serde_json::to_vec(&BlobMetadata {
                    content_type: Some(content_type.clone()),
                })
            })
            .transpose()
            .map_err(|e| FileUploadError::Io(std::io::Error::other(e)))?;

        let _guard = self.write_lock(key).lock().await;
        track_blob_operation("write", async {
            fs::create_dir_all(&data_path).await?;
            Self::write_atomically(&content_path, &blob.content).await?;

            match metadata {
                Some(json) => Self::write_atomically(&metadata_path, &json).await,
                // A previous upload's content type must not leak onto this one.
                None => safe_remove_file(&metadata_path).await,
            }
        })
        .await?;

        tracing::debug!(
            key = key.logical_key(),
            bytes = blob.content.len(),
            "Stored file content"
        );
        Ok(())
    }

    async fn read(&self, key: &FileKey) -> Result<StoredBlob, FileUploadError> {
        let content_path = self.make_storage_path(key)?;
        let metadata_path = self.metadata_path(key)?;

        track_blob_operation("read", async {
            let content = match fs::read(&content_path).await {
                Ok(content) => content,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(FileUploadError::NotFound {
                        key: key.logical_key().to_string(),
                    })
                }
                Err(e) => return Err(e.into()),
            };

            let metadata = match fs::read(&metadata_path).await {
                Ok(bytes) => serde_json::from_slice::<BlobMetadata>(&bytes).unwrap_or_else(|e| {
                    tracing::warn!(key = key.logical_key(), "Ignoring unreadable file metadata: {}", e);
                    BlobMetadata::default()
                }),
                Err(e) if e.kind() == ErrorKind::NotFound => BlobMetadata::default(),
                Err(e) => return Err(e.into()),
            };

            Ok(StoredBlob {
                content,
                content_type: metadata.content_type,
            })
        })
        .await
    }

    async fn remove(&self, key: &FileKey) -> Result<(), FileUploadError> {
        let data_path = self.data_path(key)?;

        let _guard = self.write_lock(key).lock().await;
        track_blob_operation("remove", async {
            safe_remove_file(&data_path.join(CONTENT_FILE)).await?;
            safe_remove_file(&data_path.join(METADATA_FILE)).await?;
            remove_dir_if_empty(&data_path).await
        })
        .await?;

        tracing::debug!(key = key.logical_key(), "Removed file content");
        Ok(())
    }
}

/// Delete a file, treating "already absent" as success.
pub async fn safe_remove_file(path: &Path) -> Result<(), FileUploadError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Best-effort cleanup of a temp file after a failed write; the write's own
/// error is what the caller sees.
async fn discard_temp_file(path: &Path) {
    if let Err(e) = safe_remove_file(path).await {
        tracing::warn!(path = %path.display(), "Failed to remove temp file: {}", e);
    }
}

/// Remove the per-key directory once nothing else lives in it. A directory
/// that still holds files (or is already gone) is left alone.
async fn remove_dir_if_empty(path: &Path) -> Result<(), FileUploadError> {
    match fs::remove_dir(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => {
            // The "not empty" error kind varies by platform; look instead.
            let mut entries = fs::read_dir(path).await?;
            if entries.next_entry().await?.is_some() {
                Ok(())
            } else {
                Err(e.into())
            }
        }
    }
}
