//! Capability-gated access to uploaded files.
//!
//! Issuing a URL registers a time-limited grant for one direction of one key.
//! The serving layer then calls `authorize_and_write` / `authorize_and_read`,
//! which check the grant before touching the blob store. The grant check and
//! the blob operation are two separate steps; the grant is an admission
//! filter, not a lock. Grants are never consumed: an upload may be retried
//! until its TTL lapses.

use std::sync::Arc;

use crate::config::FileUploadSettings;
use crate::error::FileUploadError;
use crate::metrics::{record_file_access, FILE_GRANTS_ISSUED_TOTAL};
use crate::services::blob_store::{BlobStore, StoredBlob};
use crate::services::file_keys::{FileKey, KeyAddressing};
use crate::services::grant_store::{GrantDirection, GrantStore};

pub struct FileStorageService {
    grants: Arc<dyn GrantStore>,
    blobs: Arc<dyn BlobStore>,
    addressing: KeyAddressing,
    upload_url_timeout: i64,
    download_url_timeout: i64,
}

impl FileStorageService {
    pub fn new(
        grants: Arc<dyn GrantStore>,
        blobs: Arc<dyn BlobStore>,
        settings: &FileUploadSettings,
    ) -> Self {
        Self {
            grants,
            blobs,
            addressing: KeyAddressing::new(settings.url_prefix.clone()),
            upload_url_timeout: settings.upload_url_timeout,
            download_url_timeout: settings.download_url_timeout,
        }
    }

    pub fn addressing(&self) -> &KeyAddressing {
        &self.addressing
    }

    pub fn blob_backend(&self) -> &'static str {
        self.blobs.backend_name()
    }

    /// Authorize an upload for `logical_key` and return the URL to send it to.
    /// Calling again refreshes the grant.
    ///
    /// `content_type` is what the client announced; the type actually stored
    /// is the one sent with the upload request.
    pub async fn request_upload_url(
        &self,
        logical_key: &str,
        content_type: &str,
    ) -> Result<String, FileUploadError> {
        let key = FileKey::parse(logical_key)?;
        self.grant(GrantDirection::Upload, &key, self.upload_url_timeout)
            .await?;

        tracing::info!(
            key = key.logical_key(),
            content_type,
            ttl_seconds = self.upload_url_timeout,
            "Upload URL issued"
        );
        Ok(self.addressing.make_url(&key))
    }

    /// Authorize a download and return its URL, or `None` when there is no
    /// content for the key. No grant is registered in that case.
    pub async fn request_download_url(
        &self,
        logical_key: &str,
    ) -> Result<Option<String>, FileUploadError> {
        let key = FileKey::parse(logical_key)?;

        if !self.blobs.exists(&key).await? {
            tracing::debug!(key = key.logical_key(), "Download URL refused: no content");
            return Ok(None);
        }

        self.grant(GrantDirection::Download, &key, self.download_url_timeout)
            .await?;

        tracing::info!(
            key = key.logical_key(),
            ttl_seconds = self.download_url_timeout,
            "Download URL issued"
        );
        Ok(Some(self.addressing.make_url(&key)))
    }

    pub async fn authorize_and_write(
        &self,
        logical_key: &str,
        blob: StoredBlob,
    ) -> Result<(), FileUploadError> {
        let key = FileKey::parse(logical_key)?;
        self.check_grant(GrantDirection::Upload, &key).await?;

        self.blobs.write(&key, blob).await?;
        record_file_access(GrantDirection::Upload.as_str(), "granted");
        Ok(())
    }

    pub async fn authorize_and_read(&self, logical_key: &str) -> Result<StoredBlob, FileUploadError> {
        let key = FileKey::parse(logical_key)?;
        self.check_grant(GrantDirection::Download, &key).await?;

        match self.blobs.read(&key).await {
            Ok(blob) => {
                record_file_access(GrantDirection::Download.as_str(), "granted");
                Ok(blob)
            }
            Err(e @ FileUploadError::NotFound { .. }) => {
                // Removed after the grant was issued.
                record_file_access(GrantDirection::Download.as_str(), "missing");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Administrative delete. Grants are left to expire on their own.
    pub async fn remove_blob(&self, logical_key: &str) -> Result<(), FileUploadError> {
        let key = FileKey::parse(logical_key)?;
        self.blobs.remove(&key).await?;
        tracing::info!(key = key.logical_key(), "File content removed");
        Ok(())
    }

    async fn grant(
        &self,
        direction: GrantDirection,
        key: &FileKey,
        ttl_seconds: i64,
    ) -> Result<(), FileUploadError> {
        self.grants
            .set(&direction.cache_key(key.logical_key()), ttl_seconds)
            .await?;
        FILE_GRANTS_ISSUED_TOTAL
            .with_label_values(&[direction.as_str()])
            .inc();
        Ok(())
    }

    async fn check_grant(
        &self,
        direction: GrantDirection,
        key: &FileKey,
    ) -> Result<(), FileUploadError> {
        if self
            .grants
            .get(&direction.cache_key(key.logical_key()))
            .await?
        {
            return Ok(());
        }

        record_file_access(direction.as_str(), "denied");
        tracing::warn!(
            key = key.logical_key(),
            direction = direction.as_str(),
            "File access denied: no live grant"
        );
        Err(FileUploadError::AccessDenied {
            direction,
            key: key.logical_key().to_string(),
        })
    }
}
