use std::sync::Arc;

use mongodb::{Client as MongoClient, Database};
use redis::aio::ConnectionManager;

use crate::config::{BlobBackend, Config, GrantCache};
use crate::error::FileUploadError;

use blob_store::{BlobStore, MemoryBlobStore};
use file_storage_service::FileStorageService;
use filesystem_storage::FilesystemBlobStore;
use grant_store::{GrantStore, MemoryGrantStore, RedisGrantStore};
use object_storage::ObjectStorageClient;
use submission_service::{MongoLedger, SubmissionLedger};

pub mod blob_store;
pub mod file_keys;
pub mod file_storage_service;
pub mod filesystem_storage;
pub mod grant_store;
pub mod memory_ledger;
pub mod object_storage;
pub mod submission_service;

pub struct AppState {
    pub config: Config,
    pub files: Arc<FileStorageService>,
    pub ledger: Arc<dyn SubmissionLedger>,
    /// Present when the service runs against real backing stores; used by
    /// the health check.
    pub mongo: Option<Database>,
    pub redis: Option<ConnectionManager>,
}

impl AppState {
    pub async fn new(
        config: Config,
        mongo_client: MongoClient,
        redis_client: redis::Client,
    ) -> anyhow::Result<Self> {
        let mongo = mongo_client.database(&config.mongo_database);

        tracing::info!("Attempting to connect to Redis...");

        let redis = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            ConnectionManager::new(redis_client),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Redis connection timeout after 30s"))??;

        let mut conn = redis.clone();
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            redis::cmd("PING").query_async::<String>(&mut conn),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Redis PING timeout after 5s"))??;

        tracing::info!("Redis connection established successfully");

        let grants = build_grant_store(&config, Some(&redis))?;
        let blobs = build_blob_store(&config)?;
        let files = Arc::new(FileStorageService::new(grants, blobs, &config.fileupload));

        let ledger = MongoLedger::new(mongo.clone());
        ledger.ensure_indexes().await?;

        tracing::info!(
            blob_backend = files.blob_backend(),
            url_prefix = files.addressing().url_prefix(),
            "File storage initialized"
        );

        Ok(Self {
            config,
            files,
            ledger: Arc::new(ledger),
            mongo: Some(mongo),
            redis: Some(redis),
        })
    }

    /// Assemble state from already-built components, without external
    /// connections.
    pub fn from_parts(
        config: Config,
        files: Arc<FileStorageService>,
        ledger: Arc<dyn SubmissionLedger>,
    ) -> Self {
        Self {
            config,
            files,
            ledger,
            mongo: None,
            redis: None,
        }
    }
}

/// Fails when no grant cache is configured, or when Redis is selected but no
/// connection is available. A missing binding is never treated as "no grants".
pub fn build_grant_store(
    config: &Config,
    redis: Option<&ConnectionManager>,
) -> Result<Arc<dyn GrantStore>, FileUploadError> {
    match config.fileupload.cache()? {
        GrantCache::Redis => {
            let redis = redis.ok_or_else(|| {
                FileUploadError::configuration("Redis file upload cache selected but not connected")
            })?;
            Ok(Arc::new(RedisGrantStore::new(redis.clone())))
        }
        GrantCache::Memory => {
            tracing::warn!("Using in-process file upload grants; not shared between processes");
            Ok(Arc::new(MemoryGrantStore::new()))
        }
    }
}

pub fn build_blob_store(config: &Config) -> Result<Arc<dyn BlobStore>, FileUploadError> {
    match config.fileupload.backend {
        BlobBackend::Filesystem => Ok(Arc::new(FilesystemBlobStore::new(
            config.fileupload.clone(),
        ))),
        BlobBackend::S3 => {
            let settings = config.object_storage.clone().ok_or_else(|| {
                FileUploadError::configuration("Object storage settings missing for s3 backend")
            })?;
            let client = ObjectStorageClient::new(settings, config.fileupload.bucket_name()?)
                .map_err(|e| FileUploadError::configuration(format!("{:#}", e)))?;
            Ok(Arc::new(client))
        }
        BlobBackend::Memory => Ok(Arc::new(MemoryBlobStore::new())),
    }
}
