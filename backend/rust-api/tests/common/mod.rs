#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use axum::Router;
use chrono::{TimeZone, Utc};
use submissions_api::{
    config::{BlobBackend, Config, FileUploadSettings, GrantCache},
    create_router,
    services::{
        file_storage_service::FileStorageService,
        grant_store::{Clock, ManualClock, MemoryGrantStore},
        memory_ledger::MemoryLedger,
        AppState,
    },
};
use tempfile::TempDir;

pub const TEST_BUCKET: &str = "submissions";

/// Everything a test needs to drive the service and inspect its effects.
/// Holds the temporary upload root alive for the test's duration.
pub struct TestApp {
    pub router: Router,
    pub files: Arc<FileStorageService>,
    pub ledger: Arc<MemoryLedger>,
    pub clock: Arc<ManualClock>,
    pub root: TempDir,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn test_settings(root: &Path) -> FileUploadSettings {
    FileUploadSettings {
        backend: BlobBackend::Filesystem,
        root_directory: Some(root.to_path_buf()),
        bucket_name: Some(TEST_BUCKET.to_string()),
        cache: Some(GrantCache::Memory),
        url_prefix: "/storage".to_string(),
        upload_url_timeout: 60,
        download_url_timeout: 60,
        max_upload_bytes: 1024 * 1024,
    }
}

pub fn test_config(fileupload: FileUploadSettings) -> Config {
    Config {
        mongo_uri: "mongodb://localhost:27017".to_string(),
        redis_uri: "redis://127.0.0.1:6379/0".to_string(),
        mongo_database: "submissions_test".to_string(),
        bind_addr: "127.0.0.1:0".to_string(),
        fileupload,
        object_storage: None,
    }
}

pub fn create_test_app() -> TestApp {
    create_test_app_with(|_| {})
}

/// Builds the full router over a temporary filesystem root, in-process
/// grants on a manual clock and an in-memory ledger.
pub fn create_test_app_with(customize: impl FnOnce(&mut FileUploadSettings)) -> TestApp {
    init_tracing();

    let root = tempfile::tempdir().expect("Failed to create temp upload root");
    let mut settings = test_settings(root.path());
    customize(&mut settings);

    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    ));
    let grant_clock: Arc<dyn Clock> = clock.clone();
    let grants = Arc::new(MemoryGrantStore::with_clock(grant_clock));

    let config = test_config(settings.clone());
    let blobs = submissions_api::services::build_blob_store(&config)
        .expect("Failed to build blob store");
    let files = Arc::new(FileStorageService::new(grants, blobs, &settings));
    let ledger = Arc::new(MemoryLedger::new());

    let state = Arc::new(AppState::from_parts(config, files.clone(), ledger.clone()));

    TestApp {
        router: create_router(state),
        files,
        ledger,
        clock,
        root,
    }
}
