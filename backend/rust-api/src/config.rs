use serde::Deserialize;
use std::env;
use std::path::PathBuf;

use crate::error::FileUploadError;

const DEFAULT_URL_TIMEOUT_SECONDS: i64 = 3600;
const DEFAULT_MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mongo_uri: String,
    pub redis_uri: String,
    pub mongo_database: String,
    pub bind_addr: String,
    pub fileupload: FileUploadSettings,
    pub object_storage: Option<ObjectStorageSettings>,
}

/// Which blob store variant holds uploaded file content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobBackend {
    Filesystem,
    S3,
    Memory,
}

/// Which expiring store keeps upload/download grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantCache {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileUploadSettings {
    pub backend: BlobBackend,
    /// Resolved lazily by the filesystem backend on first access.
    pub root_directory: Option<PathBuf>,
    pub bucket_name: Option<String>,
    /// Checked when the application state is built.
    pub cache: Option<GrantCache>,
    pub url_prefix: String,
    pub upload_url_timeout: i64,
    pub download_url_timeout: i64,
    pub max_upload_bytes: usize,
}

impl FileUploadSettings {
    pub fn root_directory(&self) -> Result<&PathBuf, FileUploadError> {
        self.root_directory
            .as_ref()
            .ok_or_else(|| FileUploadError::configuration("Undefined file upload root directory setting"))
    }

    pub fn bucket_name(&self) -> Result<&str, FileUploadError> {
        self.bucket_name
            .as_deref()
            .ok_or_else(|| FileUploadError::configuration("Undefined file upload bucket setting"))
    }

    pub fn cache(&self) -> Result<GrantCache, FileUploadError> {
        self.cache
            .ok_or_else(|| FileUploadError::configuration("Undefined cache backend for file upload"))
    }
}

impl Default for FileUploadSettings {
    fn default() -> Self {
        Self {
            backend: BlobBackend::Filesystem,
            root_directory: None,
            bucket_name: None,
            cache: None,
            url_prefix: "/storage".to_string(),
            upload_url_timeout: DEFAULT_URL_TIMEOUT_SECONDS,
            download_url_timeout: DEFAULT_URL_TIMEOUT_SECONDS,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObjectStorageSettings {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key: String,
    pub secret_key: String,
    pub prefix: String,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        // Load environment variables from root .env file (two levels up)
        // Try root .env first, then fallback to local .env
        let skip_root_env = env::var("SKIP_ROOT_ENV").is_ok();
        if skip_root_env {
            dotenvy::dotenv().ok();
        } else if dotenvy::from_path("../../.env").is_err() {
            dotenvy::dotenv().ok();
        }

        // Determine environment (defaults to dev)
        let env = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

        // Build configuration from config/*.toml + ENV overrides
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&format!("config/{}", env)).required(false))
            // Override with environment variables (prefix: APP_)
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        let mongo_uri = lookup(&settings, "database.mongo_uri", "MONGO_URI")
            .unwrap_or_else(|| "mongodb://localhost:27017".to_string());

        let redis_uri = lookup(&settings, "redis.uri", "REDIS_URI").unwrap_or_else(|| {
            let host = env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
            let port = env::var("REDIS_PORT").unwrap_or_else(|_| "6379".to_string());
            match env::var("REDIS_PASSWORD") {
                Ok(password) => format!("redis://:{}@{}:{}/0", password, host, port),
                Err(_) => format!("redis://{}:{}/0", host, port),
            }
        });

        let mongo_database = lookup(&settings, "database.mongo_database", "MONGO_DATABASE")
            .unwrap_or_else(|| "submissions".to_string());

        let bind_addr = lookup(&settings, "server.bind_addr", "BIND_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8081".to_string());

        let fileupload = load_fileupload_settings(&settings)?;
        let object_storage = load_object_storage_settings(&settings);

        if env == "prod" && fileupload.cache == Some(GrantCache::Memory) {
            // Grants must be visible to every serving process.
            return Err(config::ConfigError::Message(
                "FATAL: in-memory file upload cache is not allowed in production".to_string(),
            ));
        }

        Ok(Config {
            mongo_uri,
            redis_uri,
            mongo_database,
            bind_addr,
            fileupload,
            object_storage,
        })
    }
}

fn lookup(settings: &config::Config, key: &str, env_key: &str) -> Option<String> {
    settings
        .get_string(key)
        .ok()
        .or_else(|| env::var(env_key).ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn load_fileupload_settings(
    settings: &config::Config,
) -> Result<FileUploadSettings, config::ConfigError> {
    let defaults = FileUploadSettings::default();

    let backend = match lookup(settings, "fileupload.backend", "FILEUPLOAD_BACKEND") {
        Some(value) => parse_backend(&value)?,
        None => defaults.backend,
    };

    let cache = lookup(settings, "fileupload.cache", "FILEUPLOAD_CACHE")
        .map(|value| parse_cache(&value))
        .transpose()?;

    let url_prefix = lookup(settings, "fileupload.url_prefix", "FILEUPLOAD_URL_PREFIX")
        .map(|value| normalize_url_prefix(&value))
        .unwrap_or(defaults.url_prefix);

    Ok(FileUploadSettings {
        backend,
        root_directory: lookup(settings, "fileupload.root", "FILEUPLOAD_ROOT").map(PathBuf::from),
        bucket_name: lookup(settings, "fileupload.bucket", "FILEUPLOAD_BUCKET"),
        cache,
        url_prefix,
        upload_url_timeout: parse_number(
            settings,
            "fileupload.upload_url_timeout",
            "FILEUPLOAD_UPLOAD_URL_TIMEOUT",
        )?
        .unwrap_or(defaults.upload_url_timeout),
        download_url_timeout: parse_number(
            settings,
            "fileupload.download_url_timeout",
            "FILEUPLOAD_DOWNLOAD_URL_TIMEOUT",
        )?
        .unwrap_or(defaults.download_url_timeout),
        max_upload_bytes: parse_number(
            settings,
            "fileupload.max_upload_bytes",
            "FILEUPLOAD_MAX_UPLOAD_BYTES",
        )?
        .unwrap_or(defaults.max_upload_bytes),
    })
}

fn load_object_storage_settings(settings: &config::Config) -> Option<ObjectStorageSettings> {
    let bucket = lookup(settings, "object_storage.bucket", "OBJECT_STORAGE_BUCKET")?;
    let access_key = lookup(settings, "object_storage.access_key", "OBJECT_STORAGE_ACCESS_KEY")?;
    let secret_key = lookup(settings, "object_storage.secret_key", "OBJECT_STORAGE_SECRET_KEY")?;

    Some(ObjectStorageSettings {
        bucket,
        region: lookup(settings, "object_storage.region", "OBJECT_STORAGE_REGION")
            .unwrap_or_else(|| "us-east-1".to_string()),
        endpoint: lookup(settings, "object_storage.endpoint", "OBJECT_STORAGE_ENDPOINT"),
        access_key,
        secret_key,
        prefix: lookup(settings, "object_storage.prefix", "OBJECT_STORAGE_PREFIX")
            .unwrap_or_default(),
    })
}

fn parse_number<T>(
    settings: &config::Config,
    key: &str,
    env_key: &str,
) -> Result<Option<T>, config::ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    lookup(settings, key, env_key)
        .map(|value| {
            value.parse::<T>().map_err(|e| {
                config::ConfigError::Message(format!("Invalid value for {}: {}", key, e))
            })
        })
        .transpose()
}

fn parse_backend(value: &str) -> Result<BlobBackend, config::ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "filesystem" | "fs" => Ok(BlobBackend::Filesystem),
        "s3" => Ok(BlobBackend::S3),
        "memory" => Ok(BlobBackend::Memory),
        other => Err(config::ConfigError::Message(format!(
            "Unknown file upload backend: {}",
            other
        ))),
    }
}

fn parse_cache(value: &str) -> Result<GrantCache, config::ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "redis" => Ok(GrantCache::Redis),
        "memory" => Ok(GrantCache::Memory),
        other => Err(config::ConfigError::Message(format!(
            "Unknown file upload cache: {}",
            other
        ))),
    }
}

/// `"storage/"` and `"/storage"` both become `"/storage"`; an empty prefix
/// serves files from the root.
fn normalize_url_prefix(value: &str) -> String {
    let trimmed = value.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}
