//! Expiring store for upload/download grants.
//!
//! A grant is a presence marker under `"upload/<key>"` or `"download/<key>"`
//! that disappears once its TTL elapses. The store is a best-effort cache:
//! presence before expiry is not guaranteed across a restart or eviction,
//! absence after expiry is.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use redis::aio::ConnectionManager;
use tokio::sync::RwLock;

use crate::error::FileUploadError;
use crate::metrics::{record_cache_hit, record_cache_miss, track_cache_operation};

const GRANT_MARKER: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GrantDirection {
    Upload,
    Download,
}

impl GrantDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantDirection::Upload => "upload",
            GrantDirection::Download => "download",
        }
    }

    pub fn cache_key(&self, logical_key: &str) -> String {
        format!("{}/{}", self.as_str(), logical_key)
    }
}

impl fmt::Display for GrantDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait GrantStore: Send + Sync {
    /// Mark `key` present for `ttl_seconds`. A non-positive TTL leaves the
    /// key absent.
    async fn set(&self, key: &str, ttl_seconds: i64) -> Result<(), FileUploadError>;

    async fn get(&self, key: &str) -> Result<bool, FileUploadError>;
}

/// Grants shared by every serving process through Redis.
#[derive(Clone)]
pub struct RedisGrantStore {
    redis: ConnectionManager,
}

impl RedisGrantStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl GrantStore for RedisGrantStore {
    async fn set(&self, key: &str, ttl_seconds: i64) -> Result<(), FileUploadError> {
        let mut conn = self.redis.clone();

        if ttl_seconds <= 0 {
            // SETEX rejects non-positive expirations; an expired grant is an absent one.
            track_cache_operation("del", async {
                redis::cmd("DEL")
                    .arg(key)
                    .query_async::<()>(&mut conn)
                    .await
                    .map_err(anyhow::Error::from)
            })
            .await
            .map_err(|e| FileUploadError::Cache(e.to_string()))?;
            return Ok(());
        }

        track_cache_operation("setex", async {
            redis::cmd("SETEX")
                .arg(key)
                .arg(ttl_seconds)
                .arg(GRANT_MARKER)
                .query_async::<()>(&mut conn)
                .await
                .map_err(anyhow::Error::from)
        })
        .await
        .map_err(|e| FileUploadError::Cache(e.to_string()))?;

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<bool, FileUploadError> {
        let mut conn = self.redis.clone();

        let present = track_cache_operation("exists", async {
            redis::cmd("EXISTS")
                .arg(key)
                .query_async::<bool>(&mut conn)
                .await
                .map_err(anyhow::Error::from)
        })
        .await
        .map_err(|e| FileUploadError::Cache(e.to_string()))?;

        if present {
            record_cache_hit();
        } else {
            record_cache_miss();
        }

        Ok(present)
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Process-local grant store. Only suitable for a single serving process
/// and for tests.
pub struct MemoryGrantStore {
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl MemoryGrantStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryGrantStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GrantStore for MemoryGrantStore {
    async fn set(&self, key: &str, ttl_seconds: i64) -> Result<(), FileUploadError> {
        let mut entries = self.entries.write().await;
        let now = self.clock.now();

        // Drop anything already expired so the map does not grow without bound.
        entries.retain(|_, expires_at| *expires_at > now);

        if ttl_seconds <= 0 {
            entries.remove(key);
        } else {
            entries.insert(key.to_string(), now + Duration::seconds(ttl_seconds));
        }

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<bool, FileUploadError> {
        let entries = self.entries.read().await;
        let present = entries
            .get(key)
            .is_some_and(|expires_at| *expires_at > self.clock.now());

        if present {
            record_cache_hit();
        } else {
            record_cache_miss();
        }

        Ok(present)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manual_store() -> (Arc<ManualClock>, MemoryGrantStore) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = MemoryGrantStore::with_clock(clock.clone());
        (clock, store)
    }

    #[test]
    fn test_cache_keys_are_direction_prefixed() {
        assert_eq!(GrantDirection::Upload.cache_key("abc"), "upload/abc");
        assert_eq!(
            GrantDirection::Download.cache_key("abc|def.png"),
            "download/abc|def.png"
        );
    }

    #[tokio::test]
    async fn test_entry_present_until_ttl_elapses() {
        let (clock, store) = manual_store();
        store.set("upload/k", 10).await.unwrap();

        clock.advance(Duration::seconds(9));
        assert!(store.get("upload/k").await.unwrap());

        clock.advance(Duration::seconds(1));
        assert!(!store.get("upload/k").await.unwrap());
    }

    #[tokio::test]
    async fn test_non_positive_ttl_is_absent() {
        let (_clock, store) = manual_store();
        store.set("upload/zero", 0).await.unwrap();
        store.set("upload/negative", -5).await.unwrap();

        assert!(!store.get("upload/zero").await.unwrap());
        assert!(!store.get("upload/negative").await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_ttl_clears_live_entry() {
        let (_clock, store) = manual_store();
        store.set("download/k", 60).await.unwrap();
        store.set("download/k", 0).await.unwrap();

        assert!(!store.get("download/k").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_refreshes_ttl() {
        let (clock, store) = manual_store();
        store.set("upload/k", 10).await.unwrap();
        clock.advance(Duration::seconds(8));
        store.set("upload/k", 10).await.unwrap();
        clock.advance(Duration::seconds(8));

        assert!(store.get("upload/k").await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_key_is_absent() {
        let store = MemoryGrantStore::new();
        assert!(!store.get("upload/never").await.unwrap());
    }
}
