//! Bulk cache tier on top of an [`ObjectStore`].
//!
//! Each entry is one object in a dedicated bucket. The object body carries
//! the expiry header, so no listing or metadata reads are needed.

use super::envelope;
use crate::traits::{CacheTierBackend, ObjectMetadata, ObjectStore};
use async_trait::async_trait;
use docpipe_core::{expires_after, Clock, ServiceError, Timestamp};
use std::sync::Arc;
use std::time::Duration;

/// Metadata key recording when an entry stops being valid (RFC 3339).
pub const EXPIRES_AT_METADATA: &str = "docpipe-expires-at";

/// Service name reported in errors from this tier.
pub const OBJECT_TIER_SERVICE: &str = "bulk-cache";

pub struct ObjectStoreTierBackend {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: String,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ObjectStoreTierBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreTierBackend")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl ObjectStoreTierBackend {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            prefix: "cache/".to_string(),
            clock,
        }
    }

    /// Object key prefix for cache entries (default `cache/`).
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn object_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl CacheTierBackend for ObjectStoreTierBackend {
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, Timestamp)>, ServiceError> {
        let object_key = self.object_key(key);
        let Some(stored) = self.store.get(&self.bucket, &object_key).await? else {
            return Ok(None);
        };
        match envelope::open(OBJECT_TIER_SERVICE, key, &stored) {
            Ok((bytes, expires_at)) if expires_at > self.clock.now() => {
                Ok(Some((bytes, expires_at)))
            }
            Ok(_) => {
                self.store.delete(&self.bucket, &object_key).await?;
                Ok(None)
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "Dropping unreadable bulk cache entry");
                self.store.delete(&self.bucket, &object_key).await?;
                Ok(None)
            }
        }
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, ttl: Duration) -> Result<(), ServiceError> {
        let expires_at = expires_after(self.clock.now(), ttl);
        let mut metadata = ObjectMetadata::new();
        metadata.insert(EXPIRES_AT_METADATA.to_string(), expires_at.to_rfc3339());
        self.store
            .put(
                &self.bucket,
                &self.object_key(key),
                envelope::seal(expires_at, &bytes),
                metadata,
            )
            .await
    }

    async fn delete(&self, key: &str) -> Result<(), ServiceError> {
        self.store.delete(&self.bucket, &self.object_key(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::InMemoryObjectStore;
    use docpipe_core::ManualClock;

    fn backend() -> (ObjectStoreTierBackend, Arc<InMemoryObjectStore>, Arc<ManualClock>) {
        let store = Arc::new(InMemoryObjectStore::new());
        let clock = Arc::new(ManualClock::starting_now());
        let backend = ObjectStoreTierBackend::new(store.clone(), "docpipe-cache", clock.clone());
        (backend, store, clock)
    }

    #[tokio::test]
    async fn test_put_get_under_prefix() {
        let (backend, store, _clock) = backend();
        backend
            .put("analysis-result:fp", b"{}".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        let object = store.object("docpipe-cache", "cache/analysis-result:fp").unwrap();
        assert!(object.metadata.contains_key(EXPIRES_AT_METADATA));

        let (bytes, _) = backend.get("analysis-result:fp").await.unwrap().unwrap();
        assert_eq!(bytes, b"{}");
    }

    #[tokio::test]
    async fn test_expired_object_removed() {
        let (backend, store, clock) = backend();
        backend
            .put("k", b"v".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(2));

        assert!(backend.get("k").await.unwrap().is_none());
        assert_eq!(store.object_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_object_removed() {
        let (backend, store, _clock) = backend();
        store
            .put("docpipe-cache", "cache/k", b"xy".to_vec(), ObjectMetadata::new())
            .await
            .unwrap();

        assert!(backend.get("k").await.unwrap().is_none());
        assert_eq!(store.object_count(), 0);
        assert!(backend.get("k").await.unwrap().is_none());
    }
}
