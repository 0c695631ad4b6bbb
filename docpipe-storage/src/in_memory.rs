//! In-memory collaborator implementations.
//!
//! Used by tests and single-process deployments. Each store keeps its data
//! behind an `RwLock<HashMap>`; nothing is persisted.

use crate::traits::{
    CacheTierBackend, IndexCondition, MetadataRecord, MetadataStore, ObjectMetadata, ObjectStore,
    CONDITIONAL_CHECK_FAILED,
};
use async_trait::async_trait;
use docpipe_core::{
    expires_after, Clock, ServiceError, SystemClock, Timestamp, SERVICE_METADATA_STORE,
    SERVICE_OBJECT_STORE,
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

fn poisoned(service: &str) -> ServiceError {
    ServiceError::other(service, "in-memory store lock poisoned")
}

// ============================================================================
// OBJECT STORE
// ============================================================================

/// Stored object plus its metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub metadata: ObjectMetadata,
}

/// Object store keeping everything in a map keyed by `(bucket, key)`.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: Arc<RwLock<HashMap<(String, String), StoredObject>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct access for assertions.
    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects
            .read()
            .ok()?
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, ServiceError> {
        let objects = self
            .objects
            .read()
            .map_err(|_| poisoned(SERVICE_OBJECT_STORE))?;
        Ok(objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.bytes.clone()))
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        metadata: ObjectMetadata,
    ) -> Result<(), ServiceError> {
        let mut objects = self
            .objects
            .write()
            .map_err(|_| poisoned(SERVICE_OBJECT_STORE))?;
        objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject { bytes, metadata },
        );
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), ServiceError> {
        let mut objects = self
            .objects
            .write()
            .map_err(|_| poisoned(SERVICE_OBJECT_STORE))?;
        objects.remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }
}

// ============================================================================
// METADATA STORE
// ============================================================================

/// Metadata store with per-item version counters.
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    tables: Arc<RwLock<HashMap<String, HashMap<String, MetadataRecord>>>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn item_count(&self, table: &str) -> usize {
        self.tables
            .read()
            .map(|t| t.get(table).map_or(0, HashMap::len))
            .unwrap_or(0)
    }
}

fn condition_failed(key: &str, reason: String) -> ServiceError {
    ServiceError::status(SERVICE_METADATA_STORE, 400, format!("{}: {}", key, reason))
        .with_code(CONDITIONAL_CHECK_FAILED)
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn get(&self, table: &str, key: &str) -> Result<Option<MetadataRecord>, ServiceError> {
        let tables = self
            .tables
            .read()
            .map_err(|_| poisoned(SERVICE_METADATA_STORE))?;
        Ok(tables.get(table).and_then(|t| t.get(key)).cloned())
    }

    async fn put(&self, table: &str, record: MetadataRecord) -> Result<(), ServiceError> {
        let mut tables = self
            .tables
            .write()
            .map_err(|_| poisoned(SERVICE_METADATA_STORE))?;
        tables
            .entry(table.to_string())
            .or_default()
            .insert(record.key.clone(), record);
        Ok(())
    }

    async fn update(
        &self,
        table: &str,
        key: &str,
        changes: Map<String, Value>,
        expected_version: Option<u64>,
    ) -> Result<MetadataRecord, ServiceError> {
        let mut tables = self
            .tables
            .write()
            .map_err(|_| poisoned(SERVICE_METADATA_STORE))?;
        let items = tables.entry(table.to_string()).or_default();
        let current_version = items.get(key).map_or(0, |r| r.version);

        if let Some(expected) = expected_version {
            if expected != current_version {
                return Err(condition_failed(
                    key,
                    format!("expected version {}, found {}", expected, current_version),
                ));
            }
        }

        let record = items.entry(key.to_string()).or_insert_with(|| MetadataRecord {
            key: key.to_string(),
            version: 0,
            attributes: Map::new(),
        });
        record.attributes.extend(changes);
        record.version += 1;
        Ok(record.clone())
    }

    async fn query(
        &self,
        table: &str,
        condition: IndexCondition,
    ) -> Result<Vec<MetadataRecord>, ServiceError> {
        let tables = self
            .tables
            .read()
            .map_err(|_| poisoned(SERVICE_METADATA_STORE))?;
        let mut matches: Vec<MetadataRecord> = tables
            .get(table)
            .map(|items| {
                items
                    .values()
                    .filter(|r| condition.matches(r))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        matches.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(matches)
    }
}

// ============================================================================
// CACHE TIER BACKEND
// ============================================================================

/// TTL map standing in for a durable or bulk cache tier.
#[derive(Debug)]
pub struct InMemoryTierBackend {
    service: String,
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<String, (Vec<u8>, Timestamp)>>,
}

impl InMemoryTierBackend {
    pub fn new(service: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            service: service.into(),
            clock,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_system_clock(service: impl Into<String>) -> Self {
        Self::new(service, Arc::new(SystemClock))
    }

    /// Number of stored entries, expired ones included.
    pub fn entry_count(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }
}

#[async_trait]
impl CacheTierBackend for InMemoryTierBackend {
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, Timestamp)>, ServiceError> {
        let now = self.clock.now();
        {
            let entries = self.entries.read().map_err(|_| poisoned(&self.service))?;
            match entries.get(key) {
                Some((bytes, expires_at)) if *expires_at > now => {
                    return Ok(Some((bytes.clone(), *expires_at)))
                }
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // Expired: drop it lazily.
        let mut entries = self.entries.write().map_err(|_| poisoned(&self.service))?;
        if entries.get(key).is_some_and(|(_, expires_at)| *expires_at <= now) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, ttl: Duration) -> Result<(), ServiceError> {
        let expires_at = expires_after(self.clock.now(), ttl);
        let mut entries = self.entries.write().map_err(|_| poisoned(&self.service))?;
        entries.insert(key.to_string(), (bytes, expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), ServiceError> {
        let mut entries = self.entries.write().map_err(|_| poisoned(&self.service))?;
        entries.remove(key);
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use docpipe_core::ManualClock;
    use serde_json::json;

    fn changes(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_object_store_put_get_delete() {
        let store = InMemoryObjectStore::new();
        let mut metadata = ObjectMetadata::new();
        metadata.insert("content-type".to_string(), "text/plain".to_string());

        store
            .put("in", "doc-1", b"hello".to_vec(), metadata.clone())
            .await
            .unwrap();
        assert_eq!(store.get("in", "doc-1").await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(store.get("out", "doc-1").await.unwrap(), None);
        assert_eq!(store.object("in", "doc-1").unwrap().metadata, metadata);

        store.delete("in", "doc-1").await.unwrap();
        store.delete("in", "doc-1").await.unwrap();
        assert_eq!(store.object_count(), 0);
    }

    #[tokio::test]
    async fn test_metadata_create_requires_absent() {
        let store = InMemoryMetadataStore::new();
        let created = store
            .update("t", "k", changes(&[("a", json!(1))]), Some(0))
            .await
            .unwrap();
        assert_eq!(created.version, 1);

        let err = store
            .update("t", "k", changes(&[("a", json!(2))]), Some(0))
            .await
            .unwrap_err();
        assert!(err.has_code(CONDITIONAL_CHECK_FAILED));
    }

    #[tokio::test]
    async fn test_metadata_versioned_update() {
        let store = InMemoryMetadataStore::new();
        store
            .update("t", "k", changes(&[("a", json!(1)), ("b", json!("x"))]), Some(0))
            .await
            .unwrap();

        let updated = store
            .update("t", "k", changes(&[("a", json!(2))]), Some(1))
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.attributes["a"], json!(2));
        assert_eq!(updated.attributes["b"], json!("x"));

        let stale = store
            .update("t", "k", changes(&[("a", json!(3))]), Some(1))
            .await;
        assert!(stale.unwrap_err().has_code(CONDITIONAL_CHECK_FAILED));

        let unconditional = store
            .update("t", "k", changes(&[("a", json!(4))]), None)
            .await
            .unwrap();
        assert_eq!(unconditional.version, 3);
    }

    #[tokio::test]
    async fn test_metadata_query_by_attribute() {
        let store = InMemoryMetadataStore::new();
        for (key, stage) in [("r1", "Analyzing"), ("r2", "Delivered"), ("r3", "Analyzing")] {
            store
                .update("t", key, changes(&[("stage", json!(stage))]), Some(0))
                .await
                .unwrap();
        }
        let found = store
            .query("t", IndexCondition::equals("stage", "Analyzing"))
            .await
            .unwrap();
        let keys: Vec<_> = found.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["r1", "r3"]);
        assert_eq!(store.item_count("t"), 3);
    }

    #[tokio::test]
    async fn test_tier_backend_expires_entries() {
        let clock = Arc::new(ManualClock::starting_now());
        let backend = InMemoryTierBackend::new("durable", clock.clone());

        backend
            .put("k", b"v".to_vec(), Duration::from_secs(10))
            .await
            .unwrap();
        let (bytes, _) = backend.get("k").await.unwrap().unwrap();
        assert_eq!(bytes, b"v");

        clock.advance(Duration::from_secs(10));
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert_eq!(backend.entry_count(), 0);
    }
}
