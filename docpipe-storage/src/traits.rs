//! Collaborator traits for external storage.
//!
//! Implementations must be thread-safe. Every method returns the raw
//! [`ServiceError`]; retry and circuit breaking are layered on by callers.

use async_trait::async_trait;
use docpipe_core::{ServiceError, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;

/// Error code a metadata store returns when a conditional write loses.
pub const CONDITIONAL_CHECK_FAILED: &str = "ConditionalCheckFailed";

// ============================================================================
// OBJECT STORE
// ============================================================================

/// User metadata attached to a stored object.
pub type ObjectMetadata = HashMap<String, String>;

/// Blob storage addressed by bucket and key.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object. `None` if it does not exist.
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, ServiceError>;

    /// Store an object, replacing any previous version.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        metadata: ObjectMetadata,
    ) -> Result<(), ServiceError>;

    /// Delete an object. Deleting a missing object is not an error.
    async fn delete(&self, bucket: &str, key: &str) -> Result<(), ServiceError>;
}

// ============================================================================
// METADATA STORE
// ============================================================================

/// One versioned item in a metadata table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub key: String,
    /// Starts at 1 on creation and increases by one on every write
    pub version: u64,
    pub attributes: Map<String, Value>,
}

/// Equality match on a single attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexCondition {
    pub attribute: String,
    pub equals: Value,
}

impl IndexCondition {
    pub fn equals(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            attribute: attribute.into(),
            equals: value.into(),
        }
    }

    pub fn matches(&self, record: &MetadataRecord) -> bool {
        record.attributes.get(&self.attribute) == Some(&self.equals)
    }
}

/// Key-value table store with optimistic versioning.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get(&self, table: &str, key: &str) -> Result<Option<MetadataRecord>, ServiceError>;

    /// Unconditional write of a whole record.
    async fn put(&self, table: &str, record: MetadataRecord) -> Result<(), ServiceError>;

    /// Merge `changes` into the item at `key` and bump its version.
    ///
    /// `expected_version`:
    /// - `None` writes unconditionally, creating the item if needed
    /// - `Some(0)` requires that the item does not exist yet
    /// - `Some(v)` requires the stored version to be exactly `v`
    ///
    /// A failed condition returns an error with code
    /// [`CONDITIONAL_CHECK_FAILED`].
    async fn update(
        &self,
        table: &str,
        key: &str,
        changes: Map<String, Value>,
        expected_version: Option<u64>,
    ) -> Result<MetadataRecord, ServiceError>;

    async fn query(
        &self,
        table: &str,
        condition: IndexCondition,
    ) -> Result<Vec<MetadataRecord>, ServiceError>;
}

// ============================================================================
// CACHE TIER BACKEND
// ============================================================================

/// Storage behind the durable and bulk cache tiers.
///
/// Entries carry their own expiry; backends may drop expired entries at
/// any time and must never return an entry whose expiry has passed as if it
/// were fresh (callers re-check `expires_at` anyway).
#[async_trait]
pub trait CacheTierBackend: Send + Sync {
    /// Stored bytes and their expiry, or `None`.
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, Timestamp)>, ServiceError>;

    async fn put(&self, key: &str, bytes: Vec<u8>, ttl: Duration) -> Result<(), ServiceError>;

    async fn delete(&self, key: &str) -> Result<(), ServiceError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_index_condition_matches() {
        let mut attributes = Map::new();
        attributes.insert("stage".to_string(), json!("Analyzing"));
        let record = MetadataRecord {
            key: "req-1".to_string(),
            version: 3,
            attributes,
        };

        assert!(IndexCondition::equals("stage", "Analyzing").matches(&record));
        assert!(!IndexCondition::equals("stage", "Delivered").matches(&record));
        assert!(!IndexCondition::equals("status", "Analyzing").matches(&record));
    }
}
