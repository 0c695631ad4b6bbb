//! LMDB-backed durable cache tier.
//!
//! Uses the heed crate (Rust bindings for LMDB) to provide a memory-mapped
//! key-value store that survives process restarts.
//!
//! Values carry their expiry in an 8-byte header. Expired entries are
//! deleted lazily the next time they are read.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use docpipe_core::{expires_after, Clock, ServiceError, SystemClock, Timestamp};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};

use super::envelope;
use crate::traits::CacheTierBackend;

/// Service name used in errors raised by this backend.
pub const LMDB_SERVICE: &str = "durable-cache";

/// Error type for opening the LMDB environment.
#[derive(Debug, thiserror::Error)]
pub enum LmdbTierError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn txn_error(e: heed::Error) -> ServiceError {
    ServiceError::other(LMDB_SERVICE, format!("transaction failed: {}", e))
}

/// Durable cache tier stored in a single unnamed LMDB database.
pub struct LmdbTierBackend {
    env: Env,
    db: Database<Bytes, Bytes>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for LmdbTierBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbTierBackend")
            .field("path", &self.env.path())
            .finish()
    }
}

impl LmdbTierBackend {
    /// Open (or create) the backend.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the database in megabytes
    /// * `clock` - Source of "now" for expiry checks
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - LMDB environment cannot be opened
    /// - Database cannot be created
    pub fn open<P: AsRef<Path>>(
        path: P,
        max_size_mb: usize,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LmdbTierError> {
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per directory by this
        // process and never by another process with a different map size.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbTierError::EnvOpen(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| LmdbTierError::Transaction(e.to_string()))?;

        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbTierError::DbOpen(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbTierError::Transaction(e.to_string()))?;

        Ok(Self { env, db, clock })
    }

    pub fn open_with_system_clock<P: AsRef<Path>>(
        path: P,
        max_size_mb: usize,
    ) -> Result<Self, LmdbTierError> {
        Self::open(path, max_size_mb, Arc::new(SystemClock))
    }

    /// Number of stored entries, expired ones included.
    pub fn entry_count(&self) -> Result<u64, ServiceError> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        self.db.len(&rtxn).map_err(txn_error)
    }

    fn delete_if_expired(&self, key: &str, now: Timestamp) -> Result<(), ServiceError> {
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        // Re-check under the write lock; a fresh put may have landed.
        let still_expired = match self.db.get(&wtxn, key.as_bytes()).map_err(txn_error)? {
            Some(stored) => {
                envelope::open(LMDB_SERVICE, key, stored).map_or(true, |(_, exp)| exp <= now)
            }
            None => false,
        };
        if still_expired {
            self.db.delete(&mut wtxn, key.as_bytes()).map_err(txn_error)?;
        }
        wtxn.commit().map_err(txn_error)
    }
}

#[async_trait]
impl CacheTierBackend for LmdbTierBackend {
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, Timestamp)>, ServiceError> {
        let now = self.clock.now();
        let decoded = {
            let rtxn = self.env.read_txn().map_err(txn_error)?;
            match self.db.get(&rtxn, key.as_bytes()).map_err(txn_error)? {
                Some(stored) => Some(envelope::open(LMDB_SERVICE, key, stored)),
                None => None,
            }
        };

        match decoded {
            None => Ok(None),
            Some(Ok((bytes, expires_at))) if expires_at > now => Ok(Some((bytes, expires_at))),
            Some(Ok(_)) => {
                self.delete_if_expired(key, now)?;
                Ok(None)
            }
            Some(Err(e)) => {
                tracing::warn!(key, error = %e, "Dropping unreadable durable cache entry");
                self.delete_if_expired(key, now)?;
                Ok(None)
            }
        }
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, ttl: Duration) -> Result<(), ServiceError> {
        let expires_at = expires_after(self.clock.now(), ttl);
        let full = envelope::seal(expires_at, &bytes);

        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        self.db
            .put(&mut wtxn, key.as_bytes(), &full)
            .map_err(txn_error)?;
        wtxn.commit().map_err(txn_error)
    }

    async fn delete(&self, key: &str) -> Result<(), ServiceError> {
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        self.db.delete(&mut wtxn, key.as_bytes()).map_err(txn_error)?;
        wtxn.commit().map_err(txn_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docpipe_core::ManualClock;
    use tempfile::TempDir;

    fn create_test_backend() -> (LmdbTierBackend, Arc<ManualClock>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let backend = LmdbTierBackend::open(temp_dir.path(), 10, clock.clone()).unwrap();
        (backend, clock, temp_dir)
    }

    #[tokio::test]
    async fn test_lmdb_put_get() {
        let (backend, clock, _dir) = create_test_backend();
        backend
            .put("analysis-result:abc", b"{\"ok\":true}".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        let (bytes, expires_at) = backend.get("analysis-result:abc").await.unwrap().unwrap();
        assert_eq!(bytes, b"{\"ok\":true}");
        let remaining = expires_at - clock.now();
        assert!(remaining.num_seconds() >= 59 && remaining.num_seconds() <= 60);
    }

    #[tokio::test]
    async fn test_lmdb_miss() {
        let (backend, _clock, _dir) = create_test_backend();
        assert!(backend.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lmdb_expired_entry_deleted_on_read() {
        let (backend, clock, _dir) = create_test_backend();
        backend
            .put("k", b"v".to_vec(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(backend.entry_count().unwrap(), 1);

        clock.advance(Duration::from_secs(6));
        assert!(backend.get("k").await.unwrap().is_none());
        assert_eq!(backend.entry_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_lmdb_delete() {
        let (backend, _clock, _dir) = create_test_backend();
        backend
            .put("k", b"v".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        backend.delete("k").await.unwrap();
        backend.delete("k").await.unwrap();
        assert!(backend.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lmdb_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        {
            let backend = LmdbTierBackend::open(temp_dir.path(), 10, clock.clone()).unwrap();
            backend
                .put("k", b"persisted".to_vec(), Duration::from_secs(60))
                .await
                .unwrap();
        }
        let reopened = LmdbTierBackend::open(temp_dir.path(), 10, clock).unwrap();
        let (bytes, _) = reopened.get("k").await.unwrap().unwrap();
        assert_eq!(bytes, b"persisted");
    }
}
