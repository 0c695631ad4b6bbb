//! Bounded in-process LRU tier.
//!
//! Bounded by entry count and total value bytes. When either bound would be
//! exceeded, least-recently-accessed entries are evicted until the incoming
//! entry fits. Expired entries are dropped on read or by the sweeper.

use super::stats::CacheStats;
use docpipe_core::{elapsed_between, expires_after, Clock, ConfigError, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

// ============================================================================
// CONFIG
// ============================================================================

/// Configuration for the in-process tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryTierConfig {
    /// Maximum number of entries.
    pub max_entries: usize,
    /// Maximum total size of stored values in bytes.
    pub max_bytes: usize,
    /// Upper bound on any entry's TTL in this tier.
    pub max_ttl: Duration,
}

impl Default for MemoryTierConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_bytes: 64 * 1024 * 1024,
            max_ttl: Duration::from_secs(3600), // 1 hour
        }
    }
}

impl MemoryTierConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create MemoryTierConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `DOCPIPE_CACHE_MAX_ENTRIES`: Entry bound (default: 10000)
    /// - `DOCPIPE_CACHE_MAX_BYTES`: Byte bound (default: 64 MiB)
    /// - `DOCPIPE_CACHE_MAX_TTL_SECS`: TTL ceiling (default: 3600)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            max_entries: std::env::var("DOCPIPE_CACHE_MAX_ENTRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_entries),
            max_bytes: std::env::var("DOCPIPE_CACHE_MAX_BYTES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_bytes),
            max_ttl: std::env::var("DOCPIPE_CACHE_MAX_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_ttl),
        };
        config.validate()?;
        Ok(config)
    }

    /// Set the max entries.
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }

    /// Set the max bytes.
    pub fn with_max_bytes(mut self, max: usize) -> Self {
        self.max_bytes = max;
        self
    }

    /// Set the TTL ceiling.
    pub fn with_max_ttl(mut self, ttl: Duration) -> Self {
        self.max_ttl = ttl;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("cache.max_entries", self.max_entries),
            ("cache.max_bytes", self.max_bytes),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: "0".to_string(),
                    reason: "must be positive".to_string(),
                });
            }
        }
        if self.max_ttl.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "cache.max_ttl".to_string(),
                value: "0s".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// ENTRY
// ============================================================================

/// A cached value with its bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub created_at: Timestamp,
    pub ttl: Duration,
    pub size_bytes: usize,
    pub access_count: u64,
    pub last_accessed_at: Timestamp,
    expires_at: Timestamp,
    tick: u64,
}

impl CacheEntry {
    pub fn expires_at(&self) -> Timestamp {
        self.expires_at
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at <= now
    }
}

// ============================================================================
// MEMORY TIER
// ============================================================================

#[derive(Debug, Default)]
struct TierState {
    entries: HashMap<String, CacheEntry>,
    /// Access tick → key; the first entry is the least recently used.
    recency: BTreeMap<u64, String>,
    next_tick: u64,
    total_bytes: usize,
    stats: CacheStats,
}

impl TierState {
    fn next_tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.tick);
        self.total_bytes -= entry.size_bytes;
        Some(entry)
    }

    fn evict_lru(&mut self) -> bool {
        let Some((_, key)) = self.recency.pop_first() else {
            return false;
        };
        if let Some(entry) = self.entries.remove(&key) {
            self.total_bytes -= entry.size_bytes;
            self.stats.evictions += 1;
        }
        true
    }
}

/// Bounded in-process LRU cache tier.
#[derive(Debug)]
pub struct MemoryTier {
    config: MemoryTierConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<TierState>,
}

impl MemoryTier {
    pub fn new(config: MemoryTierConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(TierState::default()),
        }
    }

    pub fn config(&self) -> &MemoryTierConfig {
        &self.config
    }

    pub fn max_ttl(&self) -> Duration {
        self.config.max_ttl
    }

    // Every mutation leaves the maps consistent before anything can panic,
    // so a poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, TierState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Live value and its expiry; refreshes recency on hit.
    pub fn get(&self, key: &str) -> Option<(Vec<u8>, Timestamp)> {
        let now = self.clock.now();
        let mut state = self.lock();

        let expired = match state.entries.get(key) {
            None => {
                state.stats.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };
        if expired {
            state.remove(key);
            state.stats.expirations += 1;
            state.stats.misses += 1;
            return None;
        }

        let tick = state.next_tick();
        let entry = state.entries.get_mut(key)?;
        let old_tick = std::mem::replace(&mut entry.tick, tick);
        entry.access_count += 1;
        entry.last_accessed_at = now;
        let hit = (entry.value.clone(), entry.expires_at);

        state.recency.remove(&old_tick);
        state.recency.insert(tick, key.to_string());
        state.stats.hits += 1;
        Some(hit)
    }

    /// Store a value. Returns false if it is larger than the whole tier.
    pub fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> bool {
        let now = self.clock.now();
        let ttl = ttl.min(self.config.max_ttl);
        let size_bytes = value.len();
        let mut state = self.lock();

        // An older value must not outlive a rejected replacement.
        state.remove(key);

        if size_bytes > self.config.max_bytes {
            tracing::debug!(key, size_bytes, "Entry larger than in-process tier, not cached");
            return false;
        }

        while state.entries.len() >= self.config.max_entries
            || state.total_bytes + size_bytes > self.config.max_bytes
        {
            if !state.evict_lru() {
                break;
            }
        }

        let tick = state.next_tick();
        state.recency.insert(tick, key.to_string());
        state.total_bytes += size_bytes;
        state.entries.insert(
            key.to_string(),
            CacheEntry {
                key: key.to_string(),
                value,
                created_at: now,
                ttl,
                size_bytes,
                access_count: 0,
                last_accessed_at: now,
                expires_at: expires_after(now, ttl),
                tick,
            },
        );
        true
    }

    pub fn remove(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Copy of an entry without touching recency or stats.
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        self.lock().entries.get(key).cloned()
    }

    /// Remaining lifetime of a live entry.
    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        let state = self.lock();
        state
            .entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| elapsed_between(now, e.expires_at))
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.lock();
        let expired: Vec<String> = state
            .entries
            .values()
            .filter(|e| e.is_expired(now))
            .map(|e| e.key.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }
        state.stats.expirations += expired.len() as u64;
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.recency.clear();
        state.total_bytes = 0;
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            entry_count: state.entries.len() as u64,
            memory_bytes: state.total_bytes as u64,
            ..state.stats.clone()
        }
    }

    /// Periodically drop expired entries until the handle is stopped or the
    /// tier is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> SweeperHandle {
        let tier: Weak<MemoryTier> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(tier) = tier.upgrade() else {
                    break;
                };
                let removed = tier.sweep_expired();
                if removed > 0 {
                    tracing::debug!(removed, "Swept expired in-process cache entries");
                }
            }
        });
        SweeperHandle { task }
    }
}

/// Handle to a running sweeper; stopping or dropping it ends the task.
#[derive(Debug)]
pub struct SweeperHandle {
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub fn stop(self) {
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ============================================================================
// TESTS
// ============================================================================
