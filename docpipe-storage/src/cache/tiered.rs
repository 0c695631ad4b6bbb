//! Multi-tier cache with per-category policies.
//!
//! Lookup walks the enabled tiers fastest first. A hit in a slower tier is
//! copied into every faster enabled tier it missed in, never for longer than
//! it has left to live. Durable and bulk tiers are an optimisation: their
//! read and write failures are logged and counted, and the lookup carries on
//! as if they had missed.

use super::memory::{MemoryTier, SweeperHandle};
use super::single_flight::{wait_for_leader, Role, SingleFlight};
use super::stats::{CacheStats, TierCounters};
use crate::traits::CacheTierBackend;
use docpipe_core::{
    elapsed_between, CacheError, CachePolicies, CachePolicy, Clock, DocpipeError, DocpipeResult,
    Timestamp, TierKind,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Where a value returned by [`TieredCache::get_or_compute_with_source`]
/// came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    /// Found in this tier.
    Tier(TierKind),
    /// This caller ran the factory.
    Computed,
    /// Another caller ran the factory while this one waited.
    Shared,
}

impl ValueSource {
    pub fn is_cache_hit(&self) -> bool {
        matches!(self, Self::Tier(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheOutcome<T> {
    pub value: T,
    pub source: ValueSource,
}

struct RemoteTier {
    kind: TierKind,
    backend: Arc<dyn CacheTierBackend>,
    max_ttl: Duration,
    counters: TierCounters,
}

/// In-process, durable and bulk tiers behind one API.
///
/// A tier a category enables but that was never configured on this cache is
/// skipped.
pub struct TieredCache {
    memory: Arc<MemoryTier>,
    durable: Option<RemoteTier>,
    bulk: Option<RemoteTier>,
    policies: CachePolicies,
    clock: Arc<dyn Clock>,
    flights: SingleFlight,
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("memory", &self.memory)
            .field("durable", &self.durable.is_some())
            .field("bulk", &self.bulk.is_some())
            .field("policies", &self.policies)
            .finish()
    }
}

fn namespaced(category: &str, key: &str) -> String {
    format!("{}:{}", category, key)
}

impl TieredCache {
    pub fn new(memory: Arc<MemoryTier>, policies: CachePolicies, clock: Arc<dyn Clock>) -> Self {
        Self {
            memory,
            durable: None,
            bulk: None,
            policies,
            clock,
            flights: SingleFlight::default(),
        }
    }

    pub fn with_durable(mut self, backend: Arc<dyn CacheTierBackend>, max_ttl: Duration) -> Self {
        self.durable = Some(RemoteTier {
            kind: TierKind::Durable,
            backend,
            max_ttl,
            counters: TierCounters::default(),
        });
        self
    }

    pub fn with_bulk(mut self, backend: Arc<dyn CacheTierBackend>, max_ttl: Duration) -> Self {
        self.bulk = Some(RemoteTier {
            kind: TierKind::Bulk,
            backend,
            max_ttl,
            counters: TierCounters::default(),
        });
        self
    }

    pub fn policies(&self) -> &CachePolicies {
        &self.policies
    }

    fn remote(&self, tier: TierKind) -> Option<&RemoteTier> {
        match tier {
            TierKind::InProcess => None,
            TierKind::Durable => self.durable.as_ref(),
            TierKind::Bulk => self.bulk.as_ref(),
        }
    }

    fn max_ttl(&self, tier: TierKind) -> Option<Duration> {
        match tier {
            TierKind::InProcess => Some(self.memory.max_ttl()),
            _ => self.remote(tier).map(|r| r.max_ttl),
        }
    }

    // ------------------------------------------------------------------------
    // Tier primitives
    // ------------------------------------------------------------------------

    async fn read_tier(&self, tier: TierKind, key: &str) -> Option<(Vec<u8>, Timestamp)> {
        if tier == TierKind::InProcess {
            return self.memory.get(key);
        }
        let remote = self.remote(tier)?;
        match remote.backend.get(key).await {
            Ok(Some((bytes, expires_at))) if expires_at > self.clock.now() => {
                remote.counters.hit();
                Some((bytes, expires_at))
            }
            Ok(_) => {
                remote.counters.miss();
                None
            }
            Err(e) => {
                tracing::warn!(
                    tier = %tier,
                    key,
                    error = %e,
                    "Cache tier read failed, treating as miss"
                );
                remote.counters.error();
                remote.counters.miss();
                None
            }
        }
    }

    async fn write_tier(&self, tier: TierKind, key: &str, bytes: Vec<u8>, ttl: Duration) {
        if tier == TierKind::InProcess {
            self.memory.put(key, bytes, ttl);
            return;
        }
        let Some(remote) = self.remote(tier) else {
            return;
        };
        if let Err(e) = remote.backend.put(key, bytes, ttl.min(remote.max_ttl)).await {
            tracing::warn!(tier = %tier, key, error = %e, "Cache tier write failed");
            remote.counters.error();
        }
    }

    /// First live hit in lookup order, promoted into the faster tiers.
    async fn lookup(&self, policy: &CachePolicy, key: &str) -> Option<(Vec<u8>, TierKind)> {
        let mut missed = Vec::new();
        for tier in policy.tiers() {
            let Some((bytes, expires_at)) = self.read_tier(tier, key).await else {
                if self.max_ttl(tier).is_some() {
                    missed.push(tier);
                }
                continue;
            };

            let remaining = elapsed_between(self.clock.now(), expires_at);
            for faster in missed {
                let ttl = self.max_ttl(faster).map_or(remaining, |max| remaining.min(max));
                tracing::trace!(from = %tier, to = %faster, key, "Promoting cache entry");
                self.write_tier(faster, key, bytes.clone(), ttl).await;
            }
            return Some((bytes, tier));
        }
        None
    }

    async fn write_all(&self, policy: &CachePolicy, key: &str, bytes: Vec<u8>) {
        for tier in policy.tiers() {
            self.write_tier(tier, key, bytes.clone(), policy.ttl).await;
        }
    }

    // ------------------------------------------------------------------------
    // Public API
    // ------------------------------------------------------------------------

    /// Cached value, or `None` on a miss in every enabled tier.
    pub async fn get<T: DeserializeOwned>(
        &self,
        key: &str,
        category: &str,
    ) -> DocpipeResult<Option<T>> {
        let policy = self.policies.get(category)?;
        let key = namespaced(category, key);
        match self.lookup(policy, &key).await {
            Some((bytes, _)) => Ok(Some(decode(&key, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Write `value` to every enabled tier.
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        category: &str,
        value: &T,
    ) -> DocpipeResult<()> {
        let policy = self.policies.get(category)?;
        let key = namespaced(category, key);
        let bytes = encode(&key, value)?;
        self.write_all(policy, &key, bytes).await;
        Ok(())
    }

    /// Remove `key` from every enabled tier.
    ///
    /// All tiers are attempted; the first backend failure is returned.
    pub async fn invalidate(&self, key: &str, category: &str) -> DocpipeResult<()> {
        let policy = self.policies.get(category)?;
        let key = namespaced(category, key);
        let mut first_error = None;
        for tier in policy.tiers() {
            if tier == TierKind::InProcess {
                self.memory.remove(&key);
                continue;
            }
            let Some(remote) = self.remote(tier) else {
                continue;
            };
            if let Err(e) = remote.backend.delete(&key).await {
                tracing::warn!(tier = %tier, key = %key, error = %e, "Cache invalidation failed");
                remote.counters.error();
                first_error.get_or_insert(CacheError::Backend { tier, source: e });
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Cached value, or the result of `factory`, computed at most once at a
    /// time per key on this cache.
    ///
    /// Callers that arrive while a computation is running wait for it, but
    /// no later than `deadline`. Factory errors reach every waiter and are
    /// not cached.
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        key: &str,
        category: &str,
        factory: F,
        deadline: Option<Instant>,
    ) -> DocpipeResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = DocpipeResult<T>>,
    {
        self.get_or_compute_with_source(key, category, factory, deadline)
            .await
            .map(|outcome| outcome.value)
    }

    /// [`get_or_compute`](Self::get_or_compute), also reporting where the
    /// value came from.
    pub async fn get_or_compute_with_source<T, F, Fut>(
        &self,
        key: &str,
        category: &str,
        factory: F,
        deadline: Option<Instant>,
    ) -> DocpipeResult<CacheOutcome<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = DocpipeResult<T>>,
    {
        let policy = self.policies.get(category)?;
        let key = namespaced(category, key);

        let guard = loop {
            if let Some(hit) = self.lookup_decoded(policy, &key).await {
                return Ok(hit);
            }
            match self.flights.join(&key) {
                Role::Leader(guard) => break guard,
                Role::Follower(rx) => {
                    if let Some(bytes) = wait_for_leader(rx, deadline).await? {
                        return Ok(CacheOutcome {
                            value: decode(&key, &bytes)?,
                            source: ValueSource::Shared,
                        });
                    }
                    // Leader gave up; compete for leadership again.
                }
            }
        };

        // The previous leader may have finished between our miss and join.
        if let Some(hit) = self.lookup_decoded::<T>(policy, &key).await {
            if let Ok(bytes) = encode(&key, &hit.value) {
                guard.complete(Ok(Arc::new(bytes)));
            }
            return Ok(hit);
        }

        let computed = match factory().await {
            Ok(value) => encode(&key, &value)
                .map(|bytes| (value, bytes))
                .map_err(DocpipeError::from),
            Err(e) => Err(e),
        };
        match computed {
            Ok((value, bytes)) => {
                self.write_all(policy, &key, bytes.clone()).await;
                guard.complete(Ok(Arc::new(bytes)));
                Ok(CacheOutcome {
                    value,
                    source: ValueSource::Computed,
                })
            }
            Err(e) => {
                guard.complete(Err(e.clone()));
                Err(e)
            }
        }
    }

    /// Lookup that treats undecodable entries as misses so they get
    /// recomputed and overwritten.
    async fn lookup_decoded<T: DeserializeOwned>(
        &self,
        policy: &CachePolicy,
        key: &str,
    ) -> Option<CacheOutcome<T>> {
        let (bytes, tier) = self.lookup(policy, key).await?;
        match decode(key, &bytes) {
            Ok(value) => Some(CacheOutcome {
                value,
                source: ValueSource::Tier(tier),
            }),
            Err(e) => {
                tracing::warn!(key, error = %e, "Discarding undecodable cache entry");
                None
            }
        }
    }

    /// Per-tier statistics for every configured tier.
    pub fn stats(&self) -> BTreeMap<TierKind, CacheStats> {
        let mut stats = BTreeMap::new();
        stats.insert(TierKind::InProcess, self.memory.stats());
        for remote in [&self.durable, &self.bulk].into_iter().flatten() {
            stats.insert(remote.kind, remote.counters.snapshot());
        }
        stats
    }

    /// Start the in-process tier's expiry sweeper.
    pub fn spawn_sweeper(&self, interval: Duration) -> SweeperHandle {
        self.memory.spawn_sweeper(interval)
    }
}

fn encode<T: Serialize>(key: &str, value: &T) -> Result<Vec<u8>, CacheError> {
    serde_json::to_vec(value).map_err(|e| CacheError::Serialization {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, CacheError> {
    serde_json::from_slice(bytes).map_err(|e| CacheError::Deserialization {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

// ============================================================================
// TESTS
// ============================================================================
