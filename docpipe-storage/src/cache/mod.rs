//! Tiered cache for expensive pipeline results.
//!
//! Three tiers, fastest first:
//!
//! - [`MemoryTier`]: bounded in-process LRU
//! - durable: any [`CacheTierBackend`](crate::CacheTierBackend), usually
//!   [`LmdbTierBackend`]
//! - bulk: any `CacheTierBackend`, usually [`ObjectStoreTierBackend`]
//!
//! Which tiers a category uses and for how long is decided by its
//! [`CachePolicy`](docpipe_core::CachePolicy). Values are serialized with
//! `serde_json`, so every tier holds its own copy.
//!
//! # Example
//!
//! ```ignore
//! let cache = TieredCache::new(memory, CachePolicies::default(), clock)
//!     .with_durable(Arc::new(lmdb), Duration::from_secs(86_400));
//!
//! let analysis: AnalysisResult = cache
//!     .get_or_compute(fingerprint.as_str(), CATEGORY_ANALYSIS_RESULT, || engine_call(), deadline)
//!     .await?;
//! ```

mod envelope;
mod lmdb_backend;
mod memory;
mod object_tier;
mod single_flight;
mod stats;
mod tiered;

pub use lmdb_backend::{LmdbTierBackend, LmdbTierError, LMDB_SERVICE};
pub use memory::{CacheEntry, MemoryTier, MemoryTierConfig, SweeperHandle};
pub use object_tier::{ObjectStoreTierBackend, EXPIRES_AT_METADATA, OBJECT_TIER_SERVICE};
pub use stats::CacheStats;
pub use tiered::{CacheOutcome, TieredCache, ValueSource};
