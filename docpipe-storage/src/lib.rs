//! Docpipe Storage - Collaborator Traits, Tiered Cache and Stage Tracking
//!
//! - [`ObjectStore`], [`MetadataStore`], [`CacheTierBackend`]: the storage
//!   collaborators, with in-memory implementations for tests and
//!   single-process use
//! - [`TieredCache`]: in-process, durable and bulk tiers with single-flight
//! - [`StageTracker`]: the pipeline state machine persisted in a
//!   `MetadataStore`

pub mod cache;
pub mod in_memory;
pub mod stage_tracker;
pub mod traits;

pub use cache::{
    CacheEntry, CacheOutcome, CacheStats, LmdbTierBackend, LmdbTierError, MemoryTier,
    MemoryTierConfig, ObjectStoreTierBackend, SweeperHandle, TieredCache, ValueSource,
};
pub use in_memory::{InMemoryMetadataStore, InMemoryObjectStore, InMemoryTierBackend, StoredObject};
pub use stage_tracker::StageTracker;
pub use traits::{
    CacheTierBackend, IndexCondition, MetadataRecord, MetadataStore, ObjectMetadata, ObjectStore,
    CONDITIONAL_CHECK_FAILED,
};
