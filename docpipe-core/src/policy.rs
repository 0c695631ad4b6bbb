//! Per-category cache policies.
//!
//! Tier selection and TTL are independent settings of a category. The table
//! is built once at startup and handed to the cache by value; there is no API
//! to change it afterwards.

use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Category for document metadata lookups.
pub const CATEGORY_DOCUMENT_METADATA: &str = "document-metadata";
/// Category for AI analysis results, keyed by content fingerprint.
pub const CATEGORY_ANALYSIS_RESULT: &str = "analysis-result";
/// Category for formatted output, keyed by content fingerprint.
pub const CATEGORY_RENDERED_TEMPLATE: &str = "rendered-template";
/// Category for raw object bodies fetched from the object store.
pub const CATEGORY_OBJECT_CONTENT: &str = "object-content";

/// One storage layer of the tiered cache, fastest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TierKind {
    /// Bounded in-process LRU
    InProcess,
    /// Durable key-value store with TTL
    Durable,
    /// Bulk object store with TTL
    Bulk,
}

impl TierKind {
    /// All tiers in lookup order.
    pub const LOOKUP_ORDER: [TierKind; 3] =
        [TierKind::InProcess, TierKind::Durable, TierKind::Bulk];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProcess => "in-process",
            Self::Durable => "durable",
            Self::Bulk => "bulk",
        }
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which tiers a category uses and for how long entries live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    pub use_in_process: bool,
    pub use_durable: bool,
    pub use_bulk: bool,
    pub ttl: Duration,
}

impl CachePolicy {
    pub fn new(ttl: Duration) -> Self {
        Self {
            use_in_process: false,
            use_durable: false,
            use_bulk: false,
            ttl,
        }
    }

    pub fn in_process(mut self) -> Self {
        self.use_in_process = true;
        self
    }

    pub fn durable(mut self) -> Self {
        self.use_durable = true;
        self
    }

    pub fn bulk(mut self) -> Self {
        self.use_bulk = true;
        self
    }

    /// Whether the category stores entries in `tier`.
    pub fn uses(&self, tier: TierKind) -> bool {
        match tier {
            TierKind::InProcess => self.use_in_process,
            TierKind::Durable => self.use_durable,
            TierKind::Bulk => self.use_bulk,
        }
    }

    /// Enabled tiers in lookup order.
    pub fn tiers(&self) -> impl Iterator<Item = TierKind> + '_ {
        TierKind::LOOKUP_ORDER.into_iter().filter(|t| self.uses(*t))
    }
}

/// Immutable category → policy table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicies {
    policies: HashMap<String, CachePolicy>,
}

impl Default for CachePolicies {
    /// The stock table for the document pipeline.
    fn default() -> Self {
        Self::empty()
            .with_policy(
                CATEGORY_DOCUMENT_METADATA,
                CachePolicy::new(Duration::from_secs(300)).in_process().durable(),
            )
            .with_policy(
                CATEGORY_ANALYSIS_RESULT,
                CachePolicy::new(Duration::from_secs(86_400))
                    .in_process()
                    .durable()
                    .bulk(),
            )
            .with_policy(
                CATEGORY_RENDERED_TEMPLATE,
                CachePolicy::new(Duration::from_secs(3_600)).in_process(),
            )
            .with_policy(
                CATEGORY_OBJECT_CONTENT,
                CachePolicy::new(Duration::from_secs(3_600)).bulk(),
            )
    }
}

impl CachePolicies {
    /// A table with no categories.
    pub fn empty() -> Self {
        Self {
            policies: HashMap::new(),
        }
    }

    /// Add or replace a category while building the table.
    pub fn with_policy(mut self, category: impl Into<String>, policy: CachePolicy) -> Self {
        self.policies.insert(category.into(), policy);
        self
    }

    /// Look up a category.
    pub fn get(&self, category: &str) -> Result<&CachePolicy, ConfigError> {
        self.policies
            .get(category)
            .ok_or_else(|| ConfigError::UnknownCategory {
                category: category.to_string(),
            })
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }

    /// Reject policies that can never hold anything.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (category, policy) in &self.policies {
            if policy.ttl.is_zero() {
                return Err(ConfigError::InvalidValue {
                    field: format!("cache.{}.ttl", category),
                    value: format!("{:?}", policy.ttl),
                    reason: "ttl must be positive".to_string(),
                });
            }
            if policy.tiers().next().is_none() {
                return Err(ConfigError::InvalidValue {
                    field: format!("cache.{}", category),
                    value: "no tiers".to_string(),
                    reason: "at least one tier must be enabled".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table_is_valid() {
        let policies = CachePolicies::default();
        assert!(policies.validate().is_ok());
        let analysis = policies.get(CATEGORY_ANALYSIS_RESULT).unwrap();
        assert_eq!(
            analysis.tiers().collect::<Vec<_>>(),
            vec![TierKind::InProcess, TierKind::Durable, TierKind::Bulk]
        );
        let object = policies.get(CATEGORY_OBJECT_CONTENT).unwrap();
        assert_eq!(object.tiers().collect::<Vec<_>>(), vec![TierKind::Bulk]);
    }

    #[test]
    fn test_unknown_category() {
        let policies = CachePolicies::default();
        assert!(matches!(
            policies.get("nope"),
            Err(ConfigError::UnknownCategory { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_empty_policy() {
        let policies =
            CachePolicies::empty().with_policy("x", CachePolicy::new(Duration::from_secs(1)));
        assert!(policies.validate().is_err());

        let zero_ttl = CachePolicies::empty()
            .with_policy("y", CachePolicy::new(Duration::ZERO).in_process());
        assert!(zero_ttl.validate().is_err());
    }
}
