//! Pipeline stages and the durable pipeline record.
//!
//! Stages form a forward-only chain with a single side exit:
//!
//! ```text
//! Ingested ─→ Analyzing ─→ Analyzed ─→ Formatting ─→ Delivered
//!     │           │            │            │
//!     └───────────┴────────────┴────────────┴──→ Failed
//! ```
//!
//! A `Failed` record remembers the stage it failed in so a later invocation
//! can re-enter there instead of starting over.

use crate::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// STAGE
// ============================================================================

/// A step in the document pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Ingested,
    Analyzing,
    Analyzed,
    Formatting,
    Delivered,
    Failed,
}

impl Stage {
    /// The forward chain, in order.
    pub const ORDERED: [Stage; 5] = [
        Stage::Ingested,
        Stage::Analyzing,
        Stage::Analyzed,
        Stage::Formatting,
        Stage::Delivered,
    ];

    /// The immediate successor in the forward chain.
    pub fn successor(&self) -> Option<Stage> {
        match self {
            Self::Ingested => Some(Self::Analyzing),
            Self::Analyzing => Some(Self::Analyzed),
            Self::Analyzed => Some(Self::Formatting),
            Self::Formatting => Some(Self::Delivered),
            Self::Delivered | Self::Failed => None,
        }
    }

    /// Terminal stages accept no further `advance`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }

    /// Whether `to` is a legal target from this stage.
    pub fn can_advance_to(&self, to: Stage) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == Stage::Failed || self.successor() == Some(to)
    }

    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Ingested => "Ingested",
            Self::Analyzing => "Analyzing",
            Self::Analyzed => "Analyzed",
            Self::Formatting => "Formatting",
            Self::Delivered => "Delivered",
            Self::Failed => "Failed",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Result<Self, StageParseError> {
        match s {
            "Ingested" => Ok(Self::Ingested),
            "Analyzing" => Ok(Self::Analyzing),
            "Analyzed" => Ok(Self::Analyzed),
            "Formatting" => Ok(Self::Formatting),
            "Delivered" => Ok(Self::Delivered),
            "Failed" => Ok(Self::Failed),
            _ => Err(StageParseError(s.to_string())),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for Stage {
    type Err = StageParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

/// Error parsing Stage from string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageParseError(pub String);

impl fmt::Display for StageParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid pipeline stage: {}", self.0)
    }
}

impl std::error::Error for StageParseError {}

// ============================================================================
// STATUS
// ============================================================================

/// Coarse status derived from the stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineStatus {
    InProgress,
    Completed,
    Failed,
}

impl From<Stage> for PipelineStatus {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Delivered => Self::Completed,
            Stage::Failed => Self::Failed,
            _ => Self::InProgress,
        }
    }
}

// ============================================================================
// PIPELINE RECORD
// ============================================================================

/// The durable unit of work, keyed by `request_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRecord {
    pub request_id: String,
    pub content_fingerprint: String,
    pub stage: Stage,
    pub status: PipelineStatus,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub last_error: Option<String>,
    /// Stage the record was in when it moved to `Failed`
    pub failed_at_stage: Option<Stage>,
    /// Number of times the record has been reopened after a failure
    pub attempt: u32,
    /// Optimistic-concurrency version; 0 means "not yet persisted"
    pub version: u64,
}

impl PipelineRecord {
    /// A fresh record in `Ingested`.
    pub fn new(
        request_id: impl Into<String>,
        content_fingerprint: impl Into<String>,
        now: Timestamp,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            content_fingerprint: content_fingerprint.into(),
            stage: Stage::Ingested,
            status: PipelineStatus::InProgress,
            created_at: now,
            updated_at: now,
            last_error: None,
            failed_at_stage: None,
            attempt: 0,
            version: 0,
        }
    }

    /// Stage from which a new invocation continues.
    pub fn resume_point(&self) -> Stage {
        match self.stage {
            Stage::Failed => self.failed_at_stage.unwrap_or(Stage::Ingested),
            other => other,
        }
    }

    /// Copy of this record moved to `to`. Does not validate the transition.
    pub fn transitioned(&self, to: Stage, error: Option<String>, now: Timestamp) -> Self {
        let mut next = self.clone();
        next.stage = to;
        next.status = PipelineStatus::from(to);
        next.updated_at = now;
        if to == Stage::Failed {
            next.failed_at_stage = Some(self.stage);
            next.last_error = error;
        } else {
            next.last_error = None;
        }
        next
    }

    /// Copy of a failed record moved back to the stage it failed in.
    pub fn reopened(&self, now: Timestamp) -> Self {
        let mut next = self.clone();
        next.stage = self.resume_point();
        next.status = PipelineStatus::from(next.stage);
        next.updated_at = now;
        next.last_error = None;
        next.failed_at_stage = None;
        next.attempt = self.attempt.saturating_add(1);
        next
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_stage_roundtrip() {
        for stage in Stage::ORDERED.iter().chain([Stage::Failed].iter()) {
            let parsed = Stage::from_db_str(stage.as_db_str()).unwrap();
            assert_eq!(*stage, parsed);
        }
        assert!(Stage::from_db_str("Shipped").is_err());
    }

    #[test]
    fn test_successor_chain() {
        let mut stage = Stage::Ingested;
        let mut visited = vec![stage];
        while let Some(next) = stage.successor() {
            visited.push(next);
            stage = next;
        }
        assert_eq!(visited, Stage::ORDERED.to_vec());
        assert_eq!(Stage::Failed.successor(), None);
    }

    #[test]
    fn test_can_advance_to() {
        assert!(Stage::Ingested.can_advance_to(Stage::Analyzing));
        assert!(!Stage::Ingested.can_advance_to(Stage::Analyzed));
        assert!(!Stage::Analyzed.can_advance_to(Stage::Analyzing));
        for stage in &Stage::ORDERED[..4] {
            assert!(stage.can_advance_to(Stage::Failed));
        }
        assert!(!Stage::Delivered.can_advance_to(Stage::Failed));
        assert!(!Stage::Failed.can_advance_to(Stage::Failed));
        assert!(!Stage::Failed.can_advance_to(Stage::Ingested));
    }

    #[test]
    fn test_resume_point_of_failed_record() {
        let now = Utc::now();
        let record = PipelineRecord::new("req", "fp", now)
            .transitioned(Stage::Analyzing, None, now)
            .transitioned(Stage::Failed, Some("boom".to_string()), now);

        assert_eq!(record.stage, Stage::Failed);
        assert_eq!(record.status, PipelineStatus::Failed);
        assert_eq!(record.failed_at_stage, Some(Stage::Analyzing));
        assert_eq!(record.last_error.as_deref(), Some("boom"));
        assert_eq!(record.resume_point(), Stage::Analyzing);
    }

    #[test]
    fn test_reopened_resumes_at_failed_stage() {
        let now = Utc::now();
        let failed = PipelineRecord::new("req", "fp", now)
            .transitioned(Stage::Analyzing, None, now)
            .transitioned(Stage::Analyzed, None, now)
            .transitioned(Stage::Failed, Some("formatter down".to_string()), now);

        let reopened = failed.reopened(now);
        assert_eq!(reopened.stage, Stage::Analyzed);
        assert_eq!(reopened.status, PipelineStatus::InProgress);
        assert_eq!(reopened.last_error, None);
        assert_eq!(reopened.failed_at_stage, None);
        assert_eq!(reopened.attempt, 1);
    }

    #[test]
    fn test_status_follows_stage() {
        assert_eq!(PipelineStatus::from(Stage::Formatting), PipelineStatus::InProgress);
        assert_eq!(PipelineStatus::from(Stage::Delivered), PipelineStatus::Completed);
        assert_eq!(PipelineStatus::from(Stage::Failed), PipelineStatus::Failed);
    }
}
