//! Error types for docpipe operations

use crate::{Stage, TierKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// RAW COLLABORATOR FAILURES
// ============================================================================

/// Transport-level classification of a collaborator failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// The call did not complete within the transport timeout
    Timeout,
    /// The connection was reset mid-flight
    ConnectionReset,
    /// The connection could not be established
    ConnectionRefused,
    /// The service answered with a status code (HTTP-equivalent)
    Status(u16),
    /// Anything the transport could not classify
    Other,
}

impl FailureKind {
    /// True for failures that happened below the application protocol.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::ConnectionReset | Self::ConnectionRefused
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::ConnectionReset => write!(f, "connection reset"),
            Self::ConnectionRefused => write!(f, "connection refused"),
            Self::Status(code) => write!(f, "status {}", code),
            Self::Other => write!(f, "other"),
        }
    }
}

/// A failure reported by an external collaborator.
///
/// This is the only error type collaborators return. It never escapes the
/// retry layer unwrapped: callers see it inside [`ResilienceError`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{service} call failed ({kind}): {message}")]
pub struct ServiceError {
    pub service: String,
    pub kind: FailureKind,
    /// Service-specific error code (e.g. `ThrottlingException`)
    pub code: Option<String>,
    pub message: String,
    /// Server-provided hint for when to try again
    pub retry_after: Option<Duration>,
}

impl ServiceError {
    pub fn new(service: impl Into<String>, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            kind,
            code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn timeout(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(service, FailureKind::Timeout, message)
    }

    pub fn connection_reset(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(service, FailureKind::ConnectionReset, message)
    }

    pub fn status(service: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self::new(service, FailureKind::Status(status), message)
    }

    pub fn other(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(service, FailureKind::Other, message)
    }

    /// Attach a service-specific error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attach a retry-after hint.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Status code, if the service answered with one.
    pub fn status_code(&self) -> Option<u16> {
        match self.kind {
            FailureKind::Status(code) => Some(code),
            _ => None,
        }
    }

    /// True when the error carries the given service code.
    pub fn has_code(&self, code: &str) -> bool {
        self.code.as_deref() == Some(code)
    }
}

// ============================================================================
// RESILIENCE ERRORS
// ============================================================================

/// Where a caller was suspended when its deadline fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WaitPhase {
    /// Deadline had already passed before the first attempt
    BeforeAttempt,
    /// Sleeping between retry attempts
    Backoff,
    /// Waiting on another caller's in-flight cache computation
    SingleFlight,
}

impl fmt::Display for WaitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BeforeAttempt => write!(f, "before first attempt"),
            Self::Backoff => write!(f, "in retry backoff"),
            Self::SingleFlight => write!(f, "waiting for in-flight computation"),
        }
    }
}

/// One failed attempt, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// 1-based attempt number
    pub attempt_number: u32,
    /// Delay slept before this attempt (zero for the first)
    pub delay_before: Duration,
    pub error: String,
}

/// Errors surfaced by the retry executor and circuit breakers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResilienceError {
    #[error("Non-retryable failure from {service}: {source}")]
    NonRetryable {
        service: String,
        source: ServiceError,
    },

    #[error("Retries exhausted for {service} after {attempts} attempts: {last_error}")]
    RetryExhausted {
        service: String,
        attempts: u32,
        last_error: ServiceError,
        history: Vec<RetryAttempt>,
    },

    #[error("Circuit open for {breaker}, retry in {retry_in:?}")]
    CircuitOpen { breaker: String, retry_in: Duration },

    #[error("Deadline exceeded {phase}")]
    DeadlineExceeded { phase: WaitPhase },
}

// ============================================================================
// STAGE TRACKING ERRORS
// ============================================================================

/// Pipeline record errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StageError {
    #[error("Pipeline record already exists: {request_id}")]
    AlreadyExists { request_id: String },

    #[error("Pipeline record not found: {request_id}")]
    NotFound { request_id: String },

    #[error("Invalid transition for {request_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        request_id: String,
        from: Stage,
        to: Stage,
    },

    #[error("Concurrent modification of {request_id} (expected version {expected_version})")]
    ConcurrentModification {
        request_id: String,
        expected_version: u64,
    },

    #[error("Pipeline record {request_id} is corrupt: {reason}")]
    Corrupt { request_id: String, reason: String },
}

// ============================================================================
// FINGERPRINT ERRORS
// ============================================================================

/// Content fingerprint errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FingerprintError {
    #[error("Malformed fingerprint {value:?}: {reason}")]
    Malformed { value: String, reason: String },

    #[error("Fingerprint mismatch for {request_id}: stored {stored}, supplied {supplied}")]
    Mismatch {
        request_id: String,
        stored: String,
        supplied: String,
    },

    /// The supplied fingerprint was not computed from the supplied document.
    #[error("Fingerprint {supplied} does not match the document for {request_id}")]
    ContentMismatch {
        request_id: String,
        computed: String,
        supplied: String,
    },
}

// ============================================================================
// CACHE ERRORS
// ============================================================================

/// Cache layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Failed to serialize value for {key}: {reason}")]
    Serialization { key: String, reason: String },

    #[error("Failed to deserialize cached value for {key}: {reason}")]
    Deserialization { key: String, reason: String },

    #[error("{tier} cache tier failed: {source}")]
    Backend { tier: TierKind, source: ServiceError },
}

// ============================================================================
// CONFIG ERRORS
// ============================================================================

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Unknown cache category: {category}")]
    UnknownCategory { category: String },
}

// ============================================================================
// MASTER ERROR
// ============================================================================

/// Master error type for all docpipe errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DocpipeError {
    #[error("Resilience error: {0}")]
    Resilience(#[from] ResilienceError),

    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    #[error("Fingerprint error: {0}")]
    Fingerprint(#[from] FingerprintError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl DocpipeError {
    /// True when a fresh attempt at the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Stage(StageError::ConcurrentModification { .. })
                | Self::Resilience(ResilienceError::RetryExhausted { .. })
                | Self::Resilience(ResilienceError::CircuitOpen { .. })
                | Self::Resilience(ResilienceError::DeadlineExceeded { .. })
        )
    }

    /// True for programmer or data-integrity bugs that must never be retried.
    pub fn is_integrity_error(&self) -> bool {
        matches!(
            self,
            Self::Stage(StageError::InvalidTransition { .. })
                | Self::Stage(StageError::Corrupt { .. })
                | Self::Fingerprint(_)
        )
    }
}

/// Result type alias for docpipe operations.
pub type DocpipeResult<T> = Result<T, DocpipeError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_error_display() {
        let err = ServiceError::status("analysis-engine", 503, "unavailable")
            .with_code("ServiceUnavailable");
        let msg = format!("{}", err);
        assert!(msg.contains("analysis-engine"));
        assert!(msg.contains("status 503"));
        assert!(msg.contains("unavailable"));
        assert_eq!(err.status_code(), Some(503));
        assert!(err.has_code("ServiceUnavailable"));
    }

    #[test]
    fn test_failure_kind_is_transport() {
        assert!(FailureKind::Timeout.is_transport());
        assert!(FailureKind::ConnectionReset.is_transport());
        assert!(FailureKind::ConnectionRefused.is_transport());
        assert!(!FailureKind::Status(500).is_transport());
        assert!(!FailureKind::Other.is_transport());
    }

    #[test]
    fn test_resilience_error_display_exhausted() {
        let err = ResilienceError::RetryExhausted {
            service: "object-store".to_string(),
            attempts: 3,
            last_error: ServiceError::timeout("object-store", "read timed out"),
            history: Vec::new(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("object-store"));
        assert!(msg.contains("3 attempts"));
        assert!(msg.contains("read timed out"));
    }

    #[test]
    fn test_stage_error_display_invalid_transition() {
        let err = StageError::InvalidTransition {
            request_id: "req-1".to_string(),
            from: Stage::Ingested,
            to: Stage::Analyzed,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("req-1"));
        assert!(msg.contains("Ingested"));
        assert!(msg.contains("Analyzed"));
    }

    #[test]
    fn test_docpipe_error_from_variants() {
        let stage = DocpipeError::from(StageError::NotFound {
            request_id: "x".to_string(),
        });
        assert!(matches!(stage, DocpipeError::Stage(_)));

        let config = DocpipeError::from(ConfigError::UnknownCategory {
            category: "nope".to_string(),
        });
        assert!(matches!(config, DocpipeError::Config(_)));

        let cache = DocpipeError::from(CacheError::Serialization {
            key: "k".to_string(),
            reason: "bad".to_string(),
        });
        assert!(matches!(cache, DocpipeError::Cache(_)));
    }

    #[test]
    fn test_retryable_and_integrity_classification() {
        let conflict = DocpipeError::from(StageError::ConcurrentModification {
            request_id: "r".to_string(),
            expected_version: 2,
        });
        assert!(conflict.is_retryable());
        assert!(!conflict.is_integrity_error());

        let invalid = DocpipeError::from(StageError::InvalidTransition {
            request_id: "r".to_string(),
            from: Stage::Ingested,
            to: Stage::Delivered,
        });
        assert!(!invalid.is_retryable());
        assert!(invalid.is_integrity_error());

        let non_retryable = DocpipeError::from(ResilienceError::NonRetryable {
            service: "s".to_string(),
            source: ServiceError::status("s", 400, "bad request"),
        });
        assert!(!non_retryable.is_retryable());
        assert!(!non_retryable.is_integrity_error());

        let malformed = DocpipeError::from(FingerprintError::Malformed {
            value: "zz".to_string(),
            reason: "too short".to_string(),
        });
        assert!(malformed.is_integrity_error());

        let forged = DocpipeError::from(FingerprintError::ContentMismatch {
            request_id: "r".to_string(),
            computed: "a".repeat(64),
            supplied: "b".repeat(64),
        });
        assert!(forged.is_integrity_error());
        assert!(!forged.is_retryable());
    }
}
