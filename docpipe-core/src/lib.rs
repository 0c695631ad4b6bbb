//! Docpipe Core - Shared Types
//!
//! Data types, errors, and configuration shared by every docpipe crate.
//! Nothing in here performs I/O; behavior lives in `docpipe-resilience`,
//! `docpipe-storage`, and `docpipe-pipeline`.

use chrono::{DateTime, Utc};

pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod fingerprint;
pub mod health;
pub mod policy;
pub mod stage;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

pub use clock::{elapsed_between, expires_after, Clock, ManualClock, SystemClock};
pub use config::{BackoffStrategy, CircuitBreakerConfig, PipelineConfig, RetryConfig};
pub use constants::*;
pub use error::{
    CacheError, ConfigError, DocpipeError, DocpipeResult, FailureKind, FingerprintError,
    ResilienceError, RetryAttempt, ServiceError, StageError, WaitPhase,
};
pub use fingerprint::{Fingerprint, ProcessingParams, FINGERPRINT_HEX_LEN};
pub use health::{aggregate_status, CircuitState, CircuitStateParseError, HealthCheck, HealthStatus};
pub use policy::{
    CachePolicies, CachePolicy, TierKind, CATEGORY_ANALYSIS_RESULT, CATEGORY_DOCUMENT_METADATA,
    CATEGORY_OBJECT_CONTENT, CATEGORY_RENDERED_TEMPLATE,
};
pub use stage::{PipelineRecord, PipelineStatus, Stage, StageParseError};
