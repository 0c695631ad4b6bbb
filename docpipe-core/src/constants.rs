//! Constants for docpipe
//!
//! Defaults used when neither code nor environment overrides a setting.

// ============================================================================
// RETRY
// ============================================================================

/// Default number of attempts (including the first) per external call
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;

/// Default base delay between attempts in milliseconds
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;

/// Default cap on any single backoff delay in milliseconds
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;

/// Default multiplier for exponential backoff
pub const DEFAULT_RETRY_FACTOR: f64 = 2.0;

/// Jitter amplitude as a fraction of the computed delay
pub const JITTER_FRACTION: f64 = 0.10;

// ============================================================================
// CIRCUIT BREAKER
// ============================================================================

/// Consecutive failures before a breaker opens
pub const DEFAULT_CIRCUIT_FAILURE_THRESHOLD: u32 = 5;

/// Consecutive half-open successes before a breaker closes
pub const DEFAULT_CIRCUIT_SUCCESS_THRESHOLD: u32 = 2;

/// Seconds an open breaker waits before admitting trial calls
pub const DEFAULT_CIRCUIT_RECOVERY_TIMEOUT_SECS: u64 = 60;

// ============================================================================
// PIPELINE
// ============================================================================

/// Metadata table holding pipeline records
pub const DEFAULT_RECORDS_TABLE: &str = "pipeline_records";

/// Bucket for raw ingested documents
pub const DEFAULT_INPUT_BUCKET: &str = "docpipe-input";

/// Bucket for delivered results
pub const DEFAULT_OUTPUT_BUCKET: &str = "docpipe-output";

/// How many times a lost stage race is re-read and retried
pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 3;

/// Breaker / service name of the analysis engine
pub const SERVICE_ANALYSIS_ENGINE: &str = "analysis-engine";

/// Breaker / service name of the object store
pub const SERVICE_OBJECT_STORE: &str = "object-store";

/// Breaker / service name of the metadata store
pub const SERVICE_METADATA_STORE: &str = "metadata-store";

/// Breaker / service name of the result formatter
pub const SERVICE_FORMATTER: &str = "formatter";

/// Breaker / service name of the text extractor
pub const SERVICE_TEXT_EXTRACTOR: &str = "text-extractor";
