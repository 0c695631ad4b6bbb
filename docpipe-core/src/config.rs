//! Configuration types
//!
//! Every config struct has sensible `Default`s, a `from_env()` constructor
//! reading `DOCPIPE_*` variables, and a `validate()` check. `from_env()`
//! delegates to `from_source`, which takes any key lookup so tests never
//! touch the process environment.

use crate::constants::*;
use crate::{ConfigError, ProcessingParams};
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn parse_var<T: std::str::FromStr>(
    source: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    source(key).and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn bool_var(source: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    source(key)
        .map(|s| matches!(s.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

fn env_source(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

// ============================================================================
// BACKOFF STRATEGY
// ============================================================================

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// `base * factor^(attempt-1)`
    Exponential { factor: f64 },
    /// `base * attempt`
    Linear,
    /// `base`
    Fixed,
    /// `base * fib(attempt)`
    Fibonacci,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            factor: DEFAULT_RETRY_FACTOR,
        }
    }
}

impl BackoffStrategy {
    /// Parse a strategy name; `factor` only applies to exponential.
    pub fn from_name(name: &str, factor: f64) -> Result<Self, ConfigError> {
        match name.trim().to_lowercase().as_str() {
            "exponential" => Ok(Self::Exponential { factor }),
            "linear" => Ok(Self::Linear),
            "fixed" => Ok(Self::Fixed),
            "fibonacci" => Ok(Self::Fibonacci),
            other => Err(ConfigError::InvalidValue {
                field: "retry.strategy".to_string(),
                value: other.to_string(),
                reason: "expected exponential, linear, fixed or fibonacci".to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exponential { .. } => "exponential",
            Self::Linear => "linear",
            Self::Fixed => "fixed",
            Self::Fibonacci => "fibonacci",
        }
    }
}

// ============================================================================
// RETRY CONFIG
// ============================================================================

/// Retry configuration for external calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub strategy: BackoffStrategy,
    pub base_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            strategy: BackoffStrategy::default(),
            base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_RETRY_MAX_DELAY_MS),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create RetryConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `DOCPIPE_RETRY_MAX_ATTEMPTS`: Attempts per call (default: 3)
    /// - `DOCPIPE_RETRY_STRATEGY`: exponential | linear | fixed | fibonacci (default: exponential)
    /// - `DOCPIPE_RETRY_FACTOR`: Exponential factor (default: 2.0)
    /// - `DOCPIPE_RETRY_BASE_DELAY_MS`: Base delay (default: 1000)
    /// - `DOCPIPE_RETRY_MAX_DELAY_MS`: Delay cap (default: 30000)
    /// - `DOCPIPE_RETRY_JITTER`: "true" or "false" (default: true)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(env_source)
    }

    /// Build from an arbitrary key lookup.
    pub fn from_source(source: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let factor = parse_var(&source, "DOCPIPE_RETRY_FACTOR", DEFAULT_RETRY_FACTOR);
        let strategy = match source("DOCPIPE_RETRY_STRATEGY") {
            Some(name) => BackoffStrategy::from_name(&name, factor)?,
            None => BackoffStrategy::Exponential { factor },
        };

        let config = Self {
            max_attempts: parse_var(
                &source,
                "DOCPIPE_RETRY_MAX_ATTEMPTS",
                DEFAULT_RETRY_MAX_ATTEMPTS,
            ),
            strategy,
            base_delay: Duration::from_millis(parse_var(
                &source,
                "DOCPIPE_RETRY_BASE_DELAY_MS",
                DEFAULT_RETRY_BASE_DELAY_MS,
            )),
            max_delay: Duration::from_millis(parse_var(
                &source,
                "DOCPIPE_RETRY_MAX_DELAY_MS",
                DEFAULT_RETRY_MAX_DELAY_MS,
            )),
            jitter: bool_var(&source, "DOCPIPE_RETRY_JITTER", true),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_attempts".to_string(),
                value: self.max_attempts.to_string(),
                reason: "max_attempts must be at least 1".to_string(),
            });
        }

        if let BackoffStrategy::Exponential { factor } = self.strategy {
            if !factor.is_finite() || factor < 1.0 {
                return Err(ConfigError::InvalidValue {
                    field: "retry.factor".to_string(),
                    value: factor.to_string(),
                    reason: "factor must be a finite number >= 1.0".to_string(),
                });
            }
        }

        if self.base_delay > self.max_delay {
            return Err(ConfigError::InvalidValue {
                field: "retry.base_delay".to_string(),
                value: format!("{:?}", self.base_delay),
                reason: "base_delay must not exceed max_delay".to_string(),
            });
        }

        Ok(())
    }
}

// ============================================================================
// CIRCUIT BREAKER CONFIG
// ============================================================================

/// Configuration for circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_CIRCUIT_FAILURE_THRESHOLD,
            success_threshold: DEFAULT_CIRCUIT_SUCCESS_THRESHOLD,
            recovery_timeout: Duration::from_secs(DEFAULT_CIRCUIT_RECOVERY_TIMEOUT_SECS),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create CircuitBreakerConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `DOCPIPE_CIRCUIT_FAILURE_THRESHOLD`: Failures before opening (default: 5)
    /// - `DOCPIPE_CIRCUIT_SUCCESS_THRESHOLD`: Successes needed to close from half-open (default: 2)
    /// - `DOCPIPE_CIRCUIT_RECOVERY_TIMEOUT_SECS`: How long circuit stays open (default: 60)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(env_source)
    }

    /// Build from an arbitrary key lookup.
    pub fn from_source(source: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let config = Self {
            failure_threshold: parse_var(
                &source,
                "DOCPIPE_CIRCUIT_FAILURE_THRESHOLD",
                DEFAULT_CIRCUIT_FAILURE_THRESHOLD,
            ),
            success_threshold: parse_var(
                &source,
                "DOCPIPE_CIRCUIT_SUCCESS_THRESHOLD",
                DEFAULT_CIRCUIT_SUCCESS_THRESHOLD,
            ),
            recovery_timeout: Duration::from_secs(parse_var(
                &source,
                "DOCPIPE_CIRCUIT_RECOVERY_TIMEOUT_SECS",
                DEFAULT_CIRCUIT_RECOVERY_TIMEOUT_SECS,
            )),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                field: "circuit.failure_threshold".to_string(),
                value: "0".to_string(),
                reason: "failure_threshold must be at least 1".to_string(),
            });
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                field: "circuit.success_threshold".to_string(),
                value: "0".to_string(),
                reason: "success_threshold must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// PIPELINE CONFIG
// ============================================================================

/// Master configuration for a pipeline worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Bucket raw documents are written to on ingestion
    pub input_bucket: String,
    /// Bucket formatted results are delivered to
    pub output_bucket: String,
    /// Metadata table holding pipeline records
    pub records_table: String,
    /// Bounded re-reads after a lost stage race
    pub max_conflict_retries: u32,
    /// Overall budget for one `run` invocation; `None` means unbounded
    pub run_timeout: Option<Duration>,
    pub params: ProcessingParams,
    pub retry: RetryConfig,
    pub circuit: CircuitBreakerConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_bucket: DEFAULT_INPUT_BUCKET.to_string(),
            output_bucket: DEFAULT_OUTPUT_BUCKET.to_string(),
            records_table: DEFAULT_RECORDS_TABLE.to_string(),
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
            run_timeout: None,
            params: ProcessingParams::default(),
            retry: RetryConfig::default(),
            circuit: CircuitBreakerConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Create PipelineConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `DOCPIPE_INPUT_BUCKET` / `DOCPIPE_OUTPUT_BUCKET`: Object store buckets
    /// - `DOCPIPE_RECORDS_TABLE`: Metadata table (default: pipeline_records)
    /// - `DOCPIPE_MAX_CONFLICT_RETRIES`: Stage race retries (default: 3)
    /// - `DOCPIPE_RUN_TIMEOUT_SECS`: Per-invocation budget (default: unbounded)
    /// - `DOCPIPE_MODEL_ID`, `DOCPIPE_MAX_INPUT_CHARS`, `DOCPIPE_TEMPERATURE`,
    ///   `DOCPIPE_OUTPUT_FORMAT`: Processing parameters
    /// - plus everything read by [`RetryConfig::from_env`] and
    ///   [`CircuitBreakerConfig::from_env`]
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(env_source)
    }

    /// Build from an arbitrary key lookup.
    pub fn from_source(source: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let default_params = ProcessingParams::default();

        let config = Self {
            input_bucket: source("DOCPIPE_INPUT_BUCKET").unwrap_or(defaults.input_bucket),
            output_bucket: source("DOCPIPE_OUTPUT_BUCKET").unwrap_or(defaults.output_bucket),
            records_table: source("DOCPIPE_RECORDS_TABLE").unwrap_or(defaults.records_table),
            max_conflict_retries: parse_var(
                &source,
                "DOCPIPE_MAX_CONFLICT_RETRIES",
                defaults.max_conflict_retries,
            ),
            run_timeout: source("DOCPIPE_RUN_TIMEOUT_SECS")
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs),
            params: ProcessingParams {
                model_id: source("DOCPIPE_MODEL_ID").unwrap_or(default_params.model_id),
                max_input_chars: parse_var(
                    &source,
                    "DOCPIPE_MAX_INPUT_CHARS",
                    default_params.max_input_chars,
                ),
                temperature: parse_var(&source, "DOCPIPE_TEMPERATURE", default_params.temperature),
                output_format: source("DOCPIPE_OUTPUT_FORMAT")
                    .unwrap_or(default_params.output_format),
                extra: default_params.extra,
            },
            retry: RetryConfig::from_source(&source)?,
            circuit: CircuitBreakerConfig::from_source(&source)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("input_bucket", &self.input_bucket),
            ("output_bucket", &self.output_bucket),
            ("records_table", &self.records_table),
            ("params.model_id", &self.params.model_id),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingRequired {
                    field: field.to_string(),
                });
            }
        }

        if self.params.max_input_chars == 0 {
            return Err(ConfigError::InvalidValue {
                field: "params.max_input_chars".to_string(),
                value: "0".to_string(),
                reason: "max_input_chars must be positive".to_string(),
            });
        }

        if let Some(timeout) = self.run_timeout {
            if timeout.is_zero() {
                return Err(ConfigError::InvalidValue {
                    field: "run_timeout".to_string(),
                    value: format!("{:?}", timeout),
                    reason: "run_timeout must be positive when set".to_string(),
                });
            }
        }

        self.retry.validate()?;
        self.circuit.validate()
    }
}

// =============================================================================
// TESTS
// =============================================================================
