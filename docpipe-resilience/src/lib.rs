//! Docpipe Resilience - Fault Tolerance for Collaborator Calls
//!
//! - `BackoffPolicy` - delay between attempts
//! - `ClassificationRules` - which failures are worth retrying
//! - `CircuitBreaker` / `BreakerRegistry` - failure detection and recovery
//! - `RetryExecutor` - drives work through all of the above

mod backoff;
mod circuit_breaker;
mod classifier;
mod retry;

pub use backoff::BackoffPolicy;
pub use circuit_breaker::{BreakerRegistry, CircuitBreaker, CircuitBreakerSnapshot};
pub use classifier::{
    ClassificationRules, DEFAULT_ALLOWED_CODES, DEFAULT_ALLOWED_STATUSES, DEFAULT_DENIED_CODES,
};
pub use retry::{RetryExecutor, RetryOptions};
