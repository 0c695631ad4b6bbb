//! Retry executor.
//!
//! Drives a unit of work until it succeeds, fails for good, runs out of
//! attempts, hits an open circuit, or runs past its deadline. Callers only
//! ever see [`ResilienceError`]; the raw [`ServiceError`] travels inside it.

use crate::{BackoffPolicy, CircuitBreaker, ClassificationRules};
use docpipe_core::{
    DocpipeResult, ResilienceError, RetryAttempt, RetryConfig, ServiceError, WaitPhase,
    DEFAULT_RETRY_MAX_ATTEMPTS,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Per-call retry settings.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Collaborator name used in errors and logs
    pub service: String,
    /// Total attempts including the first; 0 behaves like 1
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub breaker: Option<Arc<CircuitBreaker>>,
    pub deadline: Option<Instant>,
}

impl RetryOptions {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            backoff: BackoffPolicy::default(),
            breaker: None,
            deadline: None,
        }
    }

    pub fn from_config(service: impl Into<String>, config: &RetryConfig) -> Self {
        Self::new(service)
            .with_max_attempts(config.max_attempts)
            .with_backoff(BackoffPolicy::from_config(config))
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }
}

/// Runs work under retry, backoff, breaker and deadline rules.
pub struct RetryExecutor {
    rules: ClassificationRules,
    rng: Mutex<StdRng>,
}

impl RetryExecutor {
    pub fn new(rules: ClassificationRules) -> Self {
        Self {
            rules,
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Executor with a deterministic jitter source.
    pub fn with_seed(rules: ClassificationRules, seed: u64) -> Self {
        Self {
            rules,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn rules(&self) -> &ClassificationRules {
        &self.rules
    }

    /// Run `work` until it succeeds or a terminal condition is reached.
    pub async fn execute<T, F, Fut>(&self, options: &RetryOptions, mut work: F) -> DocpipeResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let max_attempts = options.max_attempts.max(1);

        if let Some(deadline) = options.deadline {
            if Instant::now() >= deadline {
                return Err(ResilienceError::DeadlineExceeded {
                    phase: WaitPhase::BeforeAttempt,
                }
                .into());
            }
        }

        let mut history = Vec::new();
        let mut delay_before = Duration::ZERO;
        let mut attempt = 1;

        loop {
            if let Some(breaker) = &options.breaker {
                breaker.try_acquire()?;
            }

            let error = match work().await {
                Ok(value) => {
                    if let Some(breaker) = &options.breaker {
                        breaker.record_success();
                    }
                    if attempt > 1 {
                        tracing::debug!(
                            service = %options.service,
                            attempt,
                            "Call succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if let Some(breaker) = &options.breaker {
                breaker.record_failure();
            }

            if !self.rules.is_retryable(&error) {
                tracing::warn!(
                    service = %options.service,
                    attempt,
                    error = %error,
                    "Non-retryable failure"
                );
                return Err(ResilienceError::NonRetryable {
                    service: options.service.clone(),
                    source: error,
                }
                .into());
            }

            history.push(RetryAttempt {
                attempt_number: attempt,
                delay_before,
                error: error.to_string(),
            });

            if attempt >= max_attempts {
                tracing::error!(
                    service = %options.service,
                    attempts = attempt,
                    error = %error,
                    "Retries exhausted"
                );
                return Err(ResilienceError::RetryExhausted {
                    service: options.service.clone(),
                    attempts: attempt,
                    last_error: error,
                    history,
                }
                .into());
            }

            let delay = self.next_delay(options, attempt, &error);
            tracing::warn!(
                service = %options.service,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after failure"
            );

            sleep_within(delay, options.deadline).await?;
            delay_before = delay;
            attempt += 1;
        }
    }

    /// Backoff delay, raised to the server's retry-after hint but still capped.
    fn next_delay(&self, options: &RetryOptions, attempt: u32, error: &ServiceError) -> Duration {
        let computed = {
            let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
            options.backoff.delay(attempt, &mut *rng)
        };
        match error.retry_after {
            Some(hint) => computed.max(hint).min(options.backoff.cap()),
            None => computed,
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(ClassificationRules::default())
    }
}

impl std::fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("rules", &self.rules)
            .finish()
    }
}

/// Sleep for `delay` unless that would overrun `deadline`.
async fn sleep_within(delay: Duration, deadline: Option<Instant>) -> Result<(), ResilienceError> {
    let wake = Instant::now() + delay;
    match deadline {
        Some(deadline) if wake > deadline => Err(ResilienceError::DeadlineExceeded {
            phase: WaitPhase::Backoff,
        }),
        _ => {
            tokio::time::sleep_until(wake).await;
            Ok(())
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
