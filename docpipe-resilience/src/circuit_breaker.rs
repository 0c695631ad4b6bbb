//! Circuit breakers guarding named collaborators.
//!
//! A breaker trips after `failure_threshold` consecutive failures, rejects
//! calls for `recovery_timeout`, then lets trial calls through in half-open state
//! until `success_threshold` consecutive successes close it again.

use docpipe_core::{
    elapsed_between, CircuitBreakerConfig, CircuitState, Clock, HealthCheck, ResilienceError,
    SystemClock, Timestamp,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

// ============================================================================
// CIRCUIT BREAKER
// ============================================================================

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure_at: Option<Timestamp>,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure_at: None,
        }
    }
}

/// Read-only view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes_in_half_open: u32,
    pub last_failure_at: Option<Timestamp>,
    /// Remaining cool-down while open
    pub retry_in: Option<Duration>,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub recovery_timeout: Duration,
}

/// Per-dependency circuit breaker.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(BreakerState::closed()),
        }
    }

    /// Breaker reading the system clock.
    pub fn with_system_clock(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::new(name, config, Arc::new(SystemClock))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    // Counters stay consistent even if a holder panicked, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Ask permission for one call.
    ///
    /// An open breaker whose cool-down has elapsed moves to half-open here,
    /// before the call is attempted.
    pub fn try_acquire(&self) -> Result<(), ResilienceError> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure_at
                    .map(|at| elapsed_between(at, self.clock.now()))
                    .unwrap_or(self.config.recovery_timeout);

                if elapsed >= self.config.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.consecutive_successes = 0;
                    tracing::info!(breaker = %self.name, "Circuit half-open, testing recovery");
                    Ok(())
                } else {
                    Err(ResilienceError::CircuitOpen {
                        breaker: self.name.clone(),
                        retry_in: self.config.recovery_timeout.saturating_sub(elapsed),
                    })
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    *inner = BreakerState::closed();
                    tracing::info!(breaker = %self.name, "Circuit closed after trial calls");
                }
            }
            // A call admitted before the breaker tripped; nothing to learn from it.
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        let now = self.clock.now();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.last_failure_at = Some(now);
                    tracing::warn!(
                        breaker = %self.name,
                        consecutive_failures = inner.consecutive_failures,
                        "Circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.last_failure_at = Some(now);
                inner.consecutive_successes = 0;
                inner.consecutive_failures += 1;
                tracing::warn!(breaker = %self.name, "Trial call failed, circuit re-opened");
            }
            CircuitState::Open => {}
        }
    }

    /// Force the breaker closed and clear all counters.
    pub fn reset(&self) {
        *self.lock() = BreakerState::closed();
        tracing::info!(breaker = %self.name, "Circuit reset");
    }

    /// Remaining cool-down while open.
    pub fn retry_in(&self) -> Option<Duration> {
        let inner = self.lock();
        self.retry_in_locked(&inner)
    }

    fn retry_in_locked(&self, inner: &BreakerState) -> Option<Duration> {
        match (inner.state, inner.last_failure_at) {
            (CircuitState::Open, Some(at)) => Some(
                self.config
                    .recovery_timeout
                    .saturating_sub(elapsed_between(at, self.clock.now())),
            ),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.lock();
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes_in_half_open: inner.consecutive_successes,
            last_failure_at: inner.last_failure_at,
            retry_in: self.retry_in_locked(&inner),
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
            recovery_timeout: self.config.recovery_timeout,
        }
    }

    pub fn health(&self) -> HealthCheck {
        let snapshot = self.snapshot();
        HealthCheck::for_circuit(
            snapshot.name,
            snapshot.state,
            snapshot.consecutive_failures,
            snapshot.retry_in,
        )
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &inner.state)
            .field("consecutive_failures", &inner.consecutive_failures)
            .field("consecutive_successes", &inner.consecutive_successes)
            .finish()
    }
}

// ============================================================================
// BREAKER REGISTRY
// ============================================================================

/// Name → breaker map shared by everything that talks to collaborators.
///
/// Breakers are created on first use and live as long as the registry.
pub struct BreakerRegistry {
    defaults: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    clock: Arc<dyn Clock>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(defaults: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            defaults,
            overrides: HashMap::new(),
            clock,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_system_clock(defaults: CircuitBreakerConfig) -> Self {
        Self::new(defaults, Arc::new(SystemClock))
    }

    /// Use a dedicated config for one breaker name.
    pub fn with_override(mut self, name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        self.overrides.insert(name.into(), config);
        self
    }

    /// Get the breaker for `name`, creating it on first use.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().unwrap_or_else(|p| p.into_inner());
            if let Some(existing) = breakers.get(name) {
                return Arc::clone(existing);
            }
        }

        let mut breakers = self.breakers.write().unwrap_or_else(|p| p.into_inner());
        // Another caller may have created it between the two locks.
        let breaker = breakers.entry(name.to_string()).or_insert_with(|| {
            let config = self
                .overrides
                .get(name)
                .cloned()
                .unwrap_or_else(|| self.defaults.clone());
            tracing::debug!(breaker = %name, "Creating circuit breaker");
            Arc::new(CircuitBreaker::new(name, config, Arc::clone(&self.clock)))
        });
        Arc::clone(breaker)
    }

    /// Names of all breakers created so far, sorted.
    pub fn names(&self) -> Vec<String> {
        let breakers = self.breakers.read().unwrap_or_else(|p| p.into_inner());
        let mut names: Vec<String> = breakers.keys().cloned().collect();
        names.sort();
        names
    }

    fn all(&self) -> Vec<Arc<CircuitBreaker>> {
        let breakers = self.breakers.read().unwrap_or_else(|p| p.into_inner());
        let mut all: Vec<Arc<CircuitBreaker>> = breakers.values().cloned().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    /// Snapshot of every breaker, sorted by name.
    pub fn snapshot(&self) -> Vec<CircuitBreakerSnapshot> {
        self.all().iter().map(|b| b.snapshot()).collect()
    }

    /// Reset one breaker. Returns false if it does not exist yet.
    pub fn reset(&self, name: &str) -> bool {
        let breakers = self.breakers.read().unwrap_or_else(|p| p.into_inner());
        match breakers.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        for breaker in self.all() {
            breaker.reset();
        }
    }

    /// One health check per breaker, sorted by name.
    pub fn health(&self) -> Vec<HealthCheck> {
        self.all().iter().map(|b| b.health()).collect()
    }
}

impl std::fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerRegistry")
            .field("defaults", &self.defaults)
            .field("breakers", &self.names())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use docpipe_core::{HealthStatus, ManualClock};

    fn config(failures: u32, successes: u32, recovery_secs: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: failures,
            success_threshold: successes,
            recovery_timeout: Duration::from_secs(recovery_secs),
        }
    }

    fn breaker(clock: &Arc<ManualClock>) -> CircuitBreaker {
        CircuitBreaker::new("analysis-engine", config(3, 2, 30), clock.clone())
    }

    #[test]
    fn test_circuit_breaker_closed() {
        let clock = Arc::new(ManualClock::starting_now());
        let cb = breaker(&clock);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn test_half_open_admits_concurrent_calls() {
        let clock = Arc::new(ManualClock::starting_now());
        let cb = breaker(&clock);
        for _ in 0..3 {
            cb.record_failure();
        }
        clock.advance(Duration::from_secs(30));

        for _ in 0..4 {
            assert!(cb.try_acquire().is_ok());
        }
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.health().status, HealthStatus::Degraded);
    }

    #[test]
    fn test_circuit_breaker_opens_on_failures() {
        let clock = Arc::new(ManualClock::starting_now());
        let cb = breaker(&clock);

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        match cb.try_acquire() {
            Err(ResilienceError::CircuitOpen { breaker, retry_in }) => {
                assert_eq!(breaker, "analysis-engine");
                assert_eq!(retry_in, Duration::from_secs(30));
            }
            other => panic!("expected CircuitOpen, got {:?}", other),
        }
    }

    #[test]
    fn test_success_resets_failure_count() {
        let clock = Arc::new(ManualClock::starting_now());
        let cb = breaker(&clock);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_after_recovery_timeout() {
        let clock = Arc::new(ManualClock::starting_now());
        let cb = breaker(&clock);
        for _ in 0..3 {
            cb.record_failure();
        }

        clock.advance(Duration::from_secs(10));
        match cb.try_acquire() {
            Err(ResilienceError::CircuitOpen { retry_in, .. }) => {
                assert_eq!(retry_in, Duration::from_secs(20));
            }
            other => panic!("expected CircuitOpen, got {:?}", other),
        }

        clock.advance(Duration::from_secs(20));
        assert!(cb.try_acquire().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let clock = Arc::new(ManualClock::starting_now());
        let cb = breaker(&clock);
        for _ in 0..3 {
            cb.record_failure();
        }
        clock.advance(Duration::from_secs(30));
        assert!(cb.try_acquire().is_ok());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        // Cool-down restarts from the failed trial call.
        assert!(cb.try_acquire().is_err());
        assert_eq!(cb.retry_in(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_half_open_successes_close() {
        let clock = Arc::new(ManualClock::starting_now());
        let cb = breaker(&clock);
        for _ in 0..3 {
            cb.record_failure();
        }
        clock.advance(Duration::from_secs(31));
        assert!(cb.try_acquire().is_ok());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);

        let snapshot = cb.snapshot();
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.consecutive_successes_in_half_open, 0);
        assert_eq!(snapshot.last_failure_at, None);
    }

    #[test]
    fn test_reset() {
        let clock = Arc::new(ManualClock::starting_now());
        let cb = breaker(&clock);
        for _ in 0..3 {
            cb.record_failure();
        }
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn test_health_follows_state() {
        let clock = Arc::new(ManualClock::starting_now());
        let cb = breaker(&clock);
        assert_eq!(cb.health().status, HealthStatus::Healthy);
        for _ in 0..3 {
            cb.record_failure();
        }
        assert_eq!(cb.health().status, HealthStatus::Unhealthy);
        clock.advance(Duration::from_secs(30));
        cb.try_acquire().unwrap();
        assert_eq!(cb.health().status, HealthStatus::Degraded);
    }

    #[test]
    fn test_registry_creates_once_and_applies_overrides() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_now());
        let registry = BreakerRegistry::new(config(5, 2, 60), clock)
            .with_override("object-store", config(1, 1, 5));

        let a = registry.get("analysis-engine");
        let b = registry.get("analysis-engine");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.config().failure_threshold, 5);

        let store = registry.get("object-store");
        assert_eq!(store.config().failure_threshold, 1);
        store.record_failure();
        assert_eq!(store.state(), CircuitState::Open);

        assert_eq!(registry.names(), vec!["analysis-engine", "object-store"]);
        let health = registry.health();
        assert_eq!(health[0].status, HealthStatus::Healthy);
        assert_eq!(health[1].status, HealthStatus::Unhealthy);

        assert!(registry.reset("object-store"));
        assert!(!registry.reset("never-used"));
        assert_eq!(registry.snapshot()[1].state, CircuitState::Closed);
    }

    #[test]
    fn test_registry_concurrent_get_yields_one_breaker() {
        let registry = Arc::new(BreakerRegistry::with_system_clock(
            CircuitBreakerConfig::default(),
        ));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.get("metadata-store"))
            })
            .collect();
        let breakers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(breakers.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }
}
