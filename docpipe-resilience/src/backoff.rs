//! Delay computation between retry attempts.

use docpipe_core::{BackoffStrategy, RetryConfig, JITTER_FRACTION};
use rand::Rng;
use std::time::Duration;

/// Largest Fibonacci index that fits in a `u64`.
const MAX_FIB_INDEX: u32 = 93;

/// Pure delay function: strategy, base, cap and optional jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    strategy: BackoffStrategy,
    base: Duration,
    cap: Duration,
    jitter: bool,
}

impl BackoffPolicy {
    pub fn new(strategy: BackoffStrategy, base: Duration, cap: Duration) -> Self {
        Self {
            strategy,
            base,
            cap,
            jitter: true,
        }
    }

    pub fn exponential(base: Duration, factor: f64, cap: Duration) -> Self {
        Self::new(BackoffStrategy::Exponential { factor }, base, cap)
    }

    pub fn linear(base: Duration, cap: Duration) -> Self {
        Self::new(BackoffStrategy::Linear, base, cap)
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::new(BackoffStrategy::Fixed, delay, delay)
    }

    pub fn fibonacci(base: Duration, cap: Duration) -> Self {
        Self::new(BackoffStrategy::Fibonacci, base, cap)
    }

    /// No delay at all; useful for tests and tight local loops.
    pub fn none() -> Self {
        Self::new(BackoffStrategy::Fixed, Duration::ZERO, Duration::ZERO).with_jitter(false)
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.strategy, config.base_delay, config.max_delay).with_jitter(config.jitter)
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn strategy(&self) -> BackoffStrategy {
        self.strategy
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }

    /// Delay before retry `attempt` (1-based), jittered when enabled.
    pub fn delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let raw = self.delay_without_jitter(attempt);
        if !self.jitter || raw.is_zero() {
            return raw;
        }
        let noise = rng.random_range(-JITTER_FRACTION..=JITTER_FRACTION);
        let jittered = raw.as_secs_f64() * (1.0 + noise);
        self.clamp_secs(jittered)
    }

    /// The deterministic part of [`delay`](Self::delay), already capped.
    pub fn delay_without_jitter(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let raw = match self.strategy {
            BackoffStrategy::Exponential { factor } => {
                let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                return self.clamp_secs(self.base.as_secs_f64() * factor.powi(exponent));
            }
            BackoffStrategy::Linear => self.base.saturating_mul(attempt),
            BackoffStrategy::Fixed => self.base,
            BackoffStrategy::Fibonacci => {
                let multiplier = u32::try_from(fibonacci(attempt)).unwrap_or(u32::MAX);
                self.base.saturating_mul(multiplier)
            }
        };
        raw.min(self.cap)
    }

    /// Clamp a float delay into `[0, cap]`; NaN and infinity land on the cap.
    fn clamp_secs(&self, secs: f64) -> Duration {
        let cap = self.cap.as_secs_f64();
        if !secs.is_finite() || secs >= cap {
            return self.cap;
        }
        if secs <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(secs)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// fib(1) = fib(2) = 1, saturating at `u64::MAX`.
fn fibonacci(n: u32) -> u64 {
    if n > MAX_FIB_INDEX {
        return u64::MAX;
    }
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 1..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    b
}

// ============================================================================
// TESTS
// ============================================================================


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn arb_strategy() -> impl Strategy<Value = BackoffStrategy> {
        prop_oneof![
            (1.0f64..10.0).prop_map(|factor| BackoffStrategy::Exponential { factor }),
            Just(BackoffStrategy::Linear),
            Just(BackoffStrategy::Fixed),
            Just(BackoffStrategy::Fibonacci),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        /// Every delay lies in [0, cap] regardless of strategy, attempt or jitter.
        #[test]
        fn prop_delay_bounded_by_cap(
            strategy in arb_strategy(),
            base_ms in 0u64..60_000,
            cap_ms in 0u64..120_000,
            attempt in any::<u32>(),
            jitter in any::<bool>(),
            seed in any::<u64>(),
        ) {
            let cap = Duration::from_millis(cap_ms);
            let policy = BackoffPolicy::new(strategy, Duration::from_millis(base_ms), cap)
                .with_jitter(jitter);
            let mut rng = StdRng::seed_from_u64(seed);
            let delay = policy.delay(attempt, &mut rng);
            prop_assert!(delay <= cap);
        }

        /// Without jitter, delays never shrink as attempts grow.
        #[test]
        fn prop_unjittered_delay_monotonic(
            strategy in arb_strategy(),
            base_ms in 1u64..5_000,
            attempt in 1u32..200,
        ) {
            let policy = BackoffPolicy::new(
                strategy,
                Duration::from_millis(base_ms),
                Duration::from_secs(300),
            );
            prop_assert!(
                policy.delay_without_jitter(attempt) <= policy.delay_without_jitter(attempt + 1)
            );
        }
    }
}
