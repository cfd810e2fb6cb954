//! Retry backoff strategies (§4.4).
//!
//! The donor only ever modeled a single exponential-ish factor
//! (`RetryBackoffFactor` in `message_router/domain_types.rs`); the four
//! strategies here are authored fresh against that nutype-validated-config
//! idiom, kept as pure functions so the backoff law is testable without any
//! I/O or scheduling.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Base delay, in milliseconds, shared by every backoff strategy.
#[nutype(
    validate(greater_or_equal = 0, less_or_equal = 300_000),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        Default, TryFrom, Into
    ),
    default = 100
)]
pub struct BaseDelayMs(u64);

/// Per-attempt step used by [`BackoffStrategy::Linear`].
#[nutype(
    validate(greater_or_equal = 0, less_or_equal = 300_000),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        Default, TryFrom, Into
    ),
    default = 100
)]
pub struct StepMs(u64);

/// Multiplicative factor used by [`BackoffStrategy::Exponential`].
#[nutype(
    validate(greater_or_equal = 1.0, less_or_equal = 10.0),
    derive(
        Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize, Display, Default,
        TryFrom, Into
    ),
    default = 2.0
)]
pub struct BackoffFactor(f64);

/// Upper bound, in milliseconds, any computed backoff may reach.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 3_600_000),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        Default, TryFrom, Into
    ),
    default = 30_000
)]
pub struct CapMs(u64);

/// The pluggable backoff strategies named in §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// No delay between attempts.
    Immediate,
    /// Attempt `n` waits `n * step_ms`.
    Linear {
        /// Per-attempt step.
        step_ms: StepMs,
    },
    /// Attempt `n` waits `min(cap_ms, base_ms * factor^(n-1))`, ±20% jitter.
    Exponential {
        /// Delay for the first retry.
        base_ms: BaseDelayMs,
        /// Multiplier applied per subsequent attempt.
        factor: BackoffFactor,
        /// Ceiling on the computed delay, before jitter.
        cap_ms: CapMs,
    },
    /// Attempt `n` waits `min(cap_ms, fib(n) * base_ms)`.
    Fibonacci {
        /// Scale applied to the Fibonacci sequence.
        base_ms: BaseDelayMs,
        /// Ceiling on the computed delay.
        cap_ms: CapMs,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            base_ms: BaseDelayMs::default(),
            factor: BackoffFactor::default(),
            cap_ms: CapMs::default(),
        }
    }
}

impl BackoffStrategy {
    /// Computes the wait duration before retry attempt `n` (1-indexed: `n
    /// = 1` is the first retry, after the first failed attempt).
    ///
    /// Jitter (exponential only) is applied by the caller via
    /// [`BackoffStrategy::jittered_delay`]; this method is the deterministic
    /// core so the backoff law can be asserted exactly in tests.
    #[must_use]
    pub fn delay_for_attempt(&self, n: u32) -> Duration {
        match self {
            Self::Immediate => Duration::ZERO,
            Self::Linear { step_ms } => {
                Duration::from_millis(u64::from(n) * step_ms.into_inner())
            }
            Self::Exponential {
                base_ms,
                factor,
                cap_ms,
            } => {
                let raw = base_ms.into_inner() as f64 * factor.into_inner().powi(n as i32 - 1);
                let capped = raw.min(cap_ms.into_inner() as f64);
                Duration::from_millis(capped.max(0.0) as u64)
            }
            Self::Fibonacci { base_ms, cap_ms } => {
                let raw = fibonacci(n).saturating_mul(base_ms.into_inner());
                Duration::from_millis(raw.min(cap_ms.into_inner()))
            }
        }
    }

    /// Computes the wait duration before retry attempt `n`, applying ±20%
    /// jitter for the exponential strategy (per §4.4; the other three
    /// strategies are deterministic).
    #[must_use]
    pub fn jittered_delay(&self, n: u32) -> Duration {
        let base = self.delay_for_attempt(n);
        match self {
            Self::Exponential { .. } => {
                let millis = base.as_millis() as f64;
                let jitter_fraction = fastrand::f64().mul_add(0.4, -0.2); // in [-0.2, 0.2]
                let jittered = (millis * (1.0 + jitter_fraction)).max(0.0);
                Duration::from_millis(jittered as u64)
            }
            _ => base,
        }
    }
}

fn fibonacci(n: u32) -> u64 {
    if n == 0 {
        return 0;
    }
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 1..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    b
}

/// The retry policy an envelope carries (§3 `retry_policy` field).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Backoff shape between attempts.
    pub strategy: BackoffStrategy,
    /// Attempts made before dead-lettering.
    pub max_attempts: crate::domain_types::MaxAttempts,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::default(),
            max_attempts: crate::domain_types::MaxAttempts::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_has_zero_delay() {
        assert_eq!(BackoffStrategy::Immediate.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(BackoffStrategy::Immediate.delay_for_attempt(5), Duration::ZERO);
    }

    #[test]
    fn linear_scales_by_attempt_number() {
        let strategy = BackoffStrategy::Linear {
            step_ms: StepMs::try_new(100).unwrap(),
        };
        assert_eq!(strategy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(strategy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn exponential_caps_at_configured_ceiling() {
        let strategy = BackoffStrategy::Exponential {
            base_ms: BaseDelayMs::try_new(10).unwrap(),
            factor: BackoffFactor::try_new(2.0).unwrap(),
            cap_ms: CapMs::try_new(50).unwrap(),
        };
        assert_eq!(strategy.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(strategy.delay_for_attempt(2), Duration::from_millis(20));
        assert_eq!(strategy.delay_for_attempt(3), Duration::from_millis(40));
        // attempt 4 would be 80ms uncapped; capped at 50ms.
        assert_eq!(strategy.delay_for_attempt(4), Duration::from_millis(50));
    }

    #[test]
    fn exponential_jitter_stays_within_twenty_percent() {
        let strategy = BackoffStrategy::Exponential {
            base_ms: BaseDelayMs::try_new(1000).unwrap(),
            factor: BackoffFactor::try_new(2.0).unwrap(),
            cap_ms: CapMs::try_new(100_000).unwrap(),
        };
        let base = strategy.delay_for_attempt(2).as_millis() as f64;
        for _ in 0..50 {
            let jittered = strategy.jittered_delay(2).as_millis() as f64;
            assert!(jittered >= base * 0.8 - 1.0);
            assert!(jittered <= base * 1.2 + 1.0);
        }
    }

    #[test]
    fn fibonacci_matches_the_classic_sequence() {
        let strategy = BackoffStrategy::Fibonacci {
            base_ms: BaseDelayMs::try_new(10).unwrap(),
            cap_ms: CapMs::try_new(1_000_000).unwrap(),
        };
        // fib(1)=1, fib(2)=1, fib(3)=2, fib(4)=3, fib(5)=5
        assert_eq!(strategy.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(strategy.delay_for_attempt(2), Duration::from_millis(10));
        assert_eq!(strategy.delay_for_attempt(3), Duration::from_millis(20));
        assert_eq!(strategy.delay_for_attempt(4), Duration::from_millis(30));
        assert_eq!(strategy.delay_for_attempt(5), Duration::from_millis(50));
    }

    #[test]
    fn fibonacci_caps_at_configured_ceiling() {
        let strategy = BackoffStrategy::Fibonacci {
            base_ms: BaseDelayMs::try_new(1000).unwrap(),
            cap_ms: CapMs::try_new(2000).unwrap(),
        };
        assert_eq!(strategy.delay_for_attempt(10), Duration::from_millis(2000));
    }
}
