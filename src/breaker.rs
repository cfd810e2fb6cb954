//! Per-destination circuit breaker (§4.4, §3 circuit breaker state).
//!
//! The donor only ever sketched this as a trait (`CircuitBreaker` in
//! `message_router/traits.rs`) plus a `CircuitBreakerState` enum; the actual
//! router (`message_router/router.rs`) stubbed every breaker-touching method
//! as a placeholder. This module is the real implementation, built against
//! the donor's trait shape and §5's "one lock per breaker entry" policy.

use crate::domain_types::{AgentId, BreakerCooldownMs, BreakerThreshold};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Instant;

/// Where a destination's breaker currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerPhase {
    /// Calls pass through normally.
    Closed,
    /// Calls fail immediately with `breaker_open`.
    Open,
    /// One probe call is permitted.
    HalfOpen,
}

/// Per-destination breaker state (§3).
#[derive(Debug, Clone)]
struct BreakerEntry {
    phase: BreakerPhase,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    cooldown: std::time::Duration,
}

impl BreakerEntry {
    fn new(base_cooldown: std::time::Duration) -> Self {
        Self {
            phase: BreakerPhase::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            cooldown: base_cooldown,
        }
    }
}

/// A snapshot of a destination's breaker state, for `stats()`/`health()`
/// reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    /// Current phase.
    pub phase: BreakerPhase,
    /// Consecutive failures recorded in `closed`.
    pub failure_count: u32,
    /// Successes recorded since the last open.
    pub success_count: u32,
}

/// Registry of per-destination circuit breakers.
///
/// One `Mutex`-guarded entry per destination behind a lock-free map, so
/// breakers for different destinations never contend with one another.
pub struct BreakerRegistry {
    entries: DashMap<AgentId, Mutex<BreakerEntry>>,
    threshold: BreakerThreshold,
    base_cooldown: std::time::Duration,
    cooldown_cap: std::time::Duration,
}

impl BreakerRegistry {
    /// Builds a registry with the given failure threshold, base cooldown,
    /// and a cap on the exponentially-extended cooldown (§5 "breaker
    /// cooldown cap", default 60s).
    #[must_use]
    pub fn new(
        threshold: BreakerThreshold,
        base_cooldown: BreakerCooldownMs,
        cooldown_cap: std::time::Duration,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            threshold,
            base_cooldown: base_cooldown.as_duration(),
            cooldown_cap,
        }
    }

    /// Returns `Ok(())` if a call to `destination` may proceed, or
    /// `Err(true)` if the breaker is open and the call must fail
    /// immediately (`breaker_open`), or `Err(false)` if the breaker is
    /// half-open and this call is accepted as the sole permitted probe.
    ///
    /// Callers that receive `Ok(())` or the half-open probe grant must
    /// report the outcome back via [`BreakerRegistry::record_success`] or
    /// [`BreakerRegistry::record_failure`].
    pub fn try_acquire(&self, destination: &AgentId) -> Result<(), bool> {
        let entry = self
            .entries
            .entry(destination.clone())
            .or_insert_with(|| Mutex::new(BreakerEntry::new(self.base_cooldown)));
        let mut guard = entry.lock().expect("breaker mutex poisoned");
        match guard.phase {
            BreakerPhase::Closed => Ok(()),
            BreakerPhase::Open => {
                let elapsed = guard.opened_at.map(|at| at.elapsed()).unwrap_or_default();
                if elapsed >= guard.cooldown {
                    guard.phase = BreakerPhase::HalfOpen;
                    Err(false)
                } else {
                    Err(true)
                }
            }
            BreakerPhase::HalfOpen => Err(true),
        }
    }

    /// Records a successful call to `destination`.
    ///
    /// From `half_open`, returns the breaker to `closed` and resets the
    /// failure counter. From `closed`, increments the success counter.
    pub fn record_success(&self, destination: &AgentId) {
        if let Some(entry) = self.entries.get(destination) {
            let mut guard = entry.lock().expect("breaker mutex poisoned");
            guard.success_count += 1;
            if guard.phase == BreakerPhase::HalfOpen {
                guard.phase = BreakerPhase::Closed;
                guard.failure_count = 0;
                guard.cooldown = self.base_cooldown;
            }
        }
    }

    /// Records a failed call to `destination`.
    ///
    /// From `closed`, increments the failure counter and opens the breaker
    /// once `failure_count` reaches the configured threshold (the **breaker
    /// law** of §8). From `half_open`, reopens with an extended
    /// (exponential, capped) cooldown.
    pub fn record_failure(&self, destination: &AgentId) {
        let entry = self
            .entries
            .entry(destination.clone())
            .or_insert_with(|| Mutex::new(BreakerEntry::new(self.base_cooldown)));
        let mut guard = entry.lock().expect("breaker mutex poisoned");
        match guard.phase {
            BreakerPhase::Closed => {
                guard.failure_count += 1;
                if guard.failure_count >= self.threshold.into_inner() {
                    guard.phase = BreakerPhase::Open;
                    guard.opened_at = Some(Instant::now());
                }
            }
            BreakerPhase::HalfOpen => {
                guard.phase = BreakerPhase::Open;
                guard.opened_at = Some(Instant::now());
                guard.cooldown = (guard.cooldown * 2).min(self.cooldown_cap);
            }
            BreakerPhase::Open => {}
        }
    }

    /// Reads the current state of `destination`'s breaker without mutating
    /// it. Destinations never seen default to `closed`.
    #[must_use]
    pub fn snapshot(&self, destination: &AgentId) -> BreakerSnapshot {
        self.entries
            .get(destination)
            .map(|entry| {
                let guard = entry.lock().expect("breaker mutex poisoned");
                BreakerSnapshot {
                    phase: guard.phase,
                    failure_count: guard.failure_count,
                    success_count: guard.success_count,
                }
            })
            .unwrap_or(BreakerSnapshot {
                phase: BreakerPhase::Closed,
                failure_count: 0,
                success_count: 0,
            })
    }
}
