//! Crate-wide configuration (§6 "Configuration (enumerated recognized
//! options)"), with deployment-profile presets and file load/save.
//!
//! Grounded in the donor's `message_router::config::RouterConfig`: same
//! `development()`/`production()`/`testing()`/`builder()`/`validate()`/
//! `save_to_file()`/`load_from_file()` shape, almost verbatim, re-pointed at
//! this crate's domain types and component configs instead of the router's.

use crate::comm_manager::CommManagerConfig;
use crate::domain_types::{
    BreakerCooldownMs, BreakerThreshold, HistogramWindow, MaxAttempts, QueueCapacity, TimeoutMs,
};
use crate::retry::BackoffStrategy;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors: malformed values, or problems loading/saving.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {field} - {reason}")]
    Validation { field: String, reason: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

/// What to do when an approval gate's deadline elapses with no decision
/// (mirrors `workflow::template::ApprovalTimeoutPolicy`, kept as a distinct
/// type here since it is a crate-wide default rather than a per-stage
/// override).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnApprovalTimeout {
    /// Treat the timeout as a rejection.
    Reject,
    /// Treat the timeout as an approval.
    AutoApprove,
    /// Hand off to an escalation path; wait indefinitely.
    Escalate,
}

impl Default for OnApprovalTimeout {
    fn default() -> Self {
        Self::Reject
    }
}

/// Full set of recognized configuration options, covering the fabric
/// (queues, retry, breaker), workflow engine (approvals, snapshots), and
/// the persisted-state layer's retention policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Per-queue bound on outstanding envelopes.
    pub queue_capacity: QueueCapacity,
    /// Default await for `request`/`send_and_await`.
    pub request_timeout_ms: TimeoutMs,
    /// Retry attempts before dead-lettering.
    pub max_attempts: MaxAttempts,
    /// Backoff shape applied between attempts.
    pub retry_strategy: BackoffStrategy,
    /// Consecutive-failure threshold before a breaker opens.
    pub breaker_failure_threshold: BreakerThreshold,
    /// Base breaker cooldown.
    pub breaker_cooldown_ms: BreakerCooldownMs,
    /// Ceiling the exponentially-extended breaker cooldown may reach.
    pub breaker_cooldown_cap_ms: u64,
    /// Heartbeat interval agents are expected to honor.
    pub heartbeat_interval_ms: u64,
    /// Heartbeat age past which a registry entry goes `unavailable`.
    pub stale_after_ms: u64,
    /// How often the KV store's ndjson snapshot is refreshed.
    pub snapshot_interval_ms: u64,
    /// Rolling sample window for latency percentiles.
    pub metrics_window: HistogramWindow,
    /// Default approval-gate deadline, milliseconds (24h).
    pub approval_default_timeout_ms: u64,
    /// What an elapsed approval deadline resolves to by default.
    pub on_approval_timeout: OnApprovalTimeout,
    /// How long dead-lettered envelopes are retained before eviction.
    pub dlq_retention_ms: u64,
    /// Where the key-value store persists its snapshot/database file.
    pub storage_path: Option<std::path::PathBuf>,
    /// Whether to use the SQLite-backed store instead of the in-memory one.
    pub enable_persistence: bool,
}

impl CoreConfig {
    /// Settings tuned for local development: small queues, aggressive
    /// retries, in-memory storage, verbose observability.
    ///
    /// # Panics
    /// Panics if any hardcoded value is out of range for its domain type.
    #[must_use]
    pub fn development() -> Self {
        Self {
            queue_capacity: QueueCapacity::try_new(1_000).unwrap(),
            request_timeout_ms: TimeoutMs::try_new(10_000).unwrap(),
            max_attempts: MaxAttempts::try_new(2).unwrap(),
            retry_strategy: BackoffStrategy::default(),
            breaker_failure_threshold: BreakerThreshold::try_new(3).unwrap(),
            breaker_cooldown_ms: BreakerCooldownMs::try_new(5_000).unwrap(),
            breaker_cooldown_cap_ms: 30_000,
            heartbeat_interval_ms: 5_000,
            stale_after_ms: 15_000,
            snapshot_interval_ms: 10_000,
            metrics_window: HistogramWindow::try_new(1_000).unwrap(),
            approval_default_timeout_ms: 86_400_000,
            on_approval_timeout: OnApprovalTimeout::Reject,
            dlq_retention_ms: 86_400_000,
            storage_path: None,
            enable_persistence: false,
        }
    }

    /// Settings tuned for production: large queues, resilient retries,
    /// persistent storage, sampled observability.
    ///
    /// # Panics
    /// Panics if any hardcoded value is out of range for its domain type.
    #[must_use]
    pub fn production() -> Self {
        Self {
            queue_capacity: QueueCapacity::try_new(100_000).unwrap(),
            request_timeout_ms: TimeoutMs::try_new(30_000).unwrap(),
            max_attempts: MaxAttempts::try_new(3).unwrap(),
            retry_strategy: BackoffStrategy::default(),
            breaker_failure_threshold: BreakerThreshold::try_new(5).unwrap(),
            breaker_cooldown_ms: BreakerCooldownMs::try_new(5_000).unwrap(),
            breaker_cooldown_cap_ms: 60_000,
            heartbeat_interval_ms: 5_000,
            stale_after_ms: 15_000,
            snapshot_interval_ms: 10_000,
            metrics_window: HistogramWindow::try_new(10_000).unwrap(),
            approval_default_timeout_ms: 86_400_000,
            on_approval_timeout: OnApprovalTimeout::Reject,
            dlq_retention_ms: 7 * 86_400_000,
            storage_path: Some(std::path::PathBuf::from("./data/core.db")),
            enable_persistence: true,
        }
    }

    /// Settings tuned for integration tests: tiny windows, fast timeouts,
    /// in-memory storage, no persistence.
    ///
    /// # Panics
    /// Panics if any hardcoded value is out of range for its domain type.
    #[must_use]
    pub fn testing() -> Self {
        Self {
            queue_capacity: QueueCapacity::try_new(100).unwrap(),
            request_timeout_ms: TimeoutMs::try_new(2_000).unwrap(),
            max_attempts: MaxAttempts::try_new(2).unwrap(),
            retry_strategy: BackoffStrategy::Immediate,
            breaker_failure_threshold: BreakerThreshold::try_new(2).unwrap(),
            breaker_cooldown_ms: BreakerCooldownMs::try_new(100).unwrap(),
            breaker_cooldown_cap_ms: 1_000,
            heartbeat_interval_ms: 500,
            stale_after_ms: 2_000,
            snapshot_interval_ms: 1_000,
            metrics_window: HistogramWindow::try_new(10).unwrap(),
            approval_default_timeout_ms: 60_000,
            on_approval_timeout: OnApprovalTimeout::Reject,
            dlq_retention_ms: 60_000,
            storage_path: None,
            enable_persistence: false,
        }
    }

    /// Starts a builder seeded with development defaults.
    #[must_use]
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::new()
    }

    /// Validates cross-field consistency beyond what the domain types
    /// already enforce in isolation.
    ///
    /// # Errors
    /// Returns [`ConfigError::Validation`] on an inconsistent combination.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stale_after_ms <= self.heartbeat_interval_ms {
            return Err(ConfigError::Validation {
                field: "stale_after_ms".to_string(),
                reason: "must be greater than heartbeat_interval_ms".to_string(),
            });
        }
        if self.breaker_cooldown_cap_ms < self.breaker_cooldown_ms.into_inner() {
            return Err(ConfigError::Validation {
                field: "breaker_cooldown_cap_ms".to_string(),
                reason: "must be at least breaker_cooldown_ms".to_string(),
            });
        }
        if self.enable_persistence && self.storage_path.is_none() {
            return Err(ConfigError::Validation {
                field: "storage_path".to_string(),
                reason: "must specify storage path when persistence is enabled".to_string(),
            });
        }
        Ok(())
    }

    /// Saves configuration to a JSON file.
    ///
    /// # Errors
    /// Propagates I/O and serialization failures.
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Loads and validates configuration from a JSON file.
    ///
    /// # Errors
    /// Propagates I/O, deserialization, and validation failures.
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Derives the façade's own tunables from this configuration.
    #[must_use]
    pub fn comm_manager_config(&self) -> CommManagerConfig {
        CommManagerConfig {
            queue_capacity: self.queue_capacity,
            stale_after: Duration::from_millis(self.stale_after_ms),
            sweep_interval: Duration::from_millis(self.heartbeat_interval_ms),
            breaker_threshold: self.breaker_failure_threshold,
            breaker_cooldown: self.breaker_cooldown_ms,
            breaker_cooldown_cap: Duration::from_millis(self.breaker_cooldown_cap_ms),
            tracer_capacity: self.metrics_window.into_inner(),
            metrics_window: self.metrics_window.into_inner(),
            dlq_retention_ms: self.dlq_retention_ms,
        }
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self::development()
    }
}

/// Builder for a custom [`CoreConfig`], starting from development defaults.
pub struct CoreConfigBuilder {
    config: CoreConfig,
}

impl CoreConfigBuilder {
    /// Starts a builder from [`CoreConfig::development`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: CoreConfig::development(),
        }
    }

    /// Sets the per-queue capacity.
    #[must_use]
    pub fn queue_capacity(mut self, capacity: QueueCapacity) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Sets the default request timeout.
    #[must_use]
    pub fn request_timeout_ms(mut self, timeout: TimeoutMs) -> Self {
        self.config.request_timeout_ms = timeout;
        self
    }

    /// Sets the retry attempt ceiling.
    #[must_use]
    pub fn max_attempts(mut self, attempts: MaxAttempts) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    /// Sets the retry backoff strategy.
    #[must_use]
    pub fn retry_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.config.retry_strategy = strategy;
        self
    }

    /// Sets the breaker failure threshold.
    #[must_use]
    pub fn breaker_failure_threshold(mut self, threshold: BreakerThreshold) -> Self {
        self.config.breaker_failure_threshold = threshold;
        self
    }

    /// Sets the default approval-gate deadline.
    #[must_use]
    pub fn approval_default_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.approval_default_timeout_ms = timeout_ms;
        self
    }

    /// Sets the default approval-timeout resolution.
    #[must_use]
    pub fn on_approval_timeout(mut self, policy: OnApprovalTimeout) -> Self {
        self.config.on_approval_timeout = policy;
        self
    }

    /// Sets the dead-letter retention window.
    #[must_use]
    pub fn dlq_retention_ms(mut self, retention_ms: u64) -> Self {
        self.config.dlq_retention_ms = retention_ms;
        self
    }

    /// Enables or disables the SQLite-backed persistent store.
    #[must_use]
    pub fn enable_persistence(mut self, enable: bool) -> Self {
        self.config.enable_persistence = enable;
        self
    }

    /// Sets the storage path used when persistence is enabled.
    #[must_use]
    pub fn storage_path<P: Into<std::path::PathBuf>>(mut self, path: P) -> Self {
        self.config.storage_path = Some(path.into());
        self
    }

    /// Validates and returns the built configuration.
    ///
    /// # Errors
    /// Returns [`ConfigError::Validation`] if the resulting configuration
    /// is inconsistent.
    pub fn build(self) -> Result<CoreConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for CoreConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn development_config_is_valid() {
        assert!(CoreConfig::development().validate().is_ok());
    }

    #[test]
    fn production_config_is_valid() {
        assert!(CoreConfig::production().validate().is_ok());
    }

    #[test]
    fn testing_config_is_valid() {
        assert!(CoreConfig::testing().validate().is_ok());
    }

    #[test]
    fn builder_overrides_selected_fields() {
        let config = CoreConfig::builder()
            .queue_capacity(QueueCapacity::try_new(500).unwrap())
            .max_attempts(MaxAttempts::try_new(5).unwrap())
            .build()
            .unwrap();
        assert_eq!(config.queue_capacity.into_inner(), 500);
        assert_eq!(config.max_attempts.into_inner(), 5);
    }

    #[test]
    fn validate_rejects_persistence_without_storage_path() {
        let config = CoreConfig {
            enable_persistence: true,
            storage_path: None,
            ..CoreConfig::development()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_stale_after_below_heartbeat_interval() {
        let config = CoreConfig {
            heartbeat_interval_ms: 5_000,
            stale_after_ms: 1_000,
            ..CoreConfig::development()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn file_round_trip_preserves_values() {
        let config = CoreConfig::development();
        let temp_file = tempfile::NamedTempFile::new().unwrap();
        config.save_to_file(temp_file.path()).unwrap();
        let loaded = CoreConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.queue_capacity, loaded.queue_capacity);
        assert_eq!(config.request_timeout_ms, loaded.request_timeout_ms);
    }
}
