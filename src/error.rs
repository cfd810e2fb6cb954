//! The error taxonomy shared by every component of the coordination core.
//!
//! One `thiserror` enum rather than one type per component, matching the
//! donor's `CaxtonError` shape: every failure mode becomes a variant of a
//! single type so `?` keeps working across component boundaries instead of
//! forcing a `From` impl at every seam.

use thiserror::Error;

/// The taxonomy tag a [`CoreError`] carries, independent of its message.
///
/// Stable, serializable, and what callers should match on rather than the
/// error's `Display` text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Envelope failed validation; never retried.
    Malformed,
    /// Recipient absent or unavailable; retried per policy, then DLQ.
    NoRoute,
    /// Recipient back-pressured; retried per policy with jitter.
    QueueFull,
    /// No response within deadline; retried; on exhaustion DLQ.
    Timeout,
    /// Destination is circuit-open; retry after cooldown only.
    BreakerOpen,
    /// Receiver returned an `error` envelope; retried only if `retryable`.
    HandlerError,
    /// Caller deadline/cancellation; never retried.
    Cancelled,
    /// Retries used up; surfaced to caller with history.
    Exhausted,
    /// Envelope exceeded `ttl_ms` before delivery; logged, not retried.
    Expired,
    /// KV write failed invariants (reserved for future use).
    StateConflict,
    /// A stage raised `exhausted`/non-retryable `handler_error`.
    WorkflowFailed,
}

impl ErrorKind {
    /// The taxonomy tag as the lowercase snake_case string used on the
    /// wire (e.g. in `error` envelope payloads and audit records).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::NoRoute => "no_route",
            Self::QueueFull => "queue_full",
            Self::Timeout => "timeout",
            Self::BreakerOpen => "breaker_open",
            Self::HandlerError => "handler_error",
            Self::Cancelled => "cancelled",
            Self::Exhausted => "exhausted",
            Self::Expired => "expired",
            Self::StateConflict => "state_conflict",
            Self::WorkflowFailed => "workflow_failed",
        }
    }

    /// Whether the retry layer should schedule another attempt after this
    /// kind of failure, absent an explicit `retryable` hint from the
    /// handler.
    #[must_use]
    pub fn is_retryable_by_default(self) -> bool {
        matches!(self, Self::NoRoute | Self::QueueFull | Self::Timeout)
    }
}

/// The error type returned by every fallible operation in this crate.
#[derive(Error, Debug)]
pub enum CoreError {
    /// §7 `malformed`.
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// §7 `no_route`.
    #[error("no route to recipient: {0}")]
    NoRoute(String),

    /// §7 `queue_full`.
    #[error("queue full for {agent_id}")]
    QueueFull {
        /// The saturated recipient.
        agent_id: String,
    },

    /// §7 `timeout`.
    #[error("timed out awaiting response after {timeout_ms}ms")]
    Timeout {
        /// The deadline that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// §7 `breaker_open`.
    #[error("circuit breaker open for {destination}")]
    BreakerOpen {
        /// The destination whose breaker is open.
        destination: String,
    },

    /// §7 `handler_error`.
    #[error("handler returned an error: {0}")]
    HandlerError(String),

    /// §7 `cancelled`.
    #[error("operation cancelled")]
    Cancelled,

    /// §7 `exhausted`.
    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    Exhausted {
        /// Attempts made before giving up.
        attempts: u8,
        /// The final underlying failure.
        last_error: String,
    },

    /// §7 `expired`.
    #[error("envelope expired before delivery")]
    Expired,

    /// §7 `state_conflict`.
    #[error("state conflict: {0}")]
    StateConflict(String),

    /// §7 `workflow_failed`.
    #[error("workflow failed: {0}")]
    WorkflowFailed(String),

    /// The manager or a component has started shutting down.
    #[error("unavailable: shutting down")]
    Unavailable,

    /// No workflow, template, or agent exists with the given id.
    #[error("not found: {0}")]
    NotFound(String),

    /// I/O failure (snapshot files, sqlite connections).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// SQLite-backed KV adapter failure.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// SQLite migration failure.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl CoreError {
    /// Builds a [`CoreError::Malformed`] from anything displayable.
    pub fn malformed(reason: impl std::fmt::Display) -> Self {
        Self::Malformed(reason.to_string())
    }

    /// The taxonomy tag this error belongs to, per §7.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Malformed(_) => ErrorKind::Malformed,
            Self::NoRoute(_) => ErrorKind::NoRoute,
            Self::QueueFull { .. } => ErrorKind::QueueFull,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::BreakerOpen { .. } => ErrorKind::BreakerOpen,
            Self::HandlerError(_) => ErrorKind::HandlerError,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Exhausted { .. } => ErrorKind::Exhausted,
            Self::Expired => ErrorKind::Expired,
            Self::StateConflict(_) => ErrorKind::StateConflict,
            Self::WorkflowFailed(_)
            | Self::Unavailable
            | Self::NotFound(_)
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Storage(_)
            | Self::Migration(_) => ErrorKind::WorkflowFailed,
        }
    }

    /// Whether callers see this error directly (§7 propagation policy) as
    /// opposed to it being absorbed by the retry layer.
    #[must_use]
    pub fn is_surfaced_to_caller(&self) -> bool {
        matches!(
            self,
            Self::Exhausted { .. } | Self::Cancelled | Self::BreakerOpen { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_to_wire_string() {
        assert_eq!(ErrorKind::BreakerOpen.as_str(), "breaker_open");
        assert_eq!(ErrorKind::NoRoute.as_str(), "no_route");
    }

    #[test]
    fn only_exhausted_cancelled_and_breaker_open_surface() {
        assert!(CoreError::Cancelled.is_surfaced_to_caller());
        assert!(
            CoreError::Exhausted {
                attempts: 3,
                last_error: "timeout".into()
            }
            .is_surfaced_to_caller()
        );
        assert!(!CoreError::Expired.is_surfaced_to_caller());
        assert!(!CoreError::NoRoute("agent-x".into()).is_surfaced_to_caller());
    }

    #[test]
    fn default_retryability_matches_transient_errors_only() {
        assert!(ErrorKind::Timeout.is_retryable_by_default());
        assert!(!ErrorKind::Malformed.is_retryable_by_default());
        assert!(!ErrorKind::Cancelled.is_retryable_by_default());
    }
}
