//! Validated domain primitives shared across the coordination core.
//!
//! Every identifier, bounded count, and duration the rest of the crate hands
//! around is wrapped in a `nutype` newtype rather than passed as a bare
//! `String`/`u64`/`usize`. Illegal values (empty ids, out-of-range counts)
//! are rejected at the boundary instead of being checked, inconsistently, by
//! every caller.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

/// Unique identifier for a message envelope.
#[nutype(derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into
))]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generates a new random message id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Identifier tying a response back to the request that produced it.
///
/// Equal to the originating request's [`MessageId`] for responses; absent
/// otherwise.
#[nutype(derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into
))]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Builds a correlation id from the request it responds to.
    #[must_use]
    pub fn for_request(request_id: MessageId) -> Self {
        Self::new(request_id.into_inner())
    }
}

/// Unique identifier for an agent registered with the fabric.
#[nutype(
    validate(len_char_min = 1, len_char_max = 256),
    derive(
        Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
        AsRef, Into
    )
)]
pub struct AgentId(String);

/// Type tag an agent registers with (e.g. `"technical"`, `"pricing"`).
#[nutype(
    validate(len_char_min = 1, len_char_max = 128),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRef, Into)
)]
pub struct AgentType(String);

/// A single capability an agent advertises (e.g. `"extract-boq"`).
#[nutype(
    validate(len_char_min = 1, len_char_max = 128),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRef, Into)
)]
pub struct CapabilityName(String);

/// Name of a pub/sub topic.
#[nutype(
    validate(len_char_min = 1, len_char_max = 256),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRef, Into)
)]
pub struct TopicName(String);

/// Wildcard recipient marker used for `kind = broadcast` envelopes.
pub const BROADCAST_RECIPIENT: &str = "*";

/// Identifier for a workflow instance.
#[nutype(derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into
))]
pub struct WorkflowId(Uuid);

impl WorkflowId {
    /// Generates a new random workflow id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Identifier for the RFP document a workflow processes.
#[nutype(
    validate(len_char_min = 1, len_char_max = 256),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRef, Into)
)]
pub struct RfpId(String);

/// Identifier for a workflow template.
#[nutype(
    validate(len_char_min = 1, len_char_max = 128),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRef, Into)
)]
pub struct TemplateId(String);

impl TemplateId {
    /// The template selected when no predicate matches and none is
    /// explicitly requested.
    #[must_use]
    pub fn standard() -> Self {
        Self::try_new("standard").expect("\"standard\" satisfies TemplateId validation")
    }
}

/// Name of a stage within a workflow template.
#[nutype(
    validate(len_char_min = 1, len_char_max = 128),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRef, Into)
)]
pub struct StageName(String);

/// Name of a `parallel_group` shared by concurrently-dispatched stages.
#[nutype(
    validate(len_char_min = 1, len_char_max = 128),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRef, Into)
)]
pub struct ParallelGroup(String);

/// Monotonic-safe creation instant, used for envelope timestamps and
/// workflow/audit record timing.
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize))]
pub struct Timestamp(SystemTime);

impl Timestamp {
    /// Timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        Self::new(SystemTime::now())
    }

    /// Milliseconds elapsed since `self`, saturating at `u64::MAX` rather
    /// than panicking if the duration overflows.
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        self.into_inner()
            .elapsed()
            .unwrap_or_default()
            .as_millis()
            .try_into()
            .unwrap_or(u64::MAX)
    }
}

/// Per-queue bound on outstanding envelopes.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000_000),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        Default, TryFrom, Into
    ),
    default = 10_000
)]
pub struct QueueCapacity(usize);

/// Default timeout, in milliseconds, for a `request`/`send_and_await` call.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 86_400_000),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        Default, TryFrom, Into
    ),
    default = 30_000
)]
pub struct TimeoutMs(u64);

impl TimeoutMs {
    /// Converts to a [`std::time::Duration`].
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.into_inner())
    }
}

/// Number of attempts the retry layer makes before dead-lettering.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 20),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        Default, TryFrom, Into
    ),
    default = 3
)]
pub struct MaxAttempts(u8);

/// Consecutive-failure threshold before a circuit breaker opens.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1000),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        Default, TryFrom, Into
    ),
    default = 5
)]
pub struct BreakerThreshold(u32);

/// Cooldown, in milliseconds, a breaker stays `open` before a probe.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 3_600_000),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        Default, TryFrom, Into
    ),
    default = 5_000
)]
pub struct BreakerCooldownMs(u64);

impl BreakerCooldownMs {
    /// Converts to a [`std::time::Duration`].
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.into_inner())
    }
}

/// Number of samples retained in the rolling latency histogram.
#[nutype(
    validate(greater_or_equal = 10, less_or_equal = 1_000_000),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        Default, TryFrom, Into
    ),
    default = 10_000
)]
pub struct HistogramWindow(usize);

/// Monotonically increasing per-workflow audit sequence number.
#[nutype(derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, Into
))]
pub struct AuditSeq(u64);

impl AuditSeq {
    /// The first sequence number for a workflow's audit trail.
    #[must_use]
    pub fn first() -> Self {
        Self::new(0)
    }

    /// The sequence number that follows this one.
    #[must_use]
    pub fn next(&self) -> Self {
        Self::new(self.into_inner() + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_generates_unique_values() {
        assert_ne!(MessageId::generate(), MessageId::generate());
    }

    #[test]
    fn correlation_id_derives_from_request() {
        let request_id = MessageId::generate();
        let correlation = CorrelationId::for_request(request_id);
        assert_eq!(correlation.into_inner(), request_id.into_inner());
    }

    #[test]
    fn agent_id_rejects_empty_string() {
        assert!(AgentId::try_new(String::new()).is_err());
    }

    #[test]
    fn queue_capacity_rejects_zero() {
        assert!(QueueCapacity::try_new(0).is_err());
    }

    #[test]
    fn audit_seq_increments() {
        let first = AuditSeq::first();
        let second = first.next();
        assert_eq!(second.into_inner(), 1);
    }

    #[test]
    fn template_id_standard_is_valid() {
        assert_eq!(TemplateId::standard().as_ref(), "standard");
    }
}
