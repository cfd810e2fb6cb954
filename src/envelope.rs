//! The canonical message record exchanged between agents and the fabric.
//!
//! Generalizes the donor's FIPA `Performative`/`MessageParticipants` split
//! (which forbade `sender == receiver` and only ever addressed a single
//! agent) into a `recipient` that may name an agent, a topic, or the
//! broadcast wildcard, matching the coordination fabric's pub/sub and
//! fan-out requirements.

use crate::domain_types::{
    AgentId, CorrelationId, MessageId, Timestamp, TopicName, BROADCAST_RECIPIENT,
};
use crate::error::{CoreError, ErrorKind};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What an envelope is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// Expects exactly one matching `response`.
    Request,
    /// Answers a `request`; `correlation_id` names the request.
    Response,
    /// One-way message, no response expected.
    Notification,
    /// Delivered to a topic's current subscribers.
    Publish,
    /// Delivered to every registered agent matching a filter.
    Broadcast,
    /// Acknowledges receipt of a `requires_ack` envelope.
    Ack,
    /// Reports a handler-side failure; `retryable` travels in the payload.
    Error,
}

/// Delivery priority. Ordered `Low < Normal < High < Urgent` so that
/// `cmp`/`Ord` can drive lane selection directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Lowest lane; drained last.
    Low,
    /// Default priority.
    Normal,
    /// Drained before `Normal`.
    High,
    /// Drained before everything else.
    Urgent,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl Priority {
    /// All priorities, ordered from the lane drained first to the lane
    /// drained last.
    #[must_use]
    pub const fn lanes_high_to_low() -> [Priority; 4] {
        [Priority::Urgent, Priority::High, Priority::Normal, Priority::Low]
    }
}

/// Where an envelope is headed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Recipient {
    /// A specific registered agent.
    Agent(AgentId),
    /// A named topic (`kind = publish`).
    Topic(TopicName),
    /// Every registered agent (`kind = broadcast`), spelled `"*"` on the
    /// wire.
    Broadcast,
}

impl Recipient {
    /// Parses a raw wire-form recipient string given the envelope's kind.
    ///
    /// `kind = publish` recipients are topic names; `kind = broadcast`
    /// recipients must be the literal wildcard `"*"`; every other kind
    /// addresses a concrete agent.
    pub fn parse(raw: &str, kind: EnvelopeKind) -> Result<Self, CoreError> {
        if raw.is_empty() {
            return Err(CoreError::malformed("recipient must not be empty"));
        }
        match kind {
            EnvelopeKind::Publish => Ok(Self::Topic(
                TopicName::try_new(raw.to_string())
                    .map_err(|e| CoreError::malformed(e.to_string()))?,
            )),
            EnvelopeKind::Broadcast => {
                if raw == BROADCAST_RECIPIENT {
                    Ok(Self::Broadcast)
                } else {
                    Err(CoreError::malformed(
                        "broadcast envelopes must address the wildcard recipient",
                    ))
                }
            }
            _ => Ok(Self::Agent(
                AgentId::try_new(raw.to_string()).map_err(|e| CoreError::malformed(e.to_string()))?,
            )),
        }
    }

    /// The agent id this recipient names, if any.
    #[must_use]
    pub fn as_agent(&self) -> Option<&AgentId> {
        match self {
            Self::Agent(id) => Some(id),
            _ => None,
        }
    }
}

/// A single fabric hop recorded against a message's trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceHop {
    /// The component or agent that produced this hop.
    pub agent_id: String,
    /// What happened: `enqueued`, `dequeued`, `processing_started`, ...
    pub action: String,
    /// When it happened.
    pub at: Timestamp,
}

/// Optional construction parameters for [`Envelope::new_request`].
#[derive(Debug, Clone, Default)]
pub struct EnvelopeOptions {
    /// Delivery priority; defaults to [`Priority::Normal`].
    pub priority: Priority,
    /// Optional time-to-live in milliseconds.
    pub ttl_ms: Option<u64>,
    /// Whether the recipient must send an `ack` within `ack_timeout_ms`.
    pub requires_ack: bool,
    /// Retry policy governing `send_and_await` on this envelope.
    pub retry_policy: Option<RetryPolicy>,
}

/// The canonical message record exchanged between agents.
///
/// Immutable once constructed: no field can be mutated after
/// [`Envelope::new_request`]/[`Envelope::new_response`] return. The fabric's
/// accumulated `trace` is held by the tracer, keyed by `message_id`, not
/// copied into the envelope delivered to recipients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    message_id: MessageId,
    correlation_id: Option<CorrelationId>,
    sender: AgentId,
    recipient_raw: String,
    kind: EnvelopeKind,
    priority: Priority,
    payload: Value,
    timestamp: Timestamp,
    ttl_ms: Option<u64>,
    requires_ack: bool,
    retry_policy: Option<RetryPolicy>,
    /// Fields present on the wire that this version of the codec does not
    /// recognize; preserved verbatim so forward compatibility holds across
    /// versions that add fields.
    #[serde(default, flatten)]
    unknown_fields: std::collections::BTreeMap<String, Value>,
}

impl Envelope {
    /// Constructs a new `request` (or other originating-kind) envelope.
    ///
    /// Assigns a fresh `message_id` and the current timestamp. `kind`
    /// defaults to [`EnvelopeKind::Request`]; use [`Envelope::with_kind`] to
    /// build a `notification`, `publish`, or `broadcast` instead.
    #[must_use]
    pub fn new_request(
        sender: AgentId,
        recipient: Recipient,
        payload: Value,
        opts: EnvelopeOptions,
    ) -> Self {
        Self {
            message_id: MessageId::generate(),
            correlation_id: None,
            sender,
            recipient_raw: recipient_to_raw(&recipient),
            kind: EnvelopeKind::Request,
            priority: opts.priority,
            payload,
            timestamp: Timestamp::now(),
            ttl_ms: opts.ttl_ms,
            requires_ack: opts.requires_ack,
            retry_policy: opts.retry_policy,
            unknown_fields: std::collections::BTreeMap::new(),
        }
    }

    /// Overrides the kind of an envelope built via [`Envelope::new_request`],
    /// for constructing `notification`/`publish`/`broadcast`/`ack` messages
    /// through the same builder.
    #[must_use]
    pub fn with_kind(mut self, kind: EnvelopeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Constructs a `response` envelope answering `request`.
    ///
    /// Inherits `correlation_id = request.message_id`, `sender` and
    /// `recipient` swapped, and `priority` carried over from the request.
    #[must_use]
    pub fn new_response(request: &Envelope, payload: Value) -> Self {
        Self {
            message_id: MessageId::generate(),
            correlation_id: Some(CorrelationId::for_request(request.message_id)),
            sender: request.recipient_raw_as_agent().unwrap_or_else(|| request.sender.clone()),
            recipient_raw: request.sender.as_ref().to_string(),
            kind: EnvelopeKind::Response,
            priority: request.priority,
            payload,
            timestamp: Timestamp::now(),
            ttl_ms: None,
            requires_ack: false,
            retry_policy: None,
            unknown_fields: std::collections::BTreeMap::new(),
        }
    }

    /// Constructs an `error` envelope answering `request`.
    #[must_use]
    pub fn new_error_response(request: &Envelope, error_kind: ErrorKind, message: &str) -> Self {
        let payload = serde_json::json!({
            "status": "error",
            "error": error_kind.as_str(),
            "message": message,
        });
        let mut response = Self::new_response(request, payload);
        response.kind = EnvelopeKind::Error;
        response
    }

    /// Constructs an `ack` envelope acknowledging `request`.
    #[must_use]
    pub fn new_ack(request: &Envelope) -> Self {
        let mut ack = Self::new_response(request, Value::Null);
        ack.kind = EnvelopeKind::Ack;
        ack
    }

    fn recipient_raw_as_agent(&self) -> Option<AgentId> {
        AgentId::try_new(self.recipient_raw.clone()).ok()
    }

    /// Validates an envelope at ingress per §4.1: non-empty `sender`, a
    /// resolvable `recipient` for the declared `kind`, and `ttl_ms >= 0`
    /// (unrepresentable here since the field is unsigned, kept for
    /// documentation of the invariant the type system already enforces).
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.sender.as_ref().is_empty() {
            return Err(CoreError::malformed("sender must not be empty"));
        }
        Recipient::parse(&self.recipient_raw, self.kind)?;
        Ok(())
    }

    /// The envelope's unique id.
    #[must_use]
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// The request this envelope answers, if it is a response/ack/error.
    #[must_use]
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.correlation_id
    }

    /// The sending agent.
    #[must_use]
    pub fn sender(&self) -> &AgentId {
        &self.sender
    }

    /// The resolved recipient (agent, topic, or broadcast).
    pub fn recipient(&self) -> Result<Recipient, CoreError> {
        Recipient::parse(&self.recipient_raw, self.kind)
    }

    /// The raw wire-form recipient string.
    #[must_use]
    pub fn recipient_raw(&self) -> &str {
        &self.recipient_raw
    }

    /// What this envelope is for.
    #[must_use]
    pub fn kind(&self) -> EnvelopeKind {
        self.kind
    }

    /// Delivery priority.
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// The opaque structured payload.
    #[must_use]
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Creation instant.
    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Whether the envelope has exceeded its time-to-live as of now.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.ttl_ms
            .is_some_and(|ttl| self.timestamp.elapsed_ms() > ttl)
    }

    /// Whether the recipient must `ack` this envelope.
    #[must_use]
    pub fn requires_ack(&self) -> bool {
        self.requires_ack
    }

    /// The retry policy governing this envelope's delivery, if any.
    #[must_use]
    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry_policy.as_ref()
    }

    /// Encodes the envelope to a self-describing byte form.
    ///
    /// # Errors
    /// Returns [`CoreError::Serialization`] if the payload cannot be
    /// represented as JSON (never true for values built from
    /// `serde_json::Value`).
    pub fn encode(&self) -> Result<bytes::Bytes, CoreError> {
        let bytes = serde_json::to_vec(self)?;
        Ok(bytes::Bytes::from(bytes))
    }

    /// Decodes an envelope previously produced by [`Envelope::encode`].
    ///
    /// Unknown top-level fields are preserved in `unknown_fields` rather
    /// than rejected, so a newer sender's envelope can still be decoded by
    /// an older build of this crate.
    ///
    /// # Errors
    /// Returns [`CoreError::Serialization`] if `bytes` is not valid encoded
    /// envelope JSON.
    pub fn decode(bytes: &[u8]) -> Result<Self, CoreError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

fn recipient_to_raw(recipient: &Recipient) -> String {
    match recipient {
        Recipient::Agent(id) => id.as_ref().to_string(),
        Recipient::Topic(topic) => topic.as_ref().to_string(),
        Recipient::Broadcast => BROADCAST_RECIPIENT.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(name: &str) -> AgentId {
        AgentId::try_new(name.to_string()).unwrap()
    }

    #[test]
    fn request_round_trips_through_encode_decode() {
        let env = Envelope::new_request(
            agent("sales"),
            Recipient::Agent(agent("technical")),
            serde_json::json!({"rfp_id": "RFP-1"}),
            EnvelopeOptions::default(),
        );
        let bytes = env.encode().unwrap();
        let decoded = Envelope::decode(&bytes).unwrap();
        assert_eq!(decoded.message_id(), env.message_id());
        assert_eq!(decoded.sender(), env.sender());
        assert_eq!(decoded.payload(), env.payload());
    }

    #[test]
    fn response_inherits_correlation_id_from_request() {
        let request = Envelope::new_request(
            agent("sales"),
            Recipient::Agent(agent("technical")),
            Value::Null,
            EnvelopeOptions::default(),
        );
        let response = Envelope::new_response(&request, serde_json::json!({"status": "success"}));
        assert_eq!(
            response.correlation_id(),
            Some(CorrelationId::for_request(request.message_id()))
        );
        assert_eq!(response.kind(), EnvelopeKind::Response);
    }

    #[test]
    fn broadcast_recipient_must_be_wildcard() {
        let mut env = Envelope::new_request(
            agent("sales"),
            Recipient::Agent(agent("technical")),
            Value::Null,
            EnvelopeOptions::default(),
        )
        .with_kind(EnvelopeKind::Broadcast);
        // Force an invalid raw recipient to exercise validation.
        env.recipient_raw = "technical".to_string();
        assert!(env.validate().is_err());
    }

    #[test]
    fn publish_recipient_is_a_topic() {
        let env = Envelope::new_request(
            agent("sales"),
            Recipient::Topic(TopicName::try_new("workflow/progress".to_string()).unwrap()),
            Value::Null,
            EnvelopeOptions::default(),
        )
        .with_kind(EnvelopeKind::Publish);
        assert!(matches!(env.recipient().unwrap(), Recipient::Topic(_)));
    }

    #[test]
    fn ttl_expiry_is_detected() {
        let env = Envelope::new_request(
            agent("sales"),
            Recipient::Agent(agent("technical")),
            Value::Null,
            EnvelopeOptions {
                ttl_ms: Some(0),
                ..Default::default()
            },
        );
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(env.is_expired());
    }

    #[test]
    fn priority_ordering_drains_urgent_first() {
        let lanes = Priority::lanes_high_to_low();
        assert_eq!(lanes[0], Priority::Urgent);
        assert_eq!(lanes[3], Priority::Low);
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }
}
