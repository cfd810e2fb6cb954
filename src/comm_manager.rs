//! Communication Manager (§4.7): the single façade every agent and the
//! workflow engine talk to.
//!
//! Grounded in the donor's `MessageRouter` trait and its `MessageRouterImpl`
//! composition root (`message_router/router.rs`), which already wired a
//! queue, registry, and metrics collector behind one object. This module
//! does the same composition for real, adding the breaker, tracer, and a
//! request/response correlation table the donor never implemented.

use crate::breaker::BreakerRegistry;
use crate::domain_types::{
    AgentId, AgentType, BreakerCooldownMs, BreakerThreshold, CapabilityName, QueueCapacity,
    TimeoutMs, TopicName,
};
use crate::envelope::{Envelope, EnvelopeKind, Recipient};
use crate::error::CoreError;
use crate::kv::KvStore;
use crate::metrics::{MetricsEvent, MetricsSnapshot, MetricsWorker};
use crate::queue::{QueueHealth, QueueLayer, QueueStats};
use crate::registry::{AgentRegistry, AgentStatus, RegistryEntry, RegistryNotification};
use crate::tracer::{HopKind, TraceRecord, Tracer, TracerEvent};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{instrument, warn};
use uuid::Uuid;

const STATE_NAMESPACE: &str = "agents/state";
const DLQ_NAMESPACE: &str = "dlq";
const DEFAULT_ENQUEUE_WAIT: Duration = Duration::from_secs(5);

/// Tunables the façade is built with. Defaults mirror the domain types'
/// own defaults.
#[derive(Debug, Clone)]
pub struct CommManagerConfig {
    /// Per-recipient queue bound.
    pub queue_capacity: QueueCapacity,
    /// Heartbeat age past which a registry entry goes `unavailable`.
    pub stale_after: Duration,
    /// How often the registry sweeps for stale heartbeats.
    pub sweep_interval: Duration,
    /// Consecutive-failure threshold before a destination's breaker opens.
    pub breaker_threshold: BreakerThreshold,
    /// Base breaker cooldown.
    pub breaker_cooldown: BreakerCooldownMs,
    /// Ceiling the exponentially-extended cooldown may reach.
    pub breaker_cooldown_cap: Duration,
    /// Ring buffer size for the tracer.
    pub tracer_capacity: usize,
    /// Rolling sample window for latency percentiles.
    pub metrics_window: usize,
    /// How long a dead-lettered envelope is retained in the `dlq` namespace
    /// before it expires, milliseconds.
    pub dlq_retention_ms: u64,
}

impl Default for CommManagerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: QueueCapacity::default(),
            stale_after: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
            breaker_threshold: BreakerThreshold::default(),
            breaker_cooldown: BreakerCooldownMs::default(),
            breaker_cooldown_cap: Duration::from_secs(60),
            tracer_capacity: 10_000,
            metrics_window: 10_000,
            dlq_retention_ms: 86_400_000,
        }
    }
}

/// The per-recipient outcome of a `broadcast`/`publish` fan-out.
#[derive(Debug, Clone)]
pub struct FanoutOutcome {
    /// The recipient the fan-out attempted delivery to.
    pub agent_id: AgentId,
    /// Whether delivery onto that recipient's queue succeeded.
    pub result: Result<(), String>,
}

/// The single object every agent, the workflow engine, and the operator
/// API talk to for messaging, state, and observability.
pub struct CommunicationManager {
    queue: QueueLayer,
    registry: Arc<AgentRegistry>,
    breakers: BreakerRegistry,
    tracer: Tracer,
    tracer_handle: crate::tracer::TracerHandle,
    metrics: MetricsWorker,
    topics: DashMap<TopicName, HashSet<AgentId>>,
    pending: DashMap<Uuid, oneshot::Sender<Envelope>>,
    kv: Arc<dyn KvStore>,
    default_enqueue_wait: Duration,
    dlq_retention_ms: u64,
}

impl CommunicationManager {
    /// Builds the façade and spawns its background workers (tracer,
    /// metrics, registry sweeper). Returns the manager plus the receiving
    /// end of the registry's `system/registry` notification channel.
    #[must_use]
    pub fn new(
        config: CommManagerConfig,
        kv: Arc<dyn KvStore>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<RegistryNotification>) {
        let (registry, notifications) = AgentRegistry::new(config.stale_after);
        registry.spawn_sweeper(config.sweep_interval);
        let (tracer, tracer_handle) = Tracer::spawn(config.tracer_capacity);
        let metrics = MetricsWorker::spawn(config.metrics_window);
        let manager = Arc::new(Self {
            queue: QueueLayer::new(config.queue_capacity),
            registry,
            breakers: BreakerRegistry::new(
                config.breaker_threshold,
                config.breaker_cooldown,
                config.breaker_cooldown_cap,
            ),
            tracer,
            tracer_handle,
            metrics,
            topics: DashMap::new(),
            pending: DashMap::new(),
            kv,
            default_enqueue_wait: DEFAULT_ENQUEUE_WAIT,
            dlq_retention_ms: config.dlq_retention_ms,
        });
        (manager, notifications)
    }

    /// Registers an agent with the directory.
    pub fn register_agent(
        &self,
        agent_id: AgentId,
        agent_type: AgentType,
        capabilities: Vec<CapabilityName>,
        metadata: Value,
    ) {
        self.registry.register(agent_id, agent_type, capabilities, metadata);
    }

    /// Records a heartbeat for `agent_id`.
    ///
    /// # Errors
    /// Returns [`CoreError::NotFound`] if the agent is not registered.
    pub fn heartbeat(&self, agent_id: &AgentId) -> Result<(), CoreError> {
        self.registry.heartbeat(agent_id)
    }

    /// Every agent advertising `capability`, excluding `unavailable` ones.
    #[must_use]
    pub fn lookup_by_capability(&self, capability: &CapabilityName) -> Vec<RegistryEntry> {
        self.registry.lookup_by_capability(capability)
    }

    /// Every agent of `agent_type`, excluding `unavailable` ones.
    #[must_use]
    pub fn lookup_by_type(&self, agent_type: &AgentType) -> Vec<RegistryEntry> {
        self.registry.lookup_by_type(agent_type)
    }

    /// Picks the best agent of `agent_type` for dispatch, per the
    /// workflow engine's tie-break: lowest current queue size first, then
    /// lowest p95 end-to-end latency, then first registered.
    pub async fn select_agent(&self, agent_type: &AgentType) -> Option<AgentId> {
        let candidates = self.registry.lookup_by_type(agent_type);
        if candidates.is_empty() {
            return None;
        }
        let p95 = self.metrics.snapshot().end_to_end_latency.p95_ms.unwrap_or(0);
        let mut scored = Vec::with_capacity(candidates.len());
        for (index, entry) in candidates.into_iter().enumerate() {
            let queue_size = self.queue.size(&entry.agent_id).await;
            scored.push((queue_size, p95, index, entry.agent_id));
        }
        scored.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
        scored.into_iter().next().map(|(_, _, _, id)| id)
    }

    fn enqueue_deadline(&self) -> Instant {
        Instant::now() + self.default_enqueue_wait
    }

    /// Delivers `envelope` to its resolved recipient: an agent's queue, a
    /// topic's subscribers, or every registered agent, depending on kind.
    ///
    /// A `response`/`error`/`ack` whose `correlation_id` matches an
    /// in-flight [`request`](Self::request) call is routed directly to
    /// that caller instead of being queued.
    ///
    /// # Errors
    /// Returns [`CoreError::BreakerOpen`] if the destination's breaker is
    /// open, or [`CoreError::QueueFull`] if its queue is saturated past
    /// the enqueue deadline.
    #[instrument(skip(self, envelope), fields(message_id = %envelope.message_id()))]
    pub async fn send(&self, envelope: Envelope) -> Result<(), CoreError> {
        envelope.validate()?;
        self.metrics.handle().record(MetricsEvent::Sent {
            kind: envelope.kind(),
            priority: envelope.priority(),
        });

        if matches!(envelope.kind(), EnvelopeKind::Response | EnvelopeKind::Error | EnvelopeKind::Ack) {
            if let Some(correlation_id) = envelope.correlation_id() {
                let key: Uuid = correlation_id.into();
                if let Some((_, waiter)) = self.pending.remove(&key) {
                    let _ = waiter.send(envelope);
                    return Ok(());
                }
            }
        }

        match envelope.recipient()? {
            Recipient::Agent(agent_id) => self.deliver_to_agent(&agent_id, envelope).await,
            Recipient::Topic(topic) => {
                self.publish(&topic, envelope).await?;
                Ok(())
            }
            Recipient::Broadcast => {
                self.broadcast(envelope).await;
                Ok(())
            }
        }
    }

    async fn deliver_to_agent(&self, agent_id: &AgentId, envelope: Envelope) -> Result<(), CoreError> {
        if let Err(open) = self.breakers.try_acquire(agent_id) {
            if open {
                self.metrics.handle().record(MetricsEvent::Failed {
                    kind: envelope.kind(),
                    priority: envelope.priority(),
                });
                return Err(CoreError::BreakerOpen {
                    destination: agent_id.as_ref().to_string(),
                });
            }
        }

        let deadline = self.enqueue_deadline();
        let message_id = envelope.message_id();
        let sender = envelope.sender().as_ref().to_string();
        let kind = envelope.kind();
        let priority = envelope.priority();
        match self.queue.enqueue(agent_id, envelope, deadline).await {
            Ok(()) => {
                self.breakers.record_success(agent_id);
                self.tracer_handle.record(TracerEvent {
                    message_id,
                    sender,
                    recipient: agent_id.as_ref().to_string(),
                    hop: HopKind::Enqueued,
                    error: None,
                });
                Ok(())
            }
            Err(err) => {
                self.breakers.record_failure(agent_id);
                self.metrics.handle().record(MetricsEvent::Failed { kind, priority });
                warn!(agent_id = %agent_id, error = %err, "delivery failed");
                Err(err)
            }
        }
    }

    /// Sends `envelope` (which must be an `EnvelopeKind::Request` addressed
    /// to a specific agent) and awaits its `response`, retrying per the
    /// envelope's `retry_policy` on transient failures.
    ///
    /// # Errors
    /// Returns [`CoreError::Exhausted`] once `max_attempts` is reached,
    /// [`CoreError::Cancelled`] if the caller's deadline elapses first, or
    /// whatever terminal error the final attempt produced.
    pub async fn request(&self, envelope: Envelope, timeout: TimeoutMs) -> Result<Envelope, CoreError> {
        self.request_with_attempts(envelope, timeout).await.map(|(response, _attempts)| response)
    }

    /// Same as [`Self::request`], but also returns how many attempts the
    /// delivery took, so callers that persist a stage-style audit trail
    /// (§4.8 "every stage records `{..., attempts}`") don't have to
    /// rediscover it from metrics.
    ///
    /// # Errors
    /// See [`Self::request`].
    #[instrument(skip(self, envelope), fields(message_id = %envelope.message_id()))]
    pub async fn request_with_attempts(&self, envelope: Envelope, timeout: TimeoutMs) -> Result<(Envelope, u8), CoreError> {
        let policy = envelope.retry_policy().copied().unwrap_or_default();
        let strategy = policy.strategy;
        let max = policy.max_attempts.into_inner();
        let mut last_error = None;

        for attempt in 1..=u32::from(max) {
            let message_id = envelope.message_id();
            let key: Uuid = message_id.into();
            let (tx, rx) = oneshot::channel();
            self.pending.insert(key, tx);

            let send_result = self.send(envelope.clone()).await;
            let outcome = match send_result {
                Err(err) => Err(err),
                Ok(()) => match tokio::time::timeout(timeout.as_duration(), rx).await {
                    Ok(Ok(response)) => Ok(response),
                    Ok(Err(_)) => Err(CoreError::Cancelled),
                    Err(_) => Err(CoreError::Timeout {
                        timeout_ms: timeout.into_inner(),
                    }),
                },
            };
            self.pending.remove(&key);

            match outcome {
                Ok(response) => {
                    self.metrics.handle().record(MetricsEvent::Delivered {
                        kind: envelope.kind(),
                        priority: envelope.priority(),
                        latency_ms: envelope.timestamp().elapsed_ms(),
                    });
                    return Ok((response, attempt as u8));
                }
                Err(err) if err.kind().is_retryable_by_default() && attempt < u32::from(max) => {
                    self.metrics.handle().record(MetricsEvent::Retried {
                        kind: envelope.kind(),
                        priority: envelope.priority(),
                    });
                    tokio::time::sleep(strategy.jittered_delay(attempt)).await;
                    last_error = Some(err);
                }
                Err(err) => {
                    last_error = Some(err);
                    break;
                }
            }
        }

        self.metrics.handle().record(MetricsEvent::DeadLettered {
            kind: envelope.kind(),
            priority: envelope.priority(),
        });
        let last_error = last_error.map(|e| e.to_string()).unwrap_or_default();
        self.dead_letter(&envelope, max, &last_error).await;
        Err(CoreError::Exhausted {
            attempts: max,
            last_error,
        })
    }

    /// Records an exhausted request under the `dlq` namespace (§4.4, §8
    /// "DLQ completeness"), so operators can inspect and replay it later.
    /// A failure to write the dead letter itself is logged but never
    /// escalated: the caller still needs `Exhausted` to propagate.
    async fn dead_letter(&self, envelope: &Envelope, attempts: u8, last_error: &str) {
        let record = serde_json::json!({
            "message_id": envelope.message_id(),
            "sender": envelope.sender().as_ref(),
            "recipient": envelope.recipient_raw(),
            "kind": envelope.kind(),
            "priority": envelope.priority(),
            "payload": envelope.payload(),
            "attempts": attempts,
            "last_error": last_error,
            "dead_lettered_at": crate::domain_types::Timestamp::now(),
        });
        if let Err(err) = self
            .kv
            .set(DLQ_NAMESPACE, &envelope.message_id().to_string(), record, Some(self.dlq_retention_ms))
            .await
        {
            warn!(message_id = %envelope.message_id(), error = %err, "failed to write dead-letter entry");
        }
    }

    /// Subscribes `agent_id` to `topic`; future `publish`es to it are
    /// delivered to the agent's queue.
    pub fn subscribe(&self, topic: TopicName, agent_id: AgentId) {
        self.topics.entry(topic).or_default().insert(agent_id);
    }

    /// Removes `agent_id` from `topic`'s subscriber set.
    pub fn unsubscribe(&self, topic: &TopicName, agent_id: &AgentId) {
        if let Some(mut subscribers) = self.topics.get_mut(topic) {
            subscribers.remove(agent_id);
        }
    }

    /// Delivers `envelope` to every current subscriber of `topic`,
    /// independently of one another: one subscriber's full queue does not
    /// block or fail delivery to the rest.
    ///
    /// # Errors
    /// Never returns `Err`; per-recipient failures are reported in the
    /// returned outcome list.
    pub async fn publish(&self, topic: &TopicName, envelope: Envelope) -> Result<Vec<FanoutOutcome>, CoreError> {
        let subscribers: Vec<AgentId> = self
            .topics
            .get(topic)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        let mut outcomes = Vec::with_capacity(subscribers.len());
        for agent_id in subscribers {
            let result = self
                .deliver_to_agent(&agent_id, envelope.clone())
                .await
                .map_err(|e| e.to_string());
            outcomes.push(FanoutOutcome { agent_id, result });
        }
        Ok(outcomes)
    }

    /// Delivers `envelope` to every registered, non-`unavailable` agent
    /// (fire-and-forget; per-recipient outcomes recorded but not
    /// individually surfaced to the sender).
    pub async fn broadcast(&self, envelope: Envelope) -> Vec<FanoutOutcome> {
        let recipients: Vec<AgentId> = self
            .registry
            .list()
            .into_iter()
            .filter(|entry| entry.status != AgentStatus::Unavailable)
            .map(|entry| entry.agent_id)
            .collect();
        let mut outcomes = Vec::with_capacity(recipients.len());
        for agent_id in recipients {
            let result = self
                .deliver_to_agent(&agent_id, envelope.clone())
                .await
                .map_err(|e| e.to_string());
            outcomes.push(FanoutOutcome { agent_id, result });
        }
        outcomes
    }

    /// Dequeues the next envelope addressed to `agent_id`, blocking until
    /// one arrives or `deadline` elapses.
    ///
    /// # Errors
    /// Returns [`CoreError::Timeout`] if nothing arrives before `deadline`.
    pub async fn receive(&self, agent_id: &AgentId, deadline: Instant) -> Result<Envelope, CoreError> {
        let envelope = self.queue.dequeue(agent_id, deadline).await?;
        self.tracer_handle.record(TracerEvent {
            message_id: envelope.message_id(),
            sender: envelope.sender().as_ref().to_string(),
            recipient: agent_id.as_ref().to_string(),
            hop: HopKind::Dequeued,
            error: None,
        });
        Ok(envelope)
    }

    /// Sends an `ack` for `request` back to its sender.
    ///
    /// # Errors
    /// Propagates whatever [`send`](Self::send) returns.
    pub async fn ack(&self, request: &Envelope) -> Result<(), CoreError> {
        self.send(Envelope::new_ack(request)).await
    }

    /// Reads `agent_id`'s persisted key-value state under
    /// `agents/state/<agent_id>`.
    ///
    /// # Errors
    /// Returns [`CoreError::Storage`]-family errors from the backing store.
    pub async fn get_state(&self, agent_id: &AgentId) -> Result<Option<Value>, CoreError> {
        self.kv.get(STATE_NAMESPACE, agent_id.as_ref()).await
    }

    /// Writes `agent_id`'s persisted key-value state.
    ///
    /// # Errors
    /// Returns [`CoreError::Storage`]-family errors from the backing store.
    pub async fn set_state(&self, agent_id: &AgentId, value: Value) -> Result<(), CoreError> {
        self.kv.set(STATE_NAMESPACE, agent_id.as_ref(), value, None).await
    }

    /// The trace recorded for `message_id`, if still within the tracer's
    /// ring buffer window.
    #[must_use]
    pub fn trace(&self, message_id: crate::domain_types::MessageId) -> Option<TraceRecord> {
        self.tracer.trace(message_id)
    }

    /// Current queue stats for `agent_id`.
    pub async fn queue_stats(&self, agent_id: &AgentId) -> QueueStats {
        self.queue.stats(agent_id).await
    }

    /// Current breaker phase/counters for `agent_id`.
    #[must_use]
    pub fn breaker_snapshot(&self, agent_id: &AgentId) -> crate::breaker::BreakerSnapshot {
        self.breakers.snapshot(agent_id)
    }

    /// A full read of accumulated counters and latency percentiles.
    #[must_use]
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Records a stage's duration against the metrics histogram, for the
    /// workflow engine's per-stage timing telemetry.
    pub fn record_stage_duration(&self, stage: &str, duration_ms: u64) {
        self.metrics.handle().record(MetricsEvent::StageDuration {
            stage: stage.to_string(),
            duration_ms,
        });
    }

    /// Every registered agent, `unavailable` ones included.
    #[must_use]
    pub fn list_agents(&self) -> Vec<RegistryEntry> {
        self.registry.list()
    }

    /// Builds the `GET /health` payload (§6): the worst queue health tag,
    /// the worst breaker phase, and KV reachability, rolled up into one
    /// overall status.
    pub async fn health_report(&self) -> HealthReport {
        let agents = self.registry.list();

        let mut queue_status = HealthStatus::Healthy;
        for entry in &agents {
            let stats = self.queue.stats(&entry.agent_id).await;
            queue_status = queue_status.worst_of(match stats.health {
                QueueHealth::Healthy => HealthStatus::Healthy,
                QueueHealth::Degraded => HealthStatus::Degraded,
                QueueHealth::Unhealthy => HealthStatus::Unhealthy,
            });
        }

        let mut breaker_status = HealthStatus::Healthy;
        for entry in &agents {
            let snapshot = self.breakers.snapshot(&entry.agent_id);
            breaker_status = breaker_status.worst_of(match snapshot.phase {
                crate::breaker::BreakerPhase::Closed => HealthStatus::Healthy,
                crate::breaker::BreakerPhase::HalfOpen => HealthStatus::Degraded,
                crate::breaker::BreakerPhase::Open => HealthStatus::Unhealthy,
            });
        }

        let kv_status = if self.kv.keys(STATE_NAMESPACE).await.is_ok() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };

        let mut components = HashMap::new();
        components.insert(
            "queues".to_string(),
            ComponentHealth {
                status: queue_status,
                detail: format!("{} registered agent queues", agents.len()),
            },
        );
        components.insert(
            "breakers".to_string(),
            ComponentHealth {
                status: breaker_status,
                detail: format!("{} per-destination circuit breakers", agents.len()),
            },
        );
        components.insert(
            "kv".to_string(),
            ComponentHealth {
                status: kv_status,
                detail: "key-value store reachability".to_string(),
            },
        );

        HealthReport {
            status: queue_status.worst_of(breaker_status).worst_of(kv_status),
            components,
        }
    }
}

/// A component or overall health tag (§6 `GET /health`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Operating normally.
    Healthy,
    /// Degraded but still serving traffic.
    Degraded,
    /// Not serving traffic reliably.
    Unhealthy,
}

impl HealthStatus {
    /// The more severe of `self` and `other`.
    #[must_use]
    pub fn worst_of(self, other: Self) -> Self {
        self.max(other)
    }
}

/// One named component's contribution to the overall [`HealthReport`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ComponentHealth {
    /// This component's status.
    pub status: HealthStatus,
    /// A short human-readable detail string.
    pub detail: String,
}

/// The `GET /health` payload (§6): `{status, components{...}}`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HealthReport {
    /// The worst status among `components`.
    pub status: HealthStatus,
    /// Per-component health, keyed by component name.
    pub components: HashMap<String, ComponentHealth>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeOptions;
    use crate::kv::memory::MemoryKvStore;

    fn agent(name: &str) -> AgentId {
        AgentId::try_new(name.to_string()).unwrap()
    }

    fn kv() -> Arc<dyn KvStore> {
        Arc::new(MemoryKvStore::new("/tmp/comm-manager-test.ndjson"))
    }

    #[tokio::test]
    async fn health_report_is_healthy_with_no_registered_agents() {
        let (manager, _notifications) = CommunicationManager::new(CommManagerConfig::default(), kv());
        let report = manager.health_report().await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.components["queues"].status, HealthStatus::Healthy);
        assert_eq!(report.components["breakers"].status, HealthStatus::Healthy);
        assert_eq!(report.components["kv"].status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn health_report_turns_unhealthy_once_a_breaker_opens() {
        let (manager, _notifications) = CommunicationManager::new(
            CommManagerConfig {
                breaker_threshold: crate::domain_types::BreakerThreshold::try_new(1).unwrap(),
                ..CommManagerConfig::default()
            },
            kv(),
        );
        manager.register_agent(agent("technical"), AgentType::try_new("technical".into()).unwrap(), vec![], Value::Null);
        manager.breakers.record_failure(&agent("technical"));

        let report = manager.health_report().await;
        assert_eq!(report.components["breakers"].status, HealthStatus::Unhealthy);
        assert_eq!(report.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn notification_delivered_to_registered_recipient_queue() {
        let (manager, _notifications) = CommunicationManager::new(CommManagerConfig::default(), kv());
        manager.register_agent(agent("technical"), AgentType::try_new("technical".into()).unwrap(), vec![], Value::Null);
        let envelope = Envelope::new_request(
            agent("sales"),
            Recipient::Agent(agent("technical")),
            serde_json::json!({"rfp_id": "RFP-1"}),
            EnvelopeOptions::default(),
        )
        .with_kind(EnvelopeKind::Notification);
        manager.send(envelope).await.unwrap();
        let received = manager
            .receive(&agent("technical"), Instant::now() + Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(received.kind(), EnvelopeKind::Notification);
    }

    #[tokio::test]
    async fn request_resolves_once_matching_response_sent() {
        let (manager, _notifications) = CommunicationManager::new(CommManagerConfig::default(), kv());
        manager.register_agent(agent("technical"), AgentType::try_new("technical".into()).unwrap(), vec![], Value::Null);
        let request_envelope = Envelope::new_request(
            agent("sales"),
            Recipient::Agent(agent("technical")),
            serde_json::json!({"rfp_id": "RFP-1"}),
            EnvelopeOptions::default(),
        );
        let request_id = request_envelope.message_id();

        let manager_for_responder = Arc::clone(&manager);
        tokio::spawn(async move {
            let received = manager_for_responder
                .receive(&agent("technical"), Instant::now() + Duration::from_secs(1))
                .await
                .unwrap();
            let response = Envelope::new_response(&received, serde_json::json!({"status": "ok"}));
            manager_for_responder.send(response).await.unwrap();
        });

        let response = manager
            .request(request_envelope, TimeoutMs::try_new(1_000).unwrap())
            .await
            .unwrap();
        assert_eq!(response.payload(), &serde_json::json!({"status": "ok"}));
        let correlation_uuid: Option<Uuid> = response.correlation_id().map(Into::into);
        let request_uuid: Uuid = request_id.into();
        assert_eq!(correlation_uuid, Some(request_uuid));
    }

    #[tokio::test]
    async fn request_with_attempts_reports_the_retry_that_resolved_it() {
        let (manager, _notifications) = CommunicationManager::new(CommManagerConfig::default(), kv());
        manager.register_agent(agent("technical"), AgentType::try_new("technical".into()).unwrap(), vec![], Value::Null);
        let envelope = Envelope::new_request(
            agent("sales"),
            Recipient::Agent(agent("technical")),
            serde_json::json!({"rfp_id": "RFP-1"}),
            EnvelopeOptions {
                retry_policy: Some(crate::retry::RetryPolicy {
                    strategy: crate::retry::BackoffStrategy::Immediate,
                    max_attempts: crate::domain_types::MaxAttempts::try_new(2).unwrap(),
                }),
                ..Default::default()
            },
        );

        // No responder is listening for the first attempt's deadline, so
        // it times out and retries; the responder only wakes up in time
        // for the second.
        let responder = Arc::clone(&manager);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            let received = responder
                .receive(&agent("technical"), Instant::now() + Duration::from_secs(1))
                .await
                .unwrap();
            let response = Envelope::new_response(&received, serde_json::json!({"status": "ok"}));
            responder.send(response).await.unwrap();
        });

        let (response, attempts) = manager
            .request_with_attempts(envelope, TimeoutMs::try_new(40).unwrap())
            .await
            .unwrap();
        assert_eq!(response.payload(), &serde_json::json!({"status": "ok"}));
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_registered_agent() {
        let (manager, _notifications) = CommunicationManager::new(CommManagerConfig::default(), kv());
        manager.register_agent(agent("a"), AgentType::try_new("t".into()).unwrap(), vec![], Value::Null);
        manager.register_agent(agent("b"), AgentType::try_new("t".into()).unwrap(), vec![], Value::Null);
        let envelope = Envelope::new_request(agent("sales"), Recipient::Broadcast, Value::Null, EnvelopeOptions::default())
            .with_kind(EnvelopeKind::Broadcast);
        manager.send(envelope).await.unwrap();
        assert!(manager.receive(&agent("a"), Instant::now() + Duration::from_millis(100)).await.is_ok());
        assert!(manager.receive(&agent("b"), Instant::now() + Duration::from_millis(100)).await.is_ok());
    }

    #[tokio::test]
    async fn topic_publish_reaches_only_subscribers() {
        let (manager, _notifications) = CommunicationManager::new(CommManagerConfig::default(), kv());
        manager.register_agent(agent("a"), AgentType::try_new("t".into()).unwrap(), vec![], Value::Null);
        manager.register_agent(agent("b"), AgentType::try_new("t".into()).unwrap(), vec![], Value::Null);
        let topic = TopicName::try_new("workflow/progress".to_string()).unwrap();
        manager.subscribe(topic.clone(), agent("a"));
        let envelope = Envelope::new_request(
            agent("sales"),
            Recipient::Topic(topic),
            Value::Null,
            EnvelopeOptions::default(),
        )
        .with_kind(EnvelopeKind::Publish);
        manager.send(envelope).await.unwrap();
        assert!(manager.receive(&agent("a"), Instant::now() + Duration::from_millis(100)).await.is_ok());
        assert!(manager.receive(&agent("b"), Instant::now() + Duration::from_millis(20)).await.is_err());
    }

    #[tokio::test]
    async fn agent_state_roundtrips_through_kv() {
        let (manager, _notifications) = CommunicationManager::new(CommManagerConfig::default(), kv());
        manager.set_state(&agent("sales"), serde_json::json!({"busy": true})).await.unwrap();
        assert_eq!(manager.get_state(&agent("sales")).await.unwrap(), Some(serde_json::json!({"busy": true})));
    }

    #[tokio::test]
    async fn exhausted_request_writes_a_dead_letter_entry() {
        let kv_store = kv();
        let (manager, _notifications) = CommunicationManager::new(CommManagerConfig::default(), Arc::clone(&kv_store));
        manager.register_agent(agent("technical"), AgentType::try_new("technical".into()).unwrap(), vec![], Value::Null);
        // Nobody ever receives, so every attempt times out; `Timeout` is
        // retryable by default, so this runs to exhaustion rather than
        // failing on the first attempt.
        let envelope = Envelope::new_request(
            agent("sales"),
            Recipient::Agent(agent("technical")),
            serde_json::json!({"rfp_id": "RFP-1"}),
            EnvelopeOptions {
                retry_policy: Some(crate::retry::RetryPolicy {
                    strategy: crate::retry::BackoffStrategy::Immediate,
                    max_attempts: crate::domain_types::MaxAttempts::try_new(2).unwrap(),
                }),
                ..Default::default()
            },
        );
        let message_id = envelope.message_id();

        let result = manager.request(envelope, TimeoutMs::try_new(30).unwrap()).await;
        assert!(matches!(result, Err(CoreError::Exhausted { attempts: 2, .. })));

        let dead_letter = kv_store.get("dlq", &message_id.to_string()).await.unwrap();
        let dead_letter = dead_letter.expect("exhausted request should have been dead-lettered");
        assert_eq!(dead_letter["attempts"], 2);
        assert_eq!(dead_letter["recipient"], "technical");
    }
}
