//! Per-recipient priority queue layer (§4.2).
//!
//! Grounded in the donor's `DeliveryEngineImpl` (`message_router/router.rs`):
//! a `DashMap` keyed by recipient, lazily populated on first reference, with
//! short critical sections per queue (§5 "one lock per queue"). The donor
//! modeled a single FIFO per recipient; this generalizes to four priority
//! lanes, drained urgent before high before normal before low, strictly
//! FIFO within a lane.

use crate::domain_types::{AgentId, QueueCapacity};
use crate::envelope::{Envelope, Priority};
use crate::error::CoreError;
use dashmap::DashMap;
use std::collections::VecDeque;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{instrument, trace, warn};

/// Health tag surfaced via metrics when a queue repeatedly saturates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueHealth {
    /// Below the degraded threshold.
    Healthy,
    /// Saturated past the configured repeat-saturation threshold.
    Degraded,
    /// Saturated far enough, for long enough, to be considered unhealthy.
    Unhealthy,
}

/// Stats tracked per queue (§3 "Queues").
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct QueueStats {
    /// Current size of each priority lane, `[urgent, high, normal, low]`.
    pub size_by_lane: [usize; 4],
    /// Highest total size this queue has ever reached.
    pub high_water_mark: usize,
    /// Lifetime count of successful enqueues.
    pub total_enqueued: u64,
    /// Lifetime count of successful dequeues.
    pub total_dequeued: u64,
    /// Lifetime count of dropped envelopes (deadline, shutdown-discard).
    pub total_dropped: u64,
    /// Age, in milliseconds, of the oldest message still queued.
    pub oldest_message_age_ms: Option<u64>,
    /// Current health tag.
    pub health: QueueHealth,
}

impl Default for QueueStats {
    fn default() -> Self {
        Self {
            size_by_lane: [0; 4],
            high_water_mark: 0,
            total_enqueued: 0,
            total_dequeued: 0,
            total_dropped: 0,
            oldest_message_age_ms: None,
            health: QueueHealth::Healthy,
        }
    }
}

struct Lanes {
    urgent: VecDeque<Envelope>,
    high: VecDeque<Envelope>,
    normal: VecDeque<Envelope>,
    low: VecDeque<Envelope>,
    consecutive_saturations: u32,
}

impl Lanes {
    fn new() -> Self {
        Self {
            urgent: VecDeque::new(),
            high: VecDeque::new(),
            normal: VecDeque::new(),
            low: VecDeque::new(),
            consecutive_saturations: 0,
        }
    }

    fn lane_mut(&mut self, priority: Priority) -> &mut VecDeque<Envelope> {
        match priority {
            Priority::Urgent => &mut self.urgent,
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    fn total_len(&self) -> usize {
        self.urgent.len() + self.high.len() + self.normal.len() + self.low.len()
    }

    fn pop_front_highest(&mut self) -> Option<Envelope> {
        for lane in [&mut self.urgent, &mut self.high, &mut self.normal, &mut self.low] {
            if let Some(env) = lane.pop_front() {
                return Some(env);
            }
        }
        None
    }

    fn sizes(&self) -> [usize; 4] {
        [self.urgent.len(), self.high.len(), self.normal.len(), self.low.len()]
    }
}

struct PerAgentQueue {
    lanes: Mutex<Lanes>,
    notify: Notify,
    capacity: QueueCapacity,
    high_water_mark: std::sync::atomic::AtomicUsize,
    total_enqueued: std::sync::atomic::AtomicU64,
    total_dequeued: std::sync::atomic::AtomicU64,
    total_dropped: std::sync::atomic::AtomicU64,
}

impl PerAgentQueue {
    fn new(capacity: QueueCapacity) -> Self {
        Self {
            lanes: Mutex::new(Lanes::new()),
            notify: Notify::new(),
            capacity,
            high_water_mark: std::sync::atomic::AtomicUsize::new(0),
            total_enqueued: std::sync::atomic::AtomicU64::new(0),
            total_dequeued: std::sync::atomic::AtomicU64::new(0),
            total_dropped: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

const DEGRADED_SATURATION_THRESHOLD: u32 = 3;
const UNHEALTHY_SATURATION_THRESHOLD: u32 = 10;

/// The four-lane priority queue layer, one logical queue per recipient.
pub struct QueueLayer {
    queues: DashMap<AgentId, std::sync::Arc<PerAgentQueue>>,
    default_capacity: QueueCapacity,
}

impl QueueLayer {
    /// Builds an empty queue layer; per-recipient queues are created lazily
    /// on first reference.
    #[must_use]
    pub fn new(default_capacity: QueueCapacity) -> Self {
        Self {
            queues: DashMap::new(),
            default_capacity,
        }
    }

    fn queue_for(&self, agent_id: &AgentId) -> std::sync::Arc<PerAgentQueue> {
        self.queues
            .entry(agent_id.clone())
            .or_insert_with(|| std::sync::Arc::new(PerAgentQueue::new(self.default_capacity)))
            .clone()
    }

    /// Enqueues `env` for `agent_id`, blocking until space is available or
    /// `deadline` elapses.
    ///
    /// # Errors
    /// Returns [`CoreError::QueueFull`] if the queue is still saturated at
    /// `deadline`.
    #[instrument(skip(self, env), fields(agent_id = %agent_id, priority = ?env.priority()))]
    pub async fn enqueue(
        &self,
        agent_id: &AgentId,
        env: Envelope,
        deadline: Instant,
    ) -> Result<(), CoreError> {
        let queue = self.queue_for(agent_id);
        let priority = env.priority();
        let mut env = Some(env);
        loop {
            {
                let mut lanes = queue.lanes.lock().await;
                if lanes.total_len() < queue.capacity.into_inner() {
                    lanes.lane_mut(priority).push_back(env.take().unwrap());
                    let total = lanes.total_len();
                    lanes.consecutive_saturations = 0;
                    drop(lanes);
                    queue
                        .high_water_mark
                        .fetch_max(total, std::sync::atomic::Ordering::Relaxed);
                    queue
                        .total_enqueued
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    queue.notify.notify_waiters();
                    trace!("enqueued");
                    return Ok(());
                }
                lanes.consecutive_saturations += 1;
                if lanes.consecutive_saturations >= UNHEALTHY_SATURATION_THRESHOLD {
                    warn!("queue unhealthy: repeated saturation");
                }
            }
            if Instant::now() >= deadline {
                queue
                    .total_dropped
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return Err(CoreError::QueueFull {
                    agent_id: agent_id.as_ref().to_string(),
                });
            }
            let wait = tokio::time::sleep_until(deadline.min(Instant::now() + tokio::time::Duration::from_millis(10)));
            tokio::select! {
                () = wait => {}
                () = queue.notify.notified() => {}
            }
        }
    }

    /// Dequeues the next envelope for `agent_id`, draining `urgent` until
    /// empty, then `high`, `normal`, `low`. Blocks until a message arrives
    /// or `deadline` elapses.
    ///
    /// # Errors
    /// Returns [`CoreError::Timeout`] if no envelope arrives before
    /// `deadline`.
    #[instrument(skip(self), fields(agent_id = %agent_id))]
    pub async fn dequeue(&self, agent_id: &AgentId, deadline: Instant) -> Result<Envelope, CoreError> {
        let queue = self.queue_for(agent_id);
        loop {
            {
                let mut lanes = queue.lanes.lock().await;
                if let Some(env) = lanes.pop_front_highest() {
                    drop(lanes);
                    queue
                        .total_dequeued
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    queue.notify.notify_waiters();
                    trace!("dequeued");
                    return Ok(env);
                }
            }
            if Instant::now() >= deadline {
                return Err(CoreError::Timeout {
                    timeout_ms: 0,
                });
            }
            let wait = tokio::time::sleep_until(deadline.min(Instant::now() + tokio::time::Duration::from_millis(10)));
            tokio::select! {
                () = wait => {}
                () = queue.notify.notified() => {}
            }
        }
    }

    /// Reads current stats for `agent_id`'s queue without consuming any
    /// envelope. Unreferenced agents report an empty, healthy queue.
    pub async fn stats(&self, agent_id: &AgentId) -> QueueStats {
        let Some(queue) = self.queues.get(agent_id).map(|q| q.clone()) else {
            return QueueStats::default();
        };
        let lanes = queue.lanes.lock().await;
        let oldest_ms = [&lanes.urgent, &lanes.high, &lanes.normal, &lanes.low]
            .iter()
            .filter_map(|lane| lane.front())
            .map(|env| env.timestamp().elapsed_ms())
            .max();
        let saturations = lanes.consecutive_saturations;
        let health = if saturations >= UNHEALTHY_SATURATION_THRESHOLD {
            QueueHealth::Unhealthy
        } else if saturations >= DEGRADED_SATURATION_THRESHOLD {
            QueueHealth::Degraded
        } else {
            QueueHealth::Healthy
        };
        QueueStats {
            size_by_lane: lanes.sizes(),
            high_water_mark: queue.high_water_mark.load(std::sync::atomic::Ordering::Relaxed),
            total_enqueued: queue.total_enqueued.load(std::sync::atomic::Ordering::Relaxed),
            total_dequeued: queue.total_dequeued.load(std::sync::atomic::Ordering::Relaxed),
            total_dropped: queue.total_dropped.load(std::sync::atomic::Ordering::Relaxed),
            oldest_message_age_ms: oldest_ms,
            health,
        }
    }

    /// Total size across all currently-referenced queues, for the
    /// workflow engine's agent-selection tie-break (lowest queue size
    /// first).
    pub async fn size(&self, agent_id: &AgentId) -> usize {
        self.stats(agent_id).await.size_by_lane.iter().sum()
    }

    /// Discards every queued envelope for `agent_id` (shutdown's default
    /// discard-with-trace policy). Returns the number dropped.
    pub async fn discard_all(&self, agent_id: &AgentId) -> usize {
        let Some(queue) = self.queues.get(agent_id).map(|q| q.clone()) else {
            return 0;
        };
        let mut lanes = queue.lanes.lock().await;
        let dropped = lanes.total_len();
        *lanes = Lanes::new();
        drop(lanes);
        queue
            .total_dropped
            .fetch_add(dropped as u64, std::sync::atomic::Ordering::Relaxed);
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{EnvelopeOptions, Recipient};

    fn agent(name: &str) -> AgentId {
        AgentId::try_new(name.to_string()).unwrap()
    }

    fn request(sender: &str, recipient: &str, priority: Priority) -> Envelope {
        Envelope::new_request(
            agent(sender),
            Recipient::Agent(agent(recipient)),
            serde_json::Value::Null,
            EnvelopeOptions {
                priority,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn urgent_overtakes_earlier_normal_messages() {
        let layer = QueueLayer::new(QueueCapacity::try_new(100).unwrap());
        let recipient = agent("slow");
        let deadline = Instant::now() + tokio::time::Duration::from_secs(1);
        for _ in 0..100 {
            layer
                .enqueue(&recipient, request("caller", "slow", Priority::Normal), deadline)
                .await
                .unwrap();
        }
        layer
            .enqueue(&recipient, request("caller", "slow", Priority::Urgent), deadline)
            .await
            .unwrap();

        let first = layer.dequeue(&recipient, deadline).await.unwrap();
        assert_eq!(first.priority(), Priority::Urgent);
        for _ in 0..100 {
            let next = layer.dequeue(&recipient, deadline).await.unwrap();
            assert_eq!(next.priority(), Priority::Normal);
        }
    }

    #[tokio::test]
    async fn fifo_within_the_same_priority_lane() {
        let layer = QueueLayer::new(QueueCapacity::try_new(10).unwrap());
        let recipient = agent("worker");
        let deadline = Instant::now() + tokio::time::Duration::from_secs(1);
        let first = request("a", "worker", Priority::Normal);
        let second = request("b", "worker", Priority::Normal);
        let first_id = first.message_id();
        let second_id = second.message_id();
        layer.enqueue(&recipient, first, deadline).await.unwrap();
        layer.enqueue(&recipient, second, deadline).await.unwrap();

        let out1 = layer.dequeue(&recipient, deadline).await.unwrap();
        let out2 = layer.dequeue(&recipient, deadline).await.unwrap();
        assert_eq!(out1.message_id(), first_id);
        assert_eq!(out2.message_id(), second_id);
    }

    #[tokio::test]
    async fn enqueue_fails_with_queue_full_past_deadline() {
        let layer = QueueLayer::new(QueueCapacity::try_new(1).unwrap());
        let recipient = agent("tiny");
        let long_deadline = Instant::now() + tokio::time::Duration::from_secs(1);
        layer
            .enqueue(&recipient, request("a", "tiny", Priority::Normal), long_deadline)
            .await
            .unwrap();

        let short_deadline = Instant::now() + tokio::time::Duration::from_millis(20);
        let result = layer
            .enqueue(&recipient, request("b", "tiny", Priority::Normal), short_deadline)
            .await;
        assert!(matches!(result, Err(CoreError::QueueFull { .. })));
    }

    #[tokio::test]
    async fn dequeue_times_out_on_empty_queue() {
        let layer = QueueLayer::new(QueueCapacity::try_new(10).unwrap());
        let recipient = agent("idle");
        let deadline = Instant::now() + tokio::time::Duration::from_millis(20);
        let result = layer.dequeue(&recipient, deadline).await;
        assert!(matches!(result, Err(CoreError::Timeout { .. })));
    }

    #[tokio::test]
    async fn stats_reports_per_lane_sizes() {
        let layer = QueueLayer::new(QueueCapacity::try_new(10).unwrap());
        let recipient = agent("watched");
        let deadline = Instant::now() + tokio::time::Duration::from_secs(1);
        layer
            .enqueue(&recipient, request("a", "watched", Priority::High), deadline)
            .await
            .unwrap();
        let stats = layer.stats(&recipient).await;
        assert_eq!(stats.size_by_lane, [0, 1, 0, 0]);
        assert_eq!(stats.total_enqueued, 1);
    }
}
