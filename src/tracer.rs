//! Tracer (§4.5): records each message's journey through the fabric.
//!
//! Grounded in §5's "non-blocking channel to a dedicated worker" policy and
//! the donor's `MessageRouter`/`MetricsCollector` trait split
//! (`message_router/traits.rs`). Every component sends hop events over an
//! unbounded channel; a single worker task owns the ring buffer so senders
//! never block on tracer bookkeeping.

use crate::domain_types::{MessageId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tokio::sync::mpsc;

/// A hop a message made through the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HopKind {
    /// Accepted into a recipient's queue.
    Enqueued,
    /// Pulled off a recipient's queue.
    Dequeued,
    /// Handler began processing.
    ProcessingStarted,
    /// Handler finished processing.
    ProcessingFinished,
    /// A retry attempt was scheduled.
    Retrying,
    /// Delivery exhausted retries and was dead-lettered.
    DeadLettered,
    /// The envelope exceeded its `ttl_ms` before delivery.
    Expired,
}

/// A single event fed into the tracer's channel.
#[derive(Debug, Clone)]
pub struct TracerEvent {
    /// The message this event concerns.
    pub message_id: MessageId,
    /// Sending agent.
    pub sender: String,
    /// Receiving agent, topic, or wildcard.
    pub recipient: String,
    /// What happened.
    pub hop: HopKind,
    /// An error description, present for `dead_lettered`/`expired` hops
    /// that close the trace with a failure.
    pub error: Option<String>,
}

/// Whether a message's trace is still open or has reached a terminal hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    /// Still in flight.
    InProgress,
    /// Delivered and processed successfully.
    Delivered,
    /// Delivery failed terminally.
    Failed,
    /// Expired before delivery.
    Expired,
    /// Dead-lettered after exhausting retries.
    DeadLettered,
}

/// The ordered list of fabric hops a message traversed (§3 "Trace record").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    /// The traced message.
    pub message_id: MessageId,
    /// Sending agent.
    pub sender: String,
    /// Receiving agent, topic, or wildcard.
    pub recipient: String,
    /// Current status.
    pub status: TraceStatus,
    /// Ordered hop kinds recorded so far.
    pub route: Vec<HopKind>,
    /// When the trace opened.
    pub started_at: Timestamp,
    /// When the trace closed, if it has.
    pub finished_at: Option<Timestamp>,
    /// The terminal error, if any.
    pub error: Option<String>,
}

struct TracerState {
    traces: HashMap<MessageId, TraceRecord>,
    order: VecDeque<MessageId>,
    capacity: usize,
}

impl TracerState {
    fn new(capacity: usize) -> Self {
        Self {
            traces: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn apply(&mut self, event: TracerEvent) {
        let record = self.traces.entry(event.message_id).or_insert_with(|| {
            self.order.push_back(event.message_id);
            TraceRecord {
                message_id: event.message_id,
                sender: event.sender.clone(),
                recipient: event.recipient.clone(),
                status: TraceStatus::InProgress,
                route: Vec::new(),
                started_at: Timestamp::now(),
                finished_at: None,
                error: None,
            }
        });
        record.route.push(event.hop);
        match event.hop {
            HopKind::ProcessingFinished => {
                record.status = TraceStatus::Delivered;
                record.finished_at = Some(Timestamp::now());
            }
            HopKind::DeadLettered => {
                record.status = TraceStatus::DeadLettered;
                record.finished_at = Some(Timestamp::now());
                record.error = event.error;
            }
            HopKind::Expired => {
                record.status = TraceStatus::Expired;
                record.finished_at = Some(Timestamp::now());
            }
            _ => {}
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.traces.remove(&oldest);
            }
        }
    }
}

/// Handle used by every component to feed hop events into the tracer
/// without ever blocking on the tracer's own bookkeeping.
#[derive(Clone)]
pub struct TracerHandle {
    tx: mpsc::UnboundedSender<TracerEvent>,
}

impl TracerHandle {
    /// Records a hop. Silently drops the event if the tracer worker has
    /// shut down (never blocks the caller).
    pub fn record(&self, event: TracerEvent) {
        let _ = self.tx.send(event);
    }
}

/// Shared, queryable store of recent traces, updated only by the tracer's
/// dedicated worker task.
pub struct Tracer {
    state: std::sync::Arc<std::sync::Mutex<TracerState>>,
}

impl Tracer {
    /// Spawns the tracer's worker task and returns both the tracer (for
    /// reads) and a [`TracerHandle`] (for writes) sharing its ring buffer.
    #[must_use]
    pub fn spawn(ring_buffer_capacity: usize) -> (Self, TracerHandle) {
        let (tx, mut rx) = mpsc::unbounded_channel::<TracerEvent>();
        let state = std::sync::Arc::new(std::sync::Mutex::new(TracerState::new(ring_buffer_capacity)));
        let worker_state = std::sync::Arc::clone(&state);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                worker_state.lock().expect("tracer mutex poisoned").apply(event);
            }
        });
        (Self { state }, TracerHandle { tx })
    }

    /// Reads the trace for `message_id`, if it is still within the ring
    /// buffer's window.
    #[must_use]
    pub fn trace(&self, message_id: MessageId) -> Option<TraceRecord> {
        self.state
            .lock()
            .expect("tracer mutex poisoned")
            .traces
            .get(&message_id)
            .cloned()
    }

    /// Number of traces currently retained.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().expect("tracer mutex poisoned").traces.len()
    }

    /// Whether the ring buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_hops_accumulates_route_and_closes_on_terminal_event() {
        let (tracer, handle) = Tracer::spawn(100);
        let message_id = MessageId::generate();
        handle.record(TracerEvent {
            message_id,
            sender: "sales".into(),
            recipient: "technical".into(),
            hop: HopKind::Enqueued,
            error: None,
        });
        handle.record(TracerEvent {
            message_id,
            sender: "sales".into(),
            recipient: "technical".into(),
            hop: HopKind::Dequeued,
            error: None,
        });
        handle.record(TracerEvent {
            message_id,
            sender: "sales".into(),
            recipient: "technical".into(),
            hop: HopKind::ProcessingFinished,
            error: None,
        });
        // Give the worker task a moment to drain the channel.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let trace = tracer.trace(message_id).expect("trace recorded");
        assert_eq!(trace.route, vec![HopKind::Enqueued, HopKind::Dequeued, HopKind::ProcessingFinished]);
        assert_eq!(trace.status, TraceStatus::Delivered);
        assert!(trace.finished_at.is_some());
    }

    #[tokio::test]
    async fn ring_buffer_evicts_oldest_trace_past_capacity() {
        let (tracer, handle) = Tracer::spawn(2);
        for _ in 0..3 {
            let id = MessageId::generate();
            handle.record(TracerEvent {
                message_id: id,
                sender: "a".into(),
                recipient: "b".into(),
                hop: HopKind::Enqueued,
                error: None,
            });
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(tracer.len(), 2);
    }
}
