//! Metrics (§4.5): counters and latency percentiles.
//!
//! Implements the donor's `MetricsCollectorImpl` placeholder
//! (`message_router/router.rs`) for real. Counter updates arrive over the
//! same kind of non-blocking channel as the tracer (§5: "metrics updates
//! happen on the tracer's own worker"); here that worker is
//! [`MetricsWorker`], fed by [`MetricsHandle`].

use crate::envelope::{EnvelopeKind, Priority};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::mpsc;

/// A single metrics update fed into the worker's channel.
#[derive(Debug, Clone)]
pub enum MetricsEvent {
    /// A send was attempted.
    Sent { kind: EnvelopeKind, priority: Priority },
    /// A send was delivered and processed successfully.
    Delivered { kind: EnvelopeKind, priority: Priority, latency_ms: u64 },
    /// A send failed terminally (after retries, if any).
    Failed { kind: EnvelopeKind, priority: Priority },
    /// A retry attempt was scheduled.
    Retried { kind: EnvelopeKind, priority: Priority },
    /// An envelope was dead-lettered.
    DeadLettered { kind: EnvelopeKind, priority: Priority },
    /// A stage's end-to-end duration, for the per-stage histogram.
    StageDuration { stage: String, duration_ms: u64 },
}

/// Handle used by every component to report metrics without blocking.
#[derive(Clone)]
pub struct MetricsHandle {
    tx: mpsc::UnboundedSender<MetricsEvent>,
    started_at: Instant,
}

impl MetricsHandle {
    /// Records an event. Silently drops it if the worker has shut down.
    pub fn record(&self, event: MetricsEvent) {
        let _ = self.tx.send(event);
    }

    /// Seconds elapsed since the metrics worker started (process uptime
    /// proxy, per §4.5 "uptime since process start").
    #[must_use]
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

#[derive(Default)]
struct Counters {
    sent: u64,
    delivered: u64,
    failed: u64,
    retried: u64,
    dead_lettered: u64,
    by_kind: HashMap<String, u64>,
    by_priority: HashMap<String, u64>,
}

/// A bounded, sorted sample window used to compute percentiles without a
/// dedicated histogram crate (the donor doesn't carry one).
struct LatencyWindow {
    samples: Vec<u64>,
    capacity: usize,
    next_slot: usize,
}

impl LatencyWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
            capacity,
            next_slot: 0,
        }
    }

    fn push(&mut self, value: u64) {
        if self.samples.len() < self.capacity {
            self.samples.push(value);
        } else {
            self.samples[self.next_slot] = value;
            self.next_slot = (self.next_slot + 1) % self.capacity;
        }
    }

    fn percentile(&self, p: f64) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let rank = ((p / 100.0) * (sorted.len() as f64 - 1.0)).round() as usize;
        sorted.get(rank.min(sorted.len() - 1)).copied()
    }

    fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.samples.iter().sum::<u64>() as f64 / self.samples.len() as f64)
        }
    }
}

/// Latency percentiles over the configured sample window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencyStats {
    /// Mean latency, in milliseconds.
    pub avg_ms: Option<f64>,
    /// 50th percentile, in milliseconds.
    pub p50_ms: Option<u64>,
    /// 95th percentile, in milliseconds.
    pub p95_ms: Option<u64>,
    /// 99th percentile, in milliseconds.
    pub p99_ms: Option<u64>,
}

/// A point-in-time read of the whole metrics surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Total sends attempted.
    pub total_sent: u64,
    /// Total successful deliveries.
    pub total_delivered: u64,
    /// Total terminal failures.
    pub total_failed: u64,
    /// Total retry attempts scheduled.
    pub total_retried: u64,
    /// Total dead-lettered envelopes.
    pub total_dead_lettered: u64,
    /// Counts broken down by envelope kind.
    pub by_kind: HashMap<String, u64>,
    /// Counts broken down by priority.
    pub by_priority: HashMap<String, u64>,
    /// End-to-end delivery latency.
    pub end_to_end_latency: LatencyStats,
    /// Per-stage latency, keyed by stage name.
    pub stage_latency: HashMap<String, LatencyStats>,
    /// Seconds since process start.
    pub uptime_seconds: u64,
}

impl MetricsSnapshot {
    /// The metrics-consistency law of §8:
    /// `total_sent == delivered + failed + dead_lettered + in_flight`.
    ///
    /// `in_flight` is supplied by the caller (it is not tracked by the
    /// counters themselves, which only see terminal outcomes).
    #[must_use]
    pub fn is_consistent_with(&self, in_flight: u64) -> bool {
        self.total_sent == self.total_delivered + self.total_failed + self.total_dead_lettered + in_flight
    }
}

struct MetricsState {
    counters: Counters,
    end_to_end: LatencyWindow,
    per_stage: HashMap<String, LatencyWindow>,
    window_capacity: usize,
}

/// Background worker owning the counters and latency windows; the only
/// writer of metrics state, reached exclusively through [`MetricsHandle`].
pub struct MetricsWorker {
    state: std::sync::Arc<std::sync::Mutex<MetricsState>>,
    handle: MetricsHandle,
}

impl MetricsWorker {
    /// Spawns the worker task and returns it alongside a [`MetricsHandle`].
    #[must_use]
    pub fn spawn(window_capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<MetricsEvent>();
        let state = std::sync::Arc::new(std::sync::Mutex::new(MetricsState {
            counters: Counters::default(),
            end_to_end: LatencyWindow::new(window_capacity),
            per_stage: HashMap::new(),
            window_capacity,
        }));
        let worker_state = std::sync::Arc::clone(&state);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let mut guard = worker_state.lock().expect("metrics mutex poisoned");
                apply(&mut guard, event);
            }
        });
        Self {
            state,
            handle: MetricsHandle {
                tx,
                started_at: Instant::now(),
            },
        }
    }

    /// A clone-able handle for components to report metrics through.
    #[must_use]
    pub fn handle(&self) -> MetricsHandle {
        self.handle.clone()
    }

    /// Reads a full snapshot of the current metrics state.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let guard = self.state.lock().expect("metrics mutex poisoned");
        MetricsSnapshot {
            total_sent: guard.counters.sent,
            total_delivered: guard.counters.delivered,
            total_failed: guard.counters.failed,
            total_retried: guard.counters.retried,
            total_dead_lettered: guard.counters.dead_lettered,
            by_kind: guard.counters.by_kind.clone(),
            by_priority: guard.counters.by_priority.clone(),
            end_to_end_latency: LatencyStats {
                avg_ms: guard.end_to_end.average(),
                p50_ms: guard.end_to_end.percentile(50.0),
                p95_ms: guard.end_to_end.percentile(95.0),
                p99_ms: guard.end_to_end.percentile(99.0),
            },
            stage_latency: guard
                .per_stage
                .iter()
                .map(|(stage, window)| {
                    (
                        stage.clone(),
                        LatencyStats {
                            avg_ms: window.average(),
                            p50_ms: window.percentile(50.0),
                            p95_ms: window.percentile(95.0),
                            p99_ms: window.percentile(99.0),
                        },
                    )
                })
                .collect(),
            uptime_seconds: self.handle.uptime_seconds(),
        }
    }
}

fn kind_key(kind: EnvelopeKind) -> &'static str {
    match kind {
        EnvelopeKind::Request => "request",
        EnvelopeKind::Response => "response",
        EnvelopeKind::Notification => "notification",
        EnvelopeKind::Publish => "publish",
        EnvelopeKind::Broadcast => "broadcast",
        EnvelopeKind::Ack => "ack",
        EnvelopeKind::Error => "error",
    }
}

fn priority_key(priority: Priority) -> &'static str {
    match priority {
        Priority::Low => "low",
        Priority::Normal => "normal",
        Priority::High => "high",
        Priority::Urgent => "urgent",
    }
}

fn apply(state: &mut MetricsState, event: MetricsEvent) {
    match event {
        MetricsEvent::Sent { kind, priority } => {
            state.counters.sent += 1;
            *state.counters.by_kind.entry(kind_key(kind).to_string()).or_default() += 1;
            *state.counters.by_priority.entry(priority_key(priority).to_string()).or_default() += 1;
        }
        MetricsEvent::Delivered { latency_ms, .. } => {
            state.counters.delivered += 1;
            state.end_to_end.push(latency_ms);
        }
        MetricsEvent::Failed { .. } => {
            state.counters.failed += 1;
        }
        MetricsEvent::Retried { .. } => {
            state.counters.retried += 1;
        }
        MetricsEvent::DeadLettered { .. } => {
            state.counters.dead_lettered += 1;
        }
        MetricsEvent::StageDuration { stage, duration_ms } => {
            let capacity = state.window_capacity;
            state
                .per_stage
                .entry(stage)
                .or_insert_with(|| LatencyWindow::new(capacity))
                .push(duration_ms);
        }
    }
}
