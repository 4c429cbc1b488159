//! MonitoringSink implementations
//!
//! All sinks are synchronous and never block the caller:
//! - TracingMonitor writes structured log lines.
//! - BroadcastMonitor pushes events to live subscribers.
//! - InMemoryEventLog keeps a bounded journal for inspection and tests.
//! - FanoutMonitor forwards to several sinks.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

use trellis_core::monitor::{MonitorEvent, MonitorEventKind, MonitoringSink};

/// Emits each event as a `tracing` record
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMonitor;

impl MonitoringSink for TracingMonitor {
    fn record(&self, event: MonitorEvent) {
        let plan_id = event.plan_id.as_deref().unwrap_or("");
        let step_id = event.step_id.as_deref().unwrap_or("");
        if event.success {
            tracing::info!(
                target: "trellis::monitor",
                kind = ?event.kind,
                plan_id = %plan_id,
                step_id = %step_id,
                duration_ms = event.duration_ms,
                cost = event.cost,
                "monitor event"
            );
        } else {
            tracing::warn!(
                target: "trellis::monitor",
                kind = ?event.kind,
                plan_id = %plan_id,
                step_id = %step_id,
                duration_ms = event.duration_ms,
                cost = event.cost,
                "monitor event"
            );
        }
    }
}

/// In-process fan-out based on tokio broadcast channels.
pub struct BroadcastMonitor {
    tx: broadcast::Sender<MonitorEvent>,
    capacity: usize,
}

impl BroadcastMonitor {
    /// Create a new broadcast monitor with channel capacity.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Subscribe to events recorded from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastMonitor {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl MonitoringSink for BroadcastMonitor {
    fn record(&self, event: MonitorEvent) {
        // no subscribers is not an error
        let _ = self.tx.send(event);
    }
}

/// Bounded in-memory journal; the oldest events are dropped first.
pub struct InMemoryEventLog {
    events: RwLock<VecDeque<MonitorEvent>>,
    capacity: usize,
}

impl InMemoryEventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Recorded events, oldest first
    pub fn events(&self) -> Vec<MonitorEvent> {
        self.events
            .read()
            .map(|events| events.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn events_of_kind(&self, kind: MonitorEventKind) -> Vec<MonitorEvent> {
        self.events
            .read()
            .map(|events| events.iter().filter(|e| e.kind == kind).cloned().collect())
            .unwrap_or_default()
    }

    /// Events for one step of one plan, oldest first
    pub fn step_history(&self, plan_id: &str, step_id: &str) -> Vec<MonitorEvent> {
        self.events
            .read()
            .map(|events| {
                events
                    .iter()
                    .filter(|e| {
                        e.plan_id.as_deref() == Some(plan_id)
                            && e.step_id.as_deref() == Some(step_id)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.write() {
            events.clear();
        }
    }
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl MonitoringSink for InMemoryEventLog {
    fn record(&self, event: MonitorEvent) {
        let mut events = match self.events.write() {
            Ok(events) => events,
            Err(poisoned) => poisoned.into_inner(),
        };
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }
}

/// Forwards every event to each inner sink in order
#[derive(Default)]
pub struct FanoutMonitor {
    sinks: Vec<Arc<dyn MonitoringSink>>,
}

impl FanoutMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn MonitoringSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl MonitoringSink for FanoutMonitor {
    fn record(&self, event: MonitorEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.record(event.clone());
            }
            last.record(event);
        }
    }
}
