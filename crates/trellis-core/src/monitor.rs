//! Monitoring side-channel
//!
//! `record` is synchronous and must not block; sinks that forward events
//! elsewhere do so without waiting. Implementations live in trellis-stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorEventKind {
    PlanStarted,
    PlanCompleted,
    StepStarted,
    StepRetrying,
    StepSucceeded,
    StepFailed,
    StepSkipped,
    UnitCompleted,
    CacheHit,
    BatchCompleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorEvent {
    pub kind: MonitorEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub duration_ms: u64,
    pub success: bool,
    pub cost: f64,
    pub timestamp: DateTime<Utc>,
}

impl MonitorEvent {
    pub fn new(kind: MonitorEventKind) -> Self {
        Self {
            kind,
            plan_id: None,
            step_id: None,
            duration_ms: 0,
            success: true,
            cost: 0.0,
            timestamp: Utc::now(),
        }
    }

    pub fn with_plan(mut self, plan_id: impl Into<String>) -> Self {
        self.plan_id = Some(plan_id.into());
        self
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn with_result(mut self, success: bool, duration_ms: u64, cost: f64) -> Self {
        self.success = success;
        self.duration_ms = duration_ms;
        self.cost = cost;
        self
    }
}

/// Fire-and-forget event sink
pub trait MonitoringSink: Send + Sync {
    fn record(&self, event: MonitorEvent);
}

/// Sink that drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMonitor;

impl MonitoringSink for NoopMonitor {
    fn record(&self, _event: MonitorEvent) {}
}
