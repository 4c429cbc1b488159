//! Work units and their per-unit outcomes

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::limiter::ResourceUsage;
use crate::retry::RetryPolicy;
use crate::store::keyed_fingerprint;
use crate::types::{ErrorInfo, StepStatus};

/// Context for one attempt of a unit
#[derive(Debug, Clone)]
pub struct UnitContext {
    pub unit_id: String,
    /// 1-based attempt number
    pub attempt: u32,
    /// Cancelled when the batch deadline passes or the caller cancels
    pub cancellation: CancellationToken,
}

pub type UnitTask =
    Arc<dyn Fn(UnitContext) -> BoxFuture<'static, Result<Value, ErrorInfo>> + Send + Sync>;

/// One independent call in a dispatch batch
#[derive(Clone)]
pub struct WorkUnit {
    pub id: String,
    /// Tool or operation label used in logs
    pub label: String,
    /// Present when the result may be served from the idempotency cache
    pub fingerprint: Option<String>,
    pub estimated_cost: f64,
    /// Per-attempt limit
    pub timeout: Option<Duration>,
    pub retry: RetryPolicy,
    task: UnitTask,
}

impl WorkUnit {
    pub fn new<F, Fut>(id: impl Into<String>, label: impl Into<String>, task: F) -> Self
    where
        F: Fn(UnitContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ErrorInfo>> + Send + 'static,
    {
        Self {
            id: id.into(),
            label: label.into(),
            fingerprint: None,
            estimated_cost: 0.0,
            timeout: None,
            retry: RetryPolicy::none(),
            task: Arc::new(move |ctx| Box::pin(task(ctx))),
        }
    }

    /// Cache results under a fingerprint of (label, key, input)
    pub fn with_idempotency_key(mut self, key: &str, input: &Value) -> Self {
        self.fingerprint = Some(keyed_fingerprint(&self.label, key, input));
        self
    }

    pub fn with_cost(mut self, estimated_cost: f64) -> Self {
        self.estimated_cost = estimated_cost;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub(crate) fn start(&self, ctx: UnitContext) -> BoxFuture<'static, Result<Value, ErrorInfo>> {
        (self.task)(ctx)
    }
}

impl fmt::Debug for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkUnit")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("fingerprint", &self.fingerprint)
            .field("estimated_cost", &self.estimated_cost)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish()
    }
}

/// Terminal record of one unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitOutcome {
    pub unit_id: String,
    /// Succeeded, Failed or Skipped
    pub status: StepStatus,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub attempts: u32,
    pub duration_ms: u64,
    #[serde(default)]
    pub cache_hit: bool,
}

impl UnitOutcome {
    pub(crate) fn from_result(
        unit_id: String,
        result: Result<Value, ErrorInfo>,
        attempts: u32,
        duration_ms: u64,
        cache_hit: bool,
    ) -> Self {
        match result {
            Ok(output) => Self {
                unit_id,
                status: StepStatus::Succeeded,
                output,
                error: None,
                attempts,
                duration_ms,
                cache_hit,
            },
            Err(error) => Self {
                unit_id,
                status: if error.kind.is_skip() {
                    StepStatus::Skipped
                } else {
                    StepStatus::Failed
                },
                output: Value::Null,
                error: Some(error),
                attempts,
                duration_ms,
                cache_hit,
            },
        }
    }

    pub(crate) fn skipped(unit_id: String, error: ErrorInfo) -> Self {
        Self {
            unit_id,
            status: StepStatus::Skipped,
            output: Value::Null,
            error: Some(error),
            attempts: 0,
            duration_ms: 0,
            cache_hit: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Succeeded
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Every unit succeeded
    Succeeded,
    /// At least one unit failed or was skipped
    PartialFailure,
}

/// Result of one dispatch batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchReport {
    pub status: BatchStatus,
    /// One outcome per unit, in input order
    pub outcomes: Vec<UnitOutcome>,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub success_rate: f64,
    /// Whether `success_rate` reached the requested minimum
    pub acceptable: bool,
    pub usage: ResourceUsage,
    pub duration_ms: u64,
}

impl DispatchReport {
    pub(crate) fn build(
        outcomes: Vec<UnitOutcome>,
        min_success: f64,
        usage: ResourceUsage,
        duration_ms: u64,
    ) -> Self {
        let count = |status: StepStatus| outcomes.iter().filter(|o| o.status == status).count();
        let succeeded = count(StepStatus::Succeeded);
        let failed = count(StepStatus::Failed);
        let skipped = count(StepStatus::Skipped);
        let success_rate = if outcomes.is_empty() {
            1.0
        } else {
            succeeded as f64 / outcomes.len() as f64
        };
        let status = if succeeded == outcomes.len() {
            BatchStatus::Succeeded
        } else {
            BatchStatus::PartialFailure
        };
        Self {
            status,
            outcomes,
            succeeded,
            failed,
            skipped,
            success_rate,
            acceptable: success_rate >= min_success,
            usage,
            duration_ms,
        }
    }

    pub fn outcome(&self, unit_id: &str) -> Option<&UnitOutcome> {
        self.outcomes.iter().find(|o| o.unit_id == unit_id)
    }

    /// Outputs of succeeded units, in input order
    pub fn outputs(&self) -> Vec<&Value> {
        self.outcomes
            .iter()
            .filter(|o| o.is_success())
            .map(|o| &o.output)
            .collect()
    }
}
