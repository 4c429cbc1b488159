//! Executor module
//!
//! The PlanExecutor is responsible for:
//! - Validating a plan before any step runs
//! - Level-by-level scheduling of ready steps through the Dispatcher
//! - Reference resolution and tool routing for each step
//! - Skipping transitive dependents of steps that did not succeed

mod dag;

pub use dag::{DagNode, ExecutionDag, NodeState};

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::dispatch::{Dispatcher, UnitContext, UnitOutcome, WorkUnit, DEFAULT_CACHE_TTL};
use crate::limiter::{ResourceLimiter, ResourceLimits};
use crate::monitor::{MonitorEvent, MonitorEventKind, MonitoringSink, NoopMonitor};
use crate::normalizer::{PlanNormalizer, ValidationError};
use crate::registry::{ToolContext, ToolHandle, ToolRegistry};
use crate::resolver;
use crate::retry::RetryPolicy;
use crate::sandbox::{CodeSandbox, SandboxErrorKind, SandboxRequest};
use crate::store::IdempotencyCache;
use crate::types::{
    ErrorInfo, ErrorKind, ExecutionContext, Plan, PlanResult, PlanStatus, Step, StepOutcome,
    StepStatus,
};

pub(crate) const MAX_LOG_TEXT_CHARS: usize = 2_000;
const MAX_LOG_JSON_CHARS: usize = 8_000;
const MAX_STDERR_IN_ERROR_CHARS: usize = 500;
/// Headroom over the sandbox's own deadline before the unit is abandoned
const SANDBOX_TIMEOUT_GRACE: Duration = Duration::from_secs(2);

pub(crate) fn truncate_for_log(input: &str, max_chars: usize) -> String {
    let char_count = input.chars().count();
    if char_count <= max_chars {
        return input.to_string();
    }
    let mut preview: String = input.chars().take(max_chars).collect();
    preview.push_str(&format!("... [truncated, total_chars={}]", char_count));
    preview
}

fn truncate_json_for_log(value: &Value, max_chars: usize) -> String {
    truncate_for_log(&value.to_string(), max_chars)
}

fn seconds(value: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(value).ok()
}

/// The plan executor - orchestrates DAG execution
pub struct PlanExecutor {
    registry: Arc<dyn ToolRegistry>,
    sandbox: Option<Arc<dyn CodeSandbox>>,
    cache: Arc<IdempotencyCache>,
    cache_ttl: Duration,
    monitor: Arc<dyn MonitoringSink>,
    limits: ResourceLimits,
    /// Used for steps that carry no retry policy of their own
    default_retry_policy: Option<RetryPolicy>,
    /// Used for function steps that carry no timeout of their own
    default_timeout: Option<Duration>,
    normalizer: PlanNormalizer,
}

impl PlanExecutor {
    /// Create a new executor.
    ///
    /// The plan-wide limiter starts with no wall-clock budget; set one with
    /// [`with_limits`](Self::with_limits). Per-step timeouts still apply.
    pub fn new(registry: Arc<dyn ToolRegistry>) -> Self {
        Self {
            registry,
            sandbox: None,
            cache: Arc::new(IdempotencyCache::without_backend()),
            cache_ttl: DEFAULT_CACHE_TTL,
            monitor: Arc::new(NoopMonitor),
            limits: ResourceLimits::default().with_max_duration_s(f64::INFINITY),
            default_retry_policy: None,
            default_timeout: None,
            normalizer: PlanNormalizer::new(),
        }
    }

    pub fn with_sandbox(mut self, sandbox: Arc<dyn CodeSandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn with_cache(mut self, cache: Arc<IdempotencyCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn MonitoringSink>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Plan-wide limits; one limiter is shared by every batch of a run
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_default_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_retry_policy = Some(policy);
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn with_normalizer(mut self, normalizer: PlanNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Validate and group steps into dependency levels
    pub fn dependency_levels(
        &self,
        plan: &Plan,
    ) -> Result<Vec<Vec<crate::types::StepId>>, ValidationError> {
        self.normalizer.levels(plan)
    }

    /// Execute a plan to completion
    pub async fn execute(&self, plan: &Plan) -> Result<PlanResult, ValidationError> {
        self.execute_with_cancellation(plan, CancellationToken::new())
            .await
    }

    /// Execute a plan, stopping early when `cancel` fires.
    ///
    /// Only validation problems are returned as errors; step failures are
    /// reported in the result.
    pub async fn execute_with_cancellation(
        &self,
        plan: &Plan,
        cancel: CancellationToken,
    ) -> Result<PlanResult, ValidationError> {
        let started = Instant::now();
        self.normalizer.validate(plan)?;
        let mut dag = ExecutionDag::from_plan(plan)
            .map_err(|error| ValidationError::InvalidStep(plan.id.clone(), error))?;

        let tools = self.resolve_tools(plan);
        let limiter = Arc::new(ResourceLimiter::new(self.limits.clone()));
        let dispatcher = Dispatcher::new()
            .with_cache(self.cache.clone())
            .with_cache_ttl(self.cache_ttl)
            .with_monitor(self.monitor.clone());
        let mut run = RunState {
            plan_id: plan.id.as_str(),
            monitor: self.monitor.as_ref(),
            context: ExecutionContext::new(),
            outcomes: HashMap::new(),
        };

        tracing::info!(
            plan_id = %plan.id,
            steps = plan.steps.len(),
            tools = tools.len(),
            "plan execution started"
        );
        self.monitor
            .record(MonitorEvent::new(MonitorEventKind::PlanStarted).with_plan(&plan.id));

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let ready = dag.ready_nodes.clone();
            if ready.is_empty() {
                break;
            }

            let mut units = Vec::with_capacity(ready.len());
            for step_id in ready {
                let Some(step) = dag.get_node(&step_id).map(|node| node.step.clone()) else {
                    continue;
                };
                dag.mark_running(&step_id);
                tracing::info!(
                    plan_id = %plan.id,
                    step_id = %step.id,
                    tool = %step.tool,
                    "step execution started"
                );
                self.monitor.record(
                    MonitorEvent::new(MonitorEventKind::StepStarted)
                        .with_plan(&plan.id)
                        .with_step(step.id.as_str()),
                );

                match self.prepare_unit(&step, &tools, &run.context) {
                    Ok(unit) => units.push(unit),
                    Err(error) => run.settle(&mut dag, StepOutcome::not_run(step.id.clone(), error)),
                }
            }
            if units.is_empty() {
                continue;
            }

            let report = dispatcher
                .dispatch_with_limiter(units, limiter.clone(), 0.0, &cancel)
                .await;
            for unit_outcome in report.outcomes {
                run.settle(&mut dag, step_outcome(unit_outcome));
            }
        }

        for step_id in dag.unfinished_nodes() {
            dag.mark_skipped(&step_id);
            run.settle_skipped(
                &step_id,
                ErrorInfo::cancelled("plan run cancelled before step started"),
            );
        }

        let steps: Vec<StepOutcome> = plan
            .steps
            .iter()
            .map(|step| {
                run.outcomes
                    .remove(step.id.as_str())
                    .unwrap_or_else(|| StepOutcome::pending(step.id.clone()))
            })
            .collect();
        let status = if steps.iter().all(StepOutcome::is_success) {
            PlanStatus::Succeeded
        } else if cancel.is_cancelled() {
            PlanStatus::Cancelled
        } else {
            PlanStatus::Failed
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        let usage = limiter.snapshot();

        tracing::info!(
            plan_id = %plan.id,
            status = ?status,
            succeeded = steps.iter().filter(|o| o.is_success()).count(),
            total = steps.len(),
            total_cost = usage.total_cost,
            duration_ms = duration_ms,
            "plan execution finished"
        );
        self.monitor.record(
            MonitorEvent::new(MonitorEventKind::PlanCompleted)
                .with_plan(&plan.id)
                .with_result(
                    status == PlanStatus::Succeeded,
                    duration_ms,
                    usage.total_cost,
                ),
        );

        Ok(PlanResult {
            plan_id: plan.id.clone(),
            status,
            steps,
            context: run.context,
            duration_ms,
        })
    }

    fn resolve_tools(&self, plan: &Plan) -> HashMap<String, ToolHandle> {
        plan.tools()
            .into_iter()
            .map(|name| {
                let handle = self.registry.resolve_tool(name);
                tracing::debug!(
                    plan_id = %plan.id,
                    tool = %name,
                    kind = handle.kind(),
                    "tool resolved"
                );
                (name.to_string(), handle)
            })
            .collect()
    }

    /// Build the work unit for a ready step, or the error that fails it
    /// without running anything.
    fn prepare_unit(
        &self,
        step: &Step,
        tools: &HashMap<String, ToolHandle>,
        context: &ExecutionContext,
    ) -> Result<WorkUnit, ErrorInfo> {
        let input = resolver::resolve(&step.input_value(), context)
            .map_err(|error| ErrorInfo::new(ErrorKind::UnresolvedReference, error.to_string()))?;
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(
                step_id = %step.id,
                tool = %step.tool,
                resolved_input = %truncate_json_for_log(&input, MAX_LOG_JSON_CHARS),
                "step input resolved"
            );
        }

        let retry = step
            .retry_policy
            .clone()
            .or_else(|| self.default_retry_policy.clone())
            .unwrap_or_else(RetryPolicy::none);
        let step_timeout = step.timeout_s.and_then(seconds);
        let fingerprint_input = input.clone();

        let unit = match tools.get(&step.tool).cloned().unwrap_or(ToolHandle::Unknown) {
            ToolHandle::Unknown => return Err(ErrorInfo::unknown_tool(&step.tool)),
            ToolHandle::Function(tool) => {
                let step_id = step.id.to_string();
                let unit = WorkUnit::new(step.id.as_str(), step.tool.as_str(), move |ctx: UnitContext| {
                    let tool = tool.clone();
                    let input = input.clone();
                    let tool_ctx = ToolContext::new(step_id.clone(), ctx.attempt, ctx.cancellation);
                    async move { tool.call(input, tool_ctx).await }
                });
                match step_timeout.or(self.default_timeout) {
                    Some(timeout) => unit.with_timeout(timeout),
                    None => unit,
                }
            }
            ToolHandle::Sandbox(tool) => {
                let Some(sandbox) = self.sandbox.clone() else {
                    return Err(ErrorInfo::new(
                        ErrorKind::SandboxUnavailable,
                        format!(
                            "tool '{}' runs in the sandbox but no sandbox is configured",
                            step.tool
                        ),
                    ));
                };
                let timeout = step_timeout
                    .or_else(|| seconds(tool.timeout_s))
                    .unwrap_or(Duration::from_secs(10));
                let step_id = step.id.to_string();
                WorkUnit::new(step.id.as_str(), step.tool.as_str(), move |_ctx: UnitContext| {
                    let sandbox = sandbox.clone();
                    let request = SandboxRequest::new(tool.code.clone(), input.clone())
                        .with_timeout(timeout)
                        .with_memory_limit_mb(tool.memory_limit_mb);
                    let step_id = step_id.clone();
                    async move { run_sandbox_tool(sandbox.as_ref(), request, &step_id).await }
                })
                .with_timeout(timeout.saturating_add(SANDBOX_TIMEOUT_GRACE))
            }
        };

        let unit = unit.with_retry(retry).with_cost(step.estimated_cost);
        Ok(match &step.idempotency_key {
            Some(key) => unit.with_idempotency_key(key, &fingerprint_input),
            None => unit,
        })
    }
}

async fn run_sandbox_tool(
    sandbox: &dyn CodeSandbox,
    request: SandboxRequest,
    step_id: &str,
) -> Result<Value, ErrorInfo> {
    let result = sandbox.run(request).await;
    if !result.stdout.is_empty() {
        tracing::debug!(
            step_id = %step_id,
            stdout = %truncate_for_log(&result.stdout, MAX_LOG_TEXT_CHARS),
            "sandbox stdout"
        );
    }
    if !result.stderr.is_empty() {
        tracing::debug!(
            step_id = %step_id,
            stderr = %truncate_for_log(&result.stderr, MAX_LOG_TEXT_CHARS),
            "sandbox stderr"
        );
    }

    let Some(failure) = &result.error else {
        return Ok(result.return_value);
    };
    let mut error = ErrorInfo::from(failure);
    let stderr = result.stderr.trim();
    if failure.kind == SandboxErrorKind::RuntimeError && !stderr.is_empty() {
        error.message = format!(
            "{}; stderr: {}",
            error.message,
            truncate_for_log(stderr, MAX_STDERR_IN_ERROR_CHARS)
        );
    }
    Err(error)
}

fn step_outcome(unit: UnitOutcome) -> StepOutcome {
    StepOutcome {
        step_id: unit.unit_id.into(),
        status: unit.status,
        output: unit.output,
        error: unit.error,
        attempts: unit.attempts,
        duration_ms: unit.duration_ms,
        cache_hit: unit.cache_hit,
    }
}

/// Mutable state of one plan run
struct RunState<'a> {
    plan_id: &'a str,
    monitor: &'a dyn MonitoringSink,
    context: ExecutionContext,
    outcomes: HashMap<String, StepOutcome>,
}

impl RunState<'_> {
    /// Apply a terminal outcome to the DAG, the context and the result set
    fn settle(&mut self, dag: &mut ExecutionDag, outcome: StepOutcome) {
        let step_id = outcome.step_id.to_string();
        match outcome.status {
            StepStatus::Succeeded => {
                self.context.insert(step_id.clone(), outcome.output.clone());
                dag.mark_completed(&step_id);
                tracing::info!(
                    plan_id = %self.plan_id,
                    step_id = %step_id,
                    attempts = outcome.attempts,
                    cache_hit = outcome.cache_hit,
                    duration_ms = outcome.duration_ms,
                    "step execution completed"
                );
                self.monitor.record(
                    MonitorEvent::new(MonitorEventKind::StepSucceeded)
                        .with_plan(self.plan_id)
                        .with_step(&step_id)
                        .with_result(true, outcome.duration_ms, 0.0),
                );
            }
            status => {
                let kind = if status == StepStatus::Skipped {
                    dag.mark_skipped(&step_id);
                    MonitorEventKind::StepSkipped
                } else {
                    dag.mark_failed(&step_id);
                    MonitorEventKind::StepFailed
                };
                let message = outcome
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                tracing::error!(
                    plan_id = %self.plan_id,
                    step_id = %step_id,
                    status = ?status,
                    attempts = outcome.attempts,
                    error = %truncate_for_log(&message, MAX_LOG_TEXT_CHARS),
                    "step execution did not succeed"
                );
                self.monitor.record(
                    MonitorEvent::new(kind)
                        .with_plan(self.plan_id)
                        .with_step(&step_id)
                        .with_result(false, outcome.duration_ms, 0.0),
                );
                let cancelled = outcome
                    .error
                    .as_ref()
                    .is_some_and(|e| e.kind == ErrorKind::Cancelled);
                for dependent in dag.skip_dependents(&step_id) {
                    let reason = if cancelled {
                        ErrorInfo::cancelled(format!("upstream step '{}' was cancelled", step_id))
                    } else {
                        ErrorInfo::upstream_failure(&step_id)
                    };
                    self.settle_skipped(&dependent, reason);
                }
            }
        }
        self.outcomes.insert(step_id, outcome);
    }

    fn settle_skipped(&mut self, step_id: &str, reason: ErrorInfo) {
        tracing::warn!(
            plan_id = %self.plan_id,
            step_id = %step_id,
            reason = %reason,
            "step skipped"
        );
        self.monitor.record(
            MonitorEvent::new(MonitorEventKind::StepSkipped)
                .with_plan(self.plan_id)
                .with_step(step_id)
                .with_result(false, 0, 0.0),
        );
        self.outcomes
            .insert(step_id.to_string(), StepOutcome::not_run(step_id, reason));
    }
}
