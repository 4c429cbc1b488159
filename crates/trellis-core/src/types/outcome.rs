//! Step outcomes and the error taxonomy carried by them

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::context::ExecutionContext;
use super::step::StepId;

/// Runtime status of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Ready,
    Running,
    Retrying,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

/// Failure classification for steps and dispatch units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    UnresolvedReference,
    UnknownTool,
    SecurityViolation,
    Timeout,
    MemoryExceeded,
    Runtime,
    BatchTimeout,
    UpstreamFailure,
    ResourceLimit,
    Cancelled,
    InvalidInput,
    PermissionDenied,
    SandboxUnavailable,
}

impl ErrorKind {
    /// Whether a retry policy may re-run a unit that failed with this kind
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Timeout | Self::MemoryExceeded | Self::Runtime)
    }

    /// Kinds reported as `Skipped` rather than `Failed`
    pub fn is_skip(self) -> bool {
        matches!(
            self,
            Self::BatchTimeout | Self::UpstreamFailure | Self::ResourceLimit | Self::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::UnresolvedReference => "unresolved_reference",
            Self::UnknownTool => "unknown_tool",
            Self::SecurityViolation => "security_violation",
            Self::Timeout => "timeout",
            Self::MemoryExceeded => "memory_exceeded",
            Self::Runtime => "runtime",
            Self::BatchTimeout => "batch_timeout",
            Self::UpstreamFailure => "upstream_failure",
            Self::ResourceLimit => "resource_limit",
            Self::Cancelled => "cancelled",
            Self::InvalidInput => "invalid_input",
            Self::PermissionDenied => "permission_denied",
            Self::SandboxUnavailable => "sandbox_unavailable",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified failure of a step or unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn unknown_tool(tool: &str) -> Self {
        Self::new(ErrorKind::UnknownTool, format!("tool '{}' is not registered", tool))
    }

    pub fn upstream_failure(upstream: &str) -> Self {
        Self::new(
            ErrorKind::UpstreamFailure,
            format!("upstream step '{}' did not succeed", upstream),
        )
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ErrorInfo {}

/// Terminal record of one step within a plan run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step_id: StepId,
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

impl StepOutcome {
    pub fn pending(step_id: impl Into<StepId>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            output: Value::Null,
            error: None,
            attempts: 0,
            duration_ms: 0,
            cache_hit: false,
        }
    }

    /// Failed or skipped outcome for a step that never reached a tool
    pub fn not_run(step_id: impl Into<StepId>, error: ErrorInfo) -> Self {
        let status = if error.kind.is_skip() {
            StepStatus::Skipped
        } else {
            StepStatus::Failed
        };
        Self {
            status,
            error: Some(error),
            ..Self::pending(step_id)
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Succeeded
    }
}

/// Overall status of a plan run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Succeeded,
    Failed,
    Cancelled,
}

/// Final result of executing a plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanResult {
    pub plan_id: String,
    pub status: PlanStatus,
    /// One outcome per step, in declaration order
    pub steps: Vec<StepOutcome>,
    pub context: ExecutionContext,
    pub duration_ms: u64,
}

impl PlanResult {
    pub fn outcome(&self, step_id: &str) -> Option<&StepOutcome> {
        self.steps.iter().find(|o| o.step_id.as_str() == step_id)
    }

    pub fn is_success(&self) -> bool {
        self.status == PlanStatus::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::Runtime.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(!ErrorKind::SecurityViolation.is_retryable());
        assert!(!ErrorKind::UnknownTool.is_retryable());
        assert!(!ErrorKind::UnresolvedReference.is_retryable());
        assert!(!ErrorKind::PermissionDenied.is_retryable());
    }

    #[test]
    fn test_not_run_maps_skip_kinds_to_skipped() {
        let skipped = StepOutcome::not_run("b", ErrorInfo::upstream_failure("a"));
        assert_eq!(skipped.status, StepStatus::Skipped);
        let failed = StepOutcome::not_run("c", ErrorInfo::unknown_tool("nope"));
        assert_eq!(failed.status, StepStatus::Failed);
        assert_eq!(failed.attempts, 0);
    }
}
