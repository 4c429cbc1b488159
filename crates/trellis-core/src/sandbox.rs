//! Sandbox abstraction
//!
//! Implementations live in trellis-sandbox.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::types::{ErrorInfo, ErrorKind};

/// One code unit to run
#[derive(Debug, Clone)]
pub struct SandboxRequest {
    pub code: String,
    /// Bound to the name `input` inside the code unit
    pub input: Value,
    pub timeout: Duration,
    pub memory_limit_mb: u64,
}

impl SandboxRequest {
    pub fn new(code: impl Into<String>, input: Value) -> Self {
        Self {
            code: code.into(),
            input,
            timeout: Duration::from_secs(10),
            memory_limit_mb: 256,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_memory_limit_mb(mut self, memory_limit_mb: u64) -> Self {
        self.memory_limit_mb = memory_limit_mb;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxErrorKind {
    SecurityViolation,
    Timeout,
    MemoryExceeded,
    RuntimeError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxFailure {
    pub kind: SandboxErrorKind,
    pub message: String,
}

impl From<&SandboxFailure> for ErrorInfo {
    fn from(failure: &SandboxFailure) -> Self {
        let kind = match failure.kind {
            SandboxErrorKind::SecurityViolation => ErrorKind::SecurityViolation,
            SandboxErrorKind::Timeout => ErrorKind::Timeout,
            SandboxErrorKind::MemoryExceeded => ErrorKind::MemoryExceeded,
            SandboxErrorKind::RuntimeError => ErrorKind::Runtime,
        };
        ErrorInfo::new(kind, failure.message.clone())
    }
}

/// Outcome of one sandbox invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxResult {
    pub stdout: String,
    pub stderr: String,
    /// Value bound to `result` when the code finished
    pub return_value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SandboxFailure>,
    pub wall_time_ms: u64,
}

impl SandboxResult {
    pub fn success(return_value: Value, stdout: String, stderr: String, wall_time_ms: u64) -> Self {
        Self {
            stdout,
            stderr,
            return_value,
            error: None,
            wall_time_ms,
        }
    }

    pub fn failure(kind: SandboxErrorKind, message: impl Into<String>, wall_time_ms: u64) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            return_value: Value::Null,
            error: Some(SandboxFailure {
                kind,
                message: message.into(),
            }),
            wall_time_ms,
        }
    }

    pub fn with_output(mut self, stdout: String, stderr: String) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn error_kind(&self) -> Option<SandboxErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// Isolated executor for untrusted code units
#[async_trait]
pub trait CodeSandbox: Send + Sync {
    /// Run one code unit. Never fails outside the returned result.
    async fn run(&self, request: SandboxRequest) -> SandboxResult;

    /// Whether the sandbox can currently execute code
    async fn health_check(&self) -> bool {
        true
    }
}
