//! Tool registry
//!
//! Resolves a tool name to the worker kind that executes it. Resolution
//! happens once per distinct tool per plan run.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub use tokio_util::sync::CancellationToken;

use crate::types::ErrorInfo;

/// Context passed to a function tool for one attempt
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub step_id: String,
    /// 1-based attempt number
    pub attempt: u32,
    pub cancellation: CancellationToken,
}

impl ToolContext {
    pub fn new(step_id: impl Into<String>, attempt: u32, cancellation: CancellationToken) -> Self {
        Self {
            step_id: step_id.into(),
            attempt,
            cancellation,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Deterministic in-process tool
#[async_trait]
pub trait ToolFunction: Send + Sync {
    /// Tool name (must be unique)
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Invoke the tool with its resolved input object
    async fn call(&self, input: Value, ctx: ToolContext) -> Result<Value, ErrorInfo>;
}

fn default_memory_limit_mb() -> u64 {
    256
}

fn default_timeout_s() -> f64 {
    10.0
}

/// Untrusted code unit executed in the sandbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxTool {
    pub name: String,
    pub code: String,
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,
    #[serde(default = "default_timeout_s")]
    pub timeout_s: f64,
}

impl SandboxTool {
    pub fn new(name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: code.into(),
            memory_limit_mb: default_memory_limit_mb(),
            timeout_s: default_timeout_s(),
        }
    }

    pub fn with_limits(mut self, memory_limit_mb: u64, timeout_s: f64) -> Self {
        self.memory_limit_mb = memory_limit_mb;
        self.timeout_s = timeout_s;
        self
    }
}

/// How a tool is executed
#[derive(Clone)]
pub enum ToolHandle {
    Function(Arc<dyn ToolFunction>),
    Sandbox(Arc<SandboxTool>),
    Unknown,
}

impl ToolHandle {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Function(_) => "function",
            Self::Sandbox(_) => "sandbox",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Debug for ToolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Function(tool) => f.debug_tuple("Function").field(&tool.name()).finish(),
            Self::Sandbox(tool) => f.debug_tuple("Sandbox").field(&tool.name).finish(),
            Self::Unknown => f.write_str("Unknown"),
        }
    }
}

/// Tool discovery
pub trait ToolRegistry: Send + Sync {
    fn resolve_tool(&self, name: &str) -> ToolHandle;

    /// All registered tool names
    fn names(&self) -> Vec<String>;
}

/// Registry backed by in-process maps
#[derive(Default)]
pub struct InMemoryToolRegistry {
    functions: HashMap<String, Arc<dyn ToolFunction>>,
    sandbox_tools: HashMap<String, Arc<SandboxTool>>,
}

impl InMemoryToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function tool, replacing any tool of the same name
    pub fn register_function(&mut self, tool: Arc<dyn ToolFunction>) {
        let name = tool.name().to_string();
        self.sandbox_tools.remove(&name);
        self.functions.insert(name, tool);
    }

    /// Register a sandbox tool, replacing any tool of the same name
    pub fn register_sandbox(&mut self, tool: SandboxTool) {
        self.functions.remove(&tool.name);
        self.sandbox_tools.insert(tool.name.clone(), Arc::new(tool));
    }

    pub fn len(&self) -> usize {
        self.functions.len() + self.sandbox_tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ToolRegistry for InMemoryToolRegistry {
    fn resolve_tool(&self, name: &str) -> ToolHandle {
        if let Some(tool) = self.functions.get(name) {
            return ToolHandle::Function(tool.clone());
        }
        if let Some(tool) = self.sandbox_tools.get(name) {
            return ToolHandle::Sandbox(tool.clone());
        }
        ToolHandle::Unknown
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .functions
            .keys()
            .chain(self.sandbox_tools.keys())
            .cloned()
            .collect();
        names.sort();
        names
    }
}
