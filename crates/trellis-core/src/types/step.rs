//! Step type definitions
//!
//! Step represents an atomic tool invocation in a Plan.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::retry::RetryPolicy;

/// Strongly-typed Step ID.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct StepId(pub String);

impl StepId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for StepId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for StepId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<&StepId> for StepId {
    fn from(value: &StepId) -> Self {
        value.clone()
    }
}

impl From<StepId> for String {
    fn from(value: StepId) -> Self {
        value.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<str> for StepId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl PartialEq<&str> for StepId {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

/// A single step in the execution plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Unique identifier for this step
    pub id: StepId,
    /// Name of the tool to invoke
    #[serde(alias = "tool_ref")]
    pub tool: String,
    /// Tool input; strings of the form `step:<id>` are replaced by upstream outputs
    #[serde(default)]
    pub input: Map<String, Value>,
    /// IDs of steps this step depends on
    #[serde(default)]
    pub depends_on: Vec<StepId>,
    /// Enables result caching for this step, scoped by the key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Absent means the step fails on its first error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    /// Per-attempt wall-clock limit in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_s: Option<f64>,
    /// Cost charged against the plan budget
    #[serde(default)]
    pub estimated_cost: f64,
}

impl Step {
    /// Create a new step invoking `tool`
    pub fn new(id: impl Into<StepId>, tool: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tool: tool.into(),
            input: Map::new(),
            depends_on: Vec::new(),
            idempotency_key: None,
            retry_policy: None,
            timeout_s: None,
            estimated_cost: 0.0,
        }
    }

    /// Add dependencies
    pub fn with_depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StepId>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the input map. Non-object values are stored under `value`.
    pub fn with_input(mut self, input: Value) -> Self {
        self.input = match input {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_timeout_s(mut self, timeout_s: f64) -> Self {
        self.timeout_s = Some(timeout_s);
        self
    }

    pub fn with_estimated_cost(mut self, cost: f64) -> Self {
        self.estimated_cost = cost;
        self
    }

    /// Input as a JSON value
    pub fn input_value(&self) -> Value {
        Value::Object(self.input.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_accepts_tool_ref_alias() {
        let step: Step = serde_json::from_value(json!({
            "id": "s1",
            "tool_ref": "echo",
            "input": {"text": "hi"}
        }))
        .expect("step");
        assert_eq!(step.tool, "echo");
        assert_eq!(step.id, "s1");
        assert!(step.depends_on.is_empty());
        assert!(step.retry_policy.is_none());
        assert_eq!(step.estimated_cost, 0.0);
    }

    #[test]
    fn test_with_input_wraps_scalars() {
        let step = Step::new("s1", "echo").with_input(json!(42));
        assert_eq!(step.input_value(), json!({"value": 42}));
    }
}
