//! Deterministic function tools available to every plan.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use trellis_core::registry::{InMemoryToolRegistry, ToolContext, ToolFunction};
use trellis_core::types::{ErrorInfo, ErrorKind};

fn params_get_str<'a>(input: &'a Value, key: &str) -> Option<&'a str> {
    input.get(key).and_then(|v| v.as_str())
}

fn params_get_array<'a>(input: &'a Value, key: &str) -> Result<&'a Vec<Value>, ErrorInfo> {
    input
        .get(key)
        .and_then(|v| v.as_array())
        .ok_or_else(|| ErrorInfo::invalid_input(format!("'{}' must be an array", key)))
}

/// Register echo, sum, concat, json_merge and fail
pub fn register_builtin_tools(registry: &mut InMemoryToolRegistry) {
    registry.register_function(Arc::new(EchoTool));
    registry.register_function(Arc::new(SumTool));
    registry.register_function(Arc::new(ConcatTool));
    registry.register_function(Arc::new(JsonMergeTool));
    registry.register_function(Arc::new(FailTool));
}

/// Echo tool: returns its resolved input unchanged
pub struct EchoTool;

#[async_trait]
impl ToolFunction for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Returns the resolved input as output"
    }

    async fn call(&self, input: Value, _ctx: ToolContext) -> Result<Value, ErrorInfo> {
        Ok(input)
    }
}

/// Sum tool: `{"values": [numbers]}` -> `{"sum": n}`
pub struct SumTool;

#[async_trait]
impl ToolFunction for SumTool {
    fn name(&self) -> &str {
        "sum"
    }

    fn description(&self) -> &str {
        "Adds up input.values"
    }

    async fn call(&self, input: Value, _ctx: ToolContext) -> Result<Value, ErrorInfo> {
        let values = params_get_array(&input, "values")?;
        let all_integers = values.iter().all(|v| v.is_i64());
        if all_integers {
            let mut total: i64 = 0;
            for value in values {
                total = value
                    .as_i64()
                    .and_then(|v| total.checked_add(v))
                    .ok_or_else(|| ErrorInfo::invalid_input("integer sum overflowed"))?;
            }
            return Ok(serde_json::json!({ "sum": total }));
        }

        let mut total = 0.0;
        for (index, value) in values.iter().enumerate() {
            total += value.as_f64().ok_or_else(|| {
                ErrorInfo::invalid_input(format!("values[{}] is not a number", index))
            })?;
        }
        Ok(serde_json::json!({ "sum": total }))
    }
}

/// Concat tool: joins `parts` with `separator` (default empty)
pub struct ConcatTool;

#[async_trait]
impl ToolFunction for ConcatTool {
    fn name(&self) -> &str {
        "concat"
    }

    fn description(&self) -> &str {
        "Joins input.parts into one string"
    }

    async fn call(&self, input: Value, _ctx: ToolContext) -> Result<Value, ErrorInfo> {
        let parts = params_get_array(&input, "parts")?;
        let separator = params_get_str(&input, "separator").unwrap_or("");
        let rendered: Vec<String> = parts
            .iter()
            .map(|part| match part {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
        Ok(serde_json::json!({ "result": rendered.join(separator) }))
    }
}

/// JSON merge tool: deep-merges `objects` left to right
pub struct JsonMergeTool;

fn merge_into(target: &mut Map<String, Value>, source: &Map<String, Value>) {
    for (key, value) in source {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_into(existing, incoming)
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

#[async_trait]
impl ToolFunction for JsonMergeTool {
    fn name(&self) -> &str {
        "json_merge"
    }

    fn description(&self) -> &str {
        "Deep-merges input.objects; later objects win"
    }

    async fn call(&self, input: Value, _ctx: ToolContext) -> Result<Value, ErrorInfo> {
        let objects = params_get_array(&input, "objects")?;
        let mut merged = Map::new();
        for (index, object) in objects.iter().enumerate() {
            let object = object.as_object().ok_or_else(|| {
                ErrorInfo::invalid_input(format!("objects[{}] is not an object", index))
            })?;
            merge_into(&mut merged, object);
        }
        Ok(Value::Object(merged))
    }
}

/// Fail tool for failure drills.
///
/// Fails with `kind` (default `runtime`) and `message`. With `fail_attempts`
/// set, only the first that many attempts fail and later ones return
/// `{"attempt": n}`.
pub struct FailTool;

#[async_trait]
impl ToolFunction for FailTool {
    fn name(&self) -> &str {
        "fail"
    }

    fn description(&self) -> &str {
        "Fails on purpose, optionally only for the first attempts"
    }

    async fn call(&self, input: Value, ctx: ToolContext) -> Result<Value, ErrorInfo> {
        if let Some(fail_attempts) = input.get("fail_attempts").and_then(|v| v.as_u64()) {
            if u64::from(ctx.attempt) > fail_attempts {
                return Ok(serde_json::json!({ "attempt": ctx.attempt }));
            }
        }
        let kind = match params_get_str(&input, "kind") {
            Some(raw) => serde_json::from_value::<ErrorKind>(Value::String(raw.to_string()))
                .map_err(|_| ErrorInfo::invalid_input(format!("unknown error kind '{}'", raw)))?,
            None => ErrorKind::Runtime,
        };
        let message = params_get_str(&input, "message").unwrap_or("failure requested");
        Err(ErrorInfo::new(kind, message))
    }
}
