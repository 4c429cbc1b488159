//! Step reference resolution
//!
//! A JSON string exactly equal to `step:<id>` inside a step input is replaced
//! by the output recorded for `<id>`. Strings that merely contain the prefix
//! are left untouched.

use serde_json::Value;
use thiserror::Error;

use crate::types::ExecutionContext;

/// Prefix marking a step reference
pub const STEP_REFERENCE_PREFIX: &str = "step:";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("unresolved reference to step '{0}'")]
    Unresolved(String),
}

/// Step id referenced by `value`, if it is a reference string.
pub fn parse_reference(value: &str) -> Option<&str> {
    let id = value.strip_prefix(STEP_REFERENCE_PREFIX)?;
    if id.is_empty() {
        return None;
    }
    Some(id)
}

/// Replace every reference in `value` with the referenced output.
pub fn resolve(value: &Value, context: &ExecutionContext) -> Result<Value, ResolveError> {
    match value {
        Value::String(s) => match parse_reference(s) {
            Some(id) => context
                .get(id)
                .cloned()
                .ok_or_else(|| ResolveError::Unresolved(id.to_string())),
            None => Ok(value.clone()),
        },
        Value::Array(items) => items
            .iter()
            .map(|item| resolve(item, context))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut resolved = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                resolved.insert(key.clone(), resolve(item, context)?);
            }
            Ok(Value::Object(resolved))
        }
        _ => Ok(value.clone()),
    }
}

/// Every step id referenced anywhere in `value`, in traversal order.
pub fn references(value: &Value) -> Vec<String> {
    let mut out = Vec::new();
    collect_references(value, &mut out);
    out
}

fn collect_references(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            if let Some(id) = parse_reference(s) {
                if !out.iter().any(|existing| existing == id) {
                    out.push(id.to_string());
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|item| collect_references(item, out)),
        Value::Object(map) => map.values().for_each(|item| collect_references(item, out)),
        _ => {}
    }
}
