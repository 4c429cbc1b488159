//! ExecutionContext - step outputs produced during one plan run

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Append-only map from step id to output.
///
/// An output, once recorded, is never replaced for the rest of the run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionContext {
    outputs: BTreeMap<String, Value>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a step output. Returns false if the step already has one.
    pub fn insert(&mut self, step_id: impl Into<String>, output: Value) -> bool {
        let step_id = step_id.into();
        if self.outputs.contains_key(&step_id) {
            tracing::warn!(step_id = %step_id, "ignoring duplicate output for step");
            return false;
        }
        self.outputs.insert(step_id, output);
        true
    }

    pub fn get(&self, step_id: &str) -> Option<&Value> {
        self.outputs.get(step_id)
    }

    pub fn contains(&self, step_id: &str) -> bool {
        self.outputs.contains_key(step_id)
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.outputs.iter()
    }

    /// Copy of all outputs
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.outputs.clone()
    }
}

impl FromIterator<(String, Value)> for ExecutionContext {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        let mut ctx = Self::new();
        for (k, v) in iter {
            ctx.insert(k, v);
        }
        ctx
    }
}
