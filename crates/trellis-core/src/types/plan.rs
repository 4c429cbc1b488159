//! Plan type definitions

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::step::Step;

fn generate_plan_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Execution plan - a directed graph of steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Plan identifier, generated when absent from the input document
    #[serde(default = "generate_plan_id")]
    pub id: String,
    /// Steps in declaration order
    pub steps: Vec<Step>,
}

impl Plan {
    /// Create a new plan
    pub fn new(id: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            id: id.into(),
            steps,
        }
    }

    /// Parse a plan from its JSON document form
    pub fn from_json(input: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(input)
    }

    /// Get a step by ID
    pub fn get_step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id.as_str() == id)
    }

    /// Position of a step in declaration order
    pub fn position(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id.as_str() == id)
    }

    /// Distinct tool names referenced by the plan
    pub fn tools(&self) -> BTreeSet<&str> {
        self.steps.iter().map(|s| s.tool.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json_generates_missing_id() {
        let plan = Plan::from_json(
            r#"{"steps":[{"id":"a","tool":"echo"},{"id":"b","tool":"echo","depends_on":["a"]}]}"#,
        )
        .expect("plan");
        assert!(!plan.id.is_empty());
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.get_step("b").map(|s| s.depends_on.len()), Some(1));
        assert_eq!(plan.tools().into_iter().collect::<Vec<_>>(), vec!["echo"]);
    }

    #[test]
    fn test_from_json_rejects_missing_tool() {
        assert!(Plan::from_json(r#"{"id":"p","steps":[{"id":"a"}]}"#).is_err());
    }
}
