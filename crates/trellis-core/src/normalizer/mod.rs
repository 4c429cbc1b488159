//! Plan validation and dependency levels
//!
//! Responsibilities:
//! - Validate plan correctness before anything runs
//! - Compute dependency levels (groups of steps that may run together)
//!
//! Nothing here touches tools or the network; a plan that fails validation
//! never executes a single step.

use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::resolver;
use crate::types::{Plan, StepId};

/// Validation errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("dependency cycle: step '{0}' can never become ready")]
    CycleDetected(String),

    #[error("step '{0}' depends on unknown step '{1}'")]
    MissingDependency(String, String),

    #[error("step id '{0}' is declared more than once")]
    DuplicateStepId(String),

    #[error("plan has no steps")]
    EmptyPlan,

    #[error("invalid step '{0}': {1}")]
    InvalidStep(String, String),
}

/// Extra plan checks run after the built-in ones
pub trait PlanValidator: Send + Sync {
    fn validate(&self, plan: &Plan) -> Result<(), ValidationError>;
}

/// Built-in checks plus optional custom validators
#[derive(Default)]
pub struct PlanNormalizer {
    validators: Vec<Box<dyn PlanValidator>>,
}

impl PlanNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a validator that runs after the built-in checks
    pub fn add_validator(&mut self, validator: Box<dyn PlanValidator>) {
        self.validators.push(validator);
    }

    /// Validate a plan
    pub fn validate(&self, plan: &Plan) -> Result<(), ValidationError> {
        validate_basic(plan)?;
        for validator in &self.validators {
            validator.validate(plan)?;
        }
        warn_undeclared_references(plan);
        Ok(())
    }

    /// Validate and group steps into dependency levels
    pub fn levels(&self, plan: &Plan) -> Result<Vec<Vec<StepId>>, ValidationError> {
        self.validate(plan)?;
        dependency_levels(plan)
    }
}

fn validate_basic(plan: &Plan) -> Result<(), ValidationError> {
    if plan.steps.is_empty() {
        return Err(ValidationError::EmptyPlan);
    }

    let mut seen_ids = HashSet::new();
    for step in &plan.steps {
        if step.id.as_str().is_empty() {
            return Err(ValidationError::InvalidStep(
                String::new(),
                "step id must not be empty".to_string(),
            ));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(ValidationError::DuplicateStepId(step.id.to_string()));
        }
    }

    for step in &plan.steps {
        for dep in &step.depends_on {
            if !seen_ids.contains(dep.as_str()) {
                return Err(ValidationError::MissingDependency(
                    step.id.to_string(),
                    dep.to_string(),
                ));
            }
        }
        if step.tool.trim().is_empty() {
            return Err(ValidationError::InvalidStep(
                step.id.to_string(),
                "tool must not be empty".to_string(),
            ));
        }
        if let Some(timeout_s) = step.timeout_s {
            if !(timeout_s.is_finite() && timeout_s > 0.0) {
                return Err(ValidationError::InvalidStep(
                    step.id.to_string(),
                    format!("timeout_s must be positive, got {}", timeout_s),
                ));
            }
        }
        if !(step.estimated_cost.is_finite() && step.estimated_cost >= 0.0) {
            return Err(ValidationError::InvalidStep(
                step.id.to_string(),
                format!(
                    "estimated_cost must be non-negative, got {}",
                    step.estimated_cost
                ),
            ));
        }
        if let Some(policy) = &step.retry_policy {
            if policy.max_attempts == 0 {
                return Err(ValidationError::InvalidStep(
                    step.id.to_string(),
                    "retry_policy.max_attempts must be at least 1".to_string(),
                ));
            }
        }
    }

    // Kahn's pass leaves steps on a cycle (or behind one) unplaced
    dependency_levels(plan).map(|_| ())
}

/// `step:<id>` references to steps that are not declared dependencies still
/// resolve only if the referenced step happened to finish first.
fn warn_undeclared_references(plan: &Plan) {
    for step in &plan.steps {
        for referenced in resolver::references(&step.input_value()) {
            if !step.depends_on.iter().any(|dep| dep.as_str() == referenced) {
                tracing::warn!(
                    step_id = %step.id,
                    referenced = %referenced,
                    "step references an output it does not depend on"
                );
            }
        }
    }
}

/// Group steps into levels: level 0 has no dependencies, level n depends only
/// on earlier levels. Steps keep declaration order inside a level.
pub fn dependency_levels(plan: &Plan) -> Result<Vec<Vec<StepId>>, ValidationError> {
    let mut in_degree: HashMap<&str, usize> = plan
        .steps
        .iter()
        .map(|s| (s.id.as_str(), s.depends_on.len()))
        .collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in &plan.steps {
        for dep in &step.depends_on {
            if !in_degree.contains_key(dep.as_str()) {
                return Err(ValidationError::MissingDependency(
                    step.id.to_string(),
                    dep.to_string(),
                ));
            }
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(step.id.as_str());
        }
    }

    let mut levels = Vec::new();
    let mut current: Vec<&str> = plan
        .steps
        .iter()
        .map(|s| s.id.as_str())
        .filter(|id| in_degree.get(id) == Some(&0))
        .collect();
    let mut placed = 0;

    while !current.is_empty() {
        placed += current.len();
        let mut next = Vec::new();
        for id in &current {
            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        next.push(*dependent);
                    }
                }
            }
        }
        next.sort_by_key(|id| plan.position(id));
        levels.push(current.iter().map(|id| StepId::from(*id)).collect());
        current = next;
    }

    if placed < plan.steps.len() {
        let stuck = plan
            .steps
            .iter()
            .find(|s| in_degree.get(s.id.as_str()).copied().unwrap_or(0) > 0)
            .map(|s| s.id.to_string())
            .unwrap_or_default();
        return Err(ValidationError::CycleDetected(stuck));
    }
    Ok(levels)
}
