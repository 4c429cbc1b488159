//! Core type definitions for Trellis
//!
//! - Plan: a directed graph of steps produced by a planner
//! - Step: a single tool invocation with dependencies
//! - StepOutcome / ErrorInfo: per-step results, failures are values
//! - ExecutionContext: step outputs accumulated during one plan run

mod context;
mod outcome;
mod plan;
mod step;

pub use context::ExecutionContext;
pub use outcome::{ErrorInfo, ErrorKind, PlanResult, PlanStatus, StepOutcome, StepStatus};
pub use plan::Plan;
pub use step::{Step, StepId};
