//! # Trellis Core
//!
//! Data model and deterministic execution logic for the Trellis engine.
//!
//! This crate contains:
//! - Plan / Step / StepOutcome / ExecutionContext definitions
//! - Plan validation and dependency levels
//! - Reference resolution, retry policy and resource limiting
//! - Idempotent, bounded fan-out dispatch and result aggregation
//! - The plan executor that ties them together
//!
//! This crate does NOT care about:
//! - How code units are isolated (see `trellis-sandbox`)
//! - Where cached results or monitoring events end up (see `trellis-stores`)
//! - How the engine is configured or launched

pub mod aggregator;
pub mod dispatch;
pub mod executor;
pub mod limiter;
pub mod monitor;
pub mod normalizer;
pub mod registry;
pub mod resolver;
pub mod retry;
pub mod sandbox;
pub mod store;
pub mod types;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::aggregator::{aggregate, Aggregate, AggregateError, AggregationStrategy};
    pub use crate::dispatch::{
        BatchStatus, DispatchReport, Dispatcher, UnitContext, UnitOutcome, WorkUnit,
    };
    pub use crate::executor::{DagNode, ExecutionDag, NodeState, PlanExecutor};
    pub use crate::limiter::{
        Admission, DenyReason, ResourceLimiter, ResourceLimits, ResourceUsage,
    };
    pub use crate::monitor::{MonitorEvent, MonitorEventKind, MonitoringSink, NoopMonitor};
    pub use crate::normalizer::{PlanNormalizer, PlanValidator, ValidationError};
    pub use crate::registry::{
        CancellationToken, InMemoryToolRegistry, SandboxTool, ToolContext, ToolFunction,
        ToolHandle, ToolRegistry,
    };
    pub use crate::resolver::{resolve, ResolveError};
    pub use crate::retry::{RetryDecision, RetryPolicy};
    pub use crate::sandbox::{
        CodeSandbox, SandboxErrorKind, SandboxFailure, SandboxRequest, SandboxResult,
    };
    pub use crate::store::{CacheBackend, IdempotencyCache, IdempotencyRecord, StoreError};
    pub use crate::types::{
        ErrorInfo, ErrorKind, ExecutionContext, Plan, PlanResult, PlanStatus, Step, StepId,
        StepOutcome, StepStatus,
    };
}

// Re-export key types at crate root
pub use dispatch::{DispatchReport, Dispatcher, WorkUnit};
pub use executor::PlanExecutor;
pub use limiter::{ResourceLimiter, ResourceLimits};
pub use normalizer::{PlanNormalizer, ValidationError};
pub use registry::{InMemoryToolRegistry, ToolFunction, ToolHandle, ToolRegistry};
pub use retry::RetryPolicy;
pub use sandbox::{CodeSandbox, SandboxRequest, SandboxResult};
pub use store::{CacheBackend, IdempotencyCache, StoreError};
pub use types::{ErrorInfo, ErrorKind, Plan, PlanResult, PlanStatus, Step, StepId, StepOutcome};
