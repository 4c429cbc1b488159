//! # Trellis Runtime
//!
//! Wires config, stores, the process sandbox and builtin tools into a
//! ready-to-run [`PlanExecutor`](trellis_core::PlanExecutor).

mod bootstrap;
mod builtin;
mod logging;

pub use bootstrap::{limits_from_config, retry_from_config, BootstrapError, EngineApp};
pub use builtin::{
    register_builtin_tools, ConcatTool, EchoTool, FailTool, JsonMergeTool, SumTool,
};
pub use logging::init_tracing;

pub use trellis_config::{load_config, TrellisConfig};
pub use trellis_core::{Plan, PlanResult, PlanStatus};
