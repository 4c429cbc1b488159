//! # Trellis Sandbox
//!
//! Runs untrusted code units as short-lived interpreter processes:
//! static analysis first, then a restricted namespace inside a child with
//! address-space and CPU ceilings, its own process group and optional
//! bubblewrap isolation.

pub mod analyzer;
mod harness;
pub mod isolation;
mod process;

use thiserror::Error;

pub use analyzer::{analyze, Violation, ViolationCategory};
pub use isolation::{IsolationMode, IsolationPolicy};
pub use process::{
    ProcessSandbox, ProcessSandboxConfig, DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_PYTHON,
};

/// Failures of the sandbox machinery itself, as opposed to the code unit
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to start interpreter: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("isolation unavailable: {0}")]
    Isolation(String),

    #[error("interpreter protocol error: {0}")]
    Protocol(String),
}
