//! # Trellis Stores
//!
//! Backing stores and side channels for the Trellis engine.
//!
//! This crate provides:
//! - InMemory and Redis CacheBackend for the idempotency cache
//! - Tracing, broadcast, in-memory and fan-out MonitoringSink

mod cache_backend;
mod monitor_sink;

pub use cache_backend::{InMemoryCacheBackend, RedisCacheBackend};
pub use monitor_sink::{BroadcastMonitor, FanoutMonitor, InMemoryEventLog, TracingMonitor};

// Re-export core traits for convenience
pub use trellis_core::monitor::{MonitorEvent, MonitorEventKind, MonitoringSink};
pub use trellis_core::store::{CacheBackend, StoreError};
