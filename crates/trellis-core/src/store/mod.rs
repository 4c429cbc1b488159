//! Store module
//!
//! - CacheBackend: key/value store with TTL consumed by the idempotency cache
//! - IdempotencyCache: fingerprint-keyed result cache with in-flight coalescing
//!
//! Note: backend implementations are in trellis-stores crate

mod idempotency;

pub use idempotency::{
    canonical_json, fingerprint, keyed_fingerprint, CacheSource, CachedResult, IdempotencyCache,
    IdempotencyRecord,
};

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Store error types
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Item not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}

/// Key/value backing store with per-entry TTL
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), StoreError>;

    /// Returns whether an entry was removed
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
}
