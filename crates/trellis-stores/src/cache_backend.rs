//! CacheBackend implementations
//!
//! Values are stored as JSON. Entries expire after their TTL; an expired
//! entry reads as absent.

use async_trait::async_trait;
use redis::AsyncCommands;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tokio::time::Instant;

use trellis_core::store::{CacheBackend, StoreError};

/// In-memory implementation for development and testing
pub struct InMemoryCacheBackend {
    entries: RwLock<HashMap<String, (Value, Option<Instant>)>>,
}

impl InMemoryCacheBackend {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Number of entries, expired ones included until they are read
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryCacheBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for InMemoryCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let now = Instant::now();
        {
            let entries = self
                .entries
                .read()
                .map_err(|e| StoreError::Internal(e.to_string()))?;
            match entries.get(key) {
                None => return Ok(None),
                Some((value, expires_at)) if expires_at.map_or(true, |at| now < at) => {
                    return Ok(Some(value.clone()))
                }
                Some(_) => {}
            }
        }
        let mut entries = self
            .entries
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        entries.remove(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), StoreError> {
        let expires_at = Instant::now().checked_add(ttl);
        let mut entries = self
            .entries
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        entries.insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(entries.remove(key).is_some())
    }
}

/// Redis implementation; keys are `<prefix>:idem:<key>` with a server-side TTL.
pub struct RedisCacheBackend {
    client: redis::Client,
    key_prefix: String,
}

impl RedisCacheBackend {
    /// Create a new Redis cache backend from a connection URL.
    pub fn new(connection_url: &str, key_prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client = redis::Client::open(connection_url)
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            key_prefix: key_prefix.into(),
        })
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    fn entry_key(&self, key: &str) -> String {
        format!("{}:idem:{}", self.key_prefix, key)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }
}

/// Redis TTLs are whole seconds and must be positive
fn ttl_seconds(ttl: Duration) -> u64 {
    let secs = ttl.as_secs();
    if ttl.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs.max(1)
    }
}

#[async_trait]
impl CacheBackend for RedisCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let mut conn = self.connection().await?;
        let payload: Option<String> = conn
            .get(self.entry_key(key))
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(&value)?;
        conn.set_ex::<_, _, ()>(self.entry_key(key), payload, ttl_seconds(ttl))
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let removed: i64 = conn
            .del(self.entry_key(key))
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(removed > 0)
    }
}
