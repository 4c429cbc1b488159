//! IdempotencyCache - fingerprint-keyed result cache
//!
//! At most one computation per fingerprint runs at a time inside one process.
//! Later callers subscribe to the leader's result; if the leader is dropped
//! before finishing, one waiting caller takes over.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use super::{CacheBackend, StoreError};
use crate::types::{ErrorInfo, ErrorKind};

type SharedResult = Option<Result<Value, ErrorInfo>>;

/// Stored form of a cached result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub fingerprint: String,
    pub result: Value,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn new(fingerprint: impl Into<String>, result: Value, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            fingerprint: fingerprint.into(),
            result,
            expires_at: Utc::now().checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Where a result came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    /// This caller ran the computation
    Computed,
    /// Read from the backing store
    Stored,
    /// Shared from a concurrent caller's computation
    Coalesced,
}

#[derive(Debug, Clone)]
pub struct CachedResult {
    pub result: Result<Value, ErrorInfo>,
    pub source: CacheSource,
}

impl CachedResult {
    pub fn is_hit(&self) -> bool {
        self.source != CacheSource::Computed
    }
}

/// JSON text with object keys sorted at every depth
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(item) = map.get(key) {
                    write_canonical(item, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// SHA-256 (hex) of the tool name and canonicalized input
pub fn fingerprint(tool: &str, input: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tool.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical_json(input).as_bytes());
    hex::encode(hasher.finalize())
}

/// Fingerprint scoped by a caller-supplied idempotency key
pub fn keyed_fingerprint(tool: &str, key: &str, input: &Value) -> String {
    fingerprint(
        tool,
        &serde_json::json!({ "idempotency_key": key, "input": input }),
    )
}

enum Claim {
    Leader(watch::Sender<SharedResult>),
    Follower(watch::Receiver<SharedResult>),
}

struct InFlightGuard<'a> {
    in_flight: &'a Mutex<HashMap<String, watch::Receiver<SharedResult>>>,
    fingerprint: &'a str,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut map = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        map.remove(self.fingerprint);
    }
}

/// Result cache keyed by fingerprint
pub struct IdempotencyCache {
    backend: Option<Arc<dyn CacheBackend>>,
    in_flight: Mutex<HashMap<String, watch::Receiver<SharedResult>>>,
}

impl IdempotencyCache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend: Some(backend),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Coalesces concurrent computations but stores nothing
    pub fn without_backend() -> Self {
        Self {
            backend: None,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Number of fingerprints currently being computed
    pub fn in_flight_len(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Return the stored result for `fingerprint`, or run `compute` once.
    ///
    /// Successful results are stored for `ttl`. Failures reach every waiting
    /// caller but are never stored.
    pub async fn get_or_compute<F, Fut>(
        &self,
        fingerprint: &str,
        ttl: Duration,
        compute: F,
    ) -> CachedResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, ErrorInfo>>,
    {
        let mut compute = Some(compute);
        loop {
            if let Some(value) = self.lookup(fingerprint).await {
                tracing::debug!(fingerprint = %fingerprint, "idempotency cache hit");
                return CachedResult {
                    result: Ok(value),
                    source: CacheSource::Stored,
                };
            }

            match self.claim(fingerprint) {
                Claim::Follower(mut rx) => {
                    if let Some(result) = wait_for_leader(&mut rx).await {
                        return CachedResult {
                            result,
                            source: CacheSource::Coalesced,
                        };
                    }
                    tracing::debug!(
                        fingerprint = %fingerprint,
                        "in-flight computation abandoned, retrying"
                    );
                }
                Claim::Leader(tx) => {
                    let _guard = InFlightGuard {
                        in_flight: &self.in_flight,
                        fingerprint,
                    };
                    // A leader that finished while our first lookup was pending
                    // has already stored its result.
                    if let Some(value) = self.lookup(fingerprint).await {
                        tx.send_replace(Some(Ok(value.clone())));
                        return CachedResult {
                            result: Ok(value),
                            source: CacheSource::Stored,
                        };
                    }
                    let result = match compute.take() {
                        Some(compute) => compute().await,
                        None => Err(ErrorInfo::new(
                            ErrorKind::Runtime,
                            "idempotent computation already consumed",
                        )),
                    };
                    if let Ok(value) = &result {
                        self.store(fingerprint, value, ttl).await;
                    }
                    tx.send_replace(Some(result.clone()));
                    return CachedResult {
                        result,
                        source: CacheSource::Computed,
                    };
                }
            }
        }
    }

    /// Delete the stored record for `fingerprint`
    pub async fn clear(&self, fingerprint: &str) -> Result<bool, StoreError> {
        match &self.backend {
            Some(backend) => backend.delete(fingerprint).await,
            None => Ok(false),
        }
    }

    fn claim(&self, fingerprint: &str) -> Claim {
        let mut map = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(rx) = map.get(fingerprint) {
            return Claim::Follower(rx.clone());
        }
        let (tx, rx) = watch::channel(None);
        map.insert(fingerprint.to_string(), rx);
        Claim::Leader(tx)
    }

    async fn lookup(&self, fingerprint: &str) -> Option<Value> {
        let backend = self.backend.as_ref()?;
        match backend.get(fingerprint).await {
            Ok(Some(raw)) => match serde_json::from_value::<IdempotencyRecord>(raw) {
                Ok(record) if !record.is_expired(Utc::now()) => Some(record.result),
                Ok(_) => None,
                Err(error) => {
                    tracing::warn!(
                        fingerprint = %fingerprint,
                        error = %error,
                        "ignoring malformed idempotency record"
                    );
                    None
                }
            },
            Ok(None) => None,
            Err(error) => {
                tracing::warn!(
                    fingerprint = %fingerprint,
                    error = %error,
                    "cache backend unavailable, treating as miss"
                );
                None
            }
        }
    }

    async fn store(&self, fingerprint: &str, value: &Value, ttl: Duration) {
        let Some(backend) = &self.backend else {
            return;
        };
        let record = IdempotencyRecord::new(fingerprint, value.clone(), ttl);
        let encoded = match serde_json::to_value(&record) {
            Ok(encoded) => encoded,
            Err(error) => {
                tracing::warn!(fingerprint = %fingerprint, error = %error, "failed to encode idempotency record");
                return;
            }
        };
        if let Err(error) = backend.set(fingerprint, encoded, ttl).await {
            tracing::warn!(
                fingerprint = %fingerprint,
                error = %error,
                "failed to store idempotency record"
            );
        }
    }
}

impl Default for IdempotencyCache {
    fn default() -> Self {
        Self::without_backend()
    }
}

async fn wait_for_leader(rx: &mut watch::Receiver<SharedResult>) -> SharedResult {
    loop {
        let current = rx.borrow_and_update().clone();
        if current.is_some() {
            return current;
        }
        if rx.changed().await.is_err() {
            return rx.borrow().clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures_util::future::join_all;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TTL: Duration = Duration::from_secs(60);

    #[derive(Default)]
    struct MemoryBackend {
        entries: Mutex<HashMap<String, Value>>,
    }

    #[async_trait]
    impl CacheBackend for MemoryBackend {
        async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
            Ok(self.entries.lock().unwrap().get(key).cloned())
        }

        async fn set(&self, key: &str, value: Value, _ttl: Duration) -> Result<(), StoreError> {
            self.entries.lock().unwrap().insert(key.to_string(), value);
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<bool, StoreError> {
            Ok(self.entries.lock().unwrap().remove(key).is_some())
        }
    }

    struct DownBackend;

    #[async_trait]
    impl CacheBackend for DownBackend {
        async fn get(&self, _key: &str) -> Result<Option<Value>, StoreError> {
            Err(StoreError::Connection("refused".to_string()))
        }

        async fn set(&self, _key: &str, _value: Value, _ttl: Duration) -> Result<(), StoreError> {
            Err(StoreError::Connection("refused".to_string()))
        }

        async fn delete(&self, _key: &str) -> Result<bool, StoreError> {
            Err(StoreError::Connection("refused".to_string()))
        }
    }

    /// Answers `get` with the value seen when the call began, after a delay
    struct SlowBackend {
        inner: MemoryBackend,
        delay: Duration,
    }

    #[async_trait]
    impl CacheBackend for SlowBackend {
        async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
            let seen = self.inner.get(key).await;
            tokio::time::sleep(self.delay).await;
            seen
        }

        async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), StoreError> {
            self.inner.set(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<bool, StoreError> {
            self.inner.delete(key).await
        }
    }

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let a = fingerprint("search", &json!({"q": "rust", "opts": {"x": 1, "y": [1, 2]}}));
        let b = fingerprint("search", &json!({"opts": {"y": [1, 2], "x": 1}, "q": "rust"}));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, fingerprint("other", &json!({"q": "rust", "opts": {"x": 1, "y": [1, 2]}})));
        assert_ne!(
            keyed_fingerprint("search", "k1", &json!({})),
            keyed_fingerprint("search", "k2", &json!({}))
        );
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        assert_eq!(
            canonical_json(&json!({"b": 1, "a": {"d": [true, null], "c": "x"}})),
            r#"{"a":{"c":"x","d":[true,null]},"b":1}"#
        );
    }

    #[test]
    fn test_hit_skips_compute() {
        tokio_test::block_on(async {
            let backend = Arc::new(MemoryBackend::default());
            let cache = IdempotencyCache::new(backend.clone());
            let calls = AtomicUsize::new(0);

            let first = cache
                .get_or_compute("fp", TTL, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"answer": 42}))
                })
                .await;
            assert_eq!(first.source, CacheSource::Computed);

            let second = cache
                .get_or_compute("fp", TTL, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("recomputed"))
                })
                .await;
            assert_eq!(second.source, CacheSource::Stored);
            assert_eq!(second.result, Ok(json!({"answer": 42})));
            assert_eq!(calls.load(Ordering::SeqCst), 1);

            let stored = backend.get("fp").await.expect("get").expect("record");
            let record: IdempotencyRecord = serde_json::from_value(stored).expect("record");
            assert_eq!(record.fingerprint, "fp");
            assert!(!record.is_expired(Utc::now()));
        });
    }

    #[test]
    fn test_concurrent_callers_compute_once() {
        tokio_test::block_on(async {
            let cache = IdempotencyCache::new(Arc::new(MemoryBackend::default()));
            let counter = AtomicUsize::new(0);
            let calls = &counter;

            let results = join_all((0..10).map(|_| {
                cache.get_or_compute("fp", TTL, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(json!("shared"))
                })
            }))
            .await;

            assert_eq!(counter.load(Ordering::SeqCst), 1);
            assert!(results.iter().all(|r| r.result == Ok(json!("shared"))));
            assert_eq!(
                results
                    .iter()
                    .filter(|r| r.source == CacheSource::Computed)
                    .count(),
                1
            );
            assert_eq!(cache.in_flight_len(), 0);
        });
    }

    #[test]
    fn test_slow_backend_lookup_does_not_recompute() {
        tokio_test::block_on(async {
            let cache = IdempotencyCache::new(Arc::new(SlowBackend {
                inner: MemoryBackend::default(),
                delay: Duration::from_millis(50),
            }));
            let counter = AtomicUsize::new(0);
            let calls = &counter;

            let results = join_all((0..2).map(|_| {
                cache.get_or_compute("fp", TTL, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("once"))
                })
            }))
            .await;

            assert_eq!(counter.load(Ordering::SeqCst), 1);
            assert!(results.iter().all(|r| r.result == Ok(json!("once"))));
            assert_eq!(
                results
                    .iter()
                    .filter(|r| r.source == CacheSource::Computed)
                    .count(),
                1
            );
            assert_eq!(cache.in_flight_len(), 0);
        });
    }

    #[test]
    fn test_failures_are_shared_but_not_stored() {
        tokio_test::block_on(async {
            let backend = Arc::new(MemoryBackend::default());
            let cache = IdempotencyCache::new(backend.clone());
            let counter = AtomicUsize::new(0);
            let calls = &counter;

            let results = join_all((0..3).map(|_| {
                cache.get_or_compute("fp", TTL, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Err(ErrorInfo::runtime("flaky"))
                })
            }))
            .await;
            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert!(results.iter().all(|r| r.result.is_err()));
            assert!(backend.get("fp").await.expect("get").is_none());

            let retry = cache
                .get_or_compute("fp", TTL, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(1))
                })
                .await;
            assert_eq!(retry.result, Ok(json!(1)));
            assert_eq!(calls.load(Ordering::SeqCst), 2);
        });
    }

    #[test]
    fn test_unavailable_backend_degrades_to_miss() {
        tokio_test::block_on(async {
            let cache = IdempotencyCache::new(Arc::new(DownBackend));
            let calls = AtomicUsize::new(0);
            for _ in 0..2 {
                let out = cache
                    .get_or_compute("fp", TTL, || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(json!("fresh"))
                    })
                    .await;
                assert_eq!(out.result, Ok(json!("fresh")));
                assert_eq!(out.source, CacheSource::Computed);
            }
            assert_eq!(calls.load(Ordering::SeqCst), 2);
        });
    }

    #[test]
    fn test_expired_record_is_a_miss() {
        tokio_test::block_on(async {
            let backend = Arc::new(MemoryBackend::default());
            let stale = IdempotencyRecord {
                fingerprint: "fp".to_string(),
                result: json!("stale"),
                expires_at: Utc::now() - chrono::Duration::seconds(5),
            };
            backend
                .set("fp", serde_json::to_value(&stale).expect("json"), TTL)
                .await
                .expect("set");
            let cache = IdempotencyCache::new(backend);
            let out = cache
                .get_or_compute("fp", TTL, || async { Ok(json!("fresh")) })
                .await;
            assert_eq!(out.result, Ok(json!("fresh")));
        });
    }

    #[test]
    fn test_waiter_takes_over_when_leader_is_dropped() {
        tokio_test::block_on(async {
            let cache = IdempotencyCache::without_backend();

            let mut leader = Box::pin(cache.get_or_compute("fp", TTL, || async {
                std::future::pending::<Result<Value, ErrorInfo>>().await
            }));
            assert!(futures_util::poll!(&mut leader).is_pending());
            assert_eq!(cache.in_flight_len(), 1);

            let mut follower = Box::pin(
                cache.get_or_compute("fp", TTL, || async { Ok(json!("follower")) }),
            );
            assert!(futures_util::poll!(&mut follower).is_pending());

            drop(leader);
            let out = follower.await;
            assert_eq!(out.result, Ok(json!("follower")));
            assert_eq!(out.source, CacheSource::Computed);
            assert_eq!(cache.in_flight_len(), 0);
        });
    }

    #[test]
    fn test_clear_removes_record() {
        tokio_test::block_on(async {
            let cache = IdempotencyCache::new(Arc::new(MemoryBackend::default()));
            cache
                .get_or_compute("fp", TTL, || async { Ok(json!(1)) })
                .await;
            assert!(cache.clear("fp").await.expect("clear"));
            assert!(!cache.clear("fp").await.expect("clear"));
        });
    }
}
