//! Dispatcher - bounded parallel execution of independent units
//!
//! Units of one batch run as futures on the calling task under a semaphore
//! sized to `max_concurrent`. Each unit goes through the idempotency cache
//! (when fingerprinted), then limiter admission, then its retry loop. A unit
//! failure never cancels its siblings.

mod unit;

pub use unit::{BatchStatus, DispatchReport, UnitContext, UnitOutcome, UnitTask, WorkUnit};

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::limiter::{ResourceLimiter, ResourceLimits};
use crate::monitor::{MonitorEvent, MonitorEventKind, MonitoringSink, NoopMonitor};
use crate::retry::RetryDecision;
use crate::store::IdempotencyCache;
use crate::types::{ErrorInfo, ErrorKind};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3_600);

/// Runs batches of work units
pub struct Dispatcher {
    cache: Arc<IdempotencyCache>,
    cache_ttl: Duration,
    monitor: Arc<dyn MonitoringSink>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            cache: Arc::new(IdempotencyCache::without_backend()),
            cache_ttl: DEFAULT_CACHE_TTL,
            monitor: Arc::new(NoopMonitor),
        }
    }

    pub fn with_cache(mut self, cache: Arc<IdempotencyCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn MonitoringSink>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn cache(&self) -> &Arc<IdempotencyCache> {
        &self.cache
    }

    /// Run `units` under a fresh limiter built from `limits`.
    pub async fn dispatch(
        &self,
        units: Vec<WorkUnit>,
        limits: &ResourceLimits,
        min_success: f64,
    ) -> DispatchReport {
        let limiter = Arc::new(ResourceLimiter::new(limits.clone()));
        self.dispatch_with_limiter(units, limiter, min_success, &CancellationToken::new())
            .await
    }

    /// Run `units` against a caller-owned limiter.
    ///
    /// The batch ends when every unit is terminal, when the limiter's duration
    /// budget runs out, or when `cancel` fires. Units still pending at that
    /// point are reported as skipped.
    pub async fn dispatch_with_limiter(
        &self,
        units: Vec<WorkUnit>,
        limiter: Arc<ResourceLimiter>,
        min_success: f64,
        cancel: &CancellationToken,
    ) -> DispatchReport {
        let started = Instant::now();
        let total = units.len();
        let semaphore = Semaphore::new(limiter.limits().max_concurrent.max(1));
        let batch_token = cancel.child_token();
        let ids: Vec<String> = units.iter().map(|u| u.id.clone()).collect();
        let mut outcomes: Vec<Option<UnitOutcome>> = (0..total).map(|_| None).collect();

        tracing::debug!(
            units = total,
            max_concurrent = limiter.limits().max_concurrent,
            "dispatch batch started"
        );

        let mut in_flight = FuturesUnordered::new();
        for (index, unit) in units.into_iter().enumerate() {
            let semaphore = &semaphore;
            let limiter = &limiter;
            let token = &batch_token;
            in_flight.push(async move {
                let outcome = self.run_unit(unit, semaphore, limiter, token).await;
                (index, outcome)
            });
        }

        let deadline = tokio::time::sleep_until(limiter.deadline());
        tokio::pin!(deadline);
        let interruption = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    break Some(ErrorInfo::cancelled("dispatch cancelled before unit completed"));
                }
                _ = &mut deadline => {
                    break Some(ErrorInfo::new(
                        ErrorKind::BatchTimeout,
                        format!(
                            "batch duration budget of {}s exhausted",
                            limiter.limits().max_duration_s
                        ),
                    ));
                }
                next = in_flight.next() => match next {
                    Some((index, outcome)) => outcomes[index] = Some(outcome),
                    None => break None,
                },
            }
        };

        if let Some(reason) = &interruption {
            batch_token.cancel();
            tracing::warn!(
                pending = in_flight.len(),
                reason = %reason,
                "dispatch batch interrupted, abandoning unfinished units"
            );
        }
        // Dropping the remaining futures kills sandbox children and releases limiter slots.
        drop(in_flight);

        let outcomes: Vec<UnitOutcome> = outcomes
            .into_iter()
            .zip(ids)
            .map(|(outcome, id)| {
                outcome.unwrap_or_else(|| {
                    let reason = interruption
                        .clone()
                        .unwrap_or_else(|| ErrorInfo::cancelled("unit did not complete"));
                    UnitOutcome::skipped(id, reason)
                })
            })
            .collect();

        let duration_ms = started.elapsed().as_millis() as u64;
        let report = DispatchReport::build(outcomes, min_success, limiter.snapshot(), duration_ms);
        tracing::info!(
            units = total,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            status = ?report.status,
            acceptable = report.acceptable,
            duration_ms = duration_ms,
            "dispatch batch completed"
        );
        self.monitor.record(
            MonitorEvent::new(MonitorEventKind::BatchCompleted).with_result(
                report.acceptable,
                duration_ms,
                report.usage.total_cost,
            ),
        );
        report
    }

    async fn run_unit(
        &self,
        unit: WorkUnit,
        semaphore: &Semaphore,
        limiter: &Arc<ResourceLimiter>,
        cancel: &CancellationToken,
    ) -> UnitOutcome {
        let _permit = match semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                return UnitOutcome::skipped(unit.id, ErrorInfo::cancelled("dispatch pool closed"))
            }
        };
        let started = Instant::now();
        let attempts = AtomicU32::new(0);

        let (result, cache_hit) = match unit.fingerprint.as_deref() {
            Some(fingerprint) => {
                let cached = self
                    .cache
                    .get_or_compute(fingerprint, self.cache_ttl, || {
                        self.execute_admitted(&unit, limiter, cancel, &attempts)
                    })
                    .await;
                if cached.is_hit() {
                    tracing::debug!(
                        unit_id = %unit.id,
                        label = %unit.label,
                        source = ?cached.source,
                        "unit served from idempotency cache"
                    );
                    self.monitor
                        .record(MonitorEvent::new(MonitorEventKind::CacheHit).with_step(&unit.id));
                }
                let hit = cached.is_hit();
                (cached.result, hit)
            }
            None => (
                self.execute_admitted(&unit, limiter, cancel, &attempts).await,
                false,
            ),
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let outcome = UnitOutcome::from_result(
            unit.id.clone(),
            result,
            attempts.load(Ordering::SeqCst),
            duration_ms,
            cache_hit,
        );
        if let Some(error) = &outcome.error {
            tracing::warn!(
                unit_id = %unit.id,
                label = %unit.label,
                status = ?outcome.status,
                attempts = outcome.attempts,
                error = %error,
                "unit did not succeed"
            );
        }
        self.monitor.record(
            MonitorEvent::new(MonitorEventKind::UnitCompleted)
                .with_step(&unit.id)
                .with_result(outcome.is_success(), duration_ms, unit.estimated_cost),
        );
        outcome
    }

    async fn execute_admitted(
        &self,
        unit: &WorkUnit,
        limiter: &Arc<ResourceLimiter>,
        cancel: &CancellationToken,
        attempts: &AtomicU32,
    ) -> Result<Value, ErrorInfo> {
        let slot = limiter.acquire_slot(unit.estimated_cost).map_err(|reason| {
            tracing::warn!(
                unit_id = %unit.id,
                label = %unit.label,
                reason = %reason,
                "unit denied by resource limiter"
            );
            ErrorInfo::new(ErrorKind::ResourceLimit, reason.to_string())
        })?;
        let result = self.execute_with_retry(unit, cancel, attempts).await;
        slot.complete(result.is_ok());
        result
    }

    async fn execute_with_retry(
        &self,
        unit: &WorkUnit,
        cancel: &CancellationToken,
        attempts: &AtomicU32,
    ) -> Result<Value, ErrorInfo> {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(ErrorInfo::cancelled("unit cancelled before attempt"));
            }
            attempt = attempt.saturating_add(1);
            attempts.store(attempt, Ordering::SeqCst);

            let call = unit.start(UnitContext {
                unit_id: unit.id.clone(),
                attempt,
                cancellation: cancel.child_token(),
            });
            let result = match unit.timeout {
                Some(limit) => match tokio::time::timeout(limit, call).await {
                    Ok(result) => result,
                    Err(_) => Err(ErrorInfo::timeout(format!(
                        "attempt exceeded {}ms",
                        limit.as_millis()
                    ))),
                },
                None => call.await,
            };
            let error = match result {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            match unit.retry.next_action(attempt, &error) {
                RetryDecision::GiveUp => {
                    if attempt > 1 {
                        return Err(ErrorInfo::new(
                            error.kind,
                            format!(
                                "{} (retry exhausted after {} attempt(s))",
                                error.message, attempt
                            ),
                        ));
                    }
                    return Err(error);
                }
                RetryDecision::Retry { after_ms } => {
                    tracing::warn!(
                        unit_id = %unit.id,
                        label = %unit.label,
                        error = %error,
                        retry_attempt = attempt + 1,
                        retry_in_ms = after_ms,
                        "retrying unit after retryable error"
                    );
                    self.monitor.record(
                        MonitorEvent::new(MonitorEventKind::StepRetrying)
                            .with_step(&unit.id)
                            .with_result(false, 0, 0.0),
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(ErrorInfo::cancelled("unit cancelled during retry backoff"));
                        }
                        _ = sleep(Duration::from_millis(after_ms)) => {}
                    }
                }
            }
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
