//! ResourceLimiter - admission control for dispatch batches
//!
//! All checks and counter updates happen inside one critical section so
//! concurrent callers can never jointly overshoot a limit.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

pub const DEFAULT_MAX_CONCURRENT: usize = 4;
pub const DEFAULT_MAX_DURATION_S: f64 = 300.0;
pub const DEFAULT_MIN_SAMPLE: u64 = 5;

// Roughly 30 years; stands in for an unbounded deadline.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT
}

fn default_max_total_cost() -> f64 {
    f64::MAX
}

fn default_max_duration_s() -> f64 {
    DEFAULT_MAX_DURATION_S
}

fn default_max_failure_rate() -> f64 {
    1.0
}

fn default_max_calls() -> u64 {
    u64::MAX
}

fn default_min_sample() -> u64 {
    DEFAULT_MIN_SAMPLE
}

/// Quotas for one batch (or one plan run when shared across batches)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_max_total_cost")]
    pub max_total_cost: f64,
    #[serde(default = "default_max_duration_s")]
    pub max_duration_s: f64,
    #[serde(default = "default_max_failure_rate")]
    pub max_failure_rate: f64,
    #[serde(default = "default_max_calls")]
    pub max_calls: u64,
    /// Completed calls required before the failure-rate check applies
    #[serde(default = "default_min_sample")]
    pub min_sample: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_total_cost: default_max_total_cost(),
            max_duration_s: default_max_duration_s(),
            max_failure_rate: default_max_failure_rate(),
            max_calls: default_max_calls(),
            min_sample: default_min_sample(),
        }
    }
}

impl ResourceLimits {
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_max_total_cost(mut self, max_total_cost: f64) -> Self {
        self.max_total_cost = max_total_cost;
        self
    }

    pub fn with_max_duration_s(mut self, max_duration_s: f64) -> Self {
        self.max_duration_s = max_duration_s;
        self
    }

    pub fn with_max_failure_rate(mut self, max_failure_rate: f64, min_sample: u64) -> Self {
        self.max_failure_rate = max_failure_rate;
        self.min_sample = min_sample;
        self
    }

    pub fn with_max_calls(mut self, max_calls: u64) -> Self {
        self.max_calls = max_calls;
        self
    }

    /// Batch wall-clock budget; NaN and non-positive values mean no time at all
    pub fn max_duration(&self) -> Duration {
        if self.max_duration_s.is_nan() || self.max_duration_s <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(self.max_duration_s).unwrap_or(Duration::MAX)
    }
}

/// Mutable counters compared against [`ResourceLimits`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub in_flight: usize,
    pub peak_in_flight: usize,
    /// Granted admissions
    pub calls: u64,
    pub completed: u64,
    pub failures: u64,
    pub total_cost: f64,
    pub total_duration_ms: u64,
    #[serde(default)]
    pub elapsed_ms: u64,
}

impl ResourceUsage {
    pub fn failure_rate(&self) -> f64 {
        if self.completed == 0 {
            0.0
        } else {
            self.failures as f64 / self.completed as f64
        }
    }
}

/// Why an admission was refused
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DenyReason {
    #[error("concurrency limit reached ({max} in flight)")]
    ConcurrencyExhausted { max: usize },

    #[error("call limit reached ({max} calls)")]
    CallLimitReached { max: u64 },

    #[error("duration budget exhausted ({elapsed_s:.3}s of {max_s}s)")]
    DurationExceeded { elapsed_s: f64, max_s: f64 },

    #[error("cost budget exceeded (spent {spent}, requested {requested}, max {max})")]
    BudgetExceeded { spent: f64, requested: f64, max: f64 },

    #[error("failure rate {rate:.2} above {max:.2}")]
    FailureRateExceeded { rate: f64, max: f64 },
}

/// Result of an admission check
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Granted,
    Denied(DenyReason),
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// Admission controller shared by every unit of a batch
#[derive(Debug)]
pub struct ResourceLimiter {
    limits: ResourceLimits,
    started_at: Instant,
    usage: Mutex<ResourceUsage>,
}

impl ResourceLimiter {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            started_at: Instant::now(),
            usage: Mutex::new(ResourceUsage::default()),
        }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Instant after which no further work is admitted
    pub fn deadline(&self) -> Instant {
        self.started_at
            .checked_add(self.limits.max_duration())
            .unwrap_or_else(|| self.started_at + FAR_FUTURE)
    }

    fn lock(&self) -> MutexGuard<'_, ResourceUsage> {
        self.usage.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Check every quota and, if all pass, take a concurrency slot.
    pub fn try_acquire(&self, estimated_cost: f64) -> Admission {
        let elapsed = self.started_at.elapsed();
        let mut usage = self.lock();

        if usage.in_flight >= self.limits.max_concurrent {
            return Admission::Denied(DenyReason::ConcurrencyExhausted {
                max: self.limits.max_concurrent,
            });
        }
        if usage.calls >= self.limits.max_calls {
            return Admission::Denied(DenyReason::CallLimitReached {
                max: self.limits.max_calls,
            });
        }
        if elapsed >= self.limits.max_duration() {
            return Admission::Denied(DenyReason::DurationExceeded {
                elapsed_s: elapsed.as_secs_f64(),
                max_s: self.limits.max_duration_s,
            });
        }
        let requested = estimated_cost.max(0.0);
        if usage.total_cost + requested > self.limits.max_total_cost {
            return Admission::Denied(DenyReason::BudgetExceeded {
                spent: usage.total_cost,
                requested,
                max: self.limits.max_total_cost,
            });
        }
        if usage.completed >= self.limits.min_sample
            && usage.failure_rate() > self.limits.max_failure_rate
        {
            return Admission::Denied(DenyReason::FailureRateExceeded {
                rate: usage.failure_rate(),
                max: self.limits.max_failure_rate,
            });
        }

        usage.in_flight += 1;
        usage.calls += 1;
        usage.peak_in_flight = usage.peak_in_flight.max(usage.in_flight);
        Admission::Granted
    }

    /// Release a slot taken by [`try_acquire`](Self::try_acquire).
    pub fn record(&self, actual_cost: f64, success: bool, duration_ms: u64) {
        let mut usage = self.lock();
        usage.in_flight = usage.in_flight.saturating_sub(1);
        usage.completed += 1;
        if !success {
            usage.failures += 1;
        }
        usage.total_cost += actual_cost.max(0.0);
        usage.total_duration_ms = usage.total_duration_ms.saturating_add(duration_ms);
    }

    /// Copy of the current counters
    pub fn snapshot(&self) -> ResourceUsage {
        let mut usage = self.lock().clone();
        usage.elapsed_ms = self.started_at.elapsed().as_millis() as u64;
        usage
    }

    /// Acquire a slot that records a failure if dropped before completion.
    pub fn acquire_slot(
        self: &Arc<Self>,
        estimated_cost: f64,
    ) -> Result<LimiterSlot, DenyReason> {
        match self.try_acquire(estimated_cost) {
            Admission::Granted => Ok(LimiterSlot {
                limiter: Arc::clone(self),
                cost: estimated_cost.max(0.0),
                started_at: Instant::now(),
                recorded: false,
            }),
            Admission::Denied(reason) => Err(reason),
        }
    }
}

/// Granted concurrency slot
#[derive(Debug)]
pub struct LimiterSlot {
    limiter: Arc<ResourceLimiter>,
    cost: f64,
    started_at: Instant,
    recorded: bool,
}

impl LimiterSlot {
    /// Record completion with the estimated cost as the actual cost.
    pub fn complete(mut self, success: bool) {
        let duration_ms = self.started_at.elapsed().as_millis() as u64;
        self.limiter.record(self.cost, success, duration_ms);
        self.recorded = true;
    }
}

impl Drop for LimiterSlot {
    fn drop(&mut self) {
        if !self.recorded {
            let duration_ms = self.started_at.elapsed().as_millis() as u64;
            self.limiter.record(self.cost, false, duration_ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrency_slot_is_released_on_record() {
        let limiter = ResourceLimiter::new(ResourceLimits::default().with_max_concurrent(1));
        assert!(limiter.try_acquire(0.0).is_granted());
        assert_eq!(
            limiter.try_acquire(0.0),
            Admission::Denied(DenyReason::ConcurrencyExhausted { max: 1 })
        );
        limiter.record(0.0, true, 5);
        assert!(limiter.try_acquire(0.0).is_granted());
        assert_eq!(limiter.snapshot().peak_in_flight, 1);
    }

    #[test]
    fn test_cost_budget_is_inclusive() {
        let limiter = ResourceLimiter::new(ResourceLimits::default().with_max_total_cost(10.0));
        assert!(limiter.try_acquire(6.0).is_granted());
        limiter.record(6.0, true, 1);
        assert!(limiter.try_acquire(4.0).is_granted());
        limiter.record(4.0, true, 1);
        assert!(matches!(
            limiter.try_acquire(0.5),
            Admission::Denied(DenyReason::BudgetExceeded { .. })
        ));
    }

    #[test]
    fn test_call_limit() {
        let limiter = ResourceLimiter::new(ResourceLimits::default().with_max_calls(2));
        for _ in 0..2 {
            assert!(limiter.try_acquire(0.0).is_granted());
            limiter.record(0.0, true, 1);
        }
        assert_eq!(
            limiter.try_acquire(0.0),
            Admission::Denied(DenyReason::CallLimitReached { max: 2 })
        );
    }

    #[test]
    fn test_failure_rate_waits_for_min_sample() {
        let limiter =
            ResourceLimiter::new(ResourceLimits::default().with_max_failure_rate(0.5, 3));
        for _ in 0..2 {
            assert!(limiter.try_acquire(0.0).is_granted());
            limiter.record(0.0, false, 1);
        }
        // two failures, below the sample size
        assert!(limiter.try_acquire(0.0).is_granted());
        limiter.record(0.0, false, 1);
        assert!(matches!(
            limiter.try_acquire(0.0),
            Admission::Denied(DenyReason::FailureRateExceeded { .. })
        ));
    }

    #[test]
    fn test_unbounded_duration_has_a_deadline() {
        let limiter =
            ResourceLimiter::new(ResourceLimits::default().with_max_duration_s(f64::INFINITY));
        assert!(limiter.deadline() > Instant::now() + Duration::from_secs(86_400));
        assert!(limiter.try_acquire(0.0).is_granted());
    }

    #[test]
    fn test_zero_duration_denies_everything() {
        let limiter = ResourceLimiter::new(ResourceLimits::default().with_max_duration_s(0.0));
        assert!(matches!(
            limiter.try_acquire(0.0),
            Admission::Denied(DenyReason::DurationExceeded { .. })
        ));
    }

    #[test]
    fn test_dropped_slot_records_failure() {
        let limiter = Arc::new(ResourceLimiter::new(
            ResourceLimits::default().with_max_concurrent(1),
        ));
        let slot = limiter.acquire_slot(2.0).expect("slot");
        assert_eq!(limiter.snapshot().in_flight, 1);
        drop(slot);
        let usage = limiter.snapshot();
        assert_eq!(usage.in_flight, 0);
        assert_eq!(usage.failures, 1);
        assert_eq!(usage.total_cost, 2.0);

        limiter.acquire_slot(1.0).expect("slot").complete(true);
        let usage = limiter.snapshot();
        assert_eq!(usage.completed, 2);
        assert_eq!(usage.failures, 1);
    }

    #[test]
    fn test_never_exceeds_max_concurrent_across_threads() {
        let limiter = Arc::new(ResourceLimiter::new(
            ResourceLimits::default().with_max_concurrent(3),
        ));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        if limiter.try_acquire(0.0).is_granted() {
                            assert!(limiter.snapshot().in_flight <= 3);
                            limiter.record(0.0, true, 0);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread");
        }
        let usage = limiter.snapshot();
        assert!(usage.peak_in_flight <= 3);
        assert_eq!(usage.in_flight, 0);
    }
}
