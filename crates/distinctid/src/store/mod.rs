//! The coordination store: the shared service that owns every per-shard
//! counter.
//!
//! A backend implements [`CounterStore`] (one atomic increment-by-N and a
//! ping). [`StoreClient`] wraps a backend with the retry policy, failover
//! hook and round-trip accounting that the allocator relies on.
//!
//! The only mutation the engine ever performs on shared state is the atomic
//! increment; no client reads a counter and writes it back.

mod memory;
pub mod redis;

pub use memory::MemoryStore;

use crate::{Error, Result, StoreError};
use core::{future::Future, time::Duration};
use portable_atomic::{AtomicU64, Ordering};
use rand::Rng;
use std::sync::Arc;
#[cfg(feature = "tracing")]
use tracing::instrument;

/// A store offering an atomic increment-by-N on named counters.
///
/// Implementations must apply the increment as a single atomic operation on
/// the store (e.g. Redis `INCRBY`), so that no two concurrent callers can
/// observe overlapping ranges. Counters start at zero.
pub trait CounterStore: Send + Sync {
    /// Atomically adds `by` to the counter at `key` and returns the new value.
    fn incr_by(&self, key: &str, by: u64) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// A cheap connectivity probe.
    fn ping(&self) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Called after a connection-level failure and before the next retry.
    ///
    /// Backends with pooled connections drop them here; backends resolving a
    /// primary through sentinels forget the current primary so that the next
    /// attempt re-resolves it.
    fn reset(&self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

impl<S: CounterStore + ?Sized> CounterStore for Arc<S> {
    fn incr_by(&self, key: &str, by: u64) -> impl Future<Output = Result<u64, StoreError>> + Send {
        (**self).incr_by(key, by)
    }

    fn ping(&self) -> impl Future<Output = Result<(), StoreError>> + Send {
        (**self).ping()
    }

    fn reset(&self) -> impl Future<Output = ()> + Send {
        (**self).reset()
    }
}

/// Bounded exponential backoff for store round trips.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first one. At least 1.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Randomize each delay within `[delay / 2, delay]`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub const fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to wait after the `failed_attempt`-th attempt failed (1-based).
    pub fn backoff(&self, failed_attempt: u32) -> Duration {
        let exp = failed_attempt.saturating_sub(1).min(16);
        let delay = self
            .base_delay
            .saturating_mul(1 << exp)
            .min(self.max_delay);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let millis = delay.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(millis / 2..=millis))
    }
}

/// A snapshot of a [`StoreClient`]'s counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Increment round trips attempted, retries included.
    pub round_trips: u64,
    /// Round trips that failed.
    pub failures: u64,
    /// Failures that were followed by another attempt.
    pub retries: u64,
    /// Health probes sent.
    pub health_checks: u64,
}

#[derive(Debug, Default)]
struct StoreMetrics {
    round_trips: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    health_checks: AtomicU64,
}

/// The coordination store client used by the allocator.
///
/// Wraps a [`CounterStore`] with the [`RetryPolicy`]. Once every attempt has
/// failed, the last error is surfaced as [`Error::CoordinationUnavailable`];
/// the client never makes up a value.
#[derive(Debug)]
pub struct StoreClient<S> {
    store: S,
    retry: RetryPolicy,
    metrics: StoreMetrics,
}

impl<S: CounterStore> StoreClient<S> {
    pub fn new(store: S, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            metrics: StoreMetrics::default(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Atomically adds `by` to the counter at `key` and returns the new value.
    ///
    /// A retry after a timeout may re-send an increment the store already
    /// applied. The range claimed by the lost reply is simply never used.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CoordinationUnavailable`] once the retry budget is
    /// spent or on a non-retryable store error.
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip(self)))]
    pub async fn increment(&self, key: &str, by: u64) -> Result<u64> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.metrics.round_trips.fetch_add(1, Ordering::Relaxed);

            let err = match self.store.incr_by(key, by).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            self.metrics.failures.fetch_add(1, Ordering::Relaxed);

            if !err.is_retryable() || attempt >= self.retry.max_attempts {
                #[cfg(feature = "tracing")]
                tracing::error!(key, attempt, error = %err, "coordination store unavailable");
                return Err(Error::CoordinationUnavailable {
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = self.retry.backoff(attempt);
            #[cfg(feature = "tracing")]
            tracing::warn!(key, attempt, ?delay, error = %err, "increment failed, retrying");

            if err.is_connection_failure() {
                self.store.reset().await;
            }
            tokio::time::sleep(delay).await;
            self.metrics.retries.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Sends one ping, without retries.
    pub async fn health_check(&self) -> bool {
        self.metrics.health_checks.fetch_add(1, Ordering::Relaxed);
        match self.store.ping().await {
            Ok(()) => true,
            Err(_err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %_err, "health check failed");
                if _err.is_connection_failure() {
                    self.store.reset().await;
                }
                false
            }
        }
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            round_trips: self.metrics.round_trips.load(Ordering::Relaxed),
            failures: self.metrics.failures.load(Ordering::Relaxed),
            retries: self.metrics.retries.load(Ordering::Relaxed),
            health_checks: self.metrics.health_checks.load(Ordering::Relaxed),
        }
    }
}
