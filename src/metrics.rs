//! Counters exposed by the SDS server.

use crate::secret::CacheCheck;
use std::sync::atomic::{AtomicU64, Ordering};

/// Trait for recording SDS server metrics.
///
/// Implement this trait to integrate with your metrics system (e.g., Prometheus, `StatsD`).
/// [`SdsMetrics`] is the in-process implementation used when none is configured.
///
/// # Example
///
/// ```no_run
/// use sds_agent::{CacheCheck, MetricsRecorder};
///
/// struct MyMetrics;
///
/// impl MetricsRecorder for MyMetrics {
///     fn record_push(&self) {}
///     fn record_update_failure(&self) {}
///     fn record_stale_connection(&self) {}
///     fn record_cache_check(&self, outcome: CacheCheck) {
///         println!("cache check: {}", outcome.as_str());
///     }
/// }
/// ```
pub trait MetricsRecorder: Send + Sync {
    /// Records a `DiscoveryResponse` sent on a stream (initial answer or push).
    fn record_push(&self);

    /// Records a NACK from a proxy.
    fn record_update_failure(&self);

    /// Records a subscription removed by the stale-connection reaper.
    fn record_stale_connection(&self);

    /// Records the outcome of a cache check.
    fn record_cache_check(&self, outcome: CacheCheck);
}

/// Atomic in-process counters.
#[derive(Debug, Default)]
pub struct SdsMetrics {
    pushes: AtomicU64,
    update_failures: AtomicU64,
    stale_connections: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

/// Point-in-time copy of [`SdsMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// `total_pushes`
    pub total_pushes: u64,
    /// `total_secret_update_failures`
    pub total_secret_update_failures: u64,
    /// `total_stale_connections`
    pub total_stale_connections: u64,
    /// Cache hits.
    pub cache_hits: u64,
    /// Cache misses, absent and stale combined.
    pub cache_misses: u64,
}

impl SdsMetrics {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Responses sent on streams.
    pub fn total_pushes(&self) -> u64 {
        self.pushes.load(Ordering::Relaxed)
    }

    /// NACKs received.
    pub fn total_secret_update_failures(&self) -> u64 {
        self.update_failures.load(Ordering::Relaxed)
    }

    /// Subscriptions reaped for inactivity.
    pub fn total_stale_connections(&self) -> u64 {
        self.stale_connections.load(Ordering::Relaxed)
    }

    /// Cache hits.
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Cache misses.
    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    /// Reads every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_pushes: self.total_pushes(),
            total_secret_update_failures: self.total_secret_update_failures(),
            total_stale_connections: self.total_stale_connections(),
            cache_hits: self.cache_hits(),
            cache_misses: self.cache_misses(),
        }
    }
}

impl MetricsRecorder for SdsMetrics {
    fn record_push(&self) {
        self.pushes.fetch_add(1, Ordering::Relaxed);
    }

    fn record_update_failure(&self) {
        self.update_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_stale_connection(&self) {
        self.stale_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn record_cache_check(&self, outcome: CacheCheck) {
        let counter = if outcome.is_hit() {
            &self.cache_hits
        } else {
            &self.cache_misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
