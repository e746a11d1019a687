//! Stale-connection reaper.
//!
//! Proxies that vanish without closing their stream leave subscriptions behind. The reaper
//! wakes every `recycle_interval`, removes subscriptions idle for at least that long and
//! closes them, which ends the owning stream from the server side.

use crate::metrics::MetricsRecorder;
use crate::prelude::{debug, info};
use crate::registry::SubscriptionRegistry;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Removes idle subscriptions from a [`SubscriptionRegistry`].
#[derive(Clone)]
pub struct StaleConnectionReaper {
    registry: Arc<SubscriptionRegistry>,
    metrics: Arc<dyn MetricsRecorder>,
    max_idle: Duration,
}

impl fmt::Debug for StaleConnectionReaper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaleConnectionReaper")
            .field("registry", &self.registry)
            .field("metrics", &"<MetricsRecorder>")
            .field("max_idle", &self.max_idle)
            .finish()
    }
}

impl StaleConnectionReaper {
    /// Creates a reaper removing subscriptions idle for at least `max_idle`.
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        metrics: Arc<dyn MetricsRecorder>,
        max_idle: Duration,
    ) -> Self {
        Self {
            registry,
            metrics,
            max_idle,
        }
    }

    /// Runs one sweep and returns the number of subscriptions removed.
    pub fn sweep_once(&self) -> usize {
        let reaped = self.registry.sweep_idle(self.max_idle);
        for _subscription in &reaped {
            self.metrics.record_stale_connection();
            info!("Recycled stale subscription: key={}", _subscription.key());
        }
        reaped.len()
    }

    /// Sweeps every `max_idle` until `cancel` fires.
    pub(crate) async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.max_idle, self.max_idle);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("Stale connection reaper stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let _reaped = self.sweep_once();
                    debug!(
                        "Stale connection sweep: reaped={}, live={}",
                        _reaped,
                        self.registry.len()
                    );
                }
            }
        }
    }
}
