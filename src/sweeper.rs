use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, error, warn};

use crate::engines::{HoldEngine, WebhookEngine};
use crate::lock::{sweep_lock_key, LockService};

/// Periodic driver of hold expiry and pending-webhook settlement.
///
/// Correctness never depends on it, timeliness does: expired holds release
/// availability and parked webhooks settle within one period. A named lock
/// with lease = period keeps concurrent instances from sweeping at once.
pub struct Sweeper {
    holds: Arc<HoldEngine>,
    webhooks: Arc<WebhookEngine>,
    locks: Arc<LockService>,
    period: Duration,
}

impl Sweeper {
    pub fn new(
        holds: Arc<HoldEngine>,
        webhooks: Arc<WebhookEngine>,
        locks: Arc<LockService>,
        period: Duration,
    ) -> Self {
        Self {
            holds,
            webhooks,
            locks,
            period,
        }
    }

    pub async fn run(self) {
        let mut interval = time::interval(self.period);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.sweep_once().await;
        }
    }

    async fn sweep_once(&self) {
        let guard = match self.locks.try_acquire(sweep_lock_key(), self.period).await {
            Ok(Some(guard)) => Some(guard),
            Ok(None) => {
                debug!("sweep lock held elsewhere, skipping tick");
                return;
            }
            Err(e) => {
                // Every sweep step is independently transactional, so an
                // unguarded pass is safe, just potentially redundant.
                warn!(error = %e, "sweep lock unavailable, sweeping unguarded");
                None
            }
        };

        if let Err(e) = self.holds.expire_due().await {
            error!(error = %e, "hold expiry sweep failed");
        }
        if let Err(e) = self.webhooks.drain_pending().await {
            error!(error = %e, "pending webhook drain failed");
        }

        if let Some(guard) = guard {
            self.locks.release(guard).await;
        }
    }
}
