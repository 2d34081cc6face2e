use crate::services::subscription_billing::SubscriptionBillingService;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

const BATCH_SIZE: i64 = 100;

/// Applies deferred plan prices once the cycle they were deferred to begins.
pub struct BillingCycleWorker {
    billing: Arc<SubscriptionBillingService>,
    poll_interval: Duration,
}

impl BillingCycleWorker {
    pub fn new(billing: Arc<SubscriptionBillingService>, poll_interval: Duration) -> Self {
        Self {
            billing,
            poll_interval,
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            "billing cycle worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("billing cycle worker stopping");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.poll_interval) => {
                    if let Err(e) = self.run_cycle().await {
                        warn!(error = %e, "billing cycle failed");
                    }
                }
            }
        }

        info!("billing cycle worker stopped");
    }

    /// Drains every due change, one batch at a time.
    pub async fn run_cycle(&self) -> anyhow::Result<usize> {
        let mut total = 0;
        loop {
            let applied = self
                .billing
                .apply_due_scheduled_changes(Utc::now(), BATCH_SIZE)
                .await?;
            total += applied;
            if applied < BATCH_SIZE as usize {
                break;
            }
        }
        if total > 0 {
            info!(applied = total, "deferred plan prices applied");
        }
        Ok(total)
    }
}
