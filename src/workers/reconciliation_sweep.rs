use crate::config::ReconciliationConfig;
use crate::services::reconciliation::ReconciliationService;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Periodically asks providers about rows stuck in `pending`/`processing`.
///
/// A row is only settled when the provider reports a terminal status; age
/// alone never fails a payment, since the money may still be in flight.
pub struct ReconciliationSweepWorker {
    service: Arc<ReconciliationService>,
    config: ReconciliationConfig,
}

impl ReconciliationSweepWorker {
    pub fn new(service: Arc<ReconciliationService>, config: ReconciliationConfig) -> Self {
        Self { service, config }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            stale_after_secs = self.config.stale_after.as_secs(),
            batch_size = self.config.batch_size,
            "reconciliation sweep worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("reconciliation sweep worker stopping");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.run_cycle().await {
                        warn!(error = %e, "reconciliation sweep cycle failed");
                    }
                }
            }
        }

        info!("reconciliation sweep worker stopped");
    }

    pub async fn run_cycle(&self) -> anyhow::Result<()> {
        let report = self
            .service
            .sweep_stale(self.config.stale_after, self.config.batch_size)
            .await?;
        if report.examined > 0 {
            info!(
                examined = report.examined,
                resolved = report.resolved,
                failed_checks = report.failed_checks,
                "reconciliation sweep finished"
            );
        }
        Ok(())
    }
}
