//! Services module for business logic

pub mod ledger;
pub mod payment_orchestrator;
pub mod payout;
pub mod reconciliation;
pub mod subscription_billing;

pub use ledger::{LedgerError, LedgerService};
pub use payment_orchestrator::{
    OrchestrationResult, OrchestratorError, PaymentOrchestrator, SubmitPaymentRequest,
};
pub use payout::{PayoutError, PayoutService};
pub use reconciliation::{ReconciliationError, ReconciliationService};
pub use subscription_billing::{BillingError, SubscriptionBillingService};

use crate::config::{BillingConfig, PayoutConfig};
use crate::database::Repositories;
use crate::payments::factory::ProviderRegistry;
use std::sync::Arc;

/// Every service wired over one set of repositories and adapters.
#[derive(Clone)]
pub struct Services {
    pub orchestrator: Arc<PaymentOrchestrator>,
    pub billing: Arc<SubscriptionBillingService>,
    pub payouts: Arc<PayoutService>,
    pub reconciliation: Arc<ReconciliationService>,
}

impl Services {
    pub fn new(
        repos: &Repositories,
        providers: ProviderRegistry,
        billing: BillingConfig,
        payout: PayoutConfig,
    ) -> Self {
        let ledger = LedgerService::new(repos.transactions.clone());
        let orchestrator = Arc::new(PaymentOrchestrator::new(
            ledger.clone(),
            providers.clone(),
            repos.orders.clone(),
        ));
        let billing = Arc::new(SubscriptionBillingService::new(
            repos.subscriptions.clone(),
            orchestrator.clone(),
            billing,
        ));
        let payouts = Arc::new(PayoutService::new(
            repos.payouts.clone(),
            billing.clone(),
            orchestrator.clone(),
            payout,
        ));
        let reconciliation = Arc::new(ReconciliationService::new(
            ledger,
            providers,
            repos.orders.clone(),
            repos.webhook_events.clone(),
            billing.clone(),
            payouts.clone(),
        ));

        Self {
            orchestrator,
            billing,
            payouts,
            reconciliation,
        }
    }
}
