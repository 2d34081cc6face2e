//! Reconciliation of provider notifications and status checks against the
//! ledger.
//!
//! Webhooks, manual status checks and the background sweep all land in
//! [`ReconciliationService::apply_status`], which relies on the ledger's
//! compare-and-set so that only the first observer of a terminal status
//! performs the transition.

use crate::database::error::DatabaseError;
use crate::database::order_repository::{OrderRepository, OrderStatus};
use crate::database::transaction_repository::{PaymentTransaction, TransactionState};
use crate::database::webhook_repository::{
    NewWebhookEvent, WebhookEventRepository, WebhookOutcome,
};
use crate::error::{AppError, DomainError, ExternalError};
use crate::payments::error::PaymentError;
use crate::payments::factory::ProviderRegistry;
use crate::payments::types::{PaymentPurpose, ProviderKind, ProviderStatus, WebhookEvent};
use crate::services::ledger::{LedgerError, LedgerService};
use crate::services::payout::{PayoutError, PayoutService};
use crate::services::subscription_billing::{BillingError, SubscriptionBillingService};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Provider status checks in flight at once during a sweep.
const SWEEP_CONCURRENCY: usize = 4;

#[derive(Debug, Error)]
pub enum ReconciliationError {
    #[error("webhook signature rejected: {0}")]
    InvalidSignature(String),

    #[error("no transaction matches reference '{reference}'")]
    UnknownTransaction { reference: String },

    #[error("malformed notification: {0}")]
    MalformedPayload(#[source] PaymentError),

    #[error(transparent)]
    Provider(PaymentError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error(transparent)]
    Payout(#[from] PayoutError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl ReconciliationError {
    /// Errors the webhook endpoint acknowledges without asking the provider
    /// to redeliver.
    pub fn is_ignorable(&self) -> bool {
        matches!(
            self,
            ReconciliationError::InvalidSignature(_) | ReconciliationError::UnknownTransaction { .. }
        )
    }
}

impl From<ReconciliationError> for AppError {
    fn from(err: ReconciliationError) -> Self {
        match err {
            ReconciliationError::InvalidSignature(message) => {
                AppError::new(crate::error::AppErrorKind::External(
                    ExternalError::InvalidSignature { message },
                ))
            }
            ReconciliationError::UnknownTransaction { reference } => {
                AppError::domain(DomainError::UnknownTransaction { reference })
            }
            ReconciliationError::MalformedPayload(e) | ReconciliationError::Provider(e) => e.into(),
            ReconciliationError::Ledger(e) => e.into(),
            ReconciliationError::Billing(e) => e.into(),
            ReconciliationError::Payout(e) => e.into(),
            ReconciliationError::Database(e) => e.into(),
        }
    }
}

pub type ReconciliationResult<T> = Result<T, ReconciliationError>;

#[derive(Debug, Clone, Serialize)]
pub struct WebhookReceipt {
    pub outcome: WebhookOutcome,
    pub transaction_id: Option<Uuid>,
    pub state: Option<TransactionState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusCheck {
    pub transaction: PaymentTransaction,
    /// `None` when the provider was not asked (row already terminal, or no
    /// provider reference yet).
    pub provider_status: Option<ProviderStatus>,
    pub outcome: Option<WebhookOutcome>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub resolved: usize,
    pub failed_checks: usize,
}

pub struct ReconciliationService {
    ledger: LedgerService,
    providers: ProviderRegistry,
    orders: Arc<dyn OrderRepository>,
    webhook_events: Arc<dyn WebhookEventRepository>,
    billing: Arc<SubscriptionBillingService>,
    payouts: Arc<PayoutService>,
}

impl ReconciliationService {
    pub fn new(
        ledger: LedgerService,
        providers: ProviderRegistry,
        orders: Arc<dyn OrderRepository>,
        webhook_events: Arc<dyn WebhookEventRepository>,
        billing: Arc<SubscriptionBillingService>,
        payouts: Arc<PayoutService>,
    ) -> Self {
        Self {
            ledger,
            providers,
            orders,
            webhook_events,
            billing,
            payouts,
        }
    }

    // ========================================================================
    // Webhooks
    // ========================================================================

    /// Verifies, matches and applies one provider notification. The raw body
    /// is what the signature covers, so it must not be re-serialized first.
    pub async fn handle_webhook(
        &self,
        kind: ProviderKind,
        payload: &[u8],
        signature: &str,
    ) -> ReconciliationResult<WebhookReceipt> {
        let provider = self
            .providers
            .get(kind)
            .map_err(ReconciliationError::Provider)?;

        let verification = provider
            .verify_webhook(payload, signature)
            .map_err(|e| ReconciliationError::InvalidSignature(e.to_string()))?;
        if !verification.valid {
            let reason = verification
                .reason
                .unwrap_or_else(|| "signature mismatch".to_string());
            warn!(provider_kind = %kind, reason = %reason, "webhook signature rejected");
            return Err(ReconciliationError::InvalidSignature(reason));
        }

        let event = provider
            .parse_webhook_event(payload)
            .map_err(ReconciliationError::MalformedPayload)?;

        let Some(transaction) = self.locate(&event).await? else {
            let reference = event
                .provider_reference
                .clone()
                .or_else(|| event.idempotency_reference.clone())
                .unwrap_or_default();
            warn!(
                provider_kind = %kind,
                provider_reference = %reference,
                outcome = WebhookOutcome::UnknownTransaction.as_str(),
                "webhook for unknown transaction"
            );
            self.record(&event, WebhookOutcome::UnknownTransaction, None)
                .await?;
            return Err(ReconciliationError::UnknownTransaction { reference });
        };

        let (outcome, transaction) = self.apply_status(&transaction, event.status).await?;
        self.record(&event, outcome, Some(transaction.id)).await?;

        Ok(WebhookReceipt {
            outcome,
            transaction_id: Some(transaction.id),
            state: Some(transaction.state),
        })
    }

    async fn locate(&self, event: &WebhookEvent) -> ReconciliationResult<Option<PaymentTransaction>> {
        if let Some(reference) = event.provider_reference.as_deref() {
            if let Some(tx) = self.ledger.get_by_provider_reference(reference).await? {
                return Ok(Some(tx));
            }
        }
        if let Some(reference) = event.idempotency_reference.as_deref() {
            if let Some(tx) = self.ledger.get_by_idempotency_reference(reference).await? {
                return Ok(Some(tx));
            }
        }
        Ok(None)
    }

    async fn record(
        &self,
        event: &WebhookEvent,
        outcome: WebhookOutcome,
        transaction_id: Option<Uuid>,
    ) -> ReconciliationResult<()> {
        self.webhook_events
            .record_event(NewWebhookEvent {
                provider_kind: event.provider,
                event_type: event.event_type.clone(),
                provider_reference: event.provider_reference.clone(),
                idempotency_reference: event.idempotency_reference.clone(),
                provider_status: event.status,
                outcome,
                transaction_id,
                payload: event.payload.clone(),
            })
            .await?;
        Ok(())
    }

    // ========================================================================
    // Status application
    // ========================================================================

    /// Applies a provider-reported status to a ledger row.
    pub async fn apply_status(
        &self,
        transaction: &PaymentTransaction,
        status: ProviderStatus,
    ) -> ReconciliationResult<(WebhookOutcome, PaymentTransaction)> {
        let target = match status {
            ProviderStatus::Pending => return self.apply_intermediate(transaction).await,
            ProviderStatus::Successful => TransactionState::Completed,
            ProviderStatus::Failed => TransactionState::Failed,
            ProviderStatus::Cancelled => TransactionState::Cancelled,
        };

        match self
            .ledger
            .transition(transaction.id, &TransactionState::NON_TERMINAL, target, None)
            .await
        {
            Ok(updated) => {
                info!(
                    transaction_id = %updated.id,
                    idempotency_reference = %updated.idempotency_reference,
                    provider_reference = updated.provider_reference.as_deref().unwrap_or(""),
                    from_state = %transaction.state,
                    to_state = %updated.state,
                    outcome = WebhookOutcome::Applied.as_str(),
                    "transaction settled"
                );
                self.fan_out(&updated).await?;
                Ok((WebhookOutcome::Applied, updated))
            }
            Err(LedgerError::InvalidTransition { current, .. }) if current.state == target => {
                info!(
                    transaction_id = %current.id,
                    idempotency_reference = %current.idempotency_reference,
                    state = %current.state,
                    outcome = WebhookOutcome::Duplicate.as_str(),
                    "transaction already settled"
                );
                // Every fan-out step is guarded, so this only finishes work a
                // previous delivery left incomplete.
                self.fan_out(&current).await?;
                Ok((WebhookOutcome::Duplicate, *current))
            }
            Err(LedgerError::InvalidTransition { current, .. }) => {
                warn!(
                    transaction_id = %current.id,
                    idempotency_reference = %current.idempotency_reference,
                    state = %current.state,
                    reported_state = %target,
                    outcome = WebhookOutcome::ConflictingTerminal.as_str(),
                    "provider reported a different terminal state"
                );
                Ok((WebhookOutcome::ConflictingTerminal, *current))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_intermediate(
        &self,
        transaction: &PaymentTransaction,
    ) -> ReconciliationResult<(WebhookOutcome, PaymentTransaction)> {
        if transaction.state != TransactionState::Pending {
            debug!(
                transaction_id = %transaction.id,
                state = %transaction.state,
                "intermediate status ignored"
            );
            return Ok((WebhookOutcome::Intermediate, transaction.clone()));
        }
        match self
            .ledger
            .transition(
                transaction.id,
                &[TransactionState::Pending],
                TransactionState::Processing,
                None,
            )
            .await
        {
            Ok(updated) => {
                if updated.purpose == PaymentPurpose::Withdrawal {
                    self.payouts.settle_withdrawal(&updated).await?;
                }
                Ok((WebhookOutcome::Intermediate, updated))
            }
            Err(LedgerError::InvalidTransition { current, .. }) => {
                Ok((WebhookOutcome::Intermediate, *current))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Domain updates driven by a terminal transaction.
    async fn fan_out(&self, transaction: &PaymentTransaction) -> ReconciliationResult<()> {
        match transaction.purpose {
            PaymentPurpose::OrderPayment => {
                if transaction.state == TransactionState::Completed {
                    self.settle_order(transaction).await?;
                }
            }
            PaymentPurpose::SubscriptionUpgrade => {
                self.billing.settle_upgrade(transaction).await?;
            }
            PaymentPurpose::Withdrawal => {
                self.payouts.settle_withdrawal(transaction).await?;
            }
            PaymentPurpose::TestPayment => {}
        }
        Ok(())
    }

    async fn settle_order(&self, transaction: &PaymentTransaction) -> ReconciliationResult<()> {
        let Some(order_id) = transaction.linked_entity_id else {
            warn!(transaction_id = %transaction.id, "order payment has no order link");
            return Ok(());
        };

        let order = match self.orders.mark_order_paid(order_id).await? {
            Some(order) => {
                info!(
                    order_id = %order_id,
                    transaction_id = %transaction.id,
                    "order marked paid"
                );
                order
            }
            None => match self.orders.find_order(order_id).await? {
                Some(order)
                    if !matches!(order.status, OrderStatus::Pending | OrderStatus::Cancelled) =>
                {
                    order
                }
                Some(order) => {
                    warn!(
                        order_id = %order_id,
                        transaction_id = %transaction.id,
                        status = %order.status,
                        "completed payment for an order that cannot be marked paid"
                    );
                    return Ok(());
                }
                None => {
                    error!(
                        order_id = %order_id,
                        transaction_id = %transaction.id,
                        "completed payment references a missing order"
                    );
                    return Ok(());
                }
            },
        };

        // Earnings are unique per order line, so a repeat is a no-op.
        self.payouts.credit_order_earnings(&order).await?;
        Ok(())
    }

    // ========================================================================
    // Manual checks and sweep
    // ========================================================================

    /// Asks the provider for the current status of a row and applies it
    /// through the same path as webhooks.
    pub async fn check_status(&self, transaction_id: Uuid) -> ReconciliationResult<StatusCheck> {
        let transaction = self.ledger.get(transaction_id).await?;
        if transaction.state.is_terminal() {
            return Ok(StatusCheck {
                transaction,
                provider_status: None,
                outcome: None,
            });
        }
        let Some(reference) = transaction.provider_reference.clone() else {
            debug!(
                transaction_id = %transaction.id,
                "no provider reference yet, status check skipped"
            );
            return Ok(StatusCheck {
                transaction,
                provider_status: None,
                outcome: None,
            });
        };

        let provider = self
            .providers
            .get(transaction.provider_kind)
            .map_err(ReconciliationError::Provider)?;
        let status = provider
            .check_status(&reference)
            .await
            .map_err(ReconciliationError::Provider)?;
        info!(
            transaction_id = %transaction.id,
            provider_reference = %reference,
            provider_status = ?status,
            "provider status checked"
        );

        let (outcome, transaction) = self.apply_status(&transaction, status).await?;
        Ok(StatusCheck {
            transaction,
            provider_status: Some(status),
            outcome: Some(outcome),
        })
    }

    /// Runs a status check on rows left non-terminal for longer than
    /// `stale_after`. Rows the provider still reports as pending stay as they
    /// are.
    pub async fn sweep_stale(
        &self,
        stale_after: Duration,
        batch_size: i64,
    ) -> ReconciliationResult<SweepReport> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::zero());
        let stale = self.ledger.find_stale(cutoff, batch_size).await?;
        let mut report = SweepReport {
            examined: stale.len(),
            ..SweepReport::default()
        };

        use futures::stream::{self, StreamExt};

        let results: Vec<(Uuid, ReconciliationResult<StatusCheck>)> = stream::iter(stale)
            .map(|transaction| async move {
                (transaction.id, self.check_status(transaction.id).await)
            })
            .buffer_unordered(SWEEP_CONCURRENCY)
            .collect()
            .await;

        for (transaction_id, result) in results {
            match result {
                Ok(check) if check.transaction.state.is_terminal() => report.resolved += 1,
                Ok(_) => {}
                Err(e) => {
                    report.failed_checks += 1;
                    warn!(
                        transaction_id = %transaction_id,
                        error = %e,
                        "status check failed during sweep"
                    );
                }
            }
        }
        Ok(report)
    }
}
