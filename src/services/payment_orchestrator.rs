//! Payment Orchestrator Service
//!
//! Front door for "charge this amount for this purpose". Creates the ledger
//! row, invokes the adapter selected by the payer's provider family, and moves
//! the row to `processing` once the provider has accepted the request. Terminal
//! states are left to reconciliation.

use crate::database::order_repository::{OrderRepository, OrderStatus};
use crate::database::transaction_repository::{
    NewPaymentTransaction, PaymentTransaction, TransactionState,
};
use crate::error::{AppError, DomainError};
use crate::payments::error::PaymentError;
use crate::payments::factory::ProviderRegistry;
use crate::payments::types::{InitiateRequest, Money, PayerDetails, PaymentPurpose};
use crate::services::ledger::{LedgerError, LedgerService};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

// ============================================================================
// Request / Result Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitPaymentRequest {
    pub user_id: Uuid,
    pub purpose: PaymentPurpose,
    pub amount: Money,
    pub payer: PayerDetails,
    pub linked_entity_id: Option<Uuid>,
    #[serde(default)]
    pub description: Option<String>,
    /// Lets a client retry a submission without risking a second charge.
    /// Generated when absent.
    #[serde(default)]
    pub idempotency_reference: Option<String>,
    #[serde(default)]
    pub metadata: Option<JsonValue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationResult {
    pub transaction: PaymentTransaction,
    /// Set for hosted checkouts on the first submission only.
    pub checkout_url: Option<String>,
    /// True when the idempotency reference matched an earlier submission.
    pub duplicate: bool,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Rejected before any ledger row was written.
    #[error("payment rejected: {0}")]
    Rejected(#[source] PaymentError),

    #[error("order {0} not found")]
    OrderNotFound(Uuid),

    #[error("order {order_id} is {status} and cannot be paid")]
    OrderNotPayable { order_id: Uuid, status: OrderStatus },

    /// The row exists and is now `failed`; a retry needs a fresh reference.
    #[error("provider failed for transaction {transaction_id}: {source}")]
    ProviderFailed {
        transaction_id: Uuid,
        #[source]
        source: PaymentError,
    },

    /// The provider accepted the request but the `processing` transition
    /// could not be stored. Money may be moving; reconciliation settles it.
    #[error("provider accepted transaction {transaction_id} but the ledger update failed: {source}")]
    Unrecorded {
        transaction_id: Uuid,
        #[source]
        source: LedgerError,
    },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl OrchestratorError {
    /// True when no provider call can have moved money for this request.
    pub fn nothing_sent(&self) -> bool {
        !matches!(self, OrchestratorError::Unrecorded { .. })
    }
}

impl From<OrchestratorError> for AppError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::Rejected(e) => e.into(),
            OrchestratorError::OrderNotFound(order_id) => {
                AppError::domain(DomainError::OrderNotFound {
                    order_id: order_id.to_string(),
                })
            }
            OrchestratorError::OrderNotPayable { order_id, status } => {
                AppError::domain(DomainError::InvalidTransition {
                    transaction_id: order_id.to_string(),
                    current_state: status.to_string(),
                    target_state: OrderStatus::Paid.to_string(),
                })
            }
            OrchestratorError::ProviderFailed {
                transaction_id,
                source,
            } => AppError::from(source).with_context(format!("transaction_id={}", transaction_id)),
            OrchestratorError::Unrecorded {
                transaction_id,
                source,
            } => AppError::from(source).with_context(format!("transaction_id={}", transaction_id)),
            OrchestratorError::Ledger(e) => e.into(),
        }
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

// ============================================================================
// Orchestrator
// ============================================================================

pub struct PaymentOrchestrator {
    ledger: LedgerService,
    providers: ProviderRegistry,
    orders: Arc<dyn OrderRepository>,
    last_stamp: AtomicI64,
}

impl PaymentOrchestrator {
    pub fn new(
        ledger: LedgerService,
        providers: ProviderRegistry,
        orders: Arc<dyn OrderRepository>,
    ) -> Self {
        Self {
            ledger,
            providers,
            orders,
            last_stamp: AtomicI64::new(0),
        }
    }

    pub fn ledger(&self) -> &LedgerService {
        &self.ledger
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Submits a collection. At most one provider call is made per ledger row;
    /// a repeated idempotency reference returns the existing row untouched.
    ///
    /// Withdrawals are refused here; they only leave through [`disburse`],
    /// after the payout engine has reserved the seller's balance.
    ///
    /// [`disburse`]: PaymentOrchestrator::disburse
    pub async fn submit(
        &self,
        request: SubmitPaymentRequest,
    ) -> OrchestratorResult<OrchestrationResult> {
        if request.purpose == PaymentPurpose::Withdrawal {
            return Err(OrchestratorError::Rejected(PaymentError::ValidationError {
                message: "withdrawals must be requested through the seller payout flow"
                    .to_string(),
                field: Some("purpose".to_string()),
            }));
        }
        self.execute(request).await
    }

    /// Sends a payout for a withdrawal whose funds are already reserved.
    pub(crate) async fn disburse(
        &self,
        request: SubmitPaymentRequest,
    ) -> OrchestratorResult<OrchestrationResult> {
        debug_assert_eq!(request.purpose, PaymentPurpose::Withdrawal);
        self.execute(request).await
    }

    async fn execute(
        &self,
        request: SubmitPaymentRequest,
    ) -> OrchestratorResult<OrchestrationResult> {
        // Validation: nothing is written if any of these fail.
        request
            .amount
            .validate_positive("amount")
            .map_err(OrchestratorError::Rejected)?;
        let kind = request.payer.provider_kind();
        let provider = self.providers.get(kind).map_err(OrchestratorError::Rejected)?;
        provider
            .validate_payer(&request.payer)
            .map_err(OrchestratorError::Rejected)?;
        if request.purpose == PaymentPurpose::OrderPayment {
            self.check_order_payable(&request).await?;
        }

        let idempotency_reference = match request.idempotency_reference.as_deref() {
            Some(reference) if !reference.trim().is_empty() => reference.trim().to_string(),
            _ => self.generate_reference(
                request.purpose,
                request.linked_entity_id.unwrap_or(request.user_id),
            ),
        };
        let description = request
            .description
            .clone()
            .unwrap_or_else(|| request.purpose.as_str().replace('_', " "));

        let created = self
            .ledger
            .create(NewPaymentTransaction {
                user_id: request.user_id,
                amount: request.amount.clone(),
                purpose: request.purpose,
                provider_kind: kind,
                idempotency_reference: idempotency_reference.clone(),
                description: description.clone(),
                linked_entity_id: request.linked_entity_id,
            })
            .await;

        let transaction = match created {
            Ok(tx) => tx,
            Err(LedgerError::DuplicateIdempotencyKey { existing, .. }) => {
                return Ok(OrchestrationResult {
                    transaction: *existing,
                    checkout_url: None,
                    duplicate: true,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let initiated = provider
            .initiate(InitiateRequest {
                amount: request.amount,
                purpose: request.purpose,
                idempotency_reference: idempotency_reference.clone(),
                description,
                payer: request.payer,
                metadata: request.metadata,
            })
            .await;

        let response = match initiated {
            Ok(response) => response,
            Err(source) => {
                error!(
                    transaction_id = %transaction.id,
                    idempotency_reference = %idempotency_reference,
                    provider_kind = %kind,
                    error = %source,
                    "provider initiation failed"
                );
                self.mark_failed(transaction.id).await?;
                return Err(OrchestratorError::ProviderFailed {
                    transaction_id: transaction.id,
                    source,
                });
            }
        };

        info!(
            transaction_id = %transaction.id,
            idempotency_reference = %idempotency_reference,
            provider_reference = %response.provider_reference,
            provider_kind = %kind,
            "provider accepted payment"
        );

        let transaction = match self
            .ledger
            .transition(
                transaction.id,
                &[TransactionState::Pending],
                TransactionState::Processing,
                Some(&response.provider_reference),
            )
            .await
        {
            Ok(tx) => tx,
            // A webhook beat us to it; the row already reflects a later state.
            Err(LedgerError::InvalidTransition { current, .. }) => {
                info!(
                    transaction_id = %current.id,
                    state = %current.state,
                    "row moved on before processing was recorded"
                );
                *current
            }
            Err(source) => {
                error!(
                    transaction_id = %transaction.id,
                    provider_reference = %response.provider_reference,
                    error = %source,
                    "provider accepted payment but processing was not recorded"
                );
                return Err(OrchestratorError::Unrecorded {
                    transaction_id: transaction.id,
                    source,
                });
            }
        };

        Ok(OrchestrationResult {
            transaction,
            checkout_url: response.checkout_url,
            duplicate: false,
        })
    }

    pub async fn get_transaction(&self, id: Uuid) -> OrchestratorResult<PaymentTransaction> {
        Ok(self.ledger.get(id).await?)
    }

    async fn check_order_payable(&self, request: &SubmitPaymentRequest) -> OrchestratorResult<()> {
        let order_id = request.linked_entity_id.ok_or_else(|| {
            OrchestratorError::Rejected(PaymentError::ValidationError {
                message: "order payments must reference an order".to_string(),
                field: Some("linked_entity_id".to_string()),
            })
        })?;
        let order = self
            .orders
            .find_order(order_id)
            .await
            .map_err(LedgerError::from)?
            .ok_or(OrchestratorError::OrderNotFound(order_id))?;

        if order.status != OrderStatus::Pending {
            return Err(OrchestratorError::OrderNotPayable {
                order_id,
                status: order.status,
            });
        }
        if order.total_amount != request.amount.amount || order.currency != request.amount.currency
        {
            return Err(OrchestratorError::Rejected(PaymentError::ValidationError {
                message: format!(
                    "amount {} {} does not match order total {} {}",
                    request.amount.amount,
                    request.amount.currency,
                    order.total_amount,
                    order.currency
                ),
                field: Some("amount".to_string()),
            }));
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid) -> OrchestratorResult<()> {
        match self
            .ledger
            .transition(id, &[TransactionState::Pending], TransactionState::Failed, None)
            .await
        {
            Ok(_) => Ok(()),
            Err(LedgerError::InvalidTransition { current, .. }) => {
                warn!(
                    transaction_id = %id,
                    state = %current.state,
                    "could not mark row failed after provider error"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// `{prefix}-{entity}-{millis}` with the millisecond stamp forced to be
    /// strictly increasing within this process.
    fn generate_reference(&self, purpose: PaymentPurpose, entity: Uuid) -> String {
        let now = Utc::now().timestamp_millis();
        let previous = self
            .last_stamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        let stamp = now.max(previous + 1);
        format!("{}-{}-{}", purpose.reference_prefix(), entity.simple(), stamp)
    }
}
