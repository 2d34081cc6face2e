//! Seller earnings and withdrawals.
//!
//! Earnings are credited once per order line when an order's payment is
//! confirmed. Withdrawals reserve their amount against the available balance
//! before any money moves, then disburse the net amount through the push
//! adapter.

use crate::config::PayoutConfig;
use crate::database::error::DatabaseError;
use crate::database::order_repository::Order;
use crate::database::payout_repository::{
    BalanceTotals, NewSellerEarning, NewWithdrawal, PayoutRepository, ReservationOutcome,
    SellerEarning, WithdrawalRequest, WithdrawalStatus,
};
use crate::database::transaction_repository::{PaymentTransaction, TransactionState};
use crate::error::{AppError, DomainError, ValidationError};
use crate::payments::factory::ProviderRegistry;
use crate::payments::types::{Money, PayerDetails, PaymentPurpose, ProviderKind};
use crate::services::payment_orchestrator::{
    OrchestrationResult, OrchestratorError, PaymentOrchestrator, SubmitPaymentRequest,
};
use crate::services::subscription_billing::{BillingError, SubscriptionBillingService};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PayoutError {
    #[error("insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { available: i64, requested: i64 },

    #[error("invalid payout destination: {0}")]
    InvalidDestination(String),

    #[error("invalid withdrawal amount {amount}: {reason}")]
    InvalidAmount { amount: i64, reason: String },

    /// The withdrawal was reserved but the disbursement did not go through
    /// cleanly. It is `failed` with its reservation released when nothing
    /// reached the provider; otherwise it stays reserved for reconciliation.
    #[error("withdrawal {withdrawal_id} could not be submitted: {source}")]
    Submission {
        withdrawal_id: Uuid,
        #[source]
        source: OrchestratorError,
    },

    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl From<PayoutError> for AppError {
    fn from(err: PayoutError) -> Self {
        match err {
            PayoutError::InsufficientBalance {
                available,
                requested,
            } => AppError::domain(DomainError::InsufficientBalance {
                available,
                requested,
            }),
            PayoutError::InvalidDestination(reason) => {
                AppError::domain(DomainError::InvalidDestination { reason })
            }
            PayoutError::InvalidAmount { amount, reason } => {
                AppError::validation(ValidationError::InvalidAmount {
                    amount: amount.to_string(),
                    reason,
                })
            }
            PayoutError::Submission {
                withdrawal_id,
                source,
            } => AppError::from(source).with_context(format!("withdrawal_id={}", withdrawal_id)),
            PayoutError::Billing(e) => e.into(),
            PayoutError::Database(e) => e.into(),
        }
    }
}

pub type PayoutResult<T> = Result<T, PayoutError>;

#[derive(Debug, Clone, Deserialize)]
pub struct WithdrawalInput {
    pub amount: i64,
    #[serde(default)]
    pub currency: Option<String>,
    pub destination: PayerDetails,
}

#[derive(Debug, Clone, Serialize)]
pub struct WithdrawalOutcome {
    pub withdrawal: WithdrawalRequest,
    pub payment: OrchestrationResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceSummary {
    pub seller_id: Uuid,
    pub currency: String,
    pub total_earned: i64,
    pub completed_withdrawals: i64,
    pub reserved_withdrawals: i64,
    pub available: i64,
}

impl BalanceSummary {
    fn new(seller_id: Uuid, currency: String, totals: BalanceTotals) -> Self {
        Self {
            seller_id,
            currency,
            total_earned: totals.total_earned,
            completed_withdrawals: totals.completed_withdrawals,
            reserved_withdrawals: totals.reserved_withdrawals,
            available: totals.available(),
        }
    }
}

/// `amount × rate`, rounded half away from zero and kept within `0..=amount`.
pub fn apply_rate(amount: i64, rate: Decimal) -> i64 {
    let fee = (Decimal::from(amount) * rate)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .unwrap_or(0);
    fee.clamp(0, amount.max(0))
}

pub struct PayoutService {
    payouts: Arc<dyn PayoutRepository>,
    billing: Arc<SubscriptionBillingService>,
    orchestrator: Arc<PaymentOrchestrator>,
    providers: ProviderRegistry,
    config: PayoutConfig,
}

impl PayoutService {
    pub fn new(
        payouts: Arc<dyn PayoutRepository>,
        billing: Arc<SubscriptionBillingService>,
        orchestrator: Arc<PaymentOrchestrator>,
        config: PayoutConfig,
    ) -> Self {
        let providers = orchestrator.providers().clone();
        Self {
            payouts,
            billing,
            orchestrator,
            providers,
            config,
        }
    }

    // ========================================================================
    // Earnings
    // ========================================================================

    /// Credits one earning per order line. Lines credited before are skipped.
    pub async fn credit_order_earnings(&self, order: &Order) -> PayoutResult<Vec<SellerEarning>> {
        let mut credited = Vec::with_capacity(order.lines.len());
        for line in &order.lines {
            let rate = self.billing.commission_rate_for(line.seller_id).await?;
            let platform_fee = apply_rate(line.amount, rate);
            let earning = self
                .payouts
                .credit_earning(NewSellerEarning {
                    seller_id: line.seller_id,
                    order_id: order.id,
                    order_line_id: line.id,
                    gross_amount: line.amount,
                    platform_fee,
                    net_amount: line.amount - platform_fee,
                    currency: order.currency.clone(),
                })
                .await?;

            match earning {
                Some(earning) => {
                    info!(
                        order_id = %order.id,
                        order_line_id = %line.id,
                        seller_id = %line.seller_id,
                        gross_amount = earning.gross_amount,
                        platform_fee = earning.platform_fee,
                        net_amount = earning.net_amount,
                        "seller earning credited"
                    );
                    credited.push(earning);
                }
                None => info!(
                    order_id = %order.id,
                    order_line_id = %line.id,
                    "earning already credited"
                ),
            }
        }
        Ok(credited)
    }

    pub async fn list_earnings(&self, seller_id: Uuid) -> PayoutResult<Vec<SellerEarning>> {
        Ok(self.payouts.list_earnings(seller_id).await?)
    }

    pub async fn balance(
        &self,
        seller_id: Uuid,
        currency: Option<&str>,
    ) -> PayoutResult<BalanceSummary> {
        let currency = currency.unwrap_or(&self.config.currency).to_string();
        let totals = self.payouts.balance_totals(seller_id, &currency).await?;
        Ok(BalanceSummary::new(seller_id, currency, totals))
    }

    // ========================================================================
    // Withdrawals
    // ========================================================================

    pub async fn request_withdrawal(
        &self,
        seller_id: Uuid,
        input: WithdrawalInput,
    ) -> PayoutResult<WithdrawalOutcome> {
        if input.amount <= 0 {
            return Err(PayoutError::InvalidAmount {
                amount: input.amount,
                reason: "amount must be greater than zero".to_string(),
            });
        }
        if input.amount < self.config.min_withdrawal_amount {
            return Err(PayoutError::InvalidAmount {
                amount: input.amount,
                reason: format!(
                    "minimum withdrawal is {}",
                    self.config.min_withdrawal_amount
                ),
            });
        }
        self.validate_destination(&input.destination)?;

        let fee = apply_rate(input.amount, self.config.withdrawal_fee_rate);
        let net_amount = input.amount - fee;
        if net_amount <= 0 {
            return Err(PayoutError::InvalidAmount {
                amount: input.amount,
                reason: "amount does not cover the withdrawal fee".to_string(),
            });
        }
        let currency = input
            .currency
            .unwrap_or_else(|| self.config.currency.clone());

        let reservation = self
            .payouts
            .reserve_withdrawal(NewWithdrawal {
                seller_id,
                amount: input.amount,
                fee,
                net_amount,
                currency: currency.clone(),
                destination: input.destination.clone(),
            })
            .await?;

        let withdrawal = match reservation {
            ReservationOutcome::Reserved(withdrawal) => withdrawal,
            ReservationOutcome::Insufficient { available } => {
                info!(
                    seller_id = %seller_id,
                    requested = input.amount,
                    available,
                    "withdrawal rejected for insufficient balance"
                );
                return Err(PayoutError::InsufficientBalance {
                    available,
                    requested: input.amount,
                });
            }
        };
        info!(
            withdrawal_id = %withdrawal.id,
            seller_id = %seller_id,
            amount = withdrawal.amount,
            fee = withdrawal.fee,
            net_amount = withdrawal.net_amount,
            "withdrawal reserved"
        );

        let submitted = self
            .orchestrator
            .disburse(SubmitPaymentRequest {
                user_id: seller_id,
                purpose: PaymentPurpose::Withdrawal,
                amount: Money::new(net_amount, currency),
                payer: input.destination,
                linked_entity_id: Some(withdrawal.id),
                description: Some("Seller withdrawal".to_string()),
                idempotency_reference: Some(format!(
                    "{}-{}",
                    PaymentPurpose::Withdrawal.reference_prefix(),
                    withdrawal.id.simple()
                )),
                metadata: None,
            })
            .await;

        let payment = match submitted {
            Ok(payment) => payment,
            Err(source) => {
                if let OrchestratorError::ProviderFailed { transaction_id, .. }
                | OrchestratorError::Unrecorded { transaction_id, .. } = &source
                {
                    self.payouts
                        .attach_transaction(withdrawal.id, *transaction_id)
                        .await?;
                }
                if source.nothing_sent() {
                    error!(
                        withdrawal_id = %withdrawal.id,
                        error = %source,
                        "withdrawal disbursement failed"
                    );
                    self.payouts
                        .update_withdrawal_status(
                            withdrawal.id,
                            &WithdrawalStatus::RESERVED,
                            WithdrawalStatus::Failed,
                            Some(&source.to_string()),
                        )
                        .await?;
                } else {
                    // The provider may be paying out; the balance stays
                    // reserved until reconciliation learns the outcome.
                    warn!(
                        withdrawal_id = %withdrawal.id,
                        error = %source,
                        "withdrawal disbursement outcome unknown, reservation kept"
                    );
                }
                return Err(PayoutError::Submission {
                    withdrawal_id: withdrawal.id,
                    source,
                });
            }
        };

        self.payouts
            .attach_transaction(withdrawal.id, payment.transaction.id)
            .await?;
        // Settlement may already have happened if the provider called back fast.
        let withdrawal = match self.settle_withdrawal(&payment.transaction).await? {
            Some(updated) => updated,
            None => self
                .payouts
                .find_withdrawal(withdrawal.id)
                .await?
                .unwrap_or(withdrawal),
        };

        Ok(WithdrawalOutcome {
            withdrawal,
            payment,
        })
    }

    fn validate_destination(&self, destination: &PayerDetails) -> PayoutResult<()> {
        if destination.provider_kind() != ProviderKind::Push {
            return Err(PayoutError::InvalidDestination(
                "withdrawals can only be paid out to a mobile money number".to_string(),
            ));
        }
        let provider = self
            .providers
            .get(ProviderKind::Push)
            .map_err(|e| PayoutError::InvalidDestination(e.user_message()))?;
        provider
            .validate_payer(destination)
            .map_err(|e| PayoutError::InvalidDestination(e.user_message()))
    }

    /// Moves the withdrawal linked to `transaction` in step with the ledger
    /// row. Returns `None` when the withdrawal had already moved on.
    pub async fn settle_withdrawal(
        &self,
        transaction: &PaymentTransaction,
    ) -> PayoutResult<Option<WithdrawalRequest>> {
        let withdrawal_id = match transaction.linked_entity_id {
            Some(id) => Some(id),
            None => self
                .payouts
                .find_withdrawal_by_transaction(transaction.id)
                .await?
                .map(|w| w.id),
        };
        let Some(withdrawal_id) = withdrawal_id else {
            warn!(transaction_id = %transaction.id, "withdrawal transaction has no withdrawal");
            return Ok(None);
        };

        let (from, to, message): (&[WithdrawalStatus], WithdrawalStatus, Option<&str>) =
            match transaction.state {
                TransactionState::Pending => return Ok(None),
                TransactionState::Processing => (
                    &[WithdrawalStatus::Pending],
                    WithdrawalStatus::Processing,
                    None,
                ),
                TransactionState::Completed => {
                    (&WithdrawalStatus::RESERVED, WithdrawalStatus::Completed, None)
                }
                TransactionState::Failed => (
                    &WithdrawalStatus::RESERVED,
                    WithdrawalStatus::Failed,
                    Some("provider reported the disbursement failed"),
                ),
                TransactionState::Cancelled => (
                    &WithdrawalStatus::RESERVED,
                    WithdrawalStatus::Cancelled,
                    Some("disbursement was cancelled"),
                ),
            };

        let updated = self
            .payouts
            .update_withdrawal_status(withdrawal_id, from, to, message)
            .await?;
        if let Some(withdrawal) = &updated {
            info!(
                withdrawal_id = %withdrawal.id,
                transaction_id = %transaction.id,
                to_state = %withdrawal.status,
                "withdrawal status updated"
            );
        }
        Ok(updated)
    }

    pub async fn list_withdrawals(&self, seller_id: Uuid) -> PayoutResult<Vec<WithdrawalRequest>> {
        Ok(self.payouts.list_withdrawals(seller_id).await?)
    }

    pub async fn get_withdrawal(&self, id: Uuid) -> PayoutResult<Option<WithdrawalRequest>> {
        Ok(self.payouts.find_withdrawal(id).await?)
    }
}
