//! Subscription billing engine.
//!
//! Decides how a plan change takes effect:
//!
//! | from         | to                       | effect         |
//! |--------------|--------------------------|----------------|
//! | percentage   | percentage               | immediate      |
//! | subscription | percentage               | immediate      |
//! | subscription | subscription, price <=   | deferred       |
//! | subscription | subscription, price >    | payment-gated  |
//! | percentage   | subscription             | payment-gated  |
//!
//! Payment-gated changes are only committed by [`SubscriptionBillingService::settle_upgrade`]
//! once the ledger row reaches `completed`.

use crate::config::{BillingConfig, UpgradeChargePolicy};
use crate::database::error::DatabaseError;
use crate::database::subscription_repository::{
    NewSubscription, PlanId, PlanSwitch, PricingModel, Subscription, SubscriptionRepository,
    SubscriptionStatus,
};
use crate::database::transaction_repository::{PaymentTransaction, TransactionState};
use crate::error::{AppError, DomainError, ValidationError};
use crate::payments::types::{Money, PayerDetails, PaymentPurpose};
use crate::services::ledger::LedgerError;
use crate::services::payment_orchestrator::{
    OrchestrationResult, OrchestratorError, PaymentOrchestrator, SubmitPaymentRequest,
};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("seller {0} has no subscription")]
    SubscriptionNotFound(Uuid),

    #[error("plan change rejected: {0}")]
    PlanChangeRejected(String),

    #[error("a payer is required to pay for {0}")]
    PayerRequired(PlanId),

    #[error(transparent)]
    Payment(#[from] OrchestratorError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl From<BillingError> for AppError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::SubscriptionNotFound(seller_id) => {
                AppError::domain(DomainError::SubscriptionNotFound {
                    seller_id: seller_id.to_string(),
                })
            }
            BillingError::PlanChangeRejected(reason) => {
                AppError::domain(DomainError::PlanChangeRejected { reason })
            }
            BillingError::PayerRequired(_) => AppError::validation(ValidationError::MissingField {
                field: "payer".to_string(),
            }),
            BillingError::Payment(e) => e.into(),
            BillingError::Database(e) => e.into(),
        }
    }
}

impl From<LedgerError> for BillingError {
    fn from(err: LedgerError) -> Self {
        BillingError::Payment(OrchestratorError::Ledger(err))
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlanChangeKind {
    Immediate,
    Deferred,
    PaymentRequired,
    Unchanged,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanChangeOutcome {
    pub kind: PlanChangeKind,
    pub subscription: Subscription,
    /// The upgrade charge, for payment-gated changes.
    pub payment: Option<OrchestrationResult>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanChangeRequest {
    pub target_plan: PlanId,
    #[serde(default)]
    pub payer: Option<PayerDetails>,
    #[serde(default)]
    pub idempotency_reference: Option<String>,
}

/// Classifies a change from `current` (billed at `current_price`) to `target`.
pub fn classify_change(current: PlanId, current_price: i64, target: PlanId) -> PlanChangeKind {
    match (current.pricing_model(), target.pricing_model()) {
        (_, PricingModel::Percentage) => PlanChangeKind::Immediate,
        (PricingModel::Percentage, PricingModel::Subscription) => PlanChangeKind::PaymentRequired,
        (PricingModel::Subscription, PricingModel::Subscription) => {
            if target.monthly_price() <= current_price {
                PlanChangeKind::Deferred
            } else {
                PlanChangeKind::PaymentRequired
            }
        }
    }
}

pub struct SubscriptionBillingService {
    subscriptions: Arc<dyn SubscriptionRepository>,
    orchestrator: Arc<PaymentOrchestrator>,
    config: BillingConfig,
}

impl SubscriptionBillingService {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionRepository>,
        orchestrator: Arc<PaymentOrchestrator>,
        config: BillingConfig,
    ) -> Self {
        Self {
            subscriptions,
            orchestrator,
            config,
        }
    }

    fn cycle(&self) -> Duration {
        Duration::days(self.config.cycle_days)
    }

    /// Returns the seller's subscription, enrolling them on the standard
    /// percentage plan on first use.
    pub async fn get_or_default(&self, seller_id: Uuid) -> BillingResult<Subscription> {
        if let Some(existing) = self.subscriptions.find_subscription_by_seller(seller_id).await? {
            return Ok(existing);
        }
        let created = self
            .subscriptions
            .create_subscription(NewSubscription {
                seller_id,
                plan: PlanId::PercentageStandard,
                monthly_price: 0,
                currency: self.config.currency.clone(),
                expires_at: Utc::now() + self.cycle(),
            })
            .await;
        match created {
            Ok(subscription) => {
                info!(seller_id = %seller_id, plan = %subscription.plan, "seller enrolled on default plan");
                Ok(subscription)
            }
            // Lost a race with a concurrent enrolment.
            Err(e) if e.is_unique_violation() => self
                .subscriptions
                .find_subscription_by_seller(seller_id)
                .await?
                .ok_or(BillingError::SubscriptionNotFound(seller_id)),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, seller_id: Uuid) -> BillingResult<Subscription> {
        self.subscriptions
            .find_subscription_by_seller(seller_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound(seller_id))
    }

    pub async fn change_plan(
        &self,
        seller_id: Uuid,
        request: PlanChangeRequest,
    ) -> BillingResult<PlanChangeOutcome> {
        let current = self.get_or_default(seller_id).await?;
        let target = request.target_plan;

        if current.has_pending_change() {
            return Err(BillingError::PlanChangeRejected(format!(
                "a change to {} is awaiting payment",
                current
                    .pending_plan
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "another plan".to_string())
            )));
        }

        if target == current.plan
            && current.status == SubscriptionStatus::Active
            && current.scheduled_price.is_none()
        {
            return Ok(PlanChangeOutcome {
                kind: PlanChangeKind::Unchanged,
                subscription: current,
                payment: None,
            });
        }

        // A lapsed subscription has no paid cycle left to defer into.
        let kind = if current.has_lapsed(Utc::now())
            && target.pricing_model() == PricingModel::Subscription
        {
            PlanChangeKind::PaymentRequired
        } else {
            classify_change(current.plan, current.monthly_price, target)
        };
        info!(
            seller_id = %seller_id,
            from_plan = %current.plan,
            to_plan = %target,
            change = ?kind,
            "plan change requested"
        );

        match kind {
            PlanChangeKind::Immediate => {
                self.switch(
                    &current,
                    kind,
                    PlanSwitch::Immediate {
                        plan: target,
                        monthly_price: target.monthly_price(),
                    },
                )
                .await
            }
            // The price already paid for this cycle stays in force.
            PlanChangeKind::Deferred => {
                self.switch(
                    &current,
                    kind,
                    PlanSwitch::AtCycleEnd {
                        plan: target,
                        monthly_price: target.monthly_price(),
                    },
                )
                .await
            }
            PlanChangeKind::PaymentRequired => self.start_upgrade(current, request).await,
            PlanChangeKind::Unchanged => Ok(PlanChangeOutcome {
                kind,
                subscription: current,
                payment: None,
            }),
        }
    }

    async fn switch(
        &self,
        current: &Subscription,
        kind: PlanChangeKind,
        switch: PlanSwitch,
    ) -> BillingResult<PlanChangeOutcome> {
        let subscription = self
            .subscriptions
            .switch_plan(current.id, switch)
            .await?
            .ok_or_else(|| {
                BillingError::PlanChangeRejected("another change is awaiting payment".to_string())
            })?;
        Ok(PlanChangeOutcome {
            kind,
            subscription,
            payment: None,
        })
    }

    /// Amount charged to move `current` onto `target`. A lapsed subscription
    /// pays the full price of a fresh cycle.
    pub fn upgrade_charge(&self, current: &Subscription, target: PlanId) -> i64 {
        if current.has_lapsed(Utc::now()) {
            return target.monthly_price();
        }
        match (current.pricing_model(), self.config.upgrade_charge_policy) {
            (PricingModel::Percentage, _) => target.monthly_price(),
            (PricingModel::Subscription, UpgradeChargePolicy::FullPrice) => target.monthly_price(),
            (PricingModel::Subscription, UpgradeChargePolicy::Delta) => {
                (target.monthly_price() - current.monthly_price).max(0)
            }
        }
    }

    async fn start_upgrade(
        &self,
        current: Subscription,
        request: PlanChangeRequest,
    ) -> BillingResult<PlanChangeOutcome> {
        let target = request.target_plan;
        let payer = request.payer.ok_or(BillingError::PayerRequired(target))?;
        let charge = self.upgrade_charge(&current, target);

        let payment = self
            .orchestrator
            .submit(SubmitPaymentRequest {
                user_id: current.seller_id,
                purpose: PaymentPurpose::SubscriptionUpgrade,
                amount: Money::new(charge, current.currency.clone()),
                payer,
                linked_entity_id: Some(current.id),
                description: Some(format!("Upgrade to {}", target)),
                idempotency_reference: request.idempotency_reference,
                metadata: Some(serde_json::json!({
                    "from_plan": current.plan,
                    "to_plan": target,
                })),
            })
            .await?;

        if payment.duplicate {
            return Err(BillingError::PlanChangeRejected(format!(
                "payment {} was already submitted",
                payment.transaction.idempotency_reference
            )));
        }

        let Some(mut saved) = self
            .subscriptions
            .begin_pending_change(
                current.id,
                target,
                target.monthly_price(),
                payment.transaction.id,
            )
            .await?
        else {
            error!(
                seller_id = %current.seller_id,
                subscription_id = %current.id,
                transaction_id = %payment.transaction.id,
                "concurrent plan change won; upgrade payment is not tied to the subscription"
            );
            return Err(BillingError::PlanChangeRejected(
                "another change is awaiting payment".to_string(),
            ));
        };
        info!(
            seller_id = %current.seller_id,
            subscription_id = %current.id,
            transaction_id = %payment.transaction.id,
            to_plan = %target,
            amount = charge,
            "plan change awaiting payment"
        );

        // A webhook may have settled the row before the pending change was
        // stored, in which case its fan-out found nothing to commit.
        let latest = self.orchestrator.ledger().get(payment.transaction.id).await?;
        if latest.state.is_terminal() {
            if let Some(settled) = self.settle_upgrade(&latest).await? {
                saved = settled;
            }
        }

        Ok(PlanChangeOutcome {
            kind: PlanChangeKind::PaymentRequired,
            subscription: saved,
            payment: Some(payment),
        })
    }

    /// Applies a terminal upgrade transaction to its subscription: `completed`
    /// commits the awaiting change and starts a new cycle, `failed` or
    /// `cancelled` drops it. Returns `None` when there was nothing to do.
    pub async fn settle_upgrade(
        &self,
        transaction: &PaymentTransaction,
    ) -> BillingResult<Option<Subscription>> {
        let Some(subscription_id) = transaction.linked_entity_id else {
            warn!(transaction_id = %transaction.id, "upgrade transaction has no subscription link");
            return Ok(None);
        };

        let result = match transaction.state {
            TransactionState::Completed => {
                self.subscriptions
                    .commit_pending_change(subscription_id, transaction.id, Utc::now() + self.cycle())
                    .await?
            }
            TransactionState::Failed | TransactionState::Cancelled => {
                self.subscriptions
                    .clear_pending_change(subscription_id, transaction.id)
                    .await?
            }
            TransactionState::Pending | TransactionState::Processing => return Ok(None),
        };

        match &result {
            Some(subscription) => info!(
                subscription_id = %subscription_id,
                transaction_id = %transaction.id,
                to_state = %transaction.state,
                plan = %subscription.plan,
                monthly_price = subscription.monthly_price,
                "subscription upgrade settled"
            ),
            None => info!(
                subscription_id = %subscription_id,
                transaction_id = %transaction.id,
                "no awaiting change matched upgrade transaction"
            ),
        }
        Ok(result)
    }

    /// Cancels the subscription. Access continues until `expires_at`; an
    /// upgrade payment already in flight still commits if it completes.
    pub async fn cancel(&self, seller_id: Uuid) -> BillingResult<Subscription> {
        let current = self.get(seller_id).await?;
        let Some(saved) = self.subscriptions.cancel_subscription(current.id).await? else {
            return self.get(seller_id).await;
        };
        info!(
            seller_id = %seller_id,
            plan = %saved.plan,
            expires_at = %saved.expires_at,
            "subscription cancelled"
        );
        Ok(saved)
    }

    /// Commission taken from the seller's sales under their current plan.
    /// A cancelled subscription falls back to the percentage rate once the
    /// paid period is over.
    pub async fn commission_rate_for(&self, seller_id: Uuid) -> BillingResult<Decimal> {
        let subscription = self.subscriptions.find_subscription_by_seller(seller_id).await?;
        let model = match subscription {
            Some(sub) if sub.has_lapsed(Utc::now()) => PricingModel::Percentage,
            Some(sub) => sub.pricing_model(),
            None => PricingModel::Percentage,
        };
        Ok(match model {
            PricingModel::Percentage => self.config.percentage_commission_rate,
            PricingModel::Subscription => self.config.subscription_commission_rate,
        })
    }

    /// Rolls over cycles that ended with a deferred price change waiting.
    pub async fn apply_due_scheduled_changes(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> BillingResult<usize> {
        let due = self
            .subscriptions
            .find_due_scheduled_changes(now, limit)
            .await?;
        let mut applied = 0;
        for subscription in due {
            let next_expiry = subscription.expires_at + self.cycle();
            if let Some(updated) = self
                .subscriptions
                .apply_scheduled_price(subscription.id, subscription.expires_at, next_expiry)
                .await?
            {
                applied += 1;
                info!(
                    subscription_id = %updated.id,
                    seller_id = %updated.seller_id,
                    plan = %updated.plan,
                    monthly_price = updated.monthly_price,
                    expires_at = %updated.expires_at,
                    "scheduled price applied"
                );
            }
        }
        Ok(applied)
    }
}
