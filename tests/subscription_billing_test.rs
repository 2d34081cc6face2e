// Plan changes and their payment gating, driven through the same webhook
// path providers use.

mod common;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use common::{push_payer, TestHarness};
use marketplace_payments::config::{BillingConfig, PayoutConfig, UpgradeChargePolicy};
use marketplace_payments::database::error::DatabaseResult;
use marketplace_payments::database::subscription_repository::{
    NewSubscription, PlanId, PlanSwitch, Subscription, SubscriptionRepository,
    SubscriptionStatus,
};
use marketplace_payments::database::transaction_repository::TransactionState;
use marketplace_payments::database::webhook_repository::WebhookOutcome;
use marketplace_payments::database::Repositories;
use marketplace_payments::payments::types::{PaymentPurpose, ProviderKind, ProviderStatus};
use marketplace_payments::services::subscription_billing::{
    PlanChangeKind, PlanChangeOutcome, PlanChangeRequest,
};
use marketplace_payments::services::BillingError;
use marketplace_payments::workers::BillingCycleWorker;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn change_to(plan: PlanId) -> PlanChangeRequest {
    PlanChangeRequest {
        target_plan: plan,
        payer: Some(push_payer()),
        idempotency_reference: None,
    }
}

async fn request_change(harness: &TestHarness, seller: Uuid, plan: PlanId) -> PlanChangeOutcome {
    harness
        .services
        .billing
        .change_plan(seller, change_to(plan))
        .await
        .unwrap()
}

/// Every cycle ends the moment it starts, so each paid period is already over.
fn lapsing_harness() -> TestHarness {
    let billing = BillingConfig {
        cycle_days: 0,
        ..BillingConfig::default()
    };
    TestHarness::with_config(billing, PayoutConfig::default())
}

/// Subscription store whose cancellation write lands late, after whatever
/// else is in flight.
struct SlowCancel {
    inner: Arc<dyn SubscriptionRepository>,
}

#[async_trait]
impl SubscriptionRepository for SlowCancel {
    async fn create_subscription(&self, new: NewSubscription) -> DatabaseResult<Subscription> {
        self.inner.create_subscription(new).await
    }

    async fn find_subscription_by_seller(
        &self,
        seller_id: Uuid,
    ) -> DatabaseResult<Option<Subscription>> {
        self.inner.find_subscription_by_seller(seller_id).await
    }

    async fn switch_plan(
        &self,
        id: Uuid,
        switch: PlanSwitch,
    ) -> DatabaseResult<Option<Subscription>> {
        self.inner.switch_plan(id, switch).await
    }

    async fn begin_pending_change(
        &self,
        id: Uuid,
        plan: PlanId,
        price: i64,
        transaction_id: Uuid,
    ) -> DatabaseResult<Option<Subscription>> {
        self.inner
            .begin_pending_change(id, plan, price, transaction_id)
            .await
    }

    async fn cancel_subscription(&self, id: Uuid) -> DatabaseResult<Option<Subscription>> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.inner.cancel_subscription(id).await
    }

    async fn commit_pending_change(
        &self,
        id: Uuid,
        transaction_id: Uuid,
        new_expires_at: DateTime<Utc>,
    ) -> DatabaseResult<Option<Subscription>> {
        self.inner
            .commit_pending_change(id, transaction_id, new_expires_at)
            .await
    }

    async fn clear_pending_change(
        &self,
        id: Uuid,
        transaction_id: Uuid,
    ) -> DatabaseResult<Option<Subscription>> {
        self.inner.clear_pending_change(id, transaction_id).await
    }

    async fn find_due_scheduled_changes(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> DatabaseResult<Vec<Subscription>> {
        self.inner.find_due_scheduled_changes(now, limit).await
    }

    async fn apply_scheduled_price(
        &self,
        id: Uuid,
        expected_expires_at: DateTime<Utc>,
        new_expires_at: DateTime<Utc>,
    ) -> DatabaseResult<Option<Subscription>> {
        self.inner
            .apply_scheduled_price(id, expected_expires_at, new_expires_at)
            .await
    }
}

/// Moves the seller onto a subscription plan and pays for it.
async fn subscribe(harness: &TestHarness, seller: Uuid, plan: PlanId) {
    let outcome = request_change(harness, seller, plan).await;
    assert_eq!(outcome.kind, PlanChangeKind::PaymentRequired);
    let reference = outcome
        .payment
        .unwrap()
        .transaction
        .provider_reference
        .unwrap();
    harness
        .deliver(ProviderKind::Push, &reference, ProviderStatus::Successful)
        .await;
    assert_eq!(harness.services.billing.get(seller).await.unwrap().plan, plan);
}

#[tokio::test]
async fn new_sellers_start_on_the_percentage_plan() {
    let harness = TestHarness::new();
    let seller = Uuid::new_v4();

    let first = harness.services.billing.get_or_default(seller).await.unwrap();
    let second = harness.services.billing.get_or_default(seller).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(first.plan, PlanId::PercentageStandard);
    assert_eq!(first.monthly_price, 0);
    assert_eq!(first.status, SubscriptionStatus::Active);
    assert_eq!(
        harness.services.billing.commission_rate_for(seller).await.unwrap(),
        dec!(0.10)
    );
}

#[tokio::test]
async fn upgrade_waits_for_payment_then_commits() {
    let harness = TestHarness::new();
    let seller = Uuid::new_v4();
    subscribe(&harness, seller, PlanId::SubscriptionStarter).await;

    let outcome = request_change(&harness, seller, PlanId::SubscriptionProfessional).await;
    assert_eq!(outcome.kind, PlanChangeKind::PaymentRequired);
    let payment = outcome.payment.unwrap();
    assert_eq!(payment.transaction.amount, 75_000);
    assert_eq!(payment.transaction.purpose, PaymentPurpose::SubscriptionUpgrade);
    assert_eq!(payment.transaction.linked_entity_id, Some(outcome.subscription.id));

    // Nothing changes until the provider confirms.
    let waiting = outcome.subscription;
    assert_eq!(waiting.plan, PlanId::SubscriptionStarter);
    assert_eq!(waiting.monthly_price, 25_000);
    assert_eq!(waiting.pending_plan, Some(PlanId::SubscriptionProfessional));
    assert_eq!(waiting.pending_transaction_id, Some(payment.transaction.id));

    let blocked = harness
        .services
        .billing
        .change_plan(seller, change_to(PlanId::SubscriptionEnterprise))
        .await;
    assert!(matches!(blocked, Err(BillingError::PlanChangeRejected(_))));

    let receipt = harness
        .deliver(
            ProviderKind::Push,
            payment.transaction.provider_reference.as_deref().unwrap(),
            ProviderStatus::Successful,
        )
        .await;
    assert_eq!(receipt.state, Some(TransactionState::Completed));

    let upgraded = harness.services.billing.get(seller).await.unwrap();
    assert_eq!(upgraded.plan, PlanId::SubscriptionProfessional);
    assert_eq!(upgraded.monthly_price, 75_000);
    assert!(!upgraded.has_pending_change());
    assert!(upgraded.expires_at > Utc::now() + ChronoDuration::days(29));
    assert_eq!(
        harness.services.billing.commission_rate_for(seller).await.unwrap(),
        dec!(0)
    );
}

#[tokio::test]
async fn redelivered_upgrade_confirmation_does_not_extend_the_cycle() {
    let harness = TestHarness::new();
    let seller = Uuid::new_v4();
    subscribe(&harness, seller, PlanId::SubscriptionStarter).await;

    let outcome = request_change(&harness, seller, PlanId::SubscriptionProfessional).await;
    let reference = outcome
        .payment
        .unwrap()
        .transaction
        .provider_reference
        .unwrap();
    let first = harness
        .deliver(ProviderKind::Push, &reference, ProviderStatus::Successful)
        .await;
    assert_eq!(first.outcome, WebhookOutcome::Applied);
    let committed = harness.services.billing.get(seller).await.unwrap();

    let again = harness
        .deliver(ProviderKind::Push, &reference, ProviderStatus::Successful)
        .await;
    assert_eq!(again.outcome, WebhookOutcome::Duplicate);

    let after = harness.services.billing.get(seller).await.unwrap();
    assert_eq!(after.plan, PlanId::SubscriptionProfessional);
    assert_eq!(after.monthly_price, 75_000);
    assert_eq!(after.expires_at, committed.expires_at);
    assert_eq!(after.status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn cancel_racing_a_confirmed_upgrade_keeps_the_upgrade() {
    let mut repos = Repositories::in_memory();
    repos.subscriptions = Arc::new(SlowCancel {
        inner: repos.subscriptions.clone(),
    });
    let harness = TestHarness::with_repos(repos, BillingConfig::default(), PayoutConfig::default());
    let seller = Uuid::new_v4();
    subscribe(&harness, seller, PlanId::SubscriptionStarter).await;

    let outcome = request_change(&harness, seller, PlanId::SubscriptionProfessional).await;
    let reference = outcome
        .payment
        .unwrap()
        .transaction
        .provider_reference
        .unwrap();

    let (cancelled, receipt) = tokio::join!(
        harness.services.billing.cancel(seller),
        harness.deliver(ProviderKind::Push, &reference, ProviderStatus::Successful),
    );
    cancelled.unwrap();
    assert_eq!(receipt.outcome, WebhookOutcome::Applied);

    let after = harness.services.billing.get(seller).await.unwrap();
    assert_eq!(after.plan, PlanId::SubscriptionProfessional);
    assert_eq!(after.monthly_price, 75_000);
    assert_eq!(after.pending_transaction_id, None);
    assert_eq!(after.status, SubscriptionStatus::Cancelled);
}

#[tokio::test]
async fn delta_policy_charges_the_difference() {
    let billing = BillingConfig {
        upgrade_charge_policy: UpgradeChargePolicy::Delta,
        ..BillingConfig::default()
    };
    let harness = TestHarness::with_config(billing, PayoutConfig::default());
    let seller = Uuid::new_v4();
    subscribe(&harness, seller, PlanId::SubscriptionStarter).await;

    let outcome = request_change(&harness, seller, PlanId::SubscriptionProfessional).await;
    assert_eq!(outcome.payment.unwrap().transaction.amount, 50_000);
}

#[tokio::test]
async fn failed_upgrade_payment_drops_the_pending_change() {
    let harness = TestHarness::new();
    let seller = Uuid::new_v4();
    subscribe(&harness, seller, PlanId::SubscriptionStarter).await;

    let outcome = request_change(&harness, seller, PlanId::SubscriptionEnterprise).await;
    let reference = outcome
        .payment
        .unwrap()
        .transaction
        .provider_reference
        .unwrap();
    harness
        .deliver(ProviderKind::Push, &reference, ProviderStatus::Failed)
        .await;

    let current = harness.services.billing.get(seller).await.unwrap();
    assert_eq!(current.plan, PlanId::SubscriptionStarter);
    assert_eq!(current.monthly_price, 25_000);
    assert!(!current.has_pending_change());

    // The seller can try again once the failed attempt is cleared.
    let retry = request_change(&harness, seller, PlanId::SubscriptionEnterprise).await;
    assert_eq!(retry.kind, PlanChangeKind::PaymentRequired);
}

#[tokio::test]
async fn downgrade_is_deferred_to_the_next_cycle() {
    let harness = TestHarness::new();
    let seller = Uuid::new_v4();
    subscribe(&harness, seller, PlanId::SubscriptionProfessional).await;

    let outcome = request_change(&harness, seller, PlanId::SubscriptionStarter).await;
    assert_eq!(outcome.kind, PlanChangeKind::Deferred);
    assert!(outcome.payment.is_none());
    let deferred = outcome.subscription;
    assert_eq!(deferred.plan, PlanId::SubscriptionStarter);
    assert_eq!(deferred.monthly_price, 75_000);
    assert_eq!(deferred.scheduled_price, Some(25_000));

    // Not due until the paid cycle ends.
    let applied = harness
        .services
        .billing
        .apply_due_scheduled_changes(Utc::now(), 10)
        .await
        .unwrap();
    assert_eq!(applied, 0);

    let applied = harness
        .services
        .billing
        .apply_due_scheduled_changes(deferred.expires_at + ChronoDuration::seconds(1), 10)
        .await
        .unwrap();
    assert_eq!(applied, 1);

    let rolled = harness.services.billing.get(seller).await.unwrap();
    assert_eq!(rolled.monthly_price, 25_000);
    assert_eq!(rolled.scheduled_price, None);
    assert_eq!(rolled.expires_at, deferred.expires_at + ChronoDuration::days(30));
}

#[tokio::test]
async fn billing_cycle_worker_applies_expired_schedules() {
    let harness = lapsing_harness();
    let seller = Uuid::new_v4();
    subscribe(&harness, seller, PlanId::SubscriptionEnterprise).await;
    let deferred = request_change(&harness, seller, PlanId::SubscriptionStarter).await;
    assert_eq!(deferred.kind, PlanChangeKind::Deferred);
    assert_eq!(deferred.subscription.scheduled_price, Some(25_000));

    let worker = BillingCycleWorker::new(harness.services.billing.clone(), Duration::from_secs(60));
    assert_eq!(worker.run_cycle().await.unwrap(), 1);
    assert_eq!(worker.run_cycle().await.unwrap(), 0);
    assert_eq!(
        harness.services.billing.get(seller).await.unwrap().monthly_price,
        25_000
    );
}

#[tokio::test]
async fn moving_to_percentage_is_immediate_and_back_needs_payment() {
    let harness = TestHarness::new();
    let seller = Uuid::new_v4();
    subscribe(&harness, seller, PlanId::SubscriptionStarter).await;

    let outcome = request_change(&harness, seller, PlanId::PercentageStandard).await;
    assert_eq!(outcome.kind, PlanChangeKind::Immediate);
    assert_eq!(outcome.subscription.plan, PlanId::PercentageStandard);
    assert_eq!(outcome.subscription.monthly_price, 0);
    assert_eq!(outcome.subscription.scheduled_price, None);

    let unchanged = request_change(&harness, seller, PlanId::PercentageStandard).await;
    assert_eq!(unchanged.kind, PlanChangeKind::Unchanged);

    let without_payer = harness
        .services
        .billing
        .change_plan(
            seller,
            PlanChangeRequest {
                target_plan: PlanId::SubscriptionStarter,
                payer: None,
                idempotency_reference: None,
            },
        )
        .await;
    assert!(matches!(without_payer, Err(BillingError::PayerRequired(PlanId::SubscriptionStarter))));

    let back = request_change(&harness, seller, PlanId::SubscriptionStarter).await;
    assert_eq!(back.kind, PlanChangeKind::PaymentRequired);
    assert_eq!(back.payment.unwrap().transaction.amount, 25_000);
}

#[tokio::test]
async fn cancel_keeps_access_until_expiry() {
    let harness = TestHarness::new();
    let seller = Uuid::new_v4();
    subscribe(&harness, seller, PlanId::SubscriptionProfessional).await;
    let before = harness.services.billing.get(seller).await.unwrap();

    let cancelled = harness.services.billing.cancel(seller).await.unwrap();
    assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
    assert_eq!(cancelled.expires_at, before.expires_at);
    assert_eq!(cancelled.plan, PlanId::SubscriptionProfessional);
    assert_eq!(
        harness.services.billing.commission_rate_for(seller).await.unwrap(),
        dec!(0)
    );

    let again = harness.services.billing.cancel(seller).await.unwrap();
    assert_eq!(again.updated_at, cancelled.updated_at);
}

#[tokio::test]
async fn lapsed_subscription_pays_to_return_to_its_plan() {
    let harness = lapsing_harness();
    let seller = Uuid::new_v4();
    subscribe(&harness, seller, PlanId::SubscriptionStarter).await;
    harness.services.billing.cancel(seller).await.unwrap();

    // The paid period is over, so commission applies again.
    assert_eq!(
        harness.services.billing.commission_rate_for(seller).await.unwrap(),
        dec!(0.10)
    );

    let outcome = request_change(&harness, seller, PlanId::SubscriptionStarter).await;
    assert_eq!(outcome.kind, PlanChangeKind::PaymentRequired);
    assert_eq!(outcome.payment.unwrap().transaction.amount, 25_000);
    assert_eq!(outcome.subscription.status, SubscriptionStatus::Cancelled);
    assert_eq!(
        harness.services.billing.commission_rate_for(seller).await.unwrap(),
        dec!(0.10)
    );
}
