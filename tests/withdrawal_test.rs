// Seller balances and withdrawals: reservation, disbursement and settlement.

mod common;

use chrono::Utc;
use common::{
    hosted_payer, push_payer, webhook_body_by_idempotency, FlakyTransactions, TestHarness,
    VALID_SIGNATURE,
};
use marketplace_payments::config::{BillingConfig, PayoutConfig};
use marketplace_payments::database::Repositories;
use marketplace_payments::database::payout_repository::{NewSellerEarning, WithdrawalStatus};
use marketplace_payments::database::transaction_repository::TransactionState;
use marketplace_payments::database::webhook_repository::WebhookOutcome;
use marketplace_payments::payments::types::{Money, PaymentPurpose, ProviderKind, ProviderStatus};
use marketplace_payments::services::payout::{PayoutError, WithdrawalInput, WithdrawalOutcome};
use marketplace_payments::services::{Services, SubmitPaymentRequest};
use uuid::Uuid;

async fn credit(harness: &TestHarness, seller: Uuid, net_amount: i64) {
    harness
        .repos
        .payouts
        .credit_earning(NewSellerEarning {
            seller_id: seller,
            order_id: Uuid::new_v4(),
            order_line_id: Uuid::new_v4(),
            gross_amount: net_amount,
            platform_fee: 0,
            net_amount,
            currency: "TZS".to_string(),
        })
        .await
        .unwrap();
}

fn withdraw(amount: i64) -> WithdrawalInput {
    WithdrawalInput {
        amount,
        currency: None,
        destination: push_payer(),
    }
}

async fn request(
    services: &Services,
    seller: Uuid,
    amount: i64,
) -> Result<WithdrawalOutcome, PayoutError> {
    services.payouts.request_withdrawal(seller, withdraw(amount)).await
}

#[tokio::test]
async fn withdrawal_above_balance_is_rejected_without_a_ledger_row() {
    let harness = TestHarness::new();
    let seller = Uuid::new_v4();
    credit(&harness, seller, 80_000).await;

    let result = request(&harness.services, seller, 100_000).await;
    match result {
        Err(PayoutError::InsufficientBalance {
            available,
            requested,
        }) => {
            assert_eq!(available, 80_000);
            assert_eq!(requested, 100_000);
        }
        other => panic!("expected insufficient balance, got {:?}", other.map(|o| o.withdrawal.id)),
    }

    assert!(harness
        .services
        .payouts
        .list_withdrawals(seller)
        .await
        .unwrap()
        .is_empty());
    let open_rows = harness
        .repos
        .transactions
        .find_stale(Utc::now() + chrono::Duration::hours(1), 100)
        .await
        .unwrap();
    assert!(open_rows.is_empty());
    assert_eq!(harness.push.initiate_calls(), 0);
}

#[tokio::test]
async fn concurrent_withdrawals_cannot_overdraw() {
    let harness = TestHarness::new();
    let seller = Uuid::new_v4();
    credit(&harness, seller, 80_000).await;

    let (first, second) = tokio::join!(
        request(&harness.services, seller, 60_000),
        request(&harness.services, seller, 60_000),
    );

    let outcomes = [first, second];
    let accepted = outcomes.iter().filter(|r| r.is_ok()).count();
    let rejected = outcomes
        .iter()
        .filter(|r| matches!(r, Err(PayoutError::InsufficientBalance { .. })))
        .count();
    assert_eq!(accepted, 1);
    assert_eq!(rejected, 1);

    let balance = harness.services.payouts.balance(seller, None).await.unwrap();
    assert_eq!(balance.reserved_withdrawals, 60_000);
    assert_eq!(balance.available, 20_000);
}

#[tokio::test]
async fn fee_is_taken_from_the_requested_amount() {
    let harness = TestHarness::new();
    let seller = Uuid::new_v4();
    credit(&harness, seller, 80_000).await;

    let outcome = request(&harness.services, seller, 50_000).await.unwrap();
    let withdrawal = &outcome.withdrawal;
    assert_eq!(withdrawal.fee, 1_000);
    assert_eq!(withdrawal.net_amount, 49_000);
    assert_eq!(withdrawal.fee + withdrawal.net_amount, withdrawal.amount);

    // The provider is asked to send the net amount.
    let tx = &outcome.payment.transaction;
    assert_eq!(tx.purpose, PaymentPurpose::Withdrawal);
    assert_eq!(tx.amount, 49_000);
    assert_eq!(tx.linked_entity_id, Some(withdrawal.id));
    assert_eq!(tx.idempotency_reference, format!("wdr-{}", withdrawal.id.simple()));
    assert_eq!(withdrawal.transaction_id, Some(tx.id));
    assert_eq!(withdrawal.status, WithdrawalStatus::Processing);
}

#[tokio::test]
async fn webhook_settles_the_withdrawal() {
    let harness = TestHarness::new();
    let seller = Uuid::new_v4();
    credit(&harness, seller, 80_000).await;

    let outcome = request(&harness.services, seller, 50_000).await.unwrap();
    let reference = outcome.payment.transaction.provider_reference.clone().unwrap();

    let receipt = harness
        .deliver(ProviderKind::Push, &reference, ProviderStatus::Successful)
        .await;
    assert_eq!(receipt.outcome, WebhookOutcome::Applied);
    assert_eq!(receipt.state, Some(TransactionState::Completed));

    let withdrawal = harness
        .services
        .payouts
        .get_withdrawal(outcome.withdrawal.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(withdrawal.status, WithdrawalStatus::Completed);

    let balance = harness.services.payouts.balance(seller, None).await.unwrap();
    assert_eq!(balance.total_earned, 80_000);
    assert_eq!(balance.completed_withdrawals, 50_000);
    assert_eq!(balance.reserved_withdrawals, 0);
    assert_eq!(balance.available, 30_000);
}

#[tokio::test]
async fn failed_disbursement_releases_the_reservation() {
    let harness = TestHarness::new();
    let seller = Uuid::new_v4();
    credit(&harness, seller, 80_000).await;

    let outcome = request(&harness.services, seller, 50_000).await.unwrap();
    let reference = outcome.payment.transaction.provider_reference.clone().unwrap();
    harness
        .deliver(ProviderKind::Push, &reference, ProviderStatus::Failed)
        .await;

    let withdrawal = harness
        .services
        .payouts
        .get_withdrawal(outcome.withdrawal.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(withdrawal.status, WithdrawalStatus::Failed);
    assert!(withdrawal.error_message.is_some());
    let balance = harness.services.payouts.balance(seller, None).await.unwrap();
    assert_eq!(balance.available, 80_000);
}

#[tokio::test]
async fn rejected_initiation_fails_the_withdrawal() {
    let harness = TestHarness::new();
    let seller = Uuid::new_v4();
    credit(&harness, seller, 80_000).await;
    harness.push.fail_initiation(true);

    let result = request(&harness.services, seller, 50_000).await;
    let Err(PayoutError::Submission { withdrawal_id, .. }) = result else {
        panic!("expected submission failure");
    };

    let withdrawal = harness
        .services
        .payouts
        .get_withdrawal(withdrawal_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(withdrawal.status, WithdrawalStatus::Failed);
    assert!(withdrawal.transaction_id.is_some());
    let balance = harness.services.payouts.balance(seller, None).await.unwrap();
    assert_eq!(balance.available, 80_000);
}

#[tokio::test]
async fn accepted_disbursement_keeps_its_reservation_when_processing_is_not_recorded() {
    let mut repos = Repositories::in_memory();
    let transactions = FlakyTransactions::wrap(repos.transactions.clone());
    repos.transactions = transactions.clone();
    let harness = TestHarness::with_repos(repos, BillingConfig::default(), PayoutConfig::default());
    let seller = Uuid::new_v4();
    credit(&harness, seller, 80_000).await;
    transactions.fail_processing(true);

    let result = request(&harness.services, seller, 50_000).await;
    let Err(PayoutError::Submission { withdrawal_id, source }) = result else {
        panic!("expected submission error");
    };
    assert!(!source.nothing_sent());
    assert_eq!(harness.push.initiate_calls(), 1);

    let withdrawal = harness
        .services
        .payouts
        .get_withdrawal(withdrawal_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(withdrawal.status, WithdrawalStatus::Pending);
    let transaction_id = withdrawal.transaction_id.expect("transaction attached");
    let balance = harness.services.payouts.balance(seller, None).await.unwrap();
    assert_eq!(balance.available, 30_000);
    assert!(matches!(
        request(&harness.services, seller, 50_000).await,
        Err(PayoutError::InsufficientBalance { available: 30_000, .. })
    ));

    // The provider's callback still settles the payout.
    transactions.fail_processing(false);
    let tx = harness
        .services
        .orchestrator
        .get_transaction(transaction_id)
        .await
        .unwrap();
    assert_eq!(tx.state, TransactionState::Pending);
    let receipt = harness
        .services
        .reconciliation
        .handle_webhook(
            ProviderKind::Push,
            &webhook_body_by_idempotency(&tx.idempotency_reference, ProviderStatus::Successful),
            VALID_SIGNATURE,
        )
        .await
        .unwrap();
    assert_eq!(receipt.outcome, WebhookOutcome::Applied);

    let withdrawal = harness
        .services
        .payouts
        .get_withdrawal(withdrawal_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(withdrawal.status, WithdrawalStatus::Completed);
    let balance = harness.services.payouts.balance(seller, None).await.unwrap();
    assert_eq!(balance.available, 30_000);
}

#[tokio::test]
async fn withdrawals_only_go_to_mobile_money() {
    let harness = TestHarness::new();
    let seller = Uuid::new_v4();
    credit(&harness, seller, 80_000).await;

    let hosted = harness
        .services
        .payouts
        .request_withdrawal(
            seller,
            WithdrawalInput {
                amount: 10_000,
                currency: None,
                destination: hosted_payer(),
            },
        )
        .await;
    assert!(matches!(hosted, Err(PayoutError::InvalidDestination(_))));

    let tiny = request(&harness.services, seller, 500).await;
    assert!(matches!(tiny, Err(PayoutError::InvalidAmount { .. })));
    assert!(harness
        .services
        .payouts
        .list_withdrawals(seller)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn paid_orders_fund_withdrawals() {
    let harness = TestHarness::new();
    let seller = Uuid::new_v4();
    let other_seller = Uuid::new_v4();
    let order = harness
        .create_order(&[(seller, 60_000), (other_seller, 40_000)])
        .await;

    let payment = harness
        .services
        .orchestrator
        .submit(SubmitPaymentRequest {
            user_id: order.buyer_id,
            purpose: PaymentPurpose::OrderPayment,
            amount: Money::new(100_000, "TZS"),
            payer: push_payer(),
            linked_entity_id: Some(order.id),
            description: None,
            idempotency_reference: None,
            metadata: None,
        })
        .await
        .unwrap();
    harness
        .deliver(
            ProviderKind::Push,
            payment.transaction.provider_reference.as_deref().unwrap(),
            ProviderStatus::Successful,
        )
        .await;

    let balance = harness.services.payouts.balance(seller, None).await.unwrap();
    assert_eq!(balance.available, 54_000);
    let other = harness.services.payouts.balance(other_seller, None).await.unwrap();
    assert_eq!(other.available, 36_000);

    assert!(request(&harness.services, seller, 54_000).await.is_ok());
    assert!(matches!(
        request(&harness.services, seller, 1_000).await,
        Err(PayoutError::InsufficientBalance { available: 0, .. })
    ));
}
