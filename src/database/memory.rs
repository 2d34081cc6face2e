//! In-process store implementing every repository trait.
//!
//! Used when no `DATABASE_URL` is configured and by the test suite. A single
//! mutex guards all tables, so each compare-and-set and the withdrawal
//! reservation run as one critical section.

use crate::database::error::{DatabaseError, DatabaseErrorKind, DatabaseResult};
use crate::database::order_repository::{NewOrder, Order, OrderLine, OrderRepository, OrderStatus};
use crate::database::payout_repository::{
    BalanceTotals, EarningStatus, NewSellerEarning, NewWithdrawal, PayoutRepository,
    ReservationOutcome, SellerEarning, WithdrawalRequest, WithdrawalStatus,
};
use crate::database::subscription_repository::{
    NewSubscription, PlanId, PlanSwitch, Subscription, SubscriptionRepository, SubscriptionStatus,
};
use crate::database::transaction_repository::{
    NewPaymentTransaction, PaymentTransaction, TransactionRepository, TransactionState,
};
use crate::database::webhook_repository::{
    NewWebhookEvent, WebhookEventRecord, WebhookEventRepository,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct MemoryState {
    transactions: HashMap<Uuid, PaymentTransaction>,
    orders: HashMap<Uuid, Order>,
    subscriptions: HashMap<Uuid, Subscription>,
    earnings: Vec<SellerEarning>,
    withdrawals: HashMap<Uuid, WithdrawalRequest>,
    webhook_events: Vec<WebhookEventRecord>,
}

impl MemoryState {
    fn balance_totals(&self, seller_id: Uuid, currency: &str) -> BalanceTotals {
        let total_earned = self
            .earnings
            .iter()
            .filter(|e| e.seller_id == seller_id && e.currency == currency)
            .map(|e| e.net_amount)
            .sum();
        let mut totals = BalanceTotals {
            total_earned,
            ..BalanceTotals::default()
        };
        for w in self
            .withdrawals
            .values()
            .filter(|w| w.seller_id == seller_id && w.currency == currency)
        {
            if w.status == WithdrawalStatus::Completed {
                totals.completed_withdrawals += w.amount;
            } else if w.status.is_reserved() {
                totals.reserved_withdrawals += w.amount;
            }
        }
        totals
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn unique_violation(constraint: &str) -> DatabaseError {
    DatabaseError::new(DatabaseErrorKind::UniqueViolation {
        constraint: Some(constraint.to_string()),
    })
}

#[async_trait]
impl TransactionRepository for InMemoryStore {
    async fn insert(&self, new: NewPaymentTransaction) -> DatabaseResult<PaymentTransaction> {
        let mut state = self.state.lock().await;
        if state
            .transactions
            .values()
            .any(|t| t.idempotency_reference == new.idempotency_reference)
        {
            return Err(unique_violation(
                "payment_transactions_idempotency_reference_key",
            ));
        }

        let now = Utc::now();
        let tx = PaymentTransaction {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            amount: new.amount.amount,
            currency: new.amount.currency,
            purpose: new.purpose,
            provider_kind: new.provider_kind,
            idempotency_reference: new.idempotency_reference,
            provider_reference: None,
            state: TransactionState::Pending,
            linked_entity_id: new.linked_entity_id,
            description: new.description,
            created_at: now,
            updated_at: now,
        };
        state.transactions.insert(tx.id, tx.clone());
        Ok(tx)
    }

    async fn find_by_id(&self, id: Uuid) -> DatabaseResult<Option<PaymentTransaction>> {
        Ok(self.state.lock().await.transactions.get(&id).cloned())
    }

    async fn find_by_idempotency_reference(
        &self,
        reference: &str,
    ) -> DatabaseResult<Option<PaymentTransaction>> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .values()
            .find(|t| t.idempotency_reference == reference)
            .cloned())
    }

    async fn find_by_provider_reference(
        &self,
        reference: &str,
    ) -> DatabaseResult<Option<PaymentTransaction>> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .values()
            .find(|t| t.provider_reference.as_deref() == Some(reference))
            .cloned())
    }

    async fn find_by_linked_entity(
        &self,
        entity_id: Uuid,
    ) -> DatabaseResult<Vec<PaymentTransaction>> {
        let state = self.state.lock().await;
        let mut rows: Vec<PaymentTransaction> = state
            .transactions
            .values()
            .filter(|t| t.linked_entity_id == Some(entity_id))
            .cloned()
            .collect();
        rows.sort_by_key(|t| t.created_at);
        Ok(rows)
    }

    async fn compare_and_set_state(
        &self,
        id: Uuid,
        from: &[TransactionState],
        to: TransactionState,
        provider_reference: Option<&str>,
    ) -> DatabaseResult<Option<PaymentTransaction>> {
        let mut state = self.state.lock().await;
        let Some(tx) = state.transactions.get_mut(&id) else {
            return Ok(None);
        };
        if !from.contains(&tx.state) {
            return Ok(None);
        }
        tx.state = to;
        if let Some(reference) = provider_reference {
            tx.provider_reference = Some(reference.to_string());
        }
        tx.updated_at = Utc::now();
        Ok(Some(tx.clone()))
    }

    async fn find_stale(
        &self,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> DatabaseResult<Vec<PaymentTransaction>> {
        let state = self.state.lock().await;
        let mut rows: Vec<PaymentTransaction> = state
            .transactions
            .values()
            .filter(|t| !t.state.is_terminal() && t.updated_at < updated_before)
            .cloned()
            .collect();
        rows.sort_by_key(|t| t.updated_at);
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }
}

#[async_trait]
impl OrderRepository for InMemoryStore {
    async fn create_order(&self, new: NewOrder) -> DatabaseResult<Order> {
        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let order = Order {
            id: order_id,
            buyer_id: new.buyer_id,
            total_amount: new.total_amount(),
            currency: new.currency.clone(),
            status: OrderStatus::Pending,
            lines: new
                .lines
                .iter()
                .map(|l| OrderLine {
                    id: Uuid::new_v4(),
                    order_id,
                    seller_id: l.seller_id,
                    amount: l.amount,
                })
                .collect(),
            created_at: now,
            updated_at: now,
        };
        self.state.lock().await.orders.insert(order.id, order.clone());
        Ok(order)
    }

    async fn find_order(&self, id: Uuid) -> DatabaseResult<Option<Order>> {
        Ok(self.state.lock().await.orders.get(&id).cloned())
    }

    async fn mark_order_paid(&self, id: Uuid) -> DatabaseResult<Option<Order>> {
        let mut state = self.state.lock().await;
        match state.orders.get_mut(&id) {
            Some(order) if order.status == OrderStatus::Pending => {
                order.status = OrderStatus::Paid;
                order.updated_at = Utc::now();
                Ok(Some(order.clone()))
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl SubscriptionRepository for InMemoryStore {
    async fn create_subscription(&self, new: NewSubscription) -> DatabaseResult<Subscription> {
        let mut state = self.state.lock().await;
        if state
            .subscriptions
            .values()
            .any(|s| s.seller_id == new.seller_id)
        {
            return Err(unique_violation("subscriptions_seller_id_key"));
        }
        let now = Utc::now();
        let subscription = Subscription {
            id: Uuid::new_v4(),
            seller_id: new.seller_id,
            plan: new.plan,
            monthly_price: new.monthly_price,
            currency: new.currency,
            status: SubscriptionStatus::Active,
            expires_at: new.expires_at,
            scheduled_price: None,
            pending_plan: None,
            pending_price: None,
            pending_transaction_id: None,
            created_at: now,
            updated_at: now,
        };
        state
            .subscriptions
            .insert(subscription.id, subscription.clone());
        Ok(subscription)
    }

    async fn find_subscription_by_seller(
        &self,
        seller_id: Uuid,
    ) -> DatabaseResult<Option<Subscription>> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .find(|s| s.seller_id == seller_id)
            .cloned())
    }

    async fn switch_plan(
        &self,
        id: Uuid,
        switch: PlanSwitch,
    ) -> DatabaseResult<Option<Subscription>> {
        let mut state = self.state.lock().await;
        let Some(sub) = state.subscriptions.get_mut(&id) else {
            return Ok(None);
        };
        if sub.pending_transaction_id.is_some() {
            return Ok(None);
        }
        match switch {
            PlanSwitch::Immediate {
                plan,
                monthly_price,
            } => {
                sub.plan = plan;
                sub.monthly_price = monthly_price;
                sub.scheduled_price = None;
            }
            PlanSwitch::AtCycleEnd {
                plan,
                monthly_price,
            } => {
                sub.plan = plan;
                sub.scheduled_price = (monthly_price != sub.monthly_price).then_some(monthly_price);
            }
        }
        sub.status = SubscriptionStatus::Active;
        sub.updated_at = Utc::now();
        Ok(Some(sub.clone()))
    }

    async fn begin_pending_change(
        &self,
        id: Uuid,
        plan: PlanId,
        price: i64,
        transaction_id: Uuid,
    ) -> DatabaseResult<Option<Subscription>> {
        let mut state = self.state.lock().await;
        match state.subscriptions.get_mut(&id) {
            Some(sub) if sub.pending_transaction_id.is_none() => {
                sub.pending_plan = Some(plan);
                sub.pending_price = Some(price);
                sub.pending_transaction_id = Some(transaction_id);
                sub.updated_at = Utc::now();
                Ok(Some(sub.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn cancel_subscription(&self, id: Uuid) -> DatabaseResult<Option<Subscription>> {
        let mut state = self.state.lock().await;
        match state.subscriptions.get_mut(&id) {
            Some(sub) if sub.status != SubscriptionStatus::Cancelled => {
                sub.status = SubscriptionStatus::Cancelled;
                sub.scheduled_price = None;
                sub.updated_at = Utc::now();
                Ok(Some(sub.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn commit_pending_change(
        &self,
        id: Uuid,
        transaction_id: Uuid,
        new_expires_at: DateTime<Utc>,
    ) -> DatabaseResult<Option<Subscription>> {
        let mut state = self.state.lock().await;
        let Some(sub) = state.subscriptions.get_mut(&id) else {
            return Ok(None);
        };
        if sub.pending_transaction_id != Some(transaction_id) {
            return Ok(None);
        }
        let (Some(plan), Some(price)) = (sub.pending_plan, sub.pending_price) else {
            return Ok(None);
        };
        sub.plan = plan;
        sub.monthly_price = price;
        sub.status = SubscriptionStatus::Active;
        sub.expires_at = new_expires_at;
        sub.scheduled_price = None;
        sub.pending_plan = None;
        sub.pending_price = None;
        sub.pending_transaction_id = None;
        sub.updated_at = Utc::now();
        Ok(Some(sub.clone()))
    }

    async fn clear_pending_change(
        &self,
        id: Uuid,
        transaction_id: Uuid,
    ) -> DatabaseResult<Option<Subscription>> {
        let mut state = self.state.lock().await;
        match state.subscriptions.get_mut(&id) {
            Some(sub) if sub.pending_transaction_id == Some(transaction_id) => {
                sub.pending_plan = None;
                sub.pending_price = None;
                sub.pending_transaction_id = None;
                sub.updated_at = Utc::now();
                Ok(Some(sub.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn find_due_scheduled_changes(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> DatabaseResult<Vec<Subscription>> {
        let state = self.state.lock().await;
        let mut due: Vec<Subscription> = state
            .subscriptions
            .values()
            .filter(|s| {
                s.status == SubscriptionStatus::Active
                    && s.scheduled_price.is_some()
                    && s.expires_at <= now
            })
            .cloned()
            .collect();
        due.sort_by_key(|s| s.expires_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn apply_scheduled_price(
        &self,
        id: Uuid,
        expected_expires_at: DateTime<Utc>,
        new_expires_at: DateTime<Utc>,
    ) -> DatabaseResult<Option<Subscription>> {
        let mut state = self.state.lock().await;
        let Some(sub) = state.subscriptions.get_mut(&id) else {
            return Ok(None);
        };
        if sub.expires_at != expected_expires_at {
            return Ok(None);
        }
        let Some(price) = sub.scheduled_price.take() else {
            return Ok(None);
        };
        sub.monthly_price = price;
        sub.expires_at = new_expires_at;
        sub.updated_at = Utc::now();
        Ok(Some(sub.clone()))
    }
}

#[async_trait]
impl PayoutRepository for InMemoryStore {
    async fn credit_earning(
        &self,
        new: NewSellerEarning,
    ) -> DatabaseResult<Option<SellerEarning>> {
        let mut state = self.state.lock().await;
        if state
            .earnings
            .iter()
            .any(|e| e.order_id == new.order_id && e.order_line_id == new.order_line_id)
        {
            return Ok(None);
        }
        let earning = SellerEarning {
            id: Uuid::new_v4(),
            seller_id: new.seller_id,
            order_id: new.order_id,
            order_line_id: new.order_line_id,
            gross_amount: new.gross_amount,
            platform_fee: new.platform_fee,
            net_amount: new.net_amount,
            currency: new.currency,
            status: EarningStatus::Credited,
            created_at: Utc::now(),
        };
        state.earnings.push(earning.clone());
        Ok(Some(earning))
    }

    async fn list_earnings(&self, seller_id: Uuid) -> DatabaseResult<Vec<SellerEarning>> {
        let state = self.state.lock().await;
        Ok(state
            .earnings
            .iter()
            .filter(|e| e.seller_id == seller_id)
            .cloned()
            .collect())
    }

    async fn balance_totals(
        &self,
        seller_id: Uuid,
        currency: &str,
    ) -> DatabaseResult<BalanceTotals> {
        Ok(self.state.lock().await.balance_totals(seller_id, currency))
    }

    async fn reserve_withdrawal(&self, new: NewWithdrawal) -> DatabaseResult<ReservationOutcome> {
        let mut state = self.state.lock().await;
        let available = state
            .balance_totals(new.seller_id, &new.currency)
            .available();
        if new.amount > available {
            return Ok(ReservationOutcome::Insufficient { available });
        }

        let now = Utc::now();
        let withdrawal = WithdrawalRequest {
            id: Uuid::new_v4(),
            seller_id: new.seller_id,
            amount: new.amount,
            fee: new.fee,
            net_amount: new.net_amount,
            currency: new.currency,
            destination: new.destination,
            status: WithdrawalStatus::Pending,
            error_message: None,
            transaction_id: None,
            created_at: now,
            updated_at: now,
        };
        state.withdrawals.insert(withdrawal.id, withdrawal.clone());
        Ok(ReservationOutcome::Reserved(withdrawal))
    }

    async fn attach_transaction(
        &self,
        withdrawal_id: Uuid,
        transaction_id: Uuid,
    ) -> DatabaseResult<()> {
        let mut state = self.state.lock().await;
        let withdrawal = state
            .withdrawals
            .get_mut(&withdrawal_id)
            .ok_or_else(|| DatabaseError::not_found("withdrawal", withdrawal_id))?;
        withdrawal.transaction_id = Some(transaction_id);
        withdrawal.updated_at = Utc::now();
        Ok(())
    }

    async fn find_withdrawal(&self, id: Uuid) -> DatabaseResult<Option<WithdrawalRequest>> {
        Ok(self.state.lock().await.withdrawals.get(&id).cloned())
    }

    async fn find_withdrawal_by_transaction(
        &self,
        transaction_id: Uuid,
    ) -> DatabaseResult<Option<WithdrawalRequest>> {
        let state = self.state.lock().await;
        Ok(state
            .withdrawals
            .values()
            .find(|w| w.transaction_id == Some(transaction_id))
            .cloned())
    }

    async fn list_withdrawals(&self, seller_id: Uuid) -> DatabaseResult<Vec<WithdrawalRequest>> {
        let state = self.state.lock().await;
        let mut rows: Vec<WithdrawalRequest> = state
            .withdrawals
            .values()
            .filter(|w| w.seller_id == seller_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn update_withdrawal_status(
        &self,
        id: Uuid,
        from: &[WithdrawalStatus],
        to: WithdrawalStatus,
        error_message: Option<&str>,
    ) -> DatabaseResult<Option<WithdrawalRequest>> {
        let mut state = self.state.lock().await;
        match state.withdrawals.get_mut(&id) {
            Some(w) if from.contains(&w.status) => {
                w.status = to;
                if let Some(message) = error_message {
                    w.error_message = Some(message.to_string());
                }
                w.updated_at = Utc::now();
                Ok(Some(w.clone()))
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl WebhookEventRepository for InMemoryStore {
    async fn record_event(&self, new: NewWebhookEvent) -> DatabaseResult<WebhookEventRecord> {
        let record = WebhookEventRecord {
            id: Uuid::new_v4(),
            provider_kind: new.provider_kind,
            event_type: new.event_type,
            provider_reference: new.provider_reference,
            idempotency_reference: new.idempotency_reference,
            provider_status: new.provider_status,
            outcome: new.outcome,
            transaction_id: new.transaction_id,
            payload: new.payload,
            received_at: Utc::now(),
        };
        self.state.lock().await.webhook_events.push(record.clone());
        Ok(record)
    }

    async fn list_events_for_transaction(
        &self,
        transaction_id: Uuid,
    ) -> DatabaseResult<Vec<WebhookEventRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .webhook_events
            .iter()
            .filter(|e| e.transaction_id == Some(transaction_id))
            .cloned()
            .collect())
    }
}
