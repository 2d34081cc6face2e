use crate::database::error::{DatabaseError, DatabaseResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PricingModel {
    /// Commission on each sale, no recurring fee.
    Percentage,
    /// Fixed monthly fee.
    Subscription,
}

/// Plan catalog. Prices are monthly, in TZS minor units.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PlanId {
    PercentageStandard,
    SubscriptionStarter,
    SubscriptionProfessional,
    SubscriptionEnterprise,
}

impl PlanId {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanId::PercentageStandard => "percentage_standard",
            PlanId::SubscriptionStarter => "subscription_starter",
            PlanId::SubscriptionProfessional => "subscription_professional",
            PlanId::SubscriptionEnterprise => "subscription_enterprise",
        }
    }

    pub fn pricing_model(&self) -> PricingModel {
        match self {
            PlanId::PercentageStandard => PricingModel::Percentage,
            _ => PricingModel::Subscription,
        }
    }

    pub fn monthly_price(&self) -> i64 {
        match self {
            PlanId::PercentageStandard => 0,
            PlanId::SubscriptionStarter => 25_000,
            PlanId::SubscriptionProfessional => 75_000,
            PlanId::SubscriptionEnterprise => 150_000,
        }
    }
}

impl std::fmt::Display for PlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PlanId {
    type Err = DatabaseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "percentage_standard" => Ok(PlanId::PercentageStandard),
            "subscription_starter" => Ok(PlanId::SubscriptionStarter),
            "subscription_professional" => Ok(PlanId::SubscriptionProfessional),
            "subscription_enterprise" => Ok(PlanId::SubscriptionEnterprise),
            other => Err(DatabaseError::decode(format!("unknown plan '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Pending,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Pending => "pending",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = DatabaseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "active" => Ok(SubscriptionStatus::Active),
            "pending" => Ok(SubscriptionStatus::Pending),
            "cancelled" => Ok(SubscriptionStatus::Cancelled),
            other => Err(DatabaseError::decode(format!(
                "unknown subscription status '{}'",
                other
            ))),
        }
    }
}

/// A seller's billing plan.
///
/// `scheduled_price` holds a downgrade price that takes effect at `expires_at`.
/// The `pending_*` fields describe an upgrade that waits on
/// `pending_transaction_id` reaching `completed`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subscription {
    pub id: Uuid,
    pub seller_id: Uuid,
    pub plan: PlanId,
    pub monthly_price: i64,
    pub currency: String,
    pub status: SubscriptionStatus,
    pub expires_at: DateTime<Utc>,
    pub scheduled_price: Option<i64>,
    pub pending_plan: Option<PlanId>,
    pub pending_price: Option<i64>,
    pub pending_transaction_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn pricing_model(&self) -> PricingModel {
        self.plan.pricing_model()
    }

    pub fn has_pending_change(&self) -> bool {
        self.pending_transaction_id.is_some()
    }

    /// Cancelled and past the end of the last paid cycle.
    pub fn has_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Cancelled && self.expires_at <= now
    }
}

/// A plan change that needs no payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanSwitch {
    /// The new price is billed from now on.
    Immediate { plan: PlanId, monthly_price: i64 },
    /// The current price stays until the cycle ends; a different price is
    /// scheduled for the next cycle.
    AtCycleEnd { plan: PlanId, monthly_price: i64 },
}

#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub seller_id: Uuid,
    pub plan: PlanId,
    pub monthly_price: i64,
    pub currency: String,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn create_subscription(&self, new: NewSubscription) -> DatabaseResult<Subscription>;

    async fn find_subscription_by_seller(
        &self,
        seller_id: Uuid,
    ) -> DatabaseResult<Option<Subscription>>;

    /// Applies `switch` and reactivates the subscription. `None` while an
    /// upgrade is awaiting payment.
    async fn switch_plan(
        &self,
        id: Uuid,
        switch: PlanSwitch,
    ) -> DatabaseResult<Option<Subscription>>;

    /// Records an upgrade to `plan` that waits on `transaction_id`. `None`
    /// when another change is already awaiting payment.
    async fn begin_pending_change(
        &self,
        id: Uuid,
        plan: PlanId,
        price: i64,
        transaction_id: Uuid,
    ) -> DatabaseResult<Option<Subscription>>;

    /// Marks the subscription cancelled and drops any scheduled price. An
    /// awaiting upgrade is left alone. `None` when already cancelled.
    async fn cancel_subscription(&self, id: Uuid) -> DatabaseResult<Option<Subscription>>;

    /// Commits the awaiting-payment change if it is still tied to
    /// `transaction_id`: plan and price move over, status becomes active and a
    /// new cycle ending at `new_expires_at` starts. `None` when the change was
    /// already committed or cleared.
    async fn commit_pending_change(
        &self,
        id: Uuid,
        transaction_id: Uuid,
        new_expires_at: DateTime<Utc>,
    ) -> DatabaseResult<Option<Subscription>>;

    /// Drops the awaiting-payment change tied to `transaction_id`.
    async fn clear_pending_change(
        &self,
        id: Uuid,
        transaction_id: Uuid,
    ) -> DatabaseResult<Option<Subscription>>;

    /// Active subscriptions with a scheduled price whose cycle ended before `now`.
    async fn find_due_scheduled_changes(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> DatabaseResult<Vec<Subscription>>;

    /// Applies the scheduled price if the cycle ending at `expected_expires_at`
    /// has not been rolled over yet.
    async fn apply_scheduled_price(
        &self,
        id: Uuid,
        expected_expires_at: DateTime<Utc>,
        new_expires_at: DateTime<Utc>,
    ) -> DatabaseResult<Option<Subscription>>;
}

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    id: Uuid,
    seller_id: Uuid,
    plan: String,
    monthly_price: i64,
    currency: String,
    status: String,
    expires_at: DateTime<Utc>,
    scheduled_price: Option<i64>,
    pending_plan: Option<String>,
    pending_price: Option<i64>,
    pending_transaction_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = DatabaseError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Subscription {
            id: row.id,
            seller_id: row.seller_id,
            plan: PlanId::from_str(&row.plan)?,
            monthly_price: row.monthly_price,
            currency: row.currency,
            status: SubscriptionStatus::from_str(&row.status)?,
            expires_at: row.expires_at,
            scheduled_price: row.scheduled_price,
            pending_plan: row.pending_plan.as_deref().map(PlanId::from_str).transpose()?,
            pending_price: row.pending_price,
            pending_transaction_id: row.pending_transaction_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const SUBSCRIPTION_COLUMNS: &str = "id, seller_id, plan, monthly_price, currency, status, \
     expires_at, scheduled_price, pending_plan, pending_price, pending_transaction_id, \
     created_at, updated_at";

pub struct PgSubscriptionRepository {
    pool: PgPool,
}

impl PgSubscriptionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_optional(
        &self,
        query: sqlx::query::QueryAs<'_, sqlx::Postgres, SubscriptionRow, sqlx::postgres::PgArguments>,
    ) -> DatabaseResult<Option<Subscription>> {
        query
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(Subscription::try_from)
            .transpose()
    }
}

#[async_trait]
impl SubscriptionRepository for PgSubscriptionRepository {
    async fn create_subscription(&self, new: NewSubscription) -> DatabaseResult<Subscription> {
        let sql = format!(
            "INSERT INTO subscriptions (id, seller_id, plan, monthly_price, currency, status, expires_at)
             VALUES ($1, $2, $3, $4, $5, 'active', $6)
             RETURNING {}",
            SUBSCRIPTION_COLUMNS
        );
        let row = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(new.seller_id)
            .bind(new.plan.as_str())
            .bind(new.monthly_price)
            .bind(&new.currency)
            .bind(new.expires_at)
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Subscription::try_from(row)
    }

    async fn find_subscription_by_seller(
        &self,
        seller_id: Uuid,
    ) -> DatabaseResult<Option<Subscription>> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE seller_id = $1",
            SUBSCRIPTION_COLUMNS
        );
        self.fetch_optional(sqlx::query_as::<_, SubscriptionRow>(&sql).bind(seller_id))
            .await
    }

    async fn switch_plan(
        &self,
        id: Uuid,
        switch: PlanSwitch,
    ) -> DatabaseResult<Option<Subscription>> {
        let (set_price, plan, price) = match switch {
            PlanSwitch::Immediate {
                plan,
                monthly_price,
            } => (
                "monthly_price = $3, scheduled_price = NULL",
                plan,
                monthly_price,
            ),
            PlanSwitch::AtCycleEnd {
                plan,
                monthly_price,
            } => (
                "scheduled_price = CASE WHEN monthly_price = $3 THEN NULL ELSE $3 END",
                plan,
                monthly_price,
            ),
        };
        let sql = format!(
            "UPDATE subscriptions
             SET plan = $2, {}, status = 'active', updated_at = NOW()
             WHERE id = $1 AND pending_transaction_id IS NULL
             RETURNING {}",
            set_price, SUBSCRIPTION_COLUMNS
        );
        self.fetch_optional(
            sqlx::query_as::<_, SubscriptionRow>(&sql)
                .bind(id)
                .bind(plan.as_str())
                .bind(price),
        )
        .await
    }

    async fn begin_pending_change(
        &self,
        id: Uuid,
        plan: PlanId,
        price: i64,
        transaction_id: Uuid,
    ) -> DatabaseResult<Option<Subscription>> {
        let sql = format!(
            "UPDATE subscriptions
             SET pending_plan = $2, pending_price = $3, pending_transaction_id = $4,
                 updated_at = NOW()
             WHERE id = $1 AND pending_transaction_id IS NULL
             RETURNING {}",
            SUBSCRIPTION_COLUMNS
        );
        self.fetch_optional(
            sqlx::query_as::<_, SubscriptionRow>(&sql)
                .bind(id)
                .bind(plan.as_str())
                .bind(price)
                .bind(transaction_id),
        )
        .await
    }

    async fn cancel_subscription(&self, id: Uuid) -> DatabaseResult<Option<Subscription>> {
        let sql = format!(
            "UPDATE subscriptions
             SET status = 'cancelled', scheduled_price = NULL, updated_at = NOW()
             WHERE id = $1 AND status <> 'cancelled'
             RETURNING {}",
            SUBSCRIPTION_COLUMNS
        );
        self.fetch_optional(sqlx::query_as::<_, SubscriptionRow>(&sql).bind(id))
            .await
    }

    async fn commit_pending_change(
        &self,
        id: Uuid,
        transaction_id: Uuid,
        new_expires_at: DateTime<Utc>,
    ) -> DatabaseResult<Option<Subscription>> {
        let sql = format!(
            "UPDATE subscriptions
             SET plan = pending_plan, monthly_price = pending_price, status = 'active',
                 expires_at = $3, scheduled_price = NULL, pending_plan = NULL,
                 pending_price = NULL, pending_transaction_id = NULL, updated_at = NOW()
             WHERE id = $1 AND pending_transaction_id = $2 AND pending_plan IS NOT NULL
             RETURNING {}",
            SUBSCRIPTION_COLUMNS
        );
        self.fetch_optional(
            sqlx::query_as::<_, SubscriptionRow>(&sql)
                .bind(id)
                .bind(transaction_id)
                .bind(new_expires_at),
        )
        .await
    }

    async fn clear_pending_change(
        &self,
        id: Uuid,
        transaction_id: Uuid,
    ) -> DatabaseResult<Option<Subscription>> {
        let sql = format!(
            "UPDATE subscriptions
             SET pending_plan = NULL, pending_price = NULL, pending_transaction_id = NULL,
                 updated_at = NOW()
             WHERE id = $1 AND pending_transaction_id = $2
             RETURNING {}",
            SUBSCRIPTION_COLUMNS
        );
        self.fetch_optional(
            sqlx::query_as::<_, SubscriptionRow>(&sql)
                .bind(id)
                .bind(transaction_id),
        )
        .await
    }

    async fn find_due_scheduled_changes(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> DatabaseResult<Vec<Subscription>> {
        let sql = format!(
            "SELECT {} FROM subscriptions
             WHERE status = 'active' AND scheduled_price IS NOT NULL AND expires_at <= $1
             ORDER BY expires_at ASC
             LIMIT $2",
            SUBSCRIPTION_COLUMNS
        );
        let rows = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        rows.into_iter().map(Subscription::try_from).collect()
    }

    async fn apply_scheduled_price(
        &self,
        id: Uuid,
        expected_expires_at: DateTime<Utc>,
        new_expires_at: DateTime<Utc>,
    ) -> DatabaseResult<Option<Subscription>> {
        let sql = format!(
            "UPDATE subscriptions
             SET monthly_price = scheduled_price, scheduled_price = NULL,
                 expires_at = $3, updated_at = NOW()
             WHERE id = $1 AND expires_at = $2 AND scheduled_price IS NOT NULL
             RETURNING {}",
            SUBSCRIPTION_COLUMNS
        );
        self.fetch_optional(
            sqlx::query_as::<_, SubscriptionRow>(&sql)
                .bind(id)
                .bind(expected_expires_at)
                .bind(new_expires_at),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_prices_and_models() {
        assert_eq!(PlanId::PercentageStandard.monthly_price(), 0);
        assert_eq!(PlanId::SubscriptionStarter.monthly_price(), 25_000);
        assert_eq!(PlanId::SubscriptionProfessional.monthly_price(), 75_000);
        assert_eq!(PlanId::SubscriptionEnterprise.monthly_price(), 150_000);
        assert_eq!(
            PlanId::PercentageStandard.pricing_model(),
            PricingModel::Percentage
        );
        assert_eq!(
            PlanId::SubscriptionEnterprise.pricing_model(),
            PricingModel::Subscription
        );
    }

    #[test]
    fn plan_ids_parse_from_storage_strings() {
        assert_eq!(
            PlanId::from_str("subscription_professional").ok(),
            Some(PlanId::SubscriptionProfessional)
        );
        assert!(PlanId::from_str("gold").is_err());
    }
}
