use crate::database::error::{DatabaseError, DatabaseResult};
use crate::payments::types::PayerDetails;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use uuid::Uuid;

/// Net earnings credited to a seller for one order line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SellerEarning {
    pub id: Uuid,
    pub seller_id: Uuid,
    pub order_id: Uuid,
    pub order_line_id: Uuid,
    pub gross_amount: i64,
    pub platform_fee: i64,
    pub net_amount: i64,
    pub currency: String,
    pub status: EarningStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EarningStatus {
    Credited,
}

#[derive(Debug, Clone)]
pub struct NewSellerEarning {
    pub seller_id: Uuid,
    pub order_id: Uuid,
    pub order_line_id: Uuid,
    pub gross_amount: i64,
    pub platform_fee: i64,
    pub net_amount: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl WithdrawalStatus {
    pub const RESERVED: [WithdrawalStatus; 2] =
        [WithdrawalStatus::Pending, WithdrawalStatus::Processing];

    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalStatus::Pending => "pending",
            WithdrawalStatus::Processing => "processing",
            WithdrawalStatus::Completed => "completed",
            WithdrawalStatus::Failed => "failed",
            WithdrawalStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_reserved(&self) -> bool {
        Self::RESERVED.contains(self)
    }
}

impl std::fmt::Display for WithdrawalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for WithdrawalStatus {
    type Err = DatabaseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(WithdrawalStatus::Pending),
            "processing" => Ok(WithdrawalStatus::Processing),
            "completed" => Ok(WithdrawalStatus::Completed),
            "failed" => Ok(WithdrawalStatus::Failed),
            "cancelled" => Ok(WithdrawalStatus::Cancelled),
            other => Err(DatabaseError::decode(format!(
                "unknown withdrawal status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WithdrawalRequest {
    pub id: Uuid,
    pub seller_id: Uuid,
    /// Gross amount reserved against the balance; `net_amount + fee == amount`.
    pub amount: i64,
    pub fee: i64,
    pub net_amount: i64,
    pub currency: String,
    pub destination: PayerDetails,
    pub status: WithdrawalStatus,
    pub error_message: Option<String>,
    pub transaction_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewWithdrawal {
    pub seller_id: Uuid,
    pub amount: i64,
    pub fee: i64,
    pub net_amount: i64,
    pub currency: String,
    pub destination: PayerDetails,
}

/// Per-seller, per-currency sums the available balance is derived from.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BalanceTotals {
    pub total_earned: i64,
    pub completed_withdrawals: i64,
    pub reserved_withdrawals: i64,
}

impl BalanceTotals {
    pub fn available(&self) -> i64 {
        self.total_earned - self.completed_withdrawals - self.reserved_withdrawals
    }
}

#[derive(Debug, Clone)]
pub enum ReservationOutcome {
    Reserved(WithdrawalRequest),
    Insufficient { available: i64 },
}

#[async_trait]
pub trait PayoutRepository: Send + Sync {
    /// Inserts the earning unless one already exists for the order line.
    /// Returns `None` when it was credited before.
    async fn credit_earning(&self, new: NewSellerEarning)
        -> DatabaseResult<Option<SellerEarning>>;

    async fn list_earnings(&self, seller_id: Uuid) -> DatabaseResult<Vec<SellerEarning>>;

    async fn balance_totals(&self, seller_id: Uuid, currency: &str)
        -> DatabaseResult<BalanceTotals>;

    /// Checks the available balance and inserts a pending withdrawal as one
    /// atomic step per seller, so concurrent requests see each other's
    /// reservations.
    async fn reserve_withdrawal(&self, new: NewWithdrawal) -> DatabaseResult<ReservationOutcome>;

    async fn attach_transaction(
        &self,
        withdrawal_id: Uuid,
        transaction_id: Uuid,
    ) -> DatabaseResult<()>;

    async fn find_withdrawal(&self, id: Uuid) -> DatabaseResult<Option<WithdrawalRequest>>;

    async fn find_withdrawal_by_transaction(
        &self,
        transaction_id: Uuid,
    ) -> DatabaseResult<Option<WithdrawalRequest>>;

    async fn list_withdrawals(&self, seller_id: Uuid) -> DatabaseResult<Vec<WithdrawalRequest>>;

    /// Moves the withdrawal to `to` only if it is currently in one of `from`.
    async fn update_withdrawal_status(
        &self,
        id: Uuid,
        from: &[WithdrawalStatus],
        to: WithdrawalStatus,
        error_message: Option<&str>,
    ) -> DatabaseResult<Option<WithdrawalRequest>>;
}

#[derive(Debug, FromRow)]
struct EarningRow {
    id: Uuid,
    seller_id: Uuid,
    order_id: Uuid,
    order_line_id: Uuid,
    gross_amount: i64,
    platform_fee: i64,
    net_amount: i64,
    currency: String,
    created_at: DateTime<Utc>,
}

impl From<EarningRow> for SellerEarning {
    fn from(row: EarningRow) -> Self {
        SellerEarning {
            id: row.id,
            seller_id: row.seller_id,
            order_id: row.order_id,
            order_line_id: row.order_line_id,
            gross_amount: row.gross_amount,
            platform_fee: row.platform_fee,
            net_amount: row.net_amount,
            currency: row.currency,
            status: EarningStatus::Credited,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct WithdrawalRow {
    id: Uuid,
    seller_id: Uuid,
    amount: i64,
    fee: i64,
    net_amount: i64,
    currency: String,
    destination: Json<PayerDetails>,
    status: String,
    error_message: Option<String>,
    transaction_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<WithdrawalRow> for WithdrawalRequest {
    type Error = DatabaseError;

    fn try_from(row: WithdrawalRow) -> Result<Self, Self::Error> {
        Ok(WithdrawalRequest {
            id: row.id,
            seller_id: row.seller_id,
            amount: row.amount,
            fee: row.fee,
            net_amount: row.net_amount,
            currency: row.currency,
            destination: row.destination.0,
            status: WithdrawalStatus::from_str(&row.status)?,
            error_message: row.error_message,
            transaction_id: row.transaction_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const EARNING_COLUMNS: &str = "id, seller_id, order_id, order_line_id, gross_amount, \
     platform_fee, net_amount, currency, created_at";

const WITHDRAWAL_COLUMNS: &str = "id, seller_id, amount, fee, net_amount, currency, \
     destination, status, error_message, transaction_id, created_at, updated_at";

pub struct PgPayoutRepository {
    pool: PgPool,
}

impl PgPayoutRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn balance_totals_in<'e, E>(
    executor: E,
    seller_id: Uuid,
    currency: &str,
) -> DatabaseResult<BalanceTotals>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    let (total_earned, completed_withdrawals, reserved_withdrawals) =
        sqlx::query_as::<_, (i64, i64, i64)>(
            "SELECT
                (SELECT COALESCE(SUM(net_amount), 0)::BIGINT FROM seller_earnings
                  WHERE seller_id = $1 AND currency = $2),
                (SELECT COALESCE(SUM(amount), 0)::BIGINT FROM withdrawal_requests
                  WHERE seller_id = $1 AND currency = $2 AND status = 'completed'),
                (SELECT COALESCE(SUM(amount), 0)::BIGINT FROM withdrawal_requests
                  WHERE seller_id = $1 AND currency = $2 AND status IN ('pending', 'processing'))",
        )
        .bind(seller_id)
        .bind(currency)
        .fetch_one(executor)
        .await
        .map_err(DatabaseError::from_sqlx)?;

    Ok(BalanceTotals {
        total_earned,
        completed_withdrawals,
        reserved_withdrawals,
    })
}

#[async_trait]
impl PayoutRepository for PgPayoutRepository {
    async fn credit_earning(
        &self,
        new: NewSellerEarning,
    ) -> DatabaseResult<Option<SellerEarning>> {
        let sql = format!(
            "INSERT INTO seller_earnings
             (id, seller_id, order_id, order_line_id, gross_amount, platform_fee, net_amount, currency)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (order_id, order_line_id) DO NOTHING
             RETURNING {}",
            EARNING_COLUMNS
        );
        let row = sqlx::query_as::<_, EarningRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(new.seller_id)
            .bind(new.order_id)
            .bind(new.order_line_id)
            .bind(new.gross_amount)
            .bind(new.platform_fee)
            .bind(new.net_amount)
            .bind(&new.currency)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(row.map(SellerEarning::from))
    }

    async fn list_earnings(&self, seller_id: Uuid) -> DatabaseResult<Vec<SellerEarning>> {
        let sql = format!(
            "SELECT {} FROM seller_earnings WHERE seller_id = $1 ORDER BY created_at ASC",
            EARNING_COLUMNS
        );
        let rows = sqlx::query_as::<_, EarningRow>(&sql)
            .bind(seller_id)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(rows.into_iter().map(SellerEarning::from).collect())
    }

    async fn balance_totals(
        &self,
        seller_id: Uuid,
        currency: &str,
    ) -> DatabaseResult<BalanceTotals> {
        balance_totals_in(&self.pool, seller_id, currency).await
    }

    async fn reserve_withdrawal(&self, new: NewWithdrawal) -> DatabaseResult<ReservationOutcome> {
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        // Serializes reservations per seller until commit.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1::text))")
            .bind(new.seller_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        let totals = balance_totals_in(&mut *tx, new.seller_id, &new.currency).await?;
        if new.amount > totals.available() {
            tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
            return Ok(ReservationOutcome::Insufficient {
                available: totals.available(),
            });
        }

        let sql = format!(
            "INSERT INTO withdrawal_requests
             (id, seller_id, amount, fee, net_amount, currency, destination, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending')
             RETURNING {}",
            WITHDRAWAL_COLUMNS
        );
        let row = sqlx::query_as::<_, WithdrawalRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(new.seller_id)
            .bind(new.amount)
            .bind(new.fee)
            .bind(new.net_amount)
            .bind(&new.currency)
            .bind(Json(&new.destination))
            .fetch_one(&mut *tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        tx.commit().await.map_err(DatabaseError::from_sqlx)?;
        WithdrawalRequest::try_from(row).map(ReservationOutcome::Reserved)
    }

    async fn attach_transaction(
        &self,
        withdrawal_id: Uuid,
        transaction_id: Uuid,
    ) -> DatabaseResult<()> {
        let result = sqlx::query(
            "UPDATE withdrawal_requests SET transaction_id = $2, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(withdrawal_id)
        .bind(transaction_id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::not_found("withdrawal", withdrawal_id));
        }
        Ok(())
    }

    async fn find_withdrawal(&self, id: Uuid) -> DatabaseResult<Option<WithdrawalRequest>> {
        let sql = format!(
            "SELECT {} FROM withdrawal_requests WHERE id = $1",
            WITHDRAWAL_COLUMNS
        );
        sqlx::query_as::<_, WithdrawalRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(WithdrawalRequest::try_from)
            .transpose()
    }

    async fn find_withdrawal_by_transaction(
        &self,
        transaction_id: Uuid,
    ) -> DatabaseResult<Option<WithdrawalRequest>> {
        let sql = format!(
            "SELECT {} FROM withdrawal_requests WHERE transaction_id = $1",
            WITHDRAWAL_COLUMNS
        );
        sqlx::query_as::<_, WithdrawalRow>(&sql)
            .bind(transaction_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(WithdrawalRequest::try_from)
            .transpose()
    }

    async fn list_withdrawals(&self, seller_id: Uuid) -> DatabaseResult<Vec<WithdrawalRequest>> {
        let sql = format!(
            "SELECT {} FROM withdrawal_requests WHERE seller_id = $1 ORDER BY created_at DESC",
            WITHDRAWAL_COLUMNS
        );
        let rows = sqlx::query_as::<_, WithdrawalRow>(&sql)
            .bind(seller_id)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        rows.into_iter().map(WithdrawalRequest::try_from).collect()
    }

    async fn update_withdrawal_status(
        &self,
        id: Uuid,
        from: &[WithdrawalStatus],
        to: WithdrawalStatus,
        error_message: Option<&str>,
    ) -> DatabaseResult<Option<WithdrawalRequest>> {
        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let sql = format!(
            "UPDATE withdrawal_requests
             SET status = $2, error_message = COALESCE($3, error_message), updated_at = NOW()
             WHERE id = $1 AND status = ANY($4)
             RETURNING {}",
            WITHDRAWAL_COLUMNS
        );
        sqlx::query_as::<_, WithdrawalRow>(&sql)
            .bind(id)
            .bind(to.as_str())
            .bind(error_message)
            .bind(&from)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(WithdrawalRequest::try_from)
            .transpose()
    }
}
