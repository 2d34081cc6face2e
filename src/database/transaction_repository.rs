use crate::database::error::{DatabaseError, DatabaseResult};
use crate::payments::types::{Money, PaymentPurpose, ProviderKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle of a ledger row. Moves forward only; the last three are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TransactionState {
    pub const NON_TERMINAL: [TransactionState; 2] =
        [TransactionState::Pending, TransactionState::Processing];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Pending => "pending",
            TransactionState::Processing => "processing",
            TransactionState::Completed => "completed",
            TransactionState::Failed => "failed",
            TransactionState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Completed | TransactionState::Failed | TransactionState::Cancelled
        )
    }

    pub fn can_transition_to(&self, target: TransactionState) -> bool {
        match self {
            TransactionState::Pending => target != TransactionState::Pending,
            TransactionState::Processing => target.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransactionState {
    type Err = DatabaseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(TransactionState::Pending),
            "processing" => Ok(TransactionState::Processing),
            "completed" => Ok(TransactionState::Completed),
            "failed" => Ok(TransactionState::Failed),
            "cancelled" => Ok(TransactionState::Cancelled),
            other => Err(DatabaseError::decode(format!(
                "unknown transaction state '{}'",
                other
            ))),
        }
    }
}

/// Ledger row: one payment attempt and its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentTransaction {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Integer minor units.
    pub amount: i64,
    pub currency: String,
    pub purpose: PaymentPurpose,
    pub provider_kind: ProviderKind,
    pub idempotency_reference: String,
    pub provider_reference: Option<String>,
    pub state: TransactionState,
    pub linked_entity_id: Option<Uuid>,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentTransaction {
    pub fn money(&self) -> Money {
        Money::new(self.amount, self.currency.clone())
    }
}

#[derive(Debug, Clone)]
pub struct NewPaymentTransaction {
    pub user_id: Uuid,
    pub amount: Money,
    pub purpose: PaymentPurpose,
    pub provider_kind: ProviderKind,
    pub idempotency_reference: String,
    pub description: String,
    pub linked_entity_id: Option<Uuid>,
}

#[async_trait]
pub trait TransactionRepository: Send + Sync {
    /// Fails with a unique violation when the idempotency reference exists.
    async fn insert(&self, new: NewPaymentTransaction) -> DatabaseResult<PaymentTransaction>;

    async fn find_by_id(&self, id: Uuid) -> DatabaseResult<Option<PaymentTransaction>>;

    async fn find_by_idempotency_reference(
        &self,
        reference: &str,
    ) -> DatabaseResult<Option<PaymentTransaction>>;

    async fn find_by_provider_reference(
        &self,
        reference: &str,
    ) -> DatabaseResult<Option<PaymentTransaction>>;

    async fn find_by_linked_entity(&self, entity_id: Uuid)
        -> DatabaseResult<Vec<PaymentTransaction>>;

    /// Atomically moves the row to `to` only if its state is one of `from`.
    /// Returns `None` when nothing matched.
    async fn compare_and_set_state(
        &self,
        id: Uuid,
        from: &[TransactionState],
        to: TransactionState,
        provider_reference: Option<&str>,
    ) -> DatabaseResult<Option<PaymentTransaction>>;

    /// Non-terminal rows last touched before `updated_before`, oldest first.
    async fn find_stale(
        &self,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> DatabaseResult<Vec<PaymentTransaction>>;
}

#[derive(Debug, FromRow)]
struct TransactionRow {
    id: Uuid,
    user_id: Uuid,
    amount: i64,
    currency: String,
    purpose: String,
    provider_kind: String,
    idempotency_reference: String,
    provider_reference: Option<String>,
    state: String,
    linked_entity_id: Option<Uuid>,
    description: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for PaymentTransaction {
    type Error = DatabaseError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        Ok(PaymentTransaction {
            id: row.id,
            user_id: row.user_id,
            amount: row.amount,
            currency: row.currency,
            purpose: PaymentPurpose::from_str(&row.purpose)
                .map_err(|e| DatabaseError::decode(e.to_string()))?,
            provider_kind: ProviderKind::from_str(&row.provider_kind)
                .map_err(|e| DatabaseError::decode(e.to_string()))?,
            idempotency_reference: row.idempotency_reference,
            provider_reference: row.provider_reference,
            state: TransactionState::from_str(&row.state)?,
            linked_entity_id: row.linked_entity_id,
            description: row.description,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const TRANSACTION_COLUMNS: &str = "id, user_id, amount, currency, purpose, provider_kind, \
     idempotency_reference, provider_reference, state, linked_entity_id, description, \
     created_at, updated_at";

fn convert_all(rows: Vec<TransactionRow>) -> DatabaseResult<Vec<PaymentTransaction>> {
    rows.into_iter().map(PaymentTransaction::try_from).collect()
}

/// PostgreSQL-backed ledger.
pub struct PgTransactionRepository {
    pool: PgPool,
}

impl PgTransactionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_one_by(
        &self,
        column: &str,
        value: &str,
    ) -> DatabaseResult<Option<PaymentTransaction>> {
        let sql = format!(
            "SELECT {} FROM payment_transactions WHERE {} = $1",
            TRANSACTION_COLUMNS, column
        );
        sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(PaymentTransaction::try_from)
            .transpose()
    }
}

#[async_trait]
impl TransactionRepository for PgTransactionRepository {
    async fn insert(&self, new: NewPaymentTransaction) -> DatabaseResult<PaymentTransaction> {
        let sql = format!(
            "INSERT INTO payment_transactions
             (id, user_id, amount, currency, purpose, provider_kind, idempotency_reference,
              state, linked_entity_id, description)
             VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', $8, $9)
             RETURNING {}",
            TRANSACTION_COLUMNS
        );
        let row = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(new.user_id)
            .bind(new.amount.amount)
            .bind(&new.amount.currency)
            .bind(new.purpose.as_str())
            .bind(new.provider_kind.as_str())
            .bind(&new.idempotency_reference)
            .bind(new.linked_entity_id)
            .bind(&new.description)
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        PaymentTransaction::try_from(row)
    }

    async fn find_by_id(&self, id: Uuid) -> DatabaseResult<Option<PaymentTransaction>> {
        let sql = format!(
            "SELECT {} FROM payment_transactions WHERE id = $1",
            TRANSACTION_COLUMNS
        );
        sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(PaymentTransaction::try_from)
            .transpose()
    }

    async fn find_by_idempotency_reference(
        &self,
        reference: &str,
    ) -> DatabaseResult<Option<PaymentTransaction>> {
        self.fetch_one_by("idempotency_reference", reference).await
    }

    async fn find_by_provider_reference(
        &self,
        reference: &str,
    ) -> DatabaseResult<Option<PaymentTransaction>> {
        self.fetch_one_by("provider_reference", reference).await
    }

    async fn find_by_linked_entity(
        &self,
        entity_id: Uuid,
    ) -> DatabaseResult<Vec<PaymentTransaction>> {
        let sql = format!(
            "SELECT {} FROM payment_transactions WHERE linked_entity_id = $1
             ORDER BY created_at ASC",
            TRANSACTION_COLUMNS
        );
        let rows = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(entity_id)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        convert_all(rows)
    }

    async fn compare_and_set_state(
        &self,
        id: Uuid,
        from: &[TransactionState],
        to: TransactionState,
        provider_reference: Option<&str>,
    ) -> DatabaseResult<Option<PaymentTransaction>> {
        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let sql = format!(
            "UPDATE payment_transactions
             SET state = $2,
                 provider_reference = COALESCE($3, provider_reference),
                 updated_at = NOW()
             WHERE id = $1 AND state = ANY($4)
             RETURNING {}",
            TRANSACTION_COLUMNS
        );
        sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(id)
            .bind(to.as_str())
            .bind(provider_reference)
            .bind(&from)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(PaymentTransaction::try_from)
            .transpose()
    }

    async fn find_stale(
        &self,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> DatabaseResult<Vec<PaymentTransaction>> {
        let sql = format!(
            "SELECT {} FROM payment_transactions
             WHERE state IN ('pending', 'processing') AND updated_at < $1
             ORDER BY updated_at ASC
             LIMIT $2",
            TRANSACTION_COLUMNS
        );
        let rows = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(updated_before)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        convert_all(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_only_move_forward() {
        use TransactionState::*;

        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Completed));
        assert!(Pending.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Cancelled));
        assert!(!Processing.can_transition_to(Pending));
        assert!(!Processing.can_transition_to(Processing));
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for target in [Pending, Processing, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(target));
            }
        }
    }

    #[test]
    fn state_strings_round_trip() {
        for state in [
            TransactionState::Pending,
            TransactionState::Processing,
            TransactionState::Completed,
            TransactionState::Failed,
            TransactionState::Cancelled,
        ] {
            assert_eq!(TransactionState::from_str(state.as_str()).ok(), Some(state));
        }
        assert!(TransactionState::from_str("refunded").is_err());
    }
}
