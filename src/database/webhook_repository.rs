use crate::database::error::{DatabaseError, DatabaseResult};
use crate::payments::types::{ProviderKind, ProviderStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use uuid::Uuid;

/// What reconciliation did with a verified notification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// First terminal transition; side effects ran.
    Applied,
    /// The row already sat in the notified terminal state.
    Duplicate,
    /// The row is terminal in a different state than the one notified.
    ConflictingTerminal,
    /// Non-terminal status; the row moved to (or stayed) processing.
    Intermediate,
    UnknownTransaction,
}

impl WebhookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookOutcome::Applied => "applied",
            WebhookOutcome::Duplicate => "duplicate",
            WebhookOutcome::ConflictingTerminal => "conflicting_terminal",
            WebhookOutcome::Intermediate => "intermediate",
            WebhookOutcome::UnknownTransaction => "unknown_transaction",
        }
    }
}

impl std::fmt::Display for WebhookOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for WebhookOutcome {
    type Err = DatabaseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "applied" => Ok(WebhookOutcome::Applied),
            "duplicate" => Ok(WebhookOutcome::Duplicate),
            "conflicting_terminal" => Ok(WebhookOutcome::ConflictingTerminal),
            "intermediate" => Ok(WebhookOutcome::Intermediate),
            "unknown_transaction" => Ok(WebhookOutcome::UnknownTransaction),
            other => Err(DatabaseError::decode(format!(
                "unknown webhook outcome '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub provider_kind: ProviderKind,
    pub event_type: String,
    pub provider_reference: Option<String>,
    pub idempotency_reference: Option<String>,
    pub provider_status: ProviderStatus,
    pub outcome: WebhookOutcome,
    pub transaction_id: Option<Uuid>,
    pub payload: JsonValue,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewWebhookEvent {
    pub provider_kind: ProviderKind,
    pub event_type: String,
    pub provider_reference: Option<String>,
    pub idempotency_reference: Option<String>,
    pub provider_status: ProviderStatus,
    pub outcome: WebhookOutcome,
    pub transaction_id: Option<Uuid>,
    pub payload: JsonValue,
}

#[async_trait]
pub trait WebhookEventRepository: Send + Sync {
    async fn record_event(&self, new: NewWebhookEvent) -> DatabaseResult<WebhookEventRecord>;

    async fn list_events_for_transaction(
        &self,
        transaction_id: Uuid,
    ) -> DatabaseResult<Vec<WebhookEventRecord>>;
}

#[derive(Debug, FromRow)]
struct WebhookEventRow {
    id: Uuid,
    provider_kind: String,
    event_type: String,
    provider_reference: Option<String>,
    idempotency_reference: Option<String>,
    provider_status: String,
    outcome: String,
    transaction_id: Option<Uuid>,
    payload: JsonValue,
    received_at: DateTime<Utc>,
}

fn provider_status_as_str(status: ProviderStatus) -> &'static str {
    match status {
        ProviderStatus::Pending => "pending",
        ProviderStatus::Successful => "successful",
        ProviderStatus::Failed => "failed",
        ProviderStatus::Cancelled => "cancelled",
    }
}

fn provider_status_from_str(value: &str) -> DatabaseResult<ProviderStatus> {
    match value {
        "pending" => Ok(ProviderStatus::Pending),
        "successful" => Ok(ProviderStatus::Successful),
        "failed" => Ok(ProviderStatus::Failed),
        "cancelled" => Ok(ProviderStatus::Cancelled),
        other => Err(DatabaseError::decode(format!(
            "unknown provider status '{}'",
            other
        ))),
    }
}

impl TryFrom<WebhookEventRow> for WebhookEventRecord {
    type Error = DatabaseError;

    fn try_from(row: WebhookEventRow) -> Result<Self, Self::Error> {
        Ok(WebhookEventRecord {
            id: row.id,
            provider_kind: ProviderKind::from_str(&row.provider_kind)
                .map_err(|e| DatabaseError::decode(e.to_string()))?,
            event_type: row.event_type,
            provider_reference: row.provider_reference,
            idempotency_reference: row.idempotency_reference,
            provider_status: provider_status_from_str(&row.provider_status)?,
            outcome: WebhookOutcome::from_str(&row.outcome)?,
            transaction_id: row.transaction_id,
            payload: row.payload,
            received_at: row.received_at,
        })
    }
}

pub struct PgWebhookEventRepository {
    pool: PgPool,
}

impl PgWebhookEventRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookEventRepository for PgWebhookEventRepository {
    async fn record_event(&self, new: NewWebhookEvent) -> DatabaseResult<WebhookEventRecord> {
        let row = sqlx::query_as::<_, WebhookEventRow>(
            "INSERT INTO webhook_events
             (id, provider_kind, event_type, provider_reference, idempotency_reference,
              provider_status, outcome, transaction_id, payload)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             RETURNING id, provider_kind, event_type, provider_reference, idempotency_reference,
                       provider_status, outcome, transaction_id, payload, received_at",
        )
        .bind(Uuid::new_v4())
        .bind(new.provider_kind.as_str())
        .bind(&new.event_type)
        .bind(&new.provider_reference)
        .bind(&new.idempotency_reference)
        .bind(provider_status_as_str(new.provider_status))
        .bind(new.outcome.as_str())
        .bind(new.transaction_id)
        .bind(&new.payload)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        WebhookEventRecord::try_from(row)
    }

    async fn list_events_for_transaction(
        &self,
        transaction_id: Uuid,
    ) -> DatabaseResult<Vec<WebhookEventRecord>> {
        let rows = sqlx::query_as::<_, WebhookEventRow>(
            "SELECT id, provider_kind, event_type, provider_reference, idempotency_reference,
                    provider_status, outcome, transaction_id, payload, received_at
             FROM webhook_events
             WHERE transaction_id = $1
             ORDER BY received_at ASC",
        )
        .bind(transaction_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        rows.into_iter().map(WebhookEventRecord::try_from).collect()
    }
}
