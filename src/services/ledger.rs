//! Transaction ledger: the authoritative record of every payment attempt.
//!
//! All state changes go through [`LedgerService::transition`], a
//! compare-and-set on the row's current state. Whichever caller (webhook,
//! manual status check, sweep) gets there first wins; later callers get
//! [`LedgerError::InvalidTransition`] carrying the row as it now stands.

use crate::database::error::DatabaseError;
use crate::database::transaction_repository::{
    NewPaymentTransaction, PaymentTransaction, TransactionRepository, TransactionState,
};
use crate::error::{AppError, DomainError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// The reference is taken; `existing` is the row that owns it.
    #[error("idempotency reference '{reference}' already exists")]
    DuplicateIdempotencyKey {
        reference: String,
        existing: Box<PaymentTransaction>,
    },

    #[error("transaction {} is {}, cannot move to {target}", .current.id, .current.state)]
    InvalidTransition {
        current: Box<PaymentTransaction>,
        target: TransactionState,
    },

    #[error("transaction {0} not found")]
    TransactionNotFound(Uuid),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::DuplicateIdempotencyKey { reference, .. } => {
                AppError::domain(DomainError::DuplicateIdempotencyKey { reference })
            }
            LedgerError::InvalidTransition { current, target } => {
                AppError::domain(DomainError::InvalidTransition {
                    transaction_id: current.id.to_string(),
                    current_state: current.state.to_string(),
                    target_state: target.to_string(),
                })
            }
            LedgerError::TransactionNotFound(id) => {
                AppError::domain(DomainError::TransactionNotFound {
                    transaction_id: id.to_string(),
                })
            }
            LedgerError::Database(e) => e.into(),
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Clone)]
pub struct LedgerService {
    repo: Arc<dyn TransactionRepository>,
}

impl LedgerService {
    pub fn new(repo: Arc<dyn TransactionRepository>) -> Self {
        Self { repo }
    }

    /// Creates a `pending` row. A reused idempotency reference is reported as
    /// [`LedgerError::DuplicateIdempotencyKey`] together with the existing row.
    pub async fn create(&self, new: NewPaymentTransaction) -> LedgerResult<PaymentTransaction> {
        let reference = new.idempotency_reference.clone();
        match self.repo.insert(new).await {
            Ok(tx) => {
                info!(
                    transaction_id = %tx.id,
                    idempotency_reference = %tx.idempotency_reference,
                    purpose = %tx.purpose,
                    provider_kind = %tx.provider_kind,
                    amount = tx.amount,
                    currency = %tx.currency,
                    "ledger row created"
                );
                Ok(tx)
            }
            Err(e) if e.is_unique_violation() => {
                let existing = self
                    .repo
                    .find_by_idempotency_reference(&reference)
                    .await?
                    .ok_or_else(|| DatabaseError::not_found("transaction", &reference))?;
                info!(
                    transaction_id = %existing.id,
                    idempotency_reference = %reference,
                    state = %existing.state,
                    "idempotency reference already used, returning existing row"
                );
                Err(LedgerError::DuplicateIdempotencyKey {
                    reference,
                    existing: Box::new(existing),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Moves the row to `to` if its state is in `from`. `provider_reference`,
    /// when given, is stored in the same write.
    pub async fn transition(
        &self,
        id: Uuid,
        from: &[TransactionState],
        to: TransactionState,
        provider_reference: Option<&str>,
    ) -> LedgerResult<PaymentTransaction> {
        let allowed: Vec<TransactionState> = from
            .iter()
            .copied()
            .filter(|state| state.can_transition_to(to))
            .collect();

        if !allowed.is_empty() {
            if let Some(tx) = self
                .repo
                .compare_and_set_state(id, &allowed, to, provider_reference)
                .await?
            {
                info!(
                    transaction_id = %tx.id,
                    idempotency_reference = %tx.idempotency_reference,
                    provider_reference = tx.provider_reference.as_deref().unwrap_or(""),
                    from_state = ?allowed,
                    to_state = %to,
                    "ledger transition applied"
                );
                return Ok(tx);
            }
        }

        let current = self.get(id).await?;
        debug!(
            transaction_id = %id,
            current_state = %current.state,
            to_state = %to,
            "ledger transition rejected"
        );
        Err(LedgerError::InvalidTransition {
            current: Box::new(current),
            target: to,
        })
    }

    pub async fn get(&self, id: Uuid) -> LedgerResult<PaymentTransaction> {
        self.repo
            .find_by_id(id)
            .await?
            .ok_or(LedgerError::TransactionNotFound(id))
    }

    pub async fn get_by_idempotency_reference(
        &self,
        reference: &str,
    ) -> LedgerResult<Option<PaymentTransaction>> {
        Ok(self.repo.find_by_idempotency_reference(reference).await?)
    }

    pub async fn get_by_provider_reference(
        &self,
        reference: &str,
    ) -> LedgerResult<Option<PaymentTransaction>> {
        Ok(self.repo.find_by_provider_reference(reference).await?)
    }

    pub async fn list_for_entity(&self, entity_id: Uuid) -> LedgerResult<Vec<PaymentTransaction>> {
        Ok(self.repo.find_by_linked_entity(entity_id).await?)
    }

    /// Non-terminal rows not touched since `updated_before`.
    pub async fn find_stale(
        &self,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> LedgerResult<Vec<PaymentTransaction>> {
        Ok(self.repo.find_stale(updated_before, limit).await?)
    }
}
