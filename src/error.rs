//! Unified error handling for the payments service
//!
//! Module errors (adapters, storage, ledger, billing, payouts) all convert into
//! [`AppError`], which carries the HTTP status mapping, a stable error code and
//! a user-facing message.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    // Domain errors (4xx)
    #[serde(rename = "INSUFFICIENT_BALANCE")]
    InsufficientBalance,
    #[serde(rename = "INVALID_DESTINATION")]
    InvalidDestination,
    #[serde(rename = "TRANSACTION_NOT_FOUND")]
    TransactionNotFound,
    #[serde(rename = "ORDER_NOT_FOUND")]
    OrderNotFound,
    #[serde(rename = "SUBSCRIPTION_NOT_FOUND")]
    SubscriptionNotFound,
    #[serde(rename = "DUPLICATE_IDEMPOTENCY_KEY")]
    DuplicateIdempotencyKey,
    #[serde(rename = "INVALID_TRANSITION")]
    InvalidTransition,
    #[serde(rename = "UNKNOWN_TRANSACTION")]
    UnknownTransaction,
    #[serde(rename = "PLAN_CHANGE_REJECTED")]
    PlanChangeRejected,

    // Infrastructure errors (5xx)
    #[serde(rename = "DATABASE_ERROR")]
    DatabaseError,
    #[serde(rename = "CONFIGURATION_ERROR")]
    ConfigurationError,

    // External errors
    #[serde(rename = "PAYMENT_PROVIDER_ERROR")]
    PaymentProviderError,
    #[serde(rename = "INVALID_SIGNATURE")]
    InvalidSignature,

    // Generic
    #[serde(rename = "VALIDATION_ERROR")]
    ValidationError,
}

/// Business rule violations
#[derive(Debug, Clone)]
pub enum DomainError {
    /// Withdrawal exceeds the seller's available balance
    InsufficientBalance { available: i64, requested: i64 },
    /// Payout handle cannot receive funds
    InvalidDestination { reason: String },
    TransactionNotFound { transaction_id: String },
    OrderNotFound { order_id: String },
    SubscriptionNotFound { seller_id: String },
    /// Idempotency reference already used by another ledger row
    DuplicateIdempotencyKey { reference: String },
    /// Ledger row was not in any of the expected states
    InvalidTransition {
        transaction_id: String,
        current_state: String,
        target_state: String,
    },
    /// Notification references a transaction this system never created
    UnknownTransaction { reference: String },
    PlanChangeRejected { reason: String },
}

/// Infrastructure-level errors (database, configuration)
#[derive(Debug, Clone)]
pub enum InfrastructureError {
    /// Database connection or query failure
    Database { message: String, is_retryable: bool },
    /// Missing or invalid configuration
    Configuration { message: String },
}

/// External service errors
#[derive(Debug, Clone)]
pub enum ExternalError {
    /// Payment provider transport or business error
    PaymentProvider {
        provider: String,
        message: String,
        is_retryable: bool,
    },
    /// Webhook payload failed signature verification
    InvalidSignature { message: String },
}

/// Input validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    InvalidField { field: String, reason: String },
    /// Phone number or customer contact the provider cannot use
    InvalidPayerHandle { handle: String, reason: String },
    InvalidAmount { amount: String, reason: String },
    /// Required field missing
    MissingField { field: String },
}

/// Unified application error type
#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub request_id: Option<String>,
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AppErrorKind {
    Domain(DomainError),
    Infrastructure(InfrastructureError),
    External(ExternalError),
    Validation(ValidationError),
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            request_id: None,
            context: None,
        }
    }

    pub fn domain(err: DomainError) -> Self {
        Self::new(AppErrorKind::Domain(err))
    }

    pub fn validation(err: ValidationError) -> Self {
        Self::new(AppErrorKind::Validation(err))
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Map error to HTTP status code
    pub fn status_code(&self) -> u16 {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::InsufficientBalance { .. } => 422, // Unprocessable Entity
                DomainError::InvalidDestination { .. } => 400,
                DomainError::TransactionNotFound { .. } => 404,
                DomainError::OrderNotFound { .. } => 404,
                DomainError::SubscriptionNotFound { .. } => 404,
                DomainError::DuplicateIdempotencyKey { .. } => 409, // Conflict
                DomainError::InvalidTransition { .. } => 409,
                DomainError::UnknownTransaction { .. } => 404,
                DomainError::PlanChangeRejected { .. } => 409,
            },
            AppErrorKind::Infrastructure(_) => 500,
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { is_retryable, .. } => {
                    if *is_retryable {
                        503
                    } else {
                        502 // Bad Gateway
                    }
                }
                ExternalError::InvalidSignature { .. } => 401,
            },
            AppErrorKind::Validation(_) => 400,
        }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> ErrorCode {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::InsufficientBalance { .. } => ErrorCode::InsufficientBalance,
                DomainError::InvalidDestination { .. } => ErrorCode::InvalidDestination,
                DomainError::TransactionNotFound { .. } => ErrorCode::TransactionNotFound,
                DomainError::OrderNotFound { .. } => ErrorCode::OrderNotFound,
                DomainError::SubscriptionNotFound { .. } => ErrorCode::SubscriptionNotFound,
                DomainError::DuplicateIdempotencyKey { .. } => ErrorCode::DuplicateIdempotencyKey,
                DomainError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
                DomainError::UnknownTransaction { .. } => ErrorCode::UnknownTransaction,
                DomainError::PlanChangeRejected { .. } => ErrorCode::PlanChangeRejected,
            },
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { .. } => ErrorCode::DatabaseError,
                InfrastructureError::Configuration { .. } => ErrorCode::ConfigurationError,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { .. } => ErrorCode::PaymentProviderError,
                ExternalError::InvalidSignature { .. } => ErrorCode::InvalidSignature,
            },
            AppErrorKind::Validation(_) => ErrorCode::ValidationError,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::InsufficientBalance {
                    available,
                    requested,
                } => format!(
                    "Insufficient balance. Available: {}, Requested: {}",
                    available, requested
                ),
                DomainError::InvalidDestination { reason } => {
                    format!("Invalid payout destination: {}", reason)
                }
                DomainError::TransactionNotFound { transaction_id } => {
                    format!("Transaction '{}' not found", transaction_id)
                }
                DomainError::OrderNotFound { order_id } => {
                    format!("Order '{}' not found", order_id)
                }
                DomainError::SubscriptionNotFound { seller_id } => {
                    format!("No subscription found for seller '{}'", seller_id)
                }
                DomainError::DuplicateIdempotencyKey { reference } => {
                    format!("Payment '{}' was already submitted", reference)
                }
                DomainError::InvalidTransition {
                    transaction_id,
                    current_state,
                    target_state,
                } => format!(
                    "Transaction '{}' cannot move from {} to {}",
                    transaction_id, current_state, target_state
                ),
                DomainError::UnknownTransaction { reference } => {
                    format!("No transaction matches reference '{}'", reference)
                }
                DomainError::PlanChangeRejected { reason } => {
                    format!("Plan change rejected: {}", reason)
                }
            },
            AppErrorKind::Infrastructure(_) => {
                "Service temporarily unavailable. Please try again later".to_string()
            }
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider {
                    provider,
                    is_retryable,
                    ..
                } => {
                    if *is_retryable {
                        format!(
                            "Payment provider ({}) is temporarily unavailable. Please try again",
                            provider
                        )
                    } else {
                        "Payment was declined by the provider. Please try again with a new payment"
                            .to_string()
                    }
                }
                ExternalError::InvalidSignature { .. } => {
                    "Webhook signature verification failed".to_string()
                }
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::InvalidField { field, reason } => {
                    format!("Invalid value for '{}': {}", field, reason)
                }
                ValidationError::InvalidPayerHandle { handle, reason } => {
                    format!("Invalid payer '{}': {}", handle, reason)
                }
                ValidationError::InvalidAmount { amount, reason } => {
                    format!("Invalid amount '{}': {}", amount, reason)
                }
                ValidationError::MissingField { field } => {
                    format!("Required field '{}' is missing", field)
                }
            },
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::Domain(_) => false,
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { is_retryable, .. } => *is_retryable,
                InfrastructureError::Configuration { .. } => false,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { is_retryable, .. } => *is_retryable,
                ExternalError::InvalidSignature { .. } => false,
            },
            AppErrorKind::Validation(_) => false,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for AppError {}

impl From<crate::config::ConfigError> for AppError {
    fn from(err: crate::config::ConfigError) -> Self {
        AppError::new(AppErrorKind::Infrastructure(
            InfrastructureError::Configuration {
                message: err.to_string(),
            },
        ))
    }
}

// Conversions from module errors live next to those errors (payments/error.rs,
// database/error.rs, services/*).

/// Result type for operations that can fail with AppError
pub type AppResult<T> = Result<T, AppError>;
