use thiserror::Error;

pub type PaymentResult<T> = Result<T, PaymentError>;

#[derive(Debug, Clone, Error)]
pub enum PaymentError {
    #[error("Validation error: {message}")]
    ValidationError {
        message: String,
        field: Option<String>,
    },

    #[error("Invalid payer handle '{handle}': {reason}")]
    InvalidPayerHandle { handle: String, reason: String },

    #[error("Provider unavailable: provider={provider}, message={message}")]
    ProviderUnavailable {
        provider: String,
        message: String,
        retry_after_seconds: Option<u64>,
    },

    #[error("Provider rejected request: provider={provider}, message={message}")]
    ProviderRejected {
        provider: String,
        message: String,
        provider_code: Option<String>,
    },

    #[error("Webhook verification failed: {message}")]
    WebhookVerificationError { message: String },

    #[error("Unexpected provider response: provider={provider}, message={message}")]
    MalformedResponse { provider: String, message: String },
}

impl PaymentError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::ValidationError { .. } => false,
            PaymentError::InvalidPayerHandle { .. } => false,
            PaymentError::ProviderUnavailable { .. } => true,
            PaymentError::ProviderRejected { .. } => false,
            PaymentError::WebhookVerificationError { .. } => false,
            PaymentError::MalformedResponse { .. } => false,
        }
    }

    /// Errors that leave a ledger row behind as `failed` rather than
    /// rejecting the submission up front.
    pub fn is_provider_failure(&self) -> bool {
        matches!(
            self,
            PaymentError::ProviderUnavailable { .. }
                | PaymentError::ProviderRejected { .. }
                | PaymentError::MalformedResponse { .. }
        )
    }

    pub fn http_status_code(&self) -> u16 {
        match self {
            PaymentError::ValidationError { .. } => 400,
            PaymentError::InvalidPayerHandle { .. } => 400,
            PaymentError::ProviderUnavailable { .. } => 503,
            PaymentError::ProviderRejected { .. } => 402,
            PaymentError::WebhookVerificationError { .. } => 401,
            PaymentError::MalformedResponse { .. } => 502,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            PaymentError::ValidationError { message, .. } => message.clone(),
            PaymentError::InvalidPayerHandle { handle, .. } => {
                format!("'{}' is not a valid payment number", handle)
            }
            PaymentError::ProviderUnavailable { .. } => {
                "Payment provider is temporarily unavailable. Please retry shortly".to_string()
            }
            PaymentError::ProviderRejected { .. } => {
                "Payment was rejected by the provider".to_string()
            }
            PaymentError::WebhookVerificationError { .. } => {
                "Invalid webhook signature".to_string()
            }
            PaymentError::MalformedResponse { .. } => {
                "Payment provider returned an error".to_string()
            }
        }
    }
}

impl From<PaymentError> for crate::error::AppError {
    fn from(err: PaymentError) -> Self {
        use crate::error::{AppError, AppErrorKind, ExternalError, ValidationError};

        let kind = match &err {
            PaymentError::ValidationError { message, field } => match field {
                Some(field) => AppErrorKind::Validation(ValidationError::InvalidField {
                    field: field.clone(),
                    reason: message.clone(),
                }),
                None => AppErrorKind::Validation(ValidationError::InvalidField {
                    field: "request".to_string(),
                    reason: message.clone(),
                }),
            },
            PaymentError::InvalidPayerHandle { handle, reason } => {
                AppErrorKind::Validation(ValidationError::InvalidPayerHandle {
                    handle: handle.clone(),
                    reason: reason.clone(),
                })
            }
            PaymentError::WebhookVerificationError { message } => {
                AppErrorKind::External(ExternalError::InvalidSignature {
                    message: message.clone(),
                })
            }
            PaymentError::ProviderUnavailable { provider, .. }
            | PaymentError::ProviderRejected { provider, .. }
            | PaymentError::MalformedResponse { provider, .. } => {
                AppErrorKind::External(ExternalError::PaymentProvider {
                    provider: provider.clone(),
                    message: err.to_string(),
                    is_retryable: err.is_retryable(),
                })
            }
        };

        AppError::new(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_http_status_mapping_is_correct() {
        assert_eq!(
            PaymentError::InvalidPayerHandle {
                handle: "123".to_string(),
                reason: "too short".to_string()
            }
            .http_status_code(),
            400
        );
        assert_eq!(
            PaymentError::ProviderUnavailable {
                provider: "push".to_string(),
                message: "timeout".to_string(),
                retry_after_seconds: None,
            }
            .http_status_code(),
            503
        );
    }

    #[test]
    fn provider_failures_are_classified() {
        assert!(PaymentError::ProviderRejected {
            provider: "push".to_string(),
            message: "blocked".to_string(),
            provider_code: None,
        }
        .is_provider_failure());
        assert!(!PaymentError::InvalidPayerHandle {
            handle: "x".to_string(),
            reason: "bad".to_string(),
        }
        .is_provider_failure());
        assert!(!PaymentError::ProviderRejected {
            provider: "push".to_string(),
            message: "limit".to_string(),
            provider_code: None,
        }
        .is_retryable());
    }
}
