use crate::logging::mask_phone;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::PaymentProvider;
use crate::payments::types::{
    InitiateRequest, InitiateResponse, PayerDetails, ProviderKind, ProviderStatus, WebhookEvent,
    WebhookVerificationResult,
};
use crate::payments::utils::{verify_hmac_sha256_hex, PaymentHttpClient};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::info;

const PROVIDER: &str = "push";

#[derive(Debug, Clone)]
pub struct PushProviderConfig {
    pub api_key: String,
    pub webhook_secret: Option<String>,
    pub base_url: String,
    /// Dialing code every payer handle is normalized to, without `+`.
    pub country_code: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl PushProviderConfig {
    pub fn from_env() -> PaymentResult<Self> {
        let api_key =
            std::env::var("PUSH_PROVIDER_API_KEY").map_err(|_| PaymentError::ValidationError {
                message: "PUSH_PROVIDER_API_KEY environment variable is required".to_string(),
                field: Some("PUSH_PROVIDER_API_KEY".to_string()),
            })?;

        Ok(Self {
            api_key,
            webhook_secret: std::env::var("PUSH_PROVIDER_WEBHOOK_SECRET").ok(),
            base_url: std::env::var("PUSH_PROVIDER_BASE_URL")
                .unwrap_or_else(|_| "https://sandbox.mobile-checkout.example/api/v1".to_string()),
            country_code: std::env::var("PUSH_PROVIDER_COUNTRY_CODE")
                .unwrap_or_else(|_| "255".to_string()),
            timeout_secs: std::env::var("PUSH_PROVIDER_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .or_else(|| {
                    std::env::var("PAYMENT_TIMEOUT_SECONDS")
                        .ok()
                        .and_then(|v| v.parse::<u64>().ok())
                })
                .unwrap_or(30),
            max_retries: std::env::var("PUSH_PROVIDER_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(2),
        })
    }
}

fn subscriber_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[67]\d{8}$").expect("static pattern is valid"))
}

/// Normalizes a payer handle to `<country code><9-digit subscriber number>`.
///
/// Accepts the local trunk form (`0712345678`), the bare subscriber number
/// (`712345678`) and the international form with or without `+`, ignoring
/// spaces, dashes and parentheses.
pub fn normalize_msisdn(raw: &str, country_code: &str) -> PaymentResult<String> {
    let invalid = |reason: &str| PaymentError::InvalidPayerHandle {
        handle: raw.to_string(),
        reason: reason.to_string(),
    };

    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
        .collect();
    let digits = cleaned.strip_prefix('+').unwrap_or(&cleaned);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid("handle must contain digits only"));
    }

    let subscriber = if digits.len() == country_code.len() + 9 && digits.starts_with(country_code)
    {
        &digits[country_code.len()..]
    } else if digits.len() == 10 && digits.starts_with('0') {
        &digits[1..]
    } else if digits.len() == 9 {
        digits
    } else {
        return Err(invalid("unexpected number length"));
    };

    if !subscriber_pattern().is_match(subscriber) {
        return Err(invalid("not a mobile subscriber number"));
    }

    Ok(format!("{}{}", country_code, subscriber))
}

pub struct PushProvider {
    config: PushProviderConfig,
    http: PaymentHttpClient,
}

impl PushProvider {
    pub fn new(config: PushProviderConfig) -> PaymentResult<Self> {
        let http = PaymentHttpClient::new(
            PROVIDER,
            Duration::from_secs(config.timeout_secs),
            config.max_retries,
        )?;
        Ok(Self { config, http })
    }

    pub fn from_env() -> PaymentResult<Self> {
        Self::new(PushProviderConfig::from_env()?)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn map_message_error(message: String) -> PaymentError {
        let lowered = message.to_lowercase();
        if lowered.contains("timeout")
            || lowered.contains("temporarily")
            || lowered.contains("try again")
            || lowered.contains("unavailable")
        {
            return PaymentError::ProviderUnavailable {
                provider: PROVIDER.to_string(),
                message,
                retry_after_seconds: None,
            };
        }
        if lowered.contains("invalid msisdn") || lowered.contains("invalid account number") {
            return PaymentError::InvalidPayerHandle {
                handle: String::new(),
                reason: message,
            };
        }
        PaymentError::ProviderRejected {
            provider: PROVIDER.to_string(),
            message,
            provider_code: None,
        }
    }

    fn map_status(raw: &str) -> Option<ProviderStatus> {
        match raw.trim().to_lowercase().as_str() {
            "success" | "successful" | "completed" => Some(ProviderStatus::Successful),
            "pending" | "processing" | "initiated" => Some(ProviderStatus::Pending),
            "failure" | "failed" | "rejected" | "expired" => Some(ProviderStatus::Failed),
            "cancelled" | "canceled" | "reversed" => Some(ProviderStatus::Cancelled),
            _ => None,
        }
    }
}

#[async_trait]
impl PaymentProvider for PushProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Push
    }

    fn validate_payer(&self, payer: &PayerDetails) -> PaymentResult<()> {
        match payer {
            PayerDetails::Push { phone, .. } => {
                normalize_msisdn(phone, &self.config.country_code).map(|_| ())
            }
            PayerDetails::Hosted { .. } => Err(PaymentError::ValidationError {
                message: "push payments need a phone number and network".to_string(),
                field: Some("payer".to_string()),
            }),
        }
    }

    async fn initiate(&self, request: InitiateRequest) -> PaymentResult<InitiateResponse> {
        request.amount.validate_positive("amount")?;
        let (phone, network) = match &request.payer {
            PayerDetails::Push { phone, network } => (phone, network),
            PayerDetails::Hosted { .. } => {
                return Err(PaymentError::ValidationError {
                    message: "push payments need a phone number and network".to_string(),
                    field: Some("payer".to_string()),
                })
            }
        };
        let msisdn = normalize_msisdn(phone, &self.config.country_code)?;

        let (path, payload) = if request.purpose.is_outbound() {
            (
                "/disburse",
                serde_json::json!({
                    "destination": {
                        "accountNumber": msisdn,
                        "provider": network.as_str(),
                    },
                    "amount": request.amount.to_major_units().to_string(),
                    "currency": request.amount.currency,
                    "externalReferenceId": request.idempotency_reference,
                    "remarks": request.description,
                }),
            )
        } else {
            (
                "/checkout/mno",
                serde_json::json!({
                    "accountNumber": msisdn,
                    "provider": network.as_str(),
                    "amount": request.amount.to_major_units().to_string(),
                    "currency": request.amount.currency,
                    "externalId": request.idempotency_reference,
                    "additionalProperties": {
                        "description": request.description,
                        "metadata": request.metadata,
                    },
                }),
            )
        };

        let raw: PushEnvelope = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint(path),
                Some(&self.config.api_key),
                Some(&payload),
            )
            .await
            .map_err(|e| match e {
                PaymentError::ProviderRejected { message, .. } => Self::map_message_error(message),
                other => other,
            })?;

        if !raw.success {
            return Err(Self::map_message_error(raw.message));
        }

        let provider_reference = raw
            .transaction_id
            .filter(|v| !v.trim().is_empty())
            .ok_or(PaymentError::MalformedResponse {
                provider: PROVIDER.to_string(),
                message: "missing transactionId in push response".to_string(),
            })?;

        info!(
            reference = %request.idempotency_reference,
            provider_reference = %provider_reference,
            msisdn = %mask_phone(&msisdn),
            outbound = request.purpose.is_outbound(),
            "push payment initiated"
        );

        Ok(InitiateResponse {
            provider_reference,
            checkout_url: None,
            provider_data: raw.data,
        })
    }

    async fn check_status(&self, provider_reference: &str) -> PaymentResult<ProviderStatus> {
        if provider_reference.trim().is_empty() {
            return Err(PaymentError::ValidationError {
                message: "provider_reference is required".to_string(),
                field: Some("provider_reference".to_string()),
            });
        }
        let url = format!(
            "{}?reference={}",
            self.endpoint("/transactions/status"),
            provider_reference
        );
        let raw: PushEnvelope = self
            .http
            .request_json(reqwest::Method::GET, &url, Some(&self.config.api_key), None)
            .await?;
        if !raw.success {
            return Err(Self::map_message_error(raw.message));
        }

        let status = raw
            .data
            .as_ref()
            .and_then(|d| d.get("status"))
            .and_then(|v| v.as_str())
            .and_then(Self::map_status)
            .ok_or(PaymentError::MalformedResponse {
                provider: PROVIDER.to_string(),
                message: "missing or unknown status in push status response".to_string(),
            })?;
        Ok(status)
    }

    fn verify_webhook(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> PaymentResult<WebhookVerificationResult> {
        let secret = self.config.webhook_secret.as_deref().ok_or(
            PaymentError::WebhookVerificationError {
                message: "PUSH_PROVIDER_WEBHOOK_SECRET is not configured".to_string(),
            },
        )?;
        let valid = verify_hmac_sha256_hex(payload, secret, signature);
        Ok(WebhookVerificationResult {
            valid,
            reason: if valid {
                None
            } else {
                Some("invalid push provider signature".to_string())
            },
        })
    }

    fn parse_webhook_event(&self, payload: &[u8]) -> PaymentResult<WebhookEvent> {
        let parsed: JsonValue =
            serde_json::from_slice(payload).map_err(|e| PaymentError::WebhookVerificationError {
                message: format!("invalid webhook JSON payload: {}", e),
            })?;

        let text = |key: &str| {
            parsed
                .get(key)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .filter(|s| !s.trim().is_empty())
        };

        let raw_status = text("transactionstatus").unwrap_or_default();
        let status = Self::map_status(&raw_status).ok_or(PaymentError::ValidationError {
            message: format!("unknown push transaction status '{}'", raw_status),
            field: Some("transactionstatus".to_string()),
        })?;

        Ok(WebhookEvent {
            provider: ProviderKind::Push,
            event_type: text("event").unwrap_or_else(|| "transaction.update".to_string()),
            provider_reference: text("transid"),
            idempotency_reference: text("utilityref"),
            status,
            occurred_at: text("timestamp")
                .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
                .map(|t| t.with_timezone(&Utc)),
            payload: parsed,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushEnvelope {
    success: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    transaction_id: Option<String>,
    #[serde(default)]
    data: Option<JsonValue>,
}
