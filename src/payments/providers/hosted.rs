use crate::logging::mask_email;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::PaymentProvider;
use crate::payments::types::{
    InitiateRequest, InitiateResponse, PayerDetails, ProviderKind, ProviderStatus, WebhookEvent,
    WebhookVerificationResult,
};
use crate::payments::utils::{verify_hmac_sha512_hex, PaymentHttpClient};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::info;

const PROVIDER: &str = "hosted";

#[derive(Debug, Clone)]
pub struct HostedProviderConfig {
    pub secret_key: String,
    pub webhook_secret: Option<String>,
    pub base_url: String,
    /// Public base URL of this service; the payer is sent back here.
    pub callback_base_url: String,
    pub checkout_title: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl HostedProviderConfig {
    pub fn from_env() -> PaymentResult<Self> {
        let secret_key = std::env::var("HOSTED_PROVIDER_SECRET_KEY").map_err(|_| {
            PaymentError::ValidationError {
                message: "HOSTED_PROVIDER_SECRET_KEY environment variable is required".to_string(),
                field: Some("HOSTED_PROVIDER_SECRET_KEY".to_string()),
            }
        })?;
        let callback_base_url =
            std::env::var("CALLBACK_BASE_URL").map_err(|_| PaymentError::ValidationError {
                message: "CALLBACK_BASE_URL environment variable is required".to_string(),
                field: Some("CALLBACK_BASE_URL".to_string()),
            })?;

        Ok(Self {
            secret_key,
            webhook_secret: std::env::var("HOSTED_PROVIDER_WEBHOOK_SECRET").ok(),
            base_url: std::env::var("HOSTED_PROVIDER_BASE_URL")
                .unwrap_or_else(|_| "https://api.flutterwave.com/v3".to_string()),
            callback_base_url,
            checkout_title: std::env::var("HOSTED_CHECKOUT_TITLE")
                .unwrap_or_else(|_| "Marketplace Payment".to_string()),
            timeout_secs: std::env::var("HOSTED_PROVIDER_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(30),
            max_retries: std::env::var("HOSTED_PROVIDER_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(2),
        })
    }
}

fn email_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("static pattern is valid")
    })
}

pub struct HostedProvider {
    config: HostedProviderConfig,
    http: PaymentHttpClient,
}

impl HostedProvider {
    pub fn new(config: HostedProviderConfig) -> PaymentResult<Self> {
        let http = PaymentHttpClient::new(
            PROVIDER,
            Duration::from_secs(config.timeout_secs),
            config.max_retries,
        )?;
        Ok(Self { config, http })
    }

    pub fn from_env() -> PaymentResult<Self> {
        Self::new(HostedProviderConfig::from_env()?)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Where the provider sends the payer after the hosted flow ends.
    pub fn return_url(&self, idempotency_reference: &str) -> String {
        format!(
            "{}/payments/return?reference={}",
            self.config.callback_base_url.trim_end_matches('/'),
            idempotency_reference
        )
    }

    fn map_message_error(message: String) -> PaymentError {
        let lowered = message.to_lowercase();
        if lowered.contains("too many requests")
            || lowered.contains("rate limit")
            || lowered.contains("temporarily")
        {
            return PaymentError::ProviderUnavailable {
                provider: PROVIDER.to_string(),
                message,
                retry_after_seconds: None,
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
            "successful" | "success" | "completed" => Some(ProviderStatus::Successful),
            "pending" | "new" | "processing" => Some(ProviderStatus::Pending),
            "failed" | "error" => Some(ProviderStatus::Failed),
            "cancelled" | "canceled" | "abandoned" => Some(ProviderStatus::Cancelled),
            _ => None,
        }
    }

    fn customer_email(payer: &PayerDetails) -> PaymentResult<&str> {
        match payer {
            PayerDetails::Hosted { customer } => {
                let email = customer.email.trim();
                if !email_pattern().is_match(email) {
                    return Err(PaymentError::InvalidPayerHandle {
                        handle: customer.email.clone(),
                        reason: "customer email is malformed".to_string(),
                    });
                }
                Ok(email)
            }
            PayerDetails::Push { .. } => Err(PaymentError::ValidationError {
                message: "hosted checkout needs customer details".to_string(),
                field: Some("payer".to_string()),
            }),
        }
    }
}

#[async_trait]
impl PaymentProvider for HostedProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Hosted
    }

    fn validate_payer(&self, payer: &PayerDetails) -> PaymentResult<()> {
        Self::customer_email(payer).map(|_| ())
    }

    async fn initiate(&self, request: InitiateRequest) -> PaymentResult<InitiateResponse> {
        request.amount.validate_positive("amount")?;
        if request.purpose.is_outbound() {
            return Err(PaymentError::ValidationError {
                message: "hosted checkout cannot disburse funds".to_string(),
                field: Some("purpose".to_string()),
            });
        }
        let email = Self::customer_email(&request.payer)?;
        let name = match &request.payer {
            PayerDetails::Hosted { customer } => customer.name.clone(),
            PayerDetails::Push { .. } => None,
        };

        let payload = serde_json::json!({
            "tx_ref": request.idempotency_reference,
            "amount": request.amount.to_major_units().to_string(),
            "currency": request.amount.currency,
            "redirect_url": self.return_url(&request.idempotency_reference),
            "customer": {
                "email": email,
                "name": name,
            },
            "meta": request.metadata,
            "customizations": {
                "title": self.config.checkout_title,
                "description": request.description,
            }
        });

        let raw: HostedEnvelope = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint("/payments"),
                Some(&self.config.secret_key),
                Some(&payload),
            )
            .await
            .map_err(|e| match e {
                PaymentError::ProviderRejected { message, .. } => Self::map_message_error(message),
                other => other,
            })?;

        if raw.status.to_lowercase() != "success" {
            return Err(Self::map_message_error(raw.message));
        }

        let checkout_url = raw
            .data
            .as_ref()
            .and_then(|v| v.get("link").or_else(|| v.get("checkout_url")))
            .and_then(|v| v.as_str())
            .map(|v| v.to_string())
            .ok_or(PaymentError::MalformedResponse {
                provider: PROVIDER.to_string(),
                message: "missing checkout link in hosted response".to_string(),
            })?;

        info!(
            tx_ref = %request.idempotency_reference,
            customer = %mask_email(email),
            "hosted checkout initiated"
        );

        // The hosted provider keys its verification endpoint on our tx_ref.
        Ok(InitiateResponse {
            provider_reference: request.idempotency_reference,
            checkout_url: Some(checkout_url),
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
            "{}?tx_ref={}",
            self.endpoint("/transactions/verify_by_reference"),
            provider_reference
        );
        let raw: HostedEnvelope = self
            .http
            .request_json(
                reqwest::Method::GET,
                &url,
                Some(&self.config.secret_key),
                None,
            )
            .await?;

        if raw.status.to_lowercase() != "success" {
            return Err(Self::map_message_error(raw.message));
        }

        raw.data
            .as_ref()
            .and_then(|d| d.get("status"))
            .and_then(|v| v.as_str())
            .and_then(Self::map_status)
            .ok_or(PaymentError::MalformedResponse {
                provider: PROVIDER.to_string(),
                message: "missing or unknown status in hosted verification".to_string(),
            })
    }

    fn verify_webhook(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> PaymentResult<WebhookVerificationResult> {
        let secret = self.config.webhook_secret.as_deref().ok_or(
            PaymentError::WebhookVerificationError {
                message: "HOSTED_PROVIDER_WEBHOOK_SECRET is not configured".to_string(),
            },
        )?;
        let valid = verify_hmac_sha512_hex(payload, secret, signature);
        Ok(WebhookVerificationResult {
            valid,
            reason: if valid {
                None
            } else {
                Some("invalid hosted provider signature".to_string())
            },
        })
    }

    fn parse_webhook_event(&self, payload: &[u8]) -> PaymentResult<WebhookEvent> {
        let parsed: JsonValue =
            serde_json::from_slice(payload).map_err(|e| PaymentError::WebhookVerificationError {
                message: format!("invalid webhook JSON payload: {}", e),
            })?;

        let event_type = parsed
            .get("event")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let data = parsed
            .get("data")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));
        let text = |key: &str| {
            data.get(key)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .filter(|s| !s.trim().is_empty())
        };

        let raw_status = text("status").unwrap_or_default();
        let status = Self::map_status(&raw_status).ok_or(PaymentError::ValidationError {
            message: format!("unknown hosted transaction status '{}'", raw_status),
            field: Some("data.status".to_string()),
        })?;

        Ok(WebhookEvent {
            provider: ProviderKind::Hosted,
            event_type,
            provider_reference: text("flw_ref").or_else(|| {
                data.get("id")
                    .and_then(|v| v.as_i64())
                    .map(|id| id.to_string())
            }),
            idempotency_reference: text("tx_ref"),
            status,
            occurred_at: text("created_at")
                .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
                .map(|t| t.with_timezone(&Utc)),
            payload: parsed,
        })
    }
}

#[derive(Debug, Deserialize)]
struct HostedEnvelope {
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<JsonValue>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::types::{CustomerContact, MobileNetwork};
    use crate::payments::utils::hmac_sha512_hex;

    fn provider() -> HostedProvider {
        HostedProvider::new(HostedProviderConfig {
            secret_key: "sk_test_demo".to_string(),
            webhook_secret: Some("whsec_hosted".to_string()),
            base_url: "https://api.flutterwave.com/v3".to_string(),
            callback_base_url: "https://shop.example.com/".to_string(),
            checkout_title: "Marketplace Payment".to_string(),
            timeout_secs: 5,
            max_retries: 0,
        })
        .expect("provider init should succeed")
    }

    #[test]
    fn return_url_is_built_from_callback_base() {
        assert_eq!(
            provider().return_url("sub-9-1700000000000"),
            "https://shop.example.com/payments/return?reference=sub-9-1700000000000"
        );
    }

    #[test]
    fn validate_payer_checks_customer_email() {
        let provider = provider();
        let valid = PayerDetails::Hosted {
            customer: CustomerContact {
                email: "seller@example.com".to_string(),
                name: Some("Juma".to_string()),
            },
        };
        assert!(provider.validate_payer(&valid).is_ok());

        let malformed = PayerDetails::Hosted {
            customer: CustomerContact {
                email: "not-an-email".to_string(),
                name: None,
            },
        };
        assert!(matches!(
            provider.validate_payer(&malformed),
            Err(PaymentError::InvalidPayerHandle { .. })
        ));

        let push = PayerDetails::Push {
            phone: "0712345678".to_string(),
            network: MobileNetwork::AirtelMoney,
        };
        assert!(provider.validate_payer(&push).is_err());
    }

    #[test]
    fn webhook_signature_validation_works() {
        let provider = provider();
        let payload = br#"{"event":"charge.completed"}"#;
        let signature = hmac_sha512_hex(payload, "whsec_hosted").expect("hmac accepts any key");
        assert!(
            provider
                .verify_webhook(payload, &signature)
                .expect("verification should not error")
                .valid
        );
        assert!(
            !provider
                .verify_webhook(payload, "wrong")
                .expect("verification should not error")
                .valid
        );
    }

    #[test]
    fn parse_webhook_event_maps_fields() {
        let provider = provider();
        let payload = br#"{
            "event":"charge.completed",
            "data":{
                "id": 4412,
                "status":"successful",
                "tx_ref":"sub-9-1700000000000",
                "flw_ref":"FLW-MOCK-1"
            }
        }"#;
        let event = provider
            .parse_webhook_event(payload)
            .expect("webhook parse should succeed");
        assert_eq!(event.event_type, "charge.completed");
        assert_eq!(
            event.idempotency_reference.as_deref(),
            Some("sub-9-1700000000000")
        );
        assert_eq!(event.provider_reference.as_deref(), Some("FLW-MOCK-1"));
        assert_eq!(event.status, ProviderStatus::Successful);
    }

    #[test]
    fn unknown_status_is_rejected() {
        let provider = provider();
        let result = provider.parse_webhook_event(br#"{"event":"x","data":{"status":"weird"}}"#);
        assert!(result.is_err());
    }
}
