use crate::payments::error::PaymentError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Mobile-money style: the provider pushes a prompt to the payer's handset.
    Push,
    /// The payer completes a provider-hosted checkout page and is redirected back.
    Hosted,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Push => "push",
            ProviderKind::Hosted => "hosted",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "push" | "mobile_money" => Ok(ProviderKind::Push),
            "hosted" | "hosted_checkout" => Ok(ProviderKind::Hosted),
            _ => Err(PaymentError::ValidationError {
                message: format!("unsupported provider kind: {}", value),
                field: Some("provider_kind".to_string()),
            }),
        }
    }
}

/// What a ledger row is paying for. Also decides whether a push provider
/// collects from or disburses to the handle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentPurpose {
    OrderPayment,
    SubscriptionUpgrade,
    TestPayment,
    Withdrawal,
}

impl PaymentPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentPurpose::OrderPayment => "order_payment",
            PaymentPurpose::SubscriptionUpgrade => "subscription_upgrade",
            PaymentPurpose::TestPayment => "test_payment",
            PaymentPurpose::Withdrawal => "withdrawal",
        }
    }

    /// Short prefix used when building idempotency references.
    pub fn reference_prefix(&self) -> &'static str {
        match self {
            PaymentPurpose::OrderPayment => "ord",
            PaymentPurpose::SubscriptionUpgrade => "sub",
            PaymentPurpose::TestPayment => "tst",
            PaymentPurpose::Withdrawal => "wdr",
        }
    }

    pub fn is_outbound(&self) -> bool {
        matches!(self, PaymentPurpose::Withdrawal)
    }
}

impl std::fmt::Display for PaymentPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PaymentPurpose {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "order_payment" => Ok(PaymentPurpose::OrderPayment),
            "subscription_upgrade" => Ok(PaymentPurpose::SubscriptionUpgrade),
            "test_payment" => Ok(PaymentPurpose::TestPayment),
            "withdrawal" => Ok(PaymentPurpose::Withdrawal),
            _ => Err(PaymentError::ValidationError {
                message: format!("unsupported payment purpose: {}", value),
                field: Some("purpose".to_string()),
            }),
        }
    }
}

/// Amount in integer minor units of `currency`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Money {
    pub amount: i64,
    pub currency: String,
}

impl Money {
    pub fn new(amount: i64, currency: impl Into<String>) -> Self {
        Self {
            amount,
            currency: currency.into(),
        }
    }

    pub fn validate_positive(&self, field: &str) -> Result<(), PaymentError> {
        if self.amount <= 0 {
            return Err(PaymentError::ValidationError {
                message: "amount must be greater than zero".to_string(),
                field: Some(field.to_string()),
            });
        }
        let currency = self.currency.trim();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(PaymentError::ValidationError {
                message: format!("currency must be an ISO 4217 code, got '{}'", self.currency),
                field: Some("currency".to_string()),
            });
        }
        Ok(())
    }

    /// Decimal amount in major units, as most provider APIs expect it.
    pub fn to_major_units(&self) -> Decimal {
        Decimal::new(self.amount, currency_exponent(&self.currency))
    }
}

/// Number of minor-unit digits a currency is settled in by the providers we use.
pub fn currency_exponent(currency: &str) -> u32 {
    match currency.trim().to_uppercase().as_str() {
        "TZS" | "UGX" | "RWF" | "XOF" | "XAF" => 0,
        _ => 2,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MobileNetwork {
    Mpesa,
    TigoPesa,
    AirtelMoney,
    HaloPesa,
}

impl MobileNetwork {
    pub fn as_str(&self) -> &'static str {
        match self {
            MobileNetwork::Mpesa => "Mpesa",
            MobileNetwork::TigoPesa => "Tigo",
            MobileNetwork::AirtelMoney => "Airtel",
            MobileNetwork::HaloPesa => "Halopesa",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CustomerContact {
    pub email: String,
    pub name: Option<String>,
}

/// Who pays (or, for withdrawals, who receives), tagged by provider family.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "provider_kind", rename_all = "snake_case")]
pub enum PayerDetails {
    Push {
        phone: String,
        network: MobileNetwork,
    },
    Hosted {
        customer: CustomerContact,
    },
}

impl PayerDetails {
    pub fn provider_kind(&self) -> ProviderKind {
        match self {
            PayerDetails::Push { .. } => ProviderKind::Push,
            PayerDetails::Hosted { .. } => ProviderKind::Hosted,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiateRequest {
    pub amount: Money,
    pub purpose: PaymentPurpose,
    pub idempotency_reference: String,
    pub description: String,
    pub payer: PayerDetails,
    pub metadata: Option<JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiateResponse {
    pub provider_reference: String,
    /// Only set by hosted checkouts.
    pub checkout_url: Option<String>,
    pub provider_data: Option<JsonValue>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Pending,
    Successful,
    Failed,
    Cancelled,
}

impl ProviderStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProviderStatus::Pending)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookVerificationResult {
    pub valid: bool,
    pub reason: Option<String>,
}

/// A provider notification normalized into the shape reconciliation works with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub provider: ProviderKind,
    pub event_type: String,
    pub provider_reference: Option<String>,
    pub idempotency_reference: Option<String>,
    pub status: ProviderStatus,
    pub occurred_at: Option<DateTime<Utc>>,
    pub payload: JsonValue,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn money_validation_rejects_non_positive_and_bad_currency() {
        assert!(Money::new(15000, "TZS").validate_positive("amount").is_ok());
        assert!(Money::new(0, "TZS").validate_positive("amount").is_err());
        assert!(Money::new(-5, "TZS").validate_positive("amount").is_err());
        assert!(Money::new(100, "tzs").validate_positive("amount").is_err());
        assert!(Money::new(100, "").validate_positive("amount").is_err());
    }

    #[test]
    fn major_units_follow_currency_exponent() {
        assert_eq!(Money::new(15000, "TZS").to_major_units().to_string(), "15000");
        assert_eq!(Money::new(123456, "KES").to_major_units().to_string(), "1234.56");
    }

    #[test]
    fn payer_details_deserialize_from_tagged_json() {
        let payload = serde_json::json!({
            "provider_kind": "push",
            "phone": "0712345678",
            "network": "mpesa"
        });
        let payer: PayerDetails =
            serde_json::from_value(payload).expect("deserialization should succeed");
        assert_eq!(payer.provider_kind(), ProviderKind::Push);

        let payload = serde_json::json!({
            "provider_kind": "hosted",
            "customer": {"email": "buyer@example.com", "name": "Asha"}
        });
        let payer: PayerDetails =
            serde_json::from_value(payload).expect("deserialization should succeed");
        assert_eq!(payer.provider_kind(), ProviderKind::Hosted);
    }

    #[test]
    fn purpose_round_trips_through_strings() {
        for purpose in [
            PaymentPurpose::OrderPayment,
            PaymentPurpose::SubscriptionUpgrade,
            PaymentPurpose::TestPayment,
            PaymentPurpose::Withdrawal,
        ] {
            assert_eq!(PaymentPurpose::from_str(purpose.as_str()).ok(), Some(purpose));
        }
        assert!(ProviderKind::from_str("carrier-pigeon").is_err());
    }
}
