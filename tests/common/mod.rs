#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marketplace_payments::config::{BillingConfig, PayoutConfig};
use marketplace_payments::database::error::{DatabaseError, DatabaseErrorKind, DatabaseResult};
use marketplace_payments::database::order_repository::{NewOrder, NewOrderLine, Order};
use marketplace_payments::database::transaction_repository::{
    NewPaymentTransaction, PaymentTransaction, TransactionRepository, TransactionState,
};
use marketplace_payments::database::Repositories;
use marketplace_payments::payments::error::{PaymentError, PaymentResult};
use marketplace_payments::payments::factory::ProviderRegistry;
use marketplace_payments::payments::provider::PaymentProvider;
use marketplace_payments::payments::types::{
    CustomerContact, InitiateRequest, InitiateResponse, MobileNetwork, PayerDetails, ProviderKind,
    ProviderStatus, WebhookEvent, WebhookVerificationResult,
};
use marketplace_payments::services::Services;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub const VALID_SIGNATURE: &str = "valid-signature";

/// Scriptable stand-in for a provider family. Webhook bodies are plain JSON
/// (see [`webhook_body`]) signed with [`VALID_SIGNATURE`].
pub struct MockProvider {
    kind: ProviderKind,
    fail_initiate: AtomicBool,
    status: Mutex<ProviderStatus>,
    initiate_calls: AtomicUsize,
    status_checks: AtomicUsize,
}

impl MockProvider {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            fail_initiate: AtomicBool::new(false),
            status: Mutex::new(ProviderStatus::Pending),
            initiate_calls: AtomicUsize::new(0),
            status_checks: AtomicUsize::new(0),
        }
    }

    pub fn fail_initiation(&self, fail: bool) {
        self.fail_initiate.store(fail, Ordering::SeqCst);
    }

    /// Status returned by `check_status` from now on.
    pub fn report_status(&self, status: ProviderStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn initiate_calls(&self) -> usize {
        self.initiate_calls.load(Ordering::SeqCst)
    }

    pub fn status_checks(&self) -> usize {
        self.status_checks.load(Ordering::SeqCst)
    }
}

#[derive(Deserialize)]
struct MockNotification {
    #[serde(default)]
    event_type: Option<String>,
    provider_reference: Option<String>,
    idempotency_reference: Option<String>,
    status: ProviderStatus,
}

#[async_trait]
impl PaymentProvider for MockProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn validate_payer(&self, payer: &PayerDetails) -> PaymentResult<()> {
        match (self.kind, payer) {
            (ProviderKind::Push, PayerDetails::Push { phone, .. }) => {
                let digits = phone.trim_start_matches('+');
                if digits.len() >= 9 && digits.chars().all(|c| c.is_ascii_digit()) {
                    Ok(())
                } else {
                    Err(PaymentError::InvalidPayerHandle {
                        handle: phone.clone(),
                        reason: "not a phone number".to_string(),
                    })
                }
            }
            (ProviderKind::Hosted, PayerDetails::Hosted { customer }) if customer.email.contains('@') => {
                Ok(())
            }
            _ => Err(PaymentError::ValidationError {
                message: format!("payer does not fit the {} provider", self.kind),
                field: Some("payer".to_string()),
            }),
        }
    }

    async fn initiate(&self, request: InitiateRequest) -> PaymentResult<InitiateResponse> {
        self.initiate_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_initiate.load(Ordering::SeqCst) {
            return Err(PaymentError::ProviderRejected {
                provider: self.kind.to_string(),
                message: "insufficient float".to_string(),
                provider_code: Some("E42".to_string()),
            });
        }
        Ok(InitiateResponse {
            provider_reference: provider_reference_for(self.kind, &request.idempotency_reference),
            checkout_url: (self.kind == ProviderKind::Hosted)
                .then(|| format!("https://checkout.test/{}", request.idempotency_reference)),
            provider_data: None,
        })
    }

    async fn check_status(&self, _provider_reference: &str) -> PaymentResult<ProviderStatus> {
        self.status_checks.fetch_add(1, Ordering::SeqCst);
        Ok(*self.status.lock().unwrap())
    }

    fn verify_webhook(
        &self,
        _payload: &[u8],
        signature: &str,
    ) -> PaymentResult<WebhookVerificationResult> {
        let valid = signature == VALID_SIGNATURE;
        Ok(WebhookVerificationResult {
            valid,
            reason: (!valid).then(|| "signature mismatch".to_string()),
        })
    }

    fn parse_webhook_event(&self, payload: &[u8]) -> PaymentResult<WebhookEvent> {
        let notification: MockNotification =
            serde_json::from_slice(payload).map_err(|e| PaymentError::MalformedResponse {
                provider: self.kind.to_string(),
                message: e.to_string(),
            })?;
        let raw = serde_json::from_slice(payload).unwrap_or_default();
        Ok(WebhookEvent {
            provider: self.kind,
            event_type: notification
                .event_type
                .unwrap_or_else(|| "payment.updated".to_string()),
            provider_reference: notification.provider_reference,
            idempotency_reference: notification.idempotency_reference,
            status: notification.status,
            occurred_at: None,
            payload: raw,
        })
    }
}

/// Ledger store whose `pending -> processing` update can be made to fail,
/// as if the database went away right after the provider answered.
pub struct FlakyTransactions {
    inner: Arc<dyn TransactionRepository>,
    fail_processing: AtomicBool,
}

impl FlakyTransactions {
    pub fn wrap(inner: Arc<dyn TransactionRepository>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_processing: AtomicBool::new(false),
        })
    }

    pub fn fail_processing(&self, fail: bool) {
        self.fail_processing.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransactionRepository for FlakyTransactions {
    async fn insert(&self, new: NewPaymentTransaction) -> DatabaseResult<PaymentTransaction> {
        self.inner.insert(new).await
    }

    async fn find_by_id(&self, id: Uuid) -> DatabaseResult<Option<PaymentTransaction>> {
        self.inner.find_by_id(id).await
    }

    async fn find_by_idempotency_reference(
        &self,
        reference: &str,
    ) -> DatabaseResult<Option<PaymentTransaction>> {
        self.inner.find_by_idempotency_reference(reference).await
    }

    async fn find_by_provider_reference(
        &self,
        reference: &str,
    ) -> DatabaseResult<Option<PaymentTransaction>> {
        self.inner.find_by_provider_reference(reference).await
    }

    async fn find_by_linked_entity(
        &self,
        entity_id: Uuid,
    ) -> DatabaseResult<Vec<PaymentTransaction>> {
        self.inner.find_by_linked_entity(entity_id).await
    }

    async fn compare_and_set_state(
        &self,
        id: Uuid,
        from: &[TransactionState],
        to: TransactionState,
        provider_reference: Option<&str>,
    ) -> DatabaseResult<Option<PaymentTransaction>> {
        if to == TransactionState::Processing && self.fail_processing.load(Ordering::SeqCst) {
            return Err(DatabaseError::new(DatabaseErrorKind::Connection {
                message: "connection reset".to_string(),
            }));
        }
        self.inner
            .compare_and_set_state(id, from, to, provider_reference)
            .await
    }

    async fn find_stale(
        &self,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> DatabaseResult<Vec<PaymentTransaction>> {
        self.inner.find_stale(updated_before, limit).await
    }
}

/// Notification that only carries our own reference, for rows whose
/// provider reference was never stored.
pub fn webhook_body_by_idempotency(idempotency_reference: &str, status: ProviderStatus) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "idempotency_reference": idempotency_reference,
        "status": status,
    }))
    .unwrap()
}

pub fn provider_reference_for(kind: ProviderKind, idempotency_reference: &str) -> String {
    format!("{}-{}", kind, idempotency_reference)
}

pub fn webhook_body(provider_reference: &str, status: ProviderStatus) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "provider_reference": provider_reference,
        "status": status,
    }))
    .unwrap()
}

pub fn push_payer() -> PayerDetails {
    PayerDetails::Push {
        phone: "0712345678".to_string(),
        network: MobileNetwork::Mpesa,
    }
}

pub fn hosted_payer() -> PayerDetails {
    PayerDetails::Hosted {
        customer: CustomerContact {
            email: "buyer@example.com".to_string(),
            name: Some("Asha".to_string()),
        },
    }
}

/// Services wired over the in-memory store with one mock per provider family.
pub struct TestHarness {
    pub repos: Repositories,
    pub services: Services,
    pub push: Arc<MockProvider>,
    pub hosted: Arc<MockProvider>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(BillingConfig::default(), PayoutConfig::default())
    }

    pub fn with_config(billing: BillingConfig, payout: PayoutConfig) -> Self {
        Self::with_repos(Repositories::in_memory(), billing, payout)
    }

    pub fn with_repos(repos: Repositories, billing: BillingConfig, payout: PayoutConfig) -> Self {
        let push = Arc::new(MockProvider::new(ProviderKind::Push));
        let hosted = Arc::new(MockProvider::new(ProviderKind::Hosted));
        let providers = ProviderRegistry::new()
            .with_provider(push.clone())
            .with_provider(hosted.clone());
        let services = Services::new(&repos, providers, billing, payout);
        Self {
            repos,
            services,
            push,
            hosted,
        }
    }

    pub async fn create_order(&self, lines: &[(Uuid, i64)]) -> Order {
        self.repos
            .orders
            .create_order(NewOrder {
                buyer_id: Uuid::new_v4(),
                currency: "TZS".to_string(),
                lines: lines
                    .iter()
                    .map(|(seller_id, amount)| NewOrderLine {
                        seller_id: *seller_id,
                        amount: *amount,
                    })
                    .collect(),
            })
            .await
            .unwrap()
    }

    /// Delivers a signed notification for `provider_reference`.
    pub async fn deliver(
        &self,
        kind: ProviderKind,
        provider_reference: &str,
        status: ProviderStatus,
    ) -> marketplace_payments::services::reconciliation::WebhookReceipt {
        self.services
            .reconciliation
            .handle_webhook(kind, &webhook_body(provider_reference, status), VALID_SIGNATURE)
            .await
            .unwrap()
    }
}
