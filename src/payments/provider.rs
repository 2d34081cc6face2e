use crate::payments::error::PaymentResult;
use crate::payments::types::{
    InitiateRequest, InitiateResponse, PayerDetails, ProviderKind, ProviderStatus, WebhookEvent,
    WebhookVerificationResult,
};
use async_trait::async_trait;

/// Contract shared by every money-movement provider.
///
/// Provider quirks (handle normalization, redirect URL construction, payload
/// formats, signature schemes) stay inside the implementation so the
/// orchestrator and reconciliation never branch on the provider family.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Synchronous format check run before any ledger row exists.
    fn validate_payer(&self, payer: &PayerDetails) -> PaymentResult<()>;

    /// Starts the payment. Returns once the provider has accepted the request;
    /// the payer acts out-of-band afterwards.
    async fn initiate(&self, request: InitiateRequest) -> PaymentResult<InitiateResponse>;

    async fn check_status(&self, provider_reference: &str) -> PaymentResult<ProviderStatus>;

    fn verify_webhook(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> PaymentResult<WebhookVerificationResult>;

    fn parse_webhook_event(&self, payload: &[u8]) -> PaymentResult<WebhookEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::error::PaymentError;
    use crate::payments::types::{CustomerContact, Money, PaymentPurpose};

    struct MockProvider;

    #[async_trait]
    impl PaymentProvider for MockProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Hosted
        }

        fn validate_payer(&self, payer: &PayerDetails) -> PaymentResult<()> {
            match payer {
                PayerDetails::Hosted { .. } => Ok(()),
                PayerDetails::Push { phone, .. } => Err(PaymentError::InvalidPayerHandle {
                    handle: phone.clone(),
                    reason: "hosted checkout needs a customer".to_string(),
                }),
            }
        }

        async fn initiate(&self, request: InitiateRequest) -> PaymentResult<InitiateResponse> {
            Ok(InitiateResponse {
                provider_reference: format!("mock-{}", request.idempotency_reference),
                checkout_url: Some("https://example.com/pay".to_string()),
                provider_data: None,
            })
        }

        async fn check_status(&self, _provider_reference: &str) -> PaymentResult<ProviderStatus> {
            Ok(ProviderStatus::Successful)
        }

        fn verify_webhook(
            &self,
            _payload: &[u8],
            _signature: &str,
        ) -> PaymentResult<WebhookVerificationResult> {
            Ok(WebhookVerificationResult {
                valid: true,
                reason: None,
            })
        }

        fn parse_webhook_event(&self, _payload: &[u8]) -> PaymentResult<WebhookEvent> {
            Ok(WebhookEvent {
                provider: ProviderKind::Hosted,
                event_type: "mock".to_string(),
                provider_reference: Some("mock-ref".to_string()),
                idempotency_reference: None,
                status: ProviderStatus::Successful,
                occurred_at: None,
                payload: serde_json::json!({}),
            })
        }
    }

    #[tokio::test]
    async fn trait_can_be_implemented_by_mock_provider() {
        let provider: Box<dyn PaymentProvider> = Box::new(MockProvider);
        let payer = PayerDetails::Hosted {
            customer: CustomerContact {
                email: "buyer@example.com".to_string(),
                name: None,
            },
        };
        provider
            .validate_payer(&payer)
            .expect("hosted payer should validate");

        let response = provider
            .initiate(InitiateRequest {
                amount: Money::new(1000, "TZS"),
                purpose: PaymentPurpose::TestPayment,
                idempotency_reference: "tst-1".to_string(),
                description: "test".to_string(),
                payer,
                metadata: None,
            })
            .await
            .expect("initiation should succeed");
        assert_eq!(response.provider_reference, "mock-tst-1");
        assert!(response.checkout_url.is_some());

        let status = provider
            .check_status(&response.provider_reference)
            .await
            .expect("status check should succeed");
        assert!(status.is_terminal());
    }
}
