use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::PaymentProvider;
use crate::payments::providers::{HostedProvider, PushProvider};
use crate::payments::types::ProviderKind;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Adapters keyed by provider family. A ledger row's `provider_kind`
/// selects the adapter for initiation, status checks and webhooks.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn PaymentProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, provider: Arc<dyn PaymentProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn register(&mut self, provider: Arc<dyn PaymentProvider>) {
        self.providers.insert(provider.kind(), provider);
    }

    /// Builds every adapter whose credentials are present in the environment.
    /// A missing credential disables that family instead of failing startup.
    pub fn from_env() -> Self {
        let mut registry = Self::new();
        match PushProvider::from_env() {
            Ok(provider) => registry.register(Arc::new(provider)),
            Err(e) => warn!(error = %e, "push provider disabled"),
        }
        match HostedProvider::from_env() {
            Ok(provider) => registry.register(Arc::new(provider)),
            Err(e) => warn!(error = %e, "hosted provider disabled"),
        }
        registry
    }

    pub fn get(&self, kind: ProviderKind) -> PaymentResult<Arc<dyn PaymentProvider>> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or(PaymentError::ValidationError {
                message: format!("provider {} is not configured", kind),
                field: Some("provider_kind".to_string()),
            })
    }

    pub fn list_available(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<ProviderKind> = self.providers.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::providers::{HostedProviderConfig, PushProviderConfig};

    #[test]
    fn registry_resolves_registered_kinds_only() {
        let push = PushProvider::new(PushProviderConfig {
            api_key: "k".to_string(),
            webhook_secret: None,
            base_url: "https://push.example".to_string(),
            country_code: "255".to_string(),
            timeout_secs: 1,
            max_retries: 0,
        })
        .expect("provider init should succeed");
        let registry = ProviderRegistry::new().with_provider(Arc::new(push));

        assert!(registry.get(ProviderKind::Push).is_ok());
        assert!(registry.get(ProviderKind::Hosted).is_err());
        assert_eq!(registry.list_available(), vec![ProviderKind::Push]);

        let hosted = HostedProvider::new(HostedProviderConfig {
            secret_key: "k".to_string(),
            webhook_secret: None,
            base_url: "https://hosted.example".to_string(),
            callback_base_url: "https://shop.example".to_string(),
            checkout_title: "t".to_string(),
            timeout_secs: 1,
            max_retries: 0,
        })
        .expect("provider init should succeed");
        let registry = registry.with_provider(Arc::new(hosted));
        assert_eq!(
            registry.list_available(),
            vec![ProviderKind::Hosted, ProviderKind::Push]
        );
    }
}
