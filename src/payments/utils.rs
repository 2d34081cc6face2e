use crate::payments::error::{PaymentError, PaymentResult};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use sha2::{Sha256, Sha512};
use std::time::Duration;
use tracing::warn;

#[derive(Clone)]
pub struct PaymentHttpClient {
    client: Client,
    provider: &'static str,
    timeout: Duration,
    max_retries: u32,
}

impl PaymentHttpClient {
    pub fn new(provider: &'static str, timeout: Duration, max_retries: u32) -> PaymentResult<Self> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            PaymentError::ProviderUnavailable {
                provider: provider.to_string(),
                message: format!("failed to initialize HTTP client: {}", e),
                retry_after_seconds: None,
            }
        })?;

        Ok(Self {
            client,
            provider,
            timeout,
            max_retries,
        })
    }

    /// Sends a JSON request. GET and HEAD are retried on transport failures,
    /// 429s and 5xx with exponential backoff. Anything else may move money,
    /// so it is only retried when the connection was never established.
    /// Other 4xx responses are business rejections and are returned
    /// immediately.
    pub async fn request_json<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        url: &str,
        bearer_token: Option<&str>,
        body: Option<&JsonValue>,
    ) -> PaymentResult<T> {
        let replayable = method == reqwest::Method::GET || method == reqwest::Method::HEAD;
        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            let mut request = self.client.request(method.clone(), url);
            request = request.timeout(self.timeout);

            if let Some(token) = bearer_token {
                request = request.bearer_auth(token);
            }
            if let Some(payload) = body {
                request = request.json(payload);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    if status.is_success() {
                        return serde_json::from_str::<T>(&text).map_err(|e| {
                            PaymentError::MalformedResponse {
                                provider: self.provider.to_string(),
                                message: format!("invalid provider JSON response: {}", e),
                            }
                        });
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        if replayable && attempt < self.max_retries {
                            warn!(
                                provider = self.provider,
                                status = %status,
                                attempt = attempt + 1,
                                "provider request throttled or failed, retrying"
                            );
                            tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                            continue;
                        }
                        return Err(PaymentError::ProviderUnavailable {
                            provider: self.provider.to_string(),
                            message: format!("HTTP {}: {}", status, text),
                            retry_after_seconds: None,
                        });
                    }

                    return Err(PaymentError::ProviderRejected {
                        provider: self.provider.to_string(),
                        message: format!("HTTP {}: {}", status, text),
                        provider_code: Some(status.as_u16().to_string()),
                    });
                }
                Err(e) => {
                    last_error = Some(PaymentError::ProviderUnavailable {
                        provider: self.provider.to_string(),
                        message: format!("provider request failed: {}", e),
                        retry_after_seconds: None,
                    });
                    if (replayable || e.is_connect()) && attempt < self.max_retries {
                        tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                        continue;
                    }
                    break;
                }
            }
        }

        Err(last_error.unwrap_or(PaymentError::ProviderUnavailable {
            provider: self.provider.to_string(),
            message: "provider request failed".to_string(),
            retry_after_seconds: None,
        }))
    }
}

pub fn hmac_sha256_hex(payload: &[u8], secret: &str) -> Option<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(payload);
    Some(hex::encode(mac.finalize().into_bytes()))
}

pub fn hmac_sha512_hex(payload: &[u8], secret: &str) -> Option<String> {
    let mut mac = Hmac::<Sha512>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(payload);
    Some(hex::encode(mac.finalize().into_bytes()))
}

pub fn verify_hmac_sha256_hex(payload: &[u8], secret: &str, signature: &str) -> bool {
    match hmac_sha256_hex(payload, secret) {
        Some(computed) => secure_eq(
            computed.as_bytes(),
            signature.trim().to_lowercase().as_bytes(),
        ),
        None => false,
    }
}

pub fn verify_hmac_sha512_hex(payload: &[u8], secret: &str, signature: &str) -> bool {
    match hmac_sha512_hex(payload, secret) {
        Some(computed) => secure_eq(
            computed.as_bytes(),
            signature.trim().to_lowercase().as_bytes(),
        ),
        None => false,
    }
}

pub fn secure_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0_u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}
