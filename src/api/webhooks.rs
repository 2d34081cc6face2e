use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::str::FromStr;
use tracing::{error, info, warn};

use crate::api::ApiState;
use crate::error::AppError;
use crate::payments::types::ProviderKind;

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// POST /webhooks/{provider_kind}
///
/// Unverifiable or unmatched notifications are acknowledged with
/// `{"status": "ignored"}` so providers stop redelivering them.
pub async fn handle_webhook(
    State(state): State<ApiState>,
    Path(provider_kind): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let kind = match ProviderKind::from_str(&provider_kind) {
        Ok(kind) => kind,
        Err(e) => {
            warn!(provider = %provider_kind, "webhook for unknown provider");
            return AppError::from(e).into_response();
        }
    };
    info!(provider = %kind, bytes = body.len(), "Received webhook");

    let Some(signature) = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
    else {
        warn!(provider = %kind, "Missing webhook signature");
        return ignored();
    };

    match state
        .services
        .reconciliation
        .handle_webhook(kind, &body, signature)
        .await
    {
        Ok(receipt) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ok",
                "outcome": receipt.outcome,
                "transaction_id": receipt.transaction_id,
                "state": receipt.state,
            })),
        )
            .into_response(),
        Err(e) if e.is_ignorable() => {
            info!(provider = %kind, error = %e, "Webhook ignored");
            ignored()
        }
        Err(e) => {
            // Anything else is worth a redelivery.
            error!(provider = %kind, error = %e, "Webhook processing failed");
            AppError::from(e).into_response()
        }
    }
}

fn ignored() -> Response {
    (
        StatusCode::OK,
        Json(serde_json::json!({"status": "ignored"})),
    )
        .into_response()
}
