//! HTTP surface.

pub mod payments;
pub mod subscriptions;
pub mod webhooks;
pub mod withdrawals;

use crate::health::{health_handler, HealthChecker};
use crate::services::Services;
use axum::{
    http::HeaderMap,
    routing::{get, post},
    Router,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct ApiState {
    pub services: Services,
    pub health: Arc<HealthChecker>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/payments", post(payments::submit_payment))
        .route("/payments/{id}", get(payments::get_payment))
        .route("/payments/{id}/check-status", post(payments::check_status))
        .route("/webhooks/{provider_kind}", post(webhooks::handle_webhook))
        .route(
            "/sellers/{seller_id}/subscription",
            get(subscriptions::get_subscription),
        )
        .route(
            "/sellers/{seller_id}/subscription/plan",
            post(subscriptions::change_plan),
        )
        .route(
            "/sellers/{seller_id}/subscription/cancel",
            post(subscriptions::cancel_subscription),
        )
        .route(
            "/sellers/{seller_id}/withdrawals",
            post(withdrawals::request_withdrawal).get(withdrawals::list_withdrawals),
        )
        .route("/sellers/{seller_id}/balance", get(withdrawals::get_balance))
        .with_state(state)
}

pub(crate) fn request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
