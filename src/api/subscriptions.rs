use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tracing::info;
use uuid::Uuid;

use crate::api::payments::attach;
use crate::api::{request_id, ApiState};
use crate::error::AppError;
use crate::middleware::error::success_response;
use crate::services::subscription_billing::{PlanChangeKind, PlanChangeRequest};

/// GET /sellers/{seller_id}/subscription
pub async fn get_subscription(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(seller_id): Path<Uuid>,
) -> Result<Response, AppError> {
    let subscription = state
        .services
        .billing
        .get_or_default(seller_id)
        .await
        .map_err(|e| attach(AppError::from(e), &request_id(&headers)))?;
    Ok(success_response(subscription).into_response())
}

/// POST /sellers/{seller_id}/subscription/plan
pub async fn change_plan(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(seller_id): Path<Uuid>,
    Json(request): Json<PlanChangeRequest>,
) -> Result<Response, AppError> {
    let outcome = state
        .services
        .billing
        .change_plan(seller_id, request)
        .await
        .map_err(|e| attach(AppError::from(e), &request_id(&headers)))?;

    info!(seller_id = %seller_id, change = ?outcome.kind, "plan change handled");
    let status = match outcome.kind {
        PlanChangeKind::PaymentRequired => StatusCode::ACCEPTED,
        _ => StatusCode::OK,
    };
    Ok((status, success_response(outcome)).into_response())
}

/// POST /sellers/{seller_id}/subscription/cancel
pub async fn cancel_subscription(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(seller_id): Path<Uuid>,
) -> Result<Response, AppError> {
    let subscription = state
        .services
        .billing
        .cancel(seller_id)
        .await
        .map_err(|e| attach(AppError::from(e), &request_id(&headers)))?;
    Ok((StatusCode::OK, Json(subscription)).into_response())
}
