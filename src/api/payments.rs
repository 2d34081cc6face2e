use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tracing::info;
use uuid::Uuid;

use crate::api::{request_id, ApiState};
use crate::error::AppError;
use crate::middleware::error::success_response;
use crate::services::payment_orchestrator::SubmitPaymentRequest;

/// POST /payments
pub async fn submit_payment(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<SubmitPaymentRequest>,
) -> Result<Response, AppError> {
    let request_id = request_id(&headers);
    let result = state
        .services
        .orchestrator
        .submit(request)
        .await
        .map_err(|e| attach(AppError::from(e), &request_id))?;

    info!(
        transaction_id = %result.transaction.id,
        state = %result.transaction.state,
        duplicate = result.duplicate,
        "payment submitted"
    );
    let status = if result.duplicate {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, success_response(result)).into_response())
}

/// GET /payments/{id}
pub async fn get_payment(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let transaction = state
        .services
        .orchestrator
        .get_transaction(id)
        .await
        .map_err(|e| attach(AppError::from(e), &request_id(&headers)))?;
    Ok(success_response(transaction).into_response())
}

/// POST /payments/{id}/check-status
pub async fn check_status(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let check = state
        .services
        .reconciliation
        .check_status(id)
        .await
        .map_err(|e| attach(AppError::from(e), &request_id(&headers)))?;
    Ok(success_response(check).into_response())
}

pub(crate) fn attach(error: AppError, request_id: &Option<String>) -> AppError {
    match request_id {
        Some(id) => error.with_request_id(id.clone()),
        None => error,
    }
}
