use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::api::payments::attach;
use crate::api::{request_id, ApiState};
use crate::error::AppError;
use crate::middleware::error::success_response;
use crate::services::payout::WithdrawalInput;

#[derive(Debug, Deserialize)]
pub struct BalanceQuery {
    pub currency: Option<String>,
}

/// POST /sellers/{seller_id}/withdrawals
pub async fn request_withdrawal(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(seller_id): Path<Uuid>,
    Json(input): Json<WithdrawalInput>,
) -> Result<Response, AppError> {
    let outcome = state
        .services
        .payouts
        .request_withdrawal(seller_id, input)
        .await
        .map_err(|e| attach(AppError::from(e), &request_id(&headers)))?;
    Ok((StatusCode::CREATED, success_response(outcome)).into_response())
}

/// GET /sellers/{seller_id}/withdrawals
pub async fn list_withdrawals(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(seller_id): Path<Uuid>,
) -> Result<Response, AppError> {
    let withdrawals = state
        .services
        .payouts
        .list_withdrawals(seller_id)
        .await
        .map_err(|e| attach(AppError::from(e), &request_id(&headers)))?;
    Ok(Json(withdrawals).into_response())
}

/// GET /sellers/{seller_id}/balance
pub async fn get_balance(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(seller_id): Path<Uuid>,
    Query(query): Query<BalanceQuery>,
) -> Result<Response, AppError> {
    let balance = state
        .services
        .payouts
        .balance(seller_id, query.currency.as_deref())
        .await
        .map_err(|e| attach(AppError::from(e), &request_id(&headers)))?;
    Ok(success_response(balance).into_response())
}
