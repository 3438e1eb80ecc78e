use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{patch, post},
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    billing::{PaymentReceipt, PaymentRequest},
    error::ApiError,
    ledger::retry_on_conflict,
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState, Role},
};

const CASHIERS: &[Role] = &[Role::Accountant, Role::Receptionist];

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/payments", post(create_payment))
        .route("/payments/{payment_id}", patch(update_payment))
        .route("/payments/{payment_id}/remove", post(remove_payment))
        .route("/payments/{payment_id}/restore", post(restore_payment))
}

#[derive(Debug, Deserialize)]
pub struct UpdatePaymentRequest {
    pub amount: i64,
}

pub async fn create_payment(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(body): Json<PaymentRequest>,
) -> Result<Json<ApiOk<PaymentReceipt>>, ApiError> {
    auth.require(CASHIERS)?;
    let receipt = retry_on_conflict(state.conflict_retries, || {
        state.billing.create_payment(body.clone())
    })
    .await?;
    Ok(Json(ApiOk { data: receipt }))
}

pub async fn update_payment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(payment_id): Path<Uuid>,
    Json(body): Json<UpdatePaymentRequest>,
) -> Result<Json<ApiOk<PaymentReceipt>>, ApiError> {
    auth.require(CASHIERS)?;
    let receipt = retry_on_conflict(state.conflict_retries, || {
        state.billing.update_payment(payment_id, body.amount)
    })
    .await?;
    Ok(Json(ApiOk { data: receipt }))
}

pub async fn remove_payment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(payment_id): Path<Uuid>,
) -> Result<Json<ApiOk<PaymentReceipt>>, ApiError> {
    auth.require(CASHIERS)?;
    let receipt = retry_on_conflict(state.conflict_retries, || state.billing.remove_payment(payment_id)).await?;
    Ok(Json(ApiOk { data: receipt }))
}

pub async fn restore_payment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(payment_id): Path<Uuid>,
) -> Result<Json<ApiOk<PaymentReceipt>>, ApiError> {
    auth.require(CASHIERS)?;
    let receipt = retry_on_conflict(state.conflict_retries, || state.billing.restore_payment(payment_id)).await?;
    Ok(Json(ApiOk { data: receipt }))
}
