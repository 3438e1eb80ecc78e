use axum::{
    Json, Router,
    extract::{Path, State},
    routing::post,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    error::ApiError,
    inventory::DeductionResult,
    ledger::retry_on_conflict,
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState, MedicineBatch, NewBatch, Role},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/medicines/{medicine_id}/batches", post(receive_batch))
        .route("/medicines/{medicine_id}/deduct", post(deduct_stock))
}

#[derive(Debug, Deserialize)]
pub struct ReceiveBatchRequest {
    pub supplier: Option<String>,
    pub batch_code: String,
    pub quantity: i32,
    pub unit_cost: i64,
    pub expiry_date: DateTime<Utc>,
    pub received_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct DeductRequest {
    pub quantity: i32,
}

pub async fn receive_batch(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(medicine_id): Path<Uuid>,
    Json(body): Json<ReceiveBatchRequest>,
) -> Result<Json<ApiOk<MedicineBatch>>, ApiError> {
    auth.require(&[Role::Pharmacist])?;

    let batch = NewBatch {
        medicine_id,
        supplier: body.supplier,
        batch_code: body.batch_code.trim().to_string(),
        quantity: body.quantity,
        unit_cost: body.unit_cost,
        expiry_date: body.expiry_date,
        received_date: body.received_date.unwrap_or_else(Utc::now),
        received_by: Some(auth.user_id),
    };
    let stored = state.inventory.receive_batch(batch).await?;
    Ok(Json(ApiOk { data: stored }))
}

pub async fn deduct_stock(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(medicine_id): Path<Uuid>,
    Json(body): Json<DeductRequest>,
) -> Result<Json<ApiOk<DeductionResult>>, ApiError> {
    auth.require(&[Role::Pharmacist])?;

    let result = retry_on_conflict(state.conflict_retries, || {
        state.inventory.deduct(medicine_id, body.quantity)
    })
    .await?;
    Ok(Json(ApiOk { data: result }))
}
