use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    billing::{CheckoutLink, FulfilledInvoice, InvoiceBalance},
    error::ApiError,
    ledger::retry_on_conflict,
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState, Role},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/invoices/from-record/{record_id}", post(create_from_record))
        .route("/invoices/{invoice_id}/balance", get(balance))
        .route("/invoices/{invoice_id}/vnpay-url", post(vnpay_url))
}

#[derive(Debug, Default, Deserialize)]
pub struct CheckoutRequest {
    pub bank_code: Option<String>,
}

pub async fn create_from_record(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(record_id): Path<Uuid>,
) -> Result<Json<ApiOk<FulfilledInvoice>>, ApiError> {
    auth.require(&[Role::Accountant, Role::Receptionist, Role::Doctor])?;

    let out = retry_on_conflict(state.conflict_retries, || {
        state.billing.create_invoice_from_record(record_id)
    })
    .await?;
    Ok(Json(ApiOk { data: out }))
}

pub async fn balance(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<ApiOk<InvoiceBalance>>, ApiError> {
    auth.require(&[Role::Accountant, Role::Receptionist])?;
    let balance = state.billing.invoice_balance(invoice_id).await?;
    Ok(Json(ApiOk { data: balance }))
}

pub async fn vnpay_url(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(invoice_id): Path<Uuid>,
    body: Option<Json<CheckoutRequest>>,
) -> Result<Json<ApiOk<CheckoutLink>>, ApiError> {
    auth.require(&[Role::Accountant, Role::Receptionist, Role::Patient])?;

    let Json(body) = body.unwrap_or_default();
    let link = state
        .billing
        .checkout_link(&state.vnpay, invoice_id, body.bank_code.as_deref())
        .await?;
    tracing::info!(%invoice_id, amount = link.amount, "vnpay checkout link issued");
    Ok(Json(ApiOk { data: link }))
}
