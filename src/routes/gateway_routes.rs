//! Browser return and server-to-server IPN from VNPay. Neither carries a
//! session; the HMAC signature is the authentication.

use std::collections::BTreeMap;

use axum::{
    Json, Router,
    extract::{Query, State},
    response::Redirect,
    routing::get,
};
use serde::Serialize;

use crate::{
    billing::{CallbackChannel, CallbackOutcome, GatewayCallback},
    gateway::{GatewayError, response_message},
    ledger::{LedgerError, retry_on_conflict},
    models::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/payments/vnpay-return", get(vnpay_return))
        .route("/payments/vnpay-ipn", get(vnpay_ipn))
}

#[derive(Debug, Serialize)]
pub struct IpnReply {
    #[serde(rename = "RspCode")]
    pub rsp_code: &'static str,
    #[serde(rename = "Message")]
    pub message: &'static str,
}

fn reply(rsp_code: &'static str, message: &'static str) -> Json<IpnReply> {
    Json(IpnReply { rsp_code, message })
}

async fn reconcile(
    state: &AppState,
    query: &BTreeMap<String, String>,
    channel: CallbackChannel,
) -> Result<CallbackOutcome, CallbackFailure> {
    let verified = state.vnpay.verify(query).map_err(CallbackFailure::Gateway)?;
    tracing::info!(
        order = %verified.order_id,
        channel = ?channel,
        transaction_no = ?verified.transaction_no,
        bank = ?verified.bank_code,
        pay_date = ?verified.pay_date,
        "vnpay callback verified"
    );
    let cb = GatewayCallback {
        order_id: verified.order_id,
        amount: verified.amount,
        response_code: verified.response_code,
        transaction_status: verified.transaction_status,
        channel,
    };
    let result = retry_on_conflict(state.conflict_retries, || {
        state.billing.reconcile_gateway_callback(cb.clone())
    })
    .await
    .map_err(CallbackFailure::Ledger)?;
    Ok(result.outcome)
}

enum CallbackFailure {
    Gateway(GatewayError),
    Ledger(LedgerError),
}

pub async fn vnpay_return(
    State(state): State<AppState>,
    Query(query): Query<BTreeMap<String, String>>,
) -> Redirect {
    let order = query.get("vnp_TxnRef").map(String::as_str).unwrap_or("unknown");
    let outcome = match reconcile(&state, &query, CallbackChannel::Return).await {
        Ok(CallbackOutcome::Applied | CallbackOutcome::Duplicate) => "success",
        Ok(CallbackOutcome::Declined) => {
            let code = query.get("vnp_ResponseCode").map(String::as_str).unwrap_or("");
            tracing::info!(order, code, reason = response_message(code), "vnpay return declined");
            "failed"
        }
        Err(CallbackFailure::Gateway(e)) => {
            tracing::warn!(order, error = %e, "vnpay return rejected");
            "failed"
        }
        Err(CallbackFailure::Ledger(e)) => {
            tracing::warn!(order, error = %e, "vnpay return could not be applied");
            "failed"
        }
    };
    Redirect::to(&format!(
        "{}/dashboard/invoices/{}?payment={}",
        state.frontend_url.trim_end_matches('/'),
        urlencoding::encode(order),
        outcome
    ))
}

pub async fn vnpay_ipn(
    State(state): State<AppState>,
    Query(query): Query<BTreeMap<String, String>>,
) -> Json<IpnReply> {
    match reconcile(&state, &query, CallbackChannel::Ipn).await {
        Ok(_) => reply("00", "Confirm Success"),
        Err(CallbackFailure::Gateway(GatewayError::InvalidSignature)) => reply("97", "Invalid signature"),
        Err(CallbackFailure::Gateway(GatewayError::InvalidAmount(_)))
        | Err(CallbackFailure::Ledger(LedgerError::Overpayment { .. })) => reply("04", "Invalid amount"),
        Err(CallbackFailure::Ledger(LedgerError::NotFound(_) | LedgerError::Validation(_))) => {
            reply("01", "Order not found")
        }
        Err(CallbackFailure::Gateway(e)) => {
            tracing::warn!(error = %e, "vnpay ipn rejected");
            reply("99", "Unknown error")
        }
        Err(CallbackFailure::Ledger(e)) => {
            tracing::error!(error = %e, "vnpay ipn failed");
            reply("99", "Unknown error")
        }
    }
}
