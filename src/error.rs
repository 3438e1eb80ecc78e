use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::gateway::GatewayError;
use crate::ledger::LedgerError;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorObject,
}

#[derive(Debug, Serialize)]
pub struct ErrorObject {
    pub code: String,
    pub message: String,
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized(&'static str, String),
    Forbidden(&'static str, String),
    BadRequest(&'static str, String),
    NotFound(&'static str, String),
    Conflict(&'static str, String),
    Internal(String),
}

impl ApiError {
    pub fn session_expired() -> Self {
        ApiError::Unauthorized("SESSION_EXPIRED", "Session expired".into())
    }

    pub fn forbidden() -> Self {
        ApiError::Forbidden("FORBIDDEN", "Your role is not allowed to do this".into())
    }

    fn to_error_response(code: &str, message: &str) -> Json<ErrorResponse> {
        Json(ErrorResponse {
            error: ErrorObject {
                code: code.to_string(),
                message: message.to_string(),
            },
        })
    }
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Validation(msg) => ApiError::BadRequest("VALIDATION", msg),
            LedgerError::Overpayment { .. } => ApiError::BadRequest("OVERPAYMENT", e.to_string()),
            LedgerError::Guard(msg) => ApiError::BadRequest("NOT_ALLOWED", msg),
            LedgerError::NotFound(msg) => ApiError::NotFound("NOT_FOUND", msg),
            LedgerError::Conflict(msg) => ApiError::Conflict("CONFLICT", msg),
            LedgerError::Store(msg) => {
                tracing::error!(error = %msg, "ledger store failure");
                ApiError::Internal(msg)
            }
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::NotConfigured(_) => {
                tracing::error!(error = %e, "payment gateway misconfigured");
                ApiError::Internal(e.to_string())
            }
            GatewayError::InvalidSignature => ApiError::BadRequest("INVALID_SIGNATURE", e.to_string()),
            GatewayError::MissingField(_) | GatewayError::InvalidAmount(_) => {
                ApiError::BadRequest("INVALID_CALLBACK", e.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, msg) = match self {
            ApiError::Unauthorized(code, msg) => (StatusCode::UNAUTHORIZED, code, msg),
            ApiError::Forbidden(code, msg) => (StatusCode::FORBIDDEN, code, msg),
            ApiError::BadRequest(code, msg) => (StatusCode::BAD_REQUEST, code, msg),
            ApiError::NotFound(code, msg) => (StatusCode::NOT_FOUND, code, msg),
            ApiError::Conflict(code, msg) => (StatusCode::CONFLICT, code, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", msg),
        };
        (status, ApiError::to_error_response(code, &msg)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_errors_map_to_statuses() {
        let cases = [
            (LedgerError::validation("bad"), StatusCode::BAD_REQUEST),
            (
                LedgerError::Overpayment {
                    amount: 600_000,
                    remaining: 500_000,
                },
                StatusCode::BAD_REQUEST,
            ),
            (LedgerError::Guard("no".into()), StatusCode::BAD_REQUEST),
            (LedgerError::not_found("gone"), StatusCode::NOT_FOUND),
            (LedgerError::Conflict("busy".into()), StatusCode::CONFLICT),
            (LedgerError::Store("down".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), status);
        }
    }
}
