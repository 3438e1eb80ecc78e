use axum::{Json, Router, extract::State, routing::get};

use crate::error::ApiError;
use crate::models::{ApiOk, AppState};

#[derive(serde::Serialize)]
pub struct HealthData {
    pub status: &'static str,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

/// Opens and drops a ledger transaction so a dead database shows up here.
pub async fn health(State(state): State<AppState>) -> Result<Json<ApiOk<HealthData>>, ApiError> {
    drop(state.ledger.begin().await?);
    Ok(Json(ApiOk {
        data: HealthData { status: "ok" },
    }))
}
