use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::post,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    error::ApiError,
    ledger::retry_on_conflict,
    lifecycle::CascadeSummary,
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState, EntityKind, Role},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{kind}/{id}/delete", post(delete_one))
        .route("/{kind}/{id}/restore", post(restore_one))
        .route("/{kind}/delete-many", post(delete_many))
        .route("/{kind}/restore-many", post(restore_many))
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    pub hard: bool,
}

#[derive(Debug, Deserialize)]
pub struct BulkRequest {
    pub ids: Vec<Uuid>,
    #[serde(default)]
    pub hard: bool,
}

fn kind_of(segment: &str) -> Result<EntityKind, ApiError> {
    EntityKind::from_path(segment)
        .ok_or_else(|| ApiError::NotFound("UNKNOWN_KIND", format!("no lifecycle for {segment:?}")))
}

// soft operations are open to front-desk staff; hard deletes are admin-only
fn authorize(auth: &AuthContext, hard: bool) -> Result<(), ApiError> {
    if hard {
        auth.require(&[])
    } else {
        auth.require(&[Role::Receptionist, Role::Accountant])
    }
}

pub async fn delete_one(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((kind, id)): Path<(String, Uuid)>,
    Query(q): Query<DeleteQuery>,
) -> Result<Json<ApiOk<CascadeSummary>>, ApiError> {
    let kind = kind_of(&kind)?;
    authorize(&auth, q.hard)?;

    let summary = retry_on_conflict(state.conflict_retries, || {
        state.lifecycle.delete_cascade(kind, id, q.hard)
    })
    .await?;
    tracing::info!(actor = %auth.user_id, %kind, %id, hard = q.hard, "delete requested");
    Ok(Json(ApiOk { data: summary }))
}

pub async fn restore_one(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((kind, id)): Path<(String, Uuid)>,
) -> Result<Json<ApiOk<CascadeSummary>>, ApiError> {
    let kind = kind_of(&kind)?;
    authorize(&auth, false)?;

    let summary = retry_on_conflict(state.conflict_retries, || state.lifecycle.restore_cascade(kind, id)).await?;
    tracing::info!(actor = %auth.user_id, %kind, %id, "restore requested");
    Ok(Json(ApiOk { data: summary }))
}

pub async fn delete_many(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(kind): Path<String>,
    Json(body): Json<BulkRequest>,
) -> Result<Json<ApiOk<Vec<CascadeSummary>>>, ApiError> {
    let kind = kind_of(&kind)?;
    authorize(&auth, body.hard)?;
    if body.ids.is_empty() {
        return Err(ApiError::BadRequest("VALIDATION", "ids must not be empty".into()));
    }

    let out = state.lifecycle.delete_many(kind, &body.ids, body.hard).await?;
    Ok(Json(ApiOk { data: out }))
}

pub async fn restore_many(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(kind): Path<String>,
    Json(body): Json<BulkRequest>,
) -> Result<Json<ApiOk<Vec<CascadeSummary>>>, ApiError> {
    let kind = kind_of(&kind)?;
    authorize(&auth, false)?;
    if body.ids.is_empty() {
        return Err(ApiError::BadRequest("VALIDATION", "ids must not be empty".into()));
    }

    let out = state.lifecycle.restore_many(kind, &body.ids).await?;
    Ok(Json(ApiOk { data: out }))
}
