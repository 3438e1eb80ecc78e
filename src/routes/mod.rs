use crate::models::AppState;
use axum::Router;

pub mod gateway_routes;
pub mod health_routes;
pub mod inventory_routes;
pub mod invoice_routes;
pub mod lifecycle_routes;
pub mod notification_routes;
pub mod payment_routes;

pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", inventory_routes::router())
        .nest("/api/v1", invoice_routes::router())
        .nest("/api/v1", payment_routes::router())
        .nest("/api/v1", gateway_routes::router())
        .nest("/api/v1", notification_routes::router())
        .nest("/api/v1/lifecycle", lifecycle_routes::router())
        .merge(health_routes::router())
        .with_state(state)
}
