mod billing;
mod config;
mod db;
mod error;
mod gateway;
mod inventory;
mod ledger;
mod lifecycle;
mod middleware;
mod models;
mod notify;
mod routes;

use std::sync::Arc;

use crate::billing::BillingEngine;
use crate::config::{Config, StoreKind};
use crate::gateway::VnPay;
use crate::inventory::InventoryEngine;
use crate::ledger::{LedgerStore, MemoryLedger, PgLedger};
use crate::lifecycle::LifecycleManager;
use crate::middleware::auth_context::hash_access_token;
use crate::models::AppState;
use crate::notify::{NotificationHub, NotificationSink};

use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use axum::http::header;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cfg = Config::from_env()?;

    let ledger: Arc<dyn LedgerStore> = match cfg.store {
        StoreKind::Postgres => {
            let url = cfg.database_url.as_deref().unwrap_or_default();
            let pool = db::connect_pg(url, cfg.db_max_connections).await?;
            db::migrate(&pool).await?;
            Arc::new(PgLedger::new(pool))
        }
        StoreKind::Memory => {
            let mem = MemoryLedger::new();
            let token = uuid::Uuid::new_v4().simple().to_string();
            let record_id = ledger::memory::seed_demo(&mem, &hash_access_token(&token)).await;
            tracing::warn!(%token, %record_id, "in-memory ledger: demo data seeded, nothing is persisted");
            Arc::new(mem)
        }
    };

    let hub = NotificationHub::new(cfg.notify_capacity);
    let sink: Arc<dyn NotificationSink> = Arc::new(hub.clone());

    if cfg.vnpay_tmn_code.is_empty() {
        tracing::warn!("VNPAY_TMN_CODE is not set, checkout links will be refused");
    }
    let vnpay = VnPay {
        tmn_code: cfg.vnpay_tmn_code.clone(),
        hash_secret: cfg.vnpay_hash_secret.clone(),
        payment_url: cfg.vnpay_payment_url.clone(),
        return_url: cfg.vnpay_return_url.clone(),
    };

    let state = AppState {
        inventory: InventoryEngine::new(ledger.clone()),
        billing: BillingEngine::new(ledger.clone(), sink.clone()),
        lifecycle: LifecycleManager::new(ledger.clone(), sink),
        ledger,
        hub,
        vnpay: Arc::new(vnpay),
        frontend_url: cfg.frontend_url.clone(),
        conflict_retries: cfg.conflict_retries,
    };

    // browser clients call the API cross-origin during development
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT]);

    let app = routes::router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    tracing::info!("Listening on http://{}", cfg.bind_addr);
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
