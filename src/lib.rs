use axum::extract::State;
use axum::{http::Method, response::Json, routing::get, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub mod config;
pub mod database;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;

use config::AppConfig;
use errors::Result;
use services::directory::{HttpDirectory, HttpListingStore, IdentityDirectory};
use services::escrow::CommissionPolicy;
use services::ledger::TransactionLedger;
use services::notification_emitter::{HttpNotificationDispatcher, NotificationEmitter};
use services::orchestrator::PaymentOrchestrator;
use services::providers::{MomoProvider, OrangeMoneyProvider, ProviderRegistry};
use services::webhook_gateway::{WebhookGateway, WebhookSecrets};
use state::AppState;

/// Time allowed for one adapter operation: every attempt may take a send and a status check,
/// plus one token refresh.
pub fn call_budget(config: &AppConfig) -> Duration {
    config.provider_timeout * (2 * config.provider_max_retries + 3)
}

/// Wires the production collaborators around a ledger.
pub fn build_state(config: &AppConfig, ledger: Arc<dyn TransactionLedger>) -> Result<AppState> {
    let provider_a = MomoProvider::new(
        config.provider_a.clone(),
        config.provider_timeout,
        config.provider_max_retries,
    )?;
    let provider_b = OrangeMoneyProvider::new(
        config.provider_b.clone(),
        config.provider_timeout,
        config.provider_max_retries,
    )?;
    let providers = ProviderRegistry::new(Arc::new(provider_a), Arc::new(provider_b));

    let directory: Arc<dyn IdentityDirectory> = Arc::new(HttpDirectory::new(
        &config.identity_service_url,
        config.provider_timeout,
    )?);
    let listings = Arc::new(HttpListingStore::new(
        &config.listing_service_url,
        config.provider_timeout,
    )?);
    let dispatcher = Arc::new(HttpNotificationDispatcher::new(
        &config.notification_service_url,
        config.provider_timeout,
    )?);

    let notifier = NotificationEmitter::new(dispatcher, directory.clone());
    let commission = Arc::new(CommissionPolicy::new(config.commission_rate));

    let orchestrator =
        PaymentOrchestrator::new(ledger, providers, listings, directory, notifier, commission)
            .with_call_timeout(call_budget(config));

    let gateway = WebhookGateway::new(
        orchestrator.clone(),
        WebhookSecrets {
            provider_a: config.provider_a.webhook_secret.clone(),
            provider_b: config.provider_b.webhook_secret.clone(),
        },
        config.webhook_tolerance,
    );

    Ok(AppState::new(orchestrator, gateway))
}

pub fn build_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers(Any)
        .allow_credentials(false);

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_check))
        .nest("/api/payments", routes::payments::payment_routes())
        .nest("/api/admin", routes::payments::admin_routes())
        .nest("/webhooks", routes::webhooks::webhook_routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

async fn root_handler() -> &'static str {
    "🏠 Rent Escrow API"
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let rate = state.commission.current().await;
    Json(json!({
        "status": "ok",
        "service": "rent-escrow-api",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "commission_rate": rate.value(),
        "features": ["collections", "escrow", "disbursements", "webhooks", "reconciliation"]
    }))
}
