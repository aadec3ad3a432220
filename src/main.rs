use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rent_escrow_api::config::AppConfig;
use rent_escrow_api::database::connection::get_db_client;
use rent_escrow_api::database::MongoLedger;
use rent_escrow_api::services::reconciliation::ReconciliationSweep;
use rent_escrow_api::{build_router, build_state};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env().context("loading configuration")?;
    tracing::info!("✅ App config loaded: {}", config.get_config_info());

    let db = get_db_client(&config.database_url, &config.database_name)
        .await
        .context("connecting to MongoDB")?;

    let ledger = MongoLedger::new(&db);
    ledger
        .ensure_indexes()
        .await
        .context("creating transaction indexes")?;
    tracing::info!("✅ Transaction ledger ready");

    let app_state = build_state(&config, Arc::new(ledger)).context("initializing services")?;

    let sweep = ReconciliationSweep::new(app_state.orchestrator.clone(), &config.reconciliation);
    let sweep_handle = tokio::spawn(sweep.run());

    let app = build_router(app_state);
    let result = start_server(app, &config).await;

    sweep_handle.abort();
    result
}

async fn start_server(app: axum::Router, config: &AppConfig) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", config.host, config.port))?;

    tracing::info!("🚀 Server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("👋 Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
