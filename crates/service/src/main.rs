//! Checkout service entry point.

use std::sync::Arc;

use checkout::CheckoutOrchestrator;
use checkout::services::{
    InMemoryCartStore, InMemoryInventoryService, InMemoryPaymentGateway, InMemorySessionStore,
    PostgresOrderLedger,
};
use checkout_service::{ExpireSweeper, ServiceConfig, ServiceError};
use messaging::{AmqpBroker, MessageBusClient};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), ServiceError> {
    let config = ServiceConfig::from_env();

    // 1. Initialize tracing and metrics
    checkout_service::init_tracing(config.log_format, &config.log_level)?;
    checkout_service::install_metrics(config.metrics_addr)?;

    // 2. Connect the order ledger
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;
    let ledger = PostgresOrderLedger::new(pool);
    ledger.run_migrations().await?;
    tracing::info!("order ledger ready");

    // 3. Connect the message bus
    let bus =
        MessageBusClient::connect(AmqpBroker::from_config(&config.bus), config.bus.clone()).await?;

    // 4. Build the orchestrator. Carts, sessions, payments and inventory are
    //    local stand-ins until their remote adapters exist.
    let orchestrator = Arc::new(CheckoutOrchestrator::new(
        InMemoryCartStore::new(),
        InMemorySessionStore::new(),
        InMemoryPaymentGateway::new(),
        InMemoryInventoryService::new(),
        ledger,
        bus.clone(),
        config.checkout.clone(),
    ));

    // 5. Sweep stale sessions until shutdown
    let shutdown = CancellationToken::new();
    let sweeper = tokio::spawn(
        ExpireSweeper::new(orchestrator, config.sweep_interval, shutdown.clone()).run(),
    );
    tracing::info!("checkout service started");

    shutdown_signal().await;
    shutdown.cancel();
    if let Err(e) = sweeper.await {
        tracing::error!(error = %e, "expire sweeper task failed");
    }
    bus.close().await;

    tracing::info!("service shut down gracefully");
    Ok(())
}
