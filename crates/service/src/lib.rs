//! Checkout service wiring.
//!
//! Installs structured logging and the Prometheus exporter, then runs the
//! [`ExpireSweeper`] against a [`CheckoutOrchestrator`](checkout::CheckoutOrchestrator)
//! backed by the Postgres ledger and the AMQP message bus.

pub mod config;
pub mod error;
pub mod sweeper;

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub use config::{LogFormat, ServiceConfig};
pub use error::ServiceError;
pub use sweeper::ExpireSweeper;

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level when set.
pub fn init_tracing(format: LogFormat, default_level: &str) -> Result<(), ServiceError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (plain, json) = match format {
        LogFormat::Plain => (Some(tracing_subscriber::fmt::layer()), None),
        LogFormat::Json => (None, Some(tracing_subscriber::fmt::layer().json())),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(plain)
        .with(json)
        .try_init()
        .map_err(|e| ServiceError::Tracing(e.to_string()))
}

/// Installs the Prometheus recorder with its own scrape listener on `addr`.
pub fn install_metrics(addr: SocketAddr) -> Result<(), ServiceError> {
    let builder = PrometheusBuilder::new().with_http_listener(addr);
    builder.install()?;
    tracing::info!(%addr, "metrics exporter listening");
    Ok(())
}
