//! Service startup error types.

use messaging::BusError;
use thiserror::Error;

/// Errors that stop the service from starting.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The log subscriber could not be installed.
    #[error("Tracing setup failed: {0}")]
    Tracing(String),

    /// The Prometheus exporter could not be installed.
    #[error("Metrics setup failed: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    /// The ledger database is unreachable.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Ledger migrations failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// The message bus never came up.
    #[error("Message bus error: {0}")]
    Bus(#[from] BusError),
}
