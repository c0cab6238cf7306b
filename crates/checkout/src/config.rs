//! Checkout configuration loaded from environment variables.

use std::time::Duration;

use domain::TaxTable;

/// Orchestrator settings.
///
/// Reads from environment variables:
/// - `CHECKOUT_SESSION_TTL_SECS`: session lifetime (default: `1800`)
/// - `CHECKOUT_SESSION_RETENTION_SECS`: how long finished sessions are kept for replays (default: `86400`)
/// - `CHECKOUT_CALL_TIMEOUT_MS`: deadline for each adapter call (default: `10000`)
/// - `CHECKOUT_PUBLISH_TIMEOUT_MS`: deadline for event publishes (default: `5000`)
/// - `CHECKOUT_BASE_URL`: public base URL for payment return links (default: `"http://localhost:8080"`)
#[derive(Debug, Clone)]
pub struct CheckoutConfig {
    pub session_ttl: chrono::Duration,
    pub session_retention: chrono::Duration,
    pub call_timeout: Duration,
    pub publish_timeout: Duration,
    pub base_url: String,
    pub tax_table: TaxTable,
}

impl CheckoutConfig {
    /// Loads configuration from environment variables with the standard tax table.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            session_ttl: env_parse("CHECKOUT_SESSION_TTL_SECS")
                .map(chrono::Duration::seconds)
                .unwrap_or(defaults.session_ttl),
            session_retention: env_parse("CHECKOUT_SESSION_RETENTION_SECS")
                .map(chrono::Duration::seconds)
                .unwrap_or(defaults.session_retention),
            call_timeout: env_parse("CHECKOUT_CALL_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.call_timeout),
            publish_timeout: env_parse("CHECKOUT_PUBLISH_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.publish_timeout),
            base_url: std::env::var("CHECKOUT_BASE_URL").unwrap_or(defaults.base_url),
            tax_table: TaxTable::standard(),
        }
    }

    /// Return URL handed to the payment gateway for a checkout.
    pub fn return_url(&self, checkout_id: impl std::fmt::Display) -> String {
        format!(
            "{}/api/checkout/{}/complete",
            self.base_url.trim_end_matches('/'),
            checkout_id
        )
    }

    pub fn with_tax_table(mut self, tax_table: TaxTable) -> Self {
        self.tax_table = tax_table;
        self
    }
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            session_ttl: chrono::Duration::minutes(30),
            session_retention: chrono::Duration::hours(24),
            call_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(5),
            base_url: "http://localhost:8080".to_string(),
            tax_table: TaxTable::new(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = CheckoutConfig::default();
        assert_eq!(config.session_ttl, chrono::Duration::minutes(30));
        assert_eq!(config.call_timeout, Duration::from_secs(10));
        assert_eq!(config.tax_table.rate_for("US"), 0);
    }

    #[test]
    fn test_return_url() {
        let config = CheckoutConfig {
            base_url: "https://shop.example.com/".to_string(),
            ..CheckoutConfig::default()
        };
        assert_eq!(
            config.return_url("abc"),
            "https://shop.example.com/api/checkout/abc/complete"
        );
    }
}
