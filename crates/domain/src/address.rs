use serde::{Deserialize, Serialize};

/// Postal address captured at checkout time for shipping or billing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub name: String,
    pub street: String,
    pub city: String,
    pub region: Option<String>,
    pub postal_code: String,
    /// ISO-3166 alpha-2 country code; keys the tax table.
    pub country: String,
}

impl Address {
    /// Creates an address without a region.
    pub fn new(
        name: impl Into<String>,
        street: impl Into<String>,
        city: impl Into<String>,
        postal_code: impl Into<String>,
        country: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            street: street.into(),
            city: city.into(),
            region: None,
            postal_code: postal_code.into(),
            country: country.into(),
        }
    }

    /// Sets the state/province.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }
}
