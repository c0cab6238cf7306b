//! Shared identifier and value types used across the checkout crates.

pub mod money;
pub mod types;

pub use money::{Currency, CurrencyError, Money};
pub use types::{CartId, CheckoutId, OrderId, ProductId, UserId, VariantId};
