//! Domain error types.

use common::{CurrencyError, ProductId};
use thiserror::Error;

/// Errors raised by the cart, checkout and order models.
#[derive(Debug, Error)]
pub enum DomainError {
    /// Quantity must be positive.
    #[error("Invalid quantity for product {product_id}: {quantity} (must be greater than 0)")]
    InvalidQuantity {
        product_id: ProductId,
        quantity: u32,
    },

    /// Unit price must not be negative.
    #[error("Invalid price for product {product_id}: {cents} cents")]
    InvalidPrice { product_id: ProductId, cents: i64 },

    /// A merged quantity does not fit in a `u32`.
    #[error("Quantity overflow for product {product_id}")]
    QuantityOverflow { product_id: ProductId },

    /// A line total does not fit in the money representation.
    #[error("Amount overflow for product {product_id}")]
    AmountOverflow { product_id: ProductId },

    /// The line is not in the cart.
    #[error("Line not found in cart: product {product_id}")]
    LineNotFound { product_id: ProductId },

    /// Malformed currency code.
    #[error(transparent)]
    Currency(#[from] CurrencyError),

    /// A state machine refused a transition.
    #[error("Invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },
}
