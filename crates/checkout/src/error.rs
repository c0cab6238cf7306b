//! Checkout error types.

use std::time::Duration;

use common::{CartId, CheckoutId, ProductId, VariantId};
use domain::{CheckoutStatus, DomainError, Order};
use thiserror::Error;

/// Errors returned by adapters (cart store, payment gateway, inventory, ledger).
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The backing system could not be reached.
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// The backing system refused the request.
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// The record to update does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The call did not finish within its deadline.
    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    /// An order already exists for this checkout. Carries the existing order.
    #[error("Order already exists for checkout {}", .0.checkout_id)]
    DuplicateOrder(Box<Order>),

    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse classification of checkout failures, for mapping to transport responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input; nothing happened.
    Validation,
    /// Stock or product state prevents the checkout; nothing was charged.
    Conflict,
    /// The referenced record does not exist.
    NotFound,
    /// An external system is unreachable; retrying may succeed.
    Transient,
    /// Terminal for this checkout attempt.
    Fatal,
    /// The operation already ran to a terminal result.
    Replay,
}

/// Errors that can occur during checkout operations.
#[derive(Debug, Error)]
pub enum CheckoutError {
    /// Cart does not exist.
    #[error("Cart not found: {0}")]
    CartNotFound(CartId),

    /// Cart has passed its expiry.
    #[error("Cart expired: {0}")]
    CartExpired(CartId),

    /// Cart has no lines.
    #[error("Cart is empty: {0}")]
    EmptyCart(CartId),

    /// A line asks for more than is in stock.
    #[error(
        "Insufficient stock for product {product_id}: requested {requested}, available {available}"
    )]
    InsufficientStock {
        product_id: ProductId,
        variant_id: Option<VariantId>,
        requested: u32,
        available: u32,
    },

    /// A product no longer resolves in inventory.
    #[error("Product unavailable: {product_id}")]
    ProductUnavailable {
        product_id: ProductId,
        variant_id: Option<VariantId>,
    },

    /// The payment gateway could not create a payment session.
    #[error("Payment gateway error for cart {cart_id}: {source}")]
    PaymentGateway {
        cart_id: CartId,
        #[source]
        source: AdapterError,
    },

    /// Checkout session does not exist (or was evicted).
    #[error("Checkout session not found: {0}")]
    SessionNotFound(CheckoutId),

    /// Checkout session passed its expiry before completion began.
    #[error("Checkout session expired: {0}")]
    SessionExpired(CheckoutId),

    /// Checkout session already reached a terminal state.
    #[error("Checkout session {checkout_id} is already {status}")]
    SessionAlreadyTerminal {
        checkout_id: CheckoutId,
        status: CheckoutStatus,
    },

    /// No order matches the payment reference.
    #[error("Order not found for payment reference {0}")]
    OrderNotFound(String),

    /// The gateway explicitly declined the payment.
    #[error("Payment verification failed for checkout {checkout_id}: {reason}")]
    PaymentVerificationFailed {
        checkout_id: CheckoutId,
        reason: String,
    },

    /// An adapter call failed.
    #[error("{operation} failed for {key}: {source}")]
    Adapter {
        operation: &'static str,
        key: String,
        #[source]
        source: AdapterError,
    },

    /// Domain error.
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),
}

impl CheckoutError {
    /// Returns the error's taxonomy kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CheckoutError::CartExpired(_)
            | CheckoutError::EmptyCart(_)
            | CheckoutError::Domain(_) => ErrorKind::Validation,
            CheckoutError::InsufficientStock { .. }
            | CheckoutError::ProductUnavailable { .. }
            | CheckoutError::SessionExpired(_) => ErrorKind::Conflict,
            CheckoutError::CartNotFound(_)
            | CheckoutError::SessionNotFound(_)
            | CheckoutError::OrderNotFound(_) => ErrorKind::NotFound,
            CheckoutError::PaymentGateway { source, .. }
            | CheckoutError::Adapter { source, .. } => match source {
                AdapterError::Rejected(_) => ErrorKind::Fatal,
                _ => ErrorKind::Transient,
            },
            CheckoutError::PaymentVerificationFailed { .. } => ErrorKind::Fatal,
            CheckoutError::SessionAlreadyTerminal { .. } => ErrorKind::Replay,
        }
    }

    /// Returns true if the caller may retry the same call.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub(crate) fn adapter(
        operation: &'static str,
        key: impl ToString,
        source: AdapterError,
    ) -> Self {
        CheckoutError::Adapter {
            operation,
            key: key.to_string(),
            source,
        }
    }
}

/// Convenience type alias for checkout results.
pub type Result<T> = std::result::Result<T, CheckoutError>;
