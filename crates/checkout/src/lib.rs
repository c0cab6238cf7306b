//! Checkout orchestration for the storefront.
//!
//! The [`CheckoutOrchestrator`] turns a cart into a paid order in two calls:
//! 1. `initiate_checkout` re-prices the cart against inventory, freezes the
//!    totals and opens a hosted payment session
//! 2. `complete_checkout` verifies the payment, records the order under the
//!    checkout's idempotency key, then decrements stock and publishes
//!    `order.created`
//!
//! Payment notifications arriving later are applied with `on_payment_event`,
//! and `expire_sweep` retires sessions nobody paid for.
//!
//! Every external system sits behind a trait in [`services`], with an
//! in-memory implementation for tests and a Postgres order ledger.

pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod services;

pub use config::CheckoutConfig;
pub use error::{AdapterError, CheckoutError, ErrorKind, Result};
pub use orchestrator::CheckoutOrchestrator;
