//! Domain layer for the storefront checkout.
//!
//! This crate provides the records the checkout pipeline moves through:
//! - [`Cart`] with its always-consistent totals
//! - [`CheckoutSession`], the frozen view of one checkout attempt
//! - [`Order`], the ledger record created exactly once per checkout
//! - the pure totals computation driven by a [`TaxTable`]

pub mod address;
pub mod cart;
pub mod checkout;
pub mod error;
pub mod order;
pub mod tax;

pub use address::Address;
pub use cart::{Cart, CartLine};
pub use checkout::{CheckoutSession, CheckoutStatus, PaymentSessionData};
pub use error::DomainError;
pub use order::{Order, OrderLine, OrderStatus, PaymentEventKind};
pub use tax::{TaxTable, Totals, compute_totals};
