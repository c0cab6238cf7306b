//! Adapter traits for the external systems a checkout touches, with
//! in-memory implementations.

pub mod cart;
pub mod inventory;
pub mod ledger;
pub mod payment;
pub mod postgres;
pub mod sessions;

pub use cart::{CartStore, InMemoryCartStore};
pub use inventory::{InMemoryInventoryService, InventoryService, PriceAndStock};
pub use ledger::{InMemoryOrderLedger, OrderLedger};
pub use payment::{
    InMemoryPaymentGateway, PaymentGateway, PaymentProof, PaymentSessionRequest,
    PaymentVerification,
};
pub use postgres::PostgresOrderLedger;
pub use sessions::{InMemorySessionStore, SessionStore};
