//! Broker transport abstraction.
//!
//! The client owns reconnection, subscription replay and lock discipline; a
//! [`Broker`] only knows how to open one connection and a [`BrokerConnection`]
//! only knows how to talk over it.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_core::Stream;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::message::{Delivery, OutboundMessage};
use crate::topology::Topology;

/// Stream of deliveries from one queue. Ends when the connection goes away.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Delivery> + Send>>;

/// Opens connections to a broker.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    type Connection: BrokerConnection;

    async fn connect(&self) -> Result<Arc<Self::Connection>>;
}

/// One live broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    /// Declares the exchange, queues and bindings. Must be idempotent.
    async fn declare(&self, topology: &Topology) -> Result<()>;

    /// Publishes with `mandatory` and persistent delivery, returning once the
    /// broker confirms. A negative confirm or an unroutable return is `Rejected`.
    async fn publish(&self, exchange: &str, message: &OutboundMessage) -> Result<()>;

    /// Starts a manual-ack consumer on `queue`.
    async fn consume(&self, queue: &str) -> Result<DeliveryStream>;

    /// Token cancelled when the connection is lost or closed.
    fn closed_token(&self) -> CancellationToken;

    /// Closes the connection. Safe to call on a dead connection.
    async fn close(&self) -> Result<()>;
}
