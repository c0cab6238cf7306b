//! Message bus client for the storefront.
//!
//! [`MessageBusClient`] keeps one self-healing connection to a topic broker:
//! - publishes wait for the broker's confirm, bounded by a caller deadline
//! - subscriptions ack only after their handler succeeds and requeue otherwise
//! - on connection loss a supervisor reconnects with capped exponential
//!   backoff, redeclares the [`Topology`] and replays every subscription
//!
//! Transports implement [`Broker`]: [`AmqpBroker`] for RabbitMQ and
//! [`InMemoryBroker`] for tests and local runs.

pub mod amqp;
pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod memory;
pub mod message;
pub mod state;
pub mod topology;

pub use amqp::AmqpBroker;
pub use broker::{Broker, BrokerConnection, DeliveryStream};
pub use client::{HandlerError, MessageBus, MessageBusClient, MessageHandler};
pub use config::BusConfig;
pub use error::{BusError, Result};
pub use memory::InMemoryBroker;
pub use message::{Acknowledge, Delivery, Message, OutboundMessage};
pub use state::ConnectionState;
pub use topology::Topology;
