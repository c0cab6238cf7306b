//! Broker topology owned by the client.

/// Queue carrying `order.created` events.
pub const ORDERS: &str = "orders";
/// Queue carrying inventory adjustments.
pub const INVENTORY: &str = "inventory";
/// Queue carrying customer-facing notifications.
pub const NOTIFICATIONS: &str = "notifications";

/// The fixed set of exchange, queues and bindings declared on every connect.
///
/// Each queue is durable and bound to the topic exchange under its own name,
/// so a topic name doubles as routing key and queue name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    exchange: String,
    queues: Vec<String>,
}

impl Topology {
    /// Creates a topology with no queues.
    pub fn new(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            queues: Vec::new(),
        }
    }

    /// The storefront topology: `orders`, `inventory` and `notifications`.
    pub fn storefront(exchange: impl Into<String>) -> Self {
        Self::new(exchange)
            .with_queue(ORDERS)
            .with_queue(INVENTORY)
            .with_queue(NOTIFICATIONS)
    }

    /// Adds a durable queue bound under its own name.
    pub fn with_queue(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.queues.contains(&name) {
            self.queues.push(name);
        }
        self
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    /// Returns true if `topic` names a declared queue.
    pub fn has_topic(&self, topic: &str) -> bool {
        self.queues.iter().any(|q| q == topic)
    }
}
