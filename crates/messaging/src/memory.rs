//! In-memory broker for tests and local runs.
//!
//! Models the parts of a topic broker the client depends on: durable queues
//! bound to a topic exchange, publisher confirms, manual acknowledgement with
//! requeue, and connection loss. Fault switches let tests simulate an
//! unreachable broker, negative confirms and confirms that never arrive.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, BrokerConnection, DeliveryStream};
use crate::error::{BusError, Result};
use crate::message::{Acknowledge, Delivery, OutboundMessage};
use crate::topology::Topology;

type ConnectionId = u64;
type DeliveryTag = u64;

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug)]
struct Consumer {
    connection: ConnectionId,
    sender: mpsc::UnboundedSender<Delivery>,
}

#[derive(Debug, Default)]
struct Queue {
    ready: VecDeque<StoredMessage>,
    consumers: Vec<Consumer>,
    unacked: HashMap<DeliveryTag, (ConnectionId, StoredMessage)>,
    next_consumer: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    pattern: String,
    queue: String,
}

impl Binding {
    fn routes(&self, exchange: &str, routing_key: &str) -> bool {
        self.exchange == exchange && topic_matches(&self.pattern, routing_key)
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashSet<String>,
    bindings: Vec<Binding>,
    queues: HashMap<String, Queue>,
    connections: HashMap<ConnectionId, CancellationToken>,
    published: HashMap<String, usize>,
    next_connection: ConnectionId,
    next_tag: DeliveryTag,
    connect_attempts: u32,
    unavailable: bool,
    reject_publishes: bool,
    stall_confirms: bool,
}

impl BrokerState {
    /// Hands ready messages to consumers, round-robin.
    fn pump(&mut self, queue_name: &str, state: &Weak<Mutex<BrokerState>>) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };
        while !queue.consumers.is_empty() {
            let Some(message) = queue.ready.pop_front() else {
                break;
            };
            let index = queue.next_consumer % queue.consumers.len();
            let tag = self.next_tag;
            self.next_tag += 1;

            let acker = MemoryAcker {
                state: state.clone(),
                queue: queue_name.to_string(),
                tag,
            };
            let delivery =
                Delivery::new(message.body.clone(), message.redelivered, Box::new(acker));
            let consumer = &queue.consumers[index];
            let connection = consumer.connection;
            if consumer.sender.send(delivery).is_err() {
                // Receiver is gone; drop the consumer and retry the message.
                queue.consumers.remove(index);
                queue.ready.push_front(message);
                continue;
            }
            queue.unacked.insert(tag, (connection, message));
            queue.next_consumer = index + 1;
        }
    }

    /// Removes a connection, its consumers, and requeues its unacked messages.
    fn disconnect(&mut self, id: ConnectionId) -> Vec<String> {
        if let Some(token) = self.connections.remove(&id) {
            token.cancel();
        }
        let mut touched = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            queue.consumers.retain(|c| c.connection != id);

            let mut returned: Vec<(DeliveryTag, StoredMessage)> = queue
                .unacked
                .iter()
                .filter(|(_, (conn, _))| *conn == id)
                .map(|(tag, (_, message))| (*tag, message.clone()))
                .collect();
            if returned.is_empty() {
                continue;
            }
            returned.sort_by_key(|(tag, _)| *tag);
            for (tag, _) in &returned {
                queue.unacked.remove(tag);
            }
            for (_, mut message) in returned.into_iter().rev() {
                message.redelivered = true;
                queue.ready.push_front(message);
            }
            touched.push(name.clone());
        }
        touched
    }
}

/// Matches an AMQP topic binding pattern (`*` one word, `#` zero or more).
fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory broker shared between the client under test and the test body.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    /// Creates a new, reachable broker with no topology.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes new connection attempts fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.state).unavailable = unavailable;
    }

    /// Makes the broker negatively confirm every publish.
    pub fn set_reject_publishes(&self, reject: bool) {
        lock(&self.state).reject_publishes = reject;
    }

    /// Makes publishes wait forever for a confirm.
    pub fn set_stall_confirms(&self, stall: bool) {
        lock(&self.state).stall_confirms = stall;
    }

    /// Severs every live connection, as a network fault would.
    pub fn drop_connections(&self) {
        let weak = Arc::downgrade(&self.state);
        let mut state = lock(&self.state);
        let ids: Vec<ConnectionId> = state.connections.keys().copied().collect();
        for id in ids {
            for queue in state.disconnect(id) {
                state.pump(&queue, &weak);
            }
        }
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        lock(&self.state).connections.len()
    }

    /// Number of connection attempts, successful or not.
    pub fn connect_attempts(&self) -> u32 {
        lock(&self.state).connect_attempts
    }

    /// Messages waiting in `queue` for a consumer.
    pub fn queue_depth(&self, queue: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Messages delivered from `queue` and not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }

    /// Number of confirmed publishes with `routing_key`.
    pub fn published_count(&self, routing_key: &str) -> usize {
        lock(&self.state)
            .published
            .get(routing_key)
            .copied()
            .unwrap_or(0)
    }

    /// Returns true if `queue` has been declared.
    pub fn has_queue(&self, queue: &str) -> bool {
        lock(&self.state).queues.contains_key(queue)
    }

    /// Places raw bytes directly on a queue, bypassing the exchange.
    pub fn inject(&self, queue: &str, body: Vec<u8>) {
        let weak = Arc::downgrade(&self.state);
        let mut state = lock(&self.state);
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(StoredMessage {
                body,
                redelivered: false,
            });
        state.pump(queue, &weak);
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<Arc<MemoryConnection>> {
        let mut state = lock(&self.state);
        state.connect_attempts += 1;
        if state.unavailable {
            return Err(BusError::Transport("connection refused".to_string()));
        }
        let id = state.next_connection;
        state.next_connection += 1;
        let token = CancellationToken::new();
        state.connections.insert(id, token.clone());
        Ok(Arc::new(MemoryConnection {
            id,
            state: self.state.clone(),
            token,
        }))
    }
}

/// A connection to an [`InMemoryBroker`].
#[derive(Debug)]
pub struct MemoryConnection {
    id: ConnectionId,
    state: Arc<Mutex<BrokerState>>,
    token: CancellationToken,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(BusError::Transport("connection closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn declare(&self, topology: &Topology) -> Result<()> {
        self.ensure_open()?;
        let mut state = lock(&self.state);
        state.exchanges.insert(topology.exchange().to_string());
        for queue in topology.queues() {
            state.queues.entry(queue.clone()).or_default();
            let binding = Binding {
                exchange: topology.exchange().to_string(),
                pattern: queue.clone(),
                queue: queue.clone(),
            };
            if !state.bindings.contains(&binding) {
                state.bindings.push(binding);
            }
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, message: &OutboundMessage) -> Result<()> {
        self.ensure_open()?;
        let stall = {
            let weak = Arc::downgrade(&self.state);
            let mut state = lock(&self.state);
            if !state.exchanges.contains(exchange) {
                return Err(BusError::Rejected(format!("no exchange '{exchange}'")));
            }
            if state.reject_publishes {
                return Err(BusError::Rejected("broker nack".to_string()));
            }
            if state.stall_confirms {
                true
            } else {
                let targets: Vec<String> = state
                    .bindings
                    .iter()
                    .filter(|b| b.routes(exchange, &message.routing_key))
                    .map(|b| b.queue.clone())
                    .collect();
                if targets.is_empty() {
                    return Err(BusError::Rejected(format!(
                        "unroutable message for '{}'",
                        message.routing_key
                    )));
                }
                for queue in &targets {
                    if let Some(q) = state.queues.get_mut(queue) {
                        q.ready.push_back(StoredMessage {
                            body: message.body.clone(),
                            redelivered: false,
                        });
                    }
                    state.pump(queue, &weak);
                }
                *state
                    .published
                    .entry(message.routing_key.clone())
                    .or_default() += 1;
                false
            }
        };

        if stall {
            // The confirm never arrives; the connection dying is the only way out.
            self.token.cancelled().await;
            return Err(BusError::Transport("connection lost awaiting confirm".to_string()));
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let weak = Arc::downgrade(&self.state);
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = lock(&self.state);
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BusError::Transport(format!("NOT_FOUND - no queue '{queue}'")))?;
            q.consumers.push(Consumer {
                connection: self.id,
                sender: tx,
            });
            state.pump(queue, &weak);
        }
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        });
        Ok(Box::pin(stream))
    }

    fn closed_token(&self) -> CancellationToken {
        self.token.clone()
    }

    async fn close(&self) -> Result<()> {
        let weak = Arc::downgrade(&self.state);
        let mut state = lock(&self.state);
        for queue in state.disconnect(self.id) {
            state.pump(&queue, &weak);
        }
        self.token.cancel();
        Ok(())
    }
}

struct MemoryAcker {
    state: Weak<Mutex<BrokerState>>,
    queue: String,
    tag: DeliveryTag,
}

impl MemoryAcker {
    fn settle(&self, requeue: Option<bool>) -> Result<()> {
        let state = self
            .state
            .upgrade()
            .ok_or_else(|| BusError::Transport("broker gone".to_string()))?;
        let mut guard = lock(&state);
        let queue = guard
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| BusError::Transport(format!("no queue '{}'", self.queue)))?;
        let (_, mut message) = queue
            .unacked
            .remove(&self.tag)
            .ok_or_else(|| BusError::Transport(format!("unknown delivery tag {}", self.tag)))?;
        if requeue == Some(true) {
            message.redelivered = true;
            queue.ready.push_front(message);
            guard.pump(&self.queue, &self.state);
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle(None)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.settle(Some(requeue))
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;
    use crate::message::Message;

    fn outbound(topic: &str) -> OutboundMessage {
        OutboundMessage::from_message(topic, &Message::new("test", serde_json::json!({"n": 1})))
            .unwrap()
    }

    async fn connected() -> (InMemoryBroker, Arc<MemoryConnection>) {
        let broker = InMemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        conn.declare(&Topology::storefront("ecommerce"))
            .await
            .unwrap();
        (broker, conn)
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("orders", "orders"));
        assert!(!topic_matches("orders", "inventory"));
        assert!(topic_matches("order.*", "order.created"));
        assert!(!topic_matches("order.*", "order.created.v2"));
        assert!(topic_matches("order.#", "order.created.v2"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("order.#", "order"));
    }

    #[tokio::test]
    async fn test_publish_routes_to_bound_queue() {
        let (broker, conn) = connected().await;
        conn.publish("ecommerce", &outbound("orders"))
            .await
            .unwrap();

        assert_eq!(broker.queue_depth("orders"), 1);
        assert_eq!(broker.queue_depth("inventory"), 0);
        assert_eq!(broker.published_count("orders"), 1);
    }

    #[tokio::test]
    async fn test_unroutable_publish_is_rejected() {
        let (_broker, conn) = connected().await;
        let result = conn.publish("ecommerce", &outbound("payments")).await;
        assert!(matches!(result, Err(BusError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_nack_requeue_redelivers() {
        let (broker, conn) = connected().await;
        let mut stream = conn.consume("orders").await.unwrap();
        conn.publish("ecommerce", &outbound("orders"))
            .await
            .unwrap();

        let first = stream.next().await.unwrap();
        assert!(!first.redelivered);
        assert_eq!(broker.unacked_count("orders"), 1);
        first.nack(true).await.unwrap();

        let second = stream.next().await.unwrap();
        assert!(second.redelivered);
        second.ack().await.unwrap();
        assert_eq!(broker.unacked_count("orders"), 0);
        assert_eq!(broker.queue_depth("orders"), 0);
    }

    #[tokio::test]
    async fn test_drop_requeues_unacked_and_ends_streams() {
        let (broker, conn) = connected().await;
        let mut stream = conn.consume("orders").await.unwrap();
        conn.publish("ecommerce", &outbound("orders"))
            .await
            .unwrap();
        let delivery = stream.next().await.unwrap();

        broker.drop_connections();

        assert!(conn.closed_token().is_cancelled());
        assert!(stream.next().await.is_none());
        assert_eq!(broker.queue_depth("orders"), 1);
        assert_eq!(broker.connection_count(), 0);
        assert!(delivery.ack().await.is_err());
        assert!(conn.publish("ecommerce", &outbound("orders")).await.is_err());
    }

    #[tokio::test]
    async fn test_unavailable_broker_refuses_connections() {
        let broker = InMemoryBroker::new();
        broker.set_unavailable(true);
        assert!(broker.connect().await.is_err());
        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(broker.connection_count(), 0);
    }
}
