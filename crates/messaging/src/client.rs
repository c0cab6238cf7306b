//! Self-healing message bus client.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use backon::BackoffBuilder;
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, BrokerConnection, DeliveryStream};
use crate::config::BusConfig;
use crate::error::{BusError, Result};
use crate::message::{Message, OutboundMessage};
use crate::state::ConnectionState;
use crate::topology::Topology;

/// Error type handlers may return. Any error requeues the message.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Processes messages delivered on a subscribed topic.
///
/// Delivery is at-least-once, so handlers must be idempotent.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: Message) -> std::result::Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: Message) -> std::result::Result<(), HandlerError> {
        (self)(message).await
    }
}

/// Publish/subscribe operations exposed to the rest of the system.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publishes and waits for the broker's confirm, up to `deadline`.
    async fn publish(&self, topic: &str, message: Message, deadline: Duration) -> Result<()>;

    /// Registers `handler` for `topic`. Survives reconnects.
    async fn subscribe(&self, topic: &str, handler: Arc<dyn MessageHandler>) -> Result<()>;

    /// Shuts the client down. Idempotent.
    async fn close(&self);
}

struct Shared<C> {
    state: ConnectionState,
    connection: Option<Arc<C>>,
    /// Bumped on every successful connect.
    generation: u64,
    subscriptions: HashMap<String, Arc<dyn MessageHandler>>,
}

struct Inner<B: Broker> {
    broker: B,
    config: BusConfig,
    topology: Topology,
    shared: Mutex<Shared<B::Connection>>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
}

/// A single long-lived broker connection with automatic recovery.
///
/// All connection state lives behind one mutex that is only held for state
/// transitions, never across a network call. A background supervisor watches
/// the connection and, when it drops, reconnects with capped exponential
/// backoff, redeclares the topology and replays every subscription.
pub struct MessageBusClient<B: Broker> {
    inner: Arc<Inner<B>>,
}

impl<B: Broker> Clone for MessageBusClient<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Broker> MessageBusClient<B> {
    /// Connects using the storefront topology on `config.exchange`.
    ///
    /// Retries up to `config.connect_retries` times at `config.connect_interval`
    /// and fails with [`BusError::StartupFailed`] if the broker stays unreachable.
    pub async fn connect(broker: B, config: BusConfig) -> Result<Self> {
        let topology = Topology::storefront(config.exchange.clone());
        Self::connect_with_topology(broker, config, topology).await
    }

    /// Connects declaring a custom topology.
    #[tracing::instrument(skip_all, fields(exchange = %topology.exchange()))]
    pub async fn connect_with_topology(
        broker: B,
        config: BusConfig,
        topology: Topology,
    ) -> Result<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let inner = Arc::new(Inner {
            broker,
            config,
            topology,
            shared: Mutex::new(Shared {
                state: ConnectionState::Disconnected,
                connection: None,
                generation: 0,
                subscriptions: HashMap::new(),
            }),
            state_tx,
            shutdown: CancellationToken::new(),
        });

        let attempts = inner.config.connect_retries.max(1);
        let mut last_error = BusError::NotConnected;
        for attempt in 1..=attempts {
            match inner.establish().await {
                Ok(closed) => {
                    tracing::info!(attempt, "connected to message broker");
                    tokio::spawn(supervise(Arc::clone(&inner), closed));
                    return Ok(Self { inner });
                }
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        attempts,
                        error = %e,
                        "broker connection attempt failed"
                    );
                    last_error = e;
                }
            }
            if attempt < attempts {
                tokio::time::sleep(inner.config.connect_interval).await;
            }
        }

        let _ = inner.mark_closed();
        Err(BusError::StartupFailed {
            attempts,
            source: Box::new(last_error),
        })
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Receiver that observes every connection state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Default publish deadline from the configuration.
    pub fn publish_timeout(&self) -> Duration {
        self.inner.config.publish_timeout
    }

    pub fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    /// Publishes `message` to `topic` and waits for the broker's confirm.
    ///
    /// Returns [`BusError::NotConnected`] while reconnecting,
    /// [`BusError::Rejected`] on a negative confirm, and
    /// [`BusError::ConfirmTimeout`] if `deadline` elapses first.
    #[tracing::instrument(skip(self, message), fields(message_type = %message.message_type))]
    pub async fn publish(&self, topic: &str, message: Message, deadline: Duration) -> Result<()> {
        if !self.inner.topology.has_topic(topic) {
            return Err(BusError::UnknownTopic(topic.to_string()));
        }
        let outbound = OutboundMessage::from_message(topic, &message)?;
        let connection = self.inner.live_connection()?;

        let exchange = self.inner.topology.exchange();
        let confirm = connection.publish(exchange, &outbound);
        let result = match tokio::time::timeout(deadline, confirm).await {
            Ok(result) => result,
            Err(_) => Err(BusError::ConfirmTimeout(deadline)),
        };

        match &result {
            Ok(()) => {
                metrics::counter!("bus_published_total", "topic" => topic.to_string()).increment(1);
                tracing::debug!(message_id = %outbound.message_id, "message confirmed");
            }
            Err(e) => {
                metrics::counter!("bus_publish_failed_total", "topic" => topic.to_string())
                    .increment(1);
                tracing::debug!(error = %e, "publish failed");
            }
        }
        result
    }

    /// Registers `handler` for `topic`.
    ///
    /// If connected, the consumer starts immediately; otherwise it starts on
    /// the next successful reconnect. Either way it is replayed after every
    /// later reconnect.
    #[tracing::instrument(skip(self, handler))]
    pub async fn subscribe(&self, topic: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        if !self.inner.topology.has_topic(topic) {
            return Err(BusError::UnknownTopic(topic.to_string()));
        }

        let (connection, generation) = {
            let mut shared = self.inner.lock();
            if shared.state.is_terminal() {
                return Err(BusError::Closed);
            }
            if shared.subscriptions.contains_key(topic) {
                return Err(BusError::AlreadySubscribed(topic.to_string()));
            }
            shared
                .subscriptions
                .insert(topic.to_string(), Arc::clone(&handler));
            let connection = match shared.state {
                ConnectionState::Connected => shared.connection.clone(),
                _ => None,
            };
            (connection, shared.generation)
        };

        let Some(connection) = connection else {
            tracing::info!("subscription registered; consumer starts on reconnect");
            return Ok(());
        };

        if let Err(e) = self.inner.start_consumer(&connection, topic, handler).await {
            let mut shared = self.inner.lock();
            // On a still-live connection the failure is real; on a dead one
            // the supervisor will replay the registration.
            if shared.generation == generation && !connection.closed_token().is_cancelled() {
                shared.subscriptions.remove(topic);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Closes the client. Further publishes and subscribes fail with
    /// [`BusError::Closed`] and no reconnect is attempted.
    pub async fn close(&self) {
        let Ok(connection) = self.inner.mark_closed() else {
            return;
        };
        if let Some(connection) = connection
            && let Err(e) = connection.close().await
        {
            tracing::warn!(error = %e, "error closing broker connection");
        }
        tracing::info!("message bus client closed");
    }
}

#[async_trait]
impl<B: Broker> MessageBus for MessageBusClient<B> {
    async fn publish(&self, topic: &str, message: Message, deadline: Duration) -> Result<()> {
        MessageBusClient::publish(self, topic, message, deadline).await
    }

    async fn subscribe(&self, topic: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        MessageBusClient::subscribe(self, topic, handler).await
    }

    async fn close(&self) {
        MessageBusClient::close(self).await
    }
}

impl<B: Broker> Inner<B> {
    fn lock(&self) -> MutexGuard<'_, Shared<B::Connection>> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies a state transition. Returns false if it is not allowed.
    fn transition(&self, next: ConnectionState) -> bool {
        {
            let mut shared = self.lock();
            if !shared.state.can_transition_to(next) {
                return false;
            }
            shared.state = next;
            if next == ConnectionState::Disconnected {
                shared.connection = None;
            }
        }
        self.state_tx.send_replace(next);
        true
    }

    /// Enters `Closed` and hands back the live connection, if any.
    /// Fails with [`BusError::Closed`] if the client was already closed.
    fn mark_closed(&self) -> Result<Option<Arc<B::Connection>>> {
        let connection = {
            let mut shared = self.lock();
            if shared.state.is_terminal() {
                return Err(BusError::Closed);
            }
            shared.state = ConnectionState::Closed;
            shared.connection.take()
        };
        self.shutdown.cancel();
        self.state_tx.send_replace(ConnectionState::Closed);
        Ok(connection)
    }

    fn live_connection(&self) -> Result<Arc<B::Connection>> {
        let shared = self.lock();
        match shared.state {
            ConnectionState::Closed => Err(BusError::Closed),
            ConnectionState::Connected => shared.connection.clone().ok_or(BusError::NotConnected),
            _ => Err(BusError::NotConnected),
        }
    }

    /// Opens a connection, declares the topology and replays subscriptions.
    /// Returns the token that fires when the new connection is lost.
    async fn establish(&self) -> Result<CancellationToken> {
        if !self.transition(ConnectionState::Connecting) {
            return Err(BusError::Closed);
        }

        let connection = match self.broker.connect().await {
            Ok(connection) => connection,
            Err(e) => {
                self.transition(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        if let Err(e) = connection.declare(&self.topology).await {
            let _ = connection.close().await;
            self.transition(ConnectionState::Disconnected);
            return Err(e);
        }

        let replay = {
            let mut shared = self.lock();
            if shared.state.can_transition_to(ConnectionState::Connected) {
                shared.state = ConnectionState::Connected;
                shared.connection = Some(Arc::clone(&connection));
                shared.generation += 1;
                Some(
                    shared
                        .subscriptions
                        .iter()
                        .map(|(topic, handler)| (topic.clone(), Arc::clone(handler)))
                        .collect::<Vec<_>>(),
                )
            } else {
                None
            }
        };
        let Some(replay) = replay else {
            // Closed while connecting.
            let _ = connection.close().await;
            return Err(BusError::Closed);
        };
        self.state_tx.send_replace(ConnectionState::Connected);

        for (topic, handler) in replay {
            if let Err(e) = self.start_consumer(&connection, &topic, handler).await {
                tracing::error!(topic = %topic, error = %e, "failed to restore subscription");
                let _ = connection.close().await;
                self.transition(ConnectionState::Disconnected);
                return Err(e);
            }
            tracing::debug!(topic = %topic, "subscription restored");
        }

        Ok(connection.closed_token())
    }

    async fn start_consumer(
        &self,
        connection: &Arc<B::Connection>,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let stream = connection.consume(topic).await?;
        tokio::spawn(dispatch(
            topic.to_string(),
            stream,
            handler,
            self.shutdown.clone(),
        ));
        Ok(())
    }
}

/// Watches the live connection and restores it whenever it drops.
async fn supervise<B: Broker>(inner: Arc<Inner<B>>, mut closed: CancellationToken) {
    'watch: loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = closed.cancelled() => {}
        }
        if !inner.transition(ConnectionState::Disconnected) {
            break;
        }
        tracing::warn!("broker connection lost; reconnecting");

        let mut delays = inner.config.backoff().build();
        loop {
            if !inner.transition(ConnectionState::Reconnecting) {
                break 'watch;
            }
            let delay = delays.next().unwrap_or(inner.config.reconnect_max);
            tokio::select! {
                _ = inner.shutdown.cancelled() => break 'watch,
                _ = tokio::time::sleep(delay) => {}
            }
            match inner.establish().await {
                Ok(token) => {
                    closed = token;
                    metrics::counter!("bus_reconnects_total").increment(1);
                    tracing::info!("reconnected to message broker");
                    break;
                }
                Err(BusError::Closed) => break 'watch,
                Err(e) => {
                    tracing::warn!(
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "reconnect attempt failed"
                    );
                }
            }
        }
    }

    tracing::debug!("connection supervisor stopped");
}

/// Delivers one subscription's messages to its handler, one at a time.
async fn dispatch(
    topic: String,
    mut stream: DeliveryStream,
    handler: Arc<dyn MessageHandler>,
    shutdown: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = stream.next() => match next {
                Some(delivery) => delivery,
                None => break,
            },
        };

        let outcome = match Message::from_bytes(&delivery.body) {
            Ok(message) => match handler.handle(message).await {
                Ok(()) => "handled",
                Err(e) => {
                    tracing::warn!(topic = %topic, error = %e, "handler failed; requeueing");
                    "handler_error"
                }
            },
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "undecodable message; requeueing");
                "decode_error"
            }
        };

        let settled = if outcome == "handled" {
            delivery.ack().await
        } else {
            delivery.nack(true).await
        };
        if let Err(e) = settled {
            tracing::warn!(topic = %topic, error = %e, "failed to settle delivery");
        }
        metrics::counter!(
            "bus_messages_handled_total",
            "topic" => topic.clone(),
            "outcome" => outcome
        )
        .increment(1);
    }

    tracing::debug!(topic = %topic, "dispatch stopped");
}
