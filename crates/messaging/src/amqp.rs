//! AMQP 0-9-1 transport backed by `lapin`.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broker::{Broker, BrokerConnection, DeliveryStream};
use crate::config::BusConfig;
use crate::error::{BusError, Result};
use crate::message::{Acknowledge, Delivery, OutboundMessage};
use crate::topology::Topology;

const CONTENT_TYPE: &str = "application/json";
const PERSISTENT: u8 = 2;

/// Connects to a RabbitMQ (or compatible) broker.
#[derive(Debug, Clone)]
pub struct AmqpBroker {
    url: String,
    prefetch: u16,
}

impl AmqpBroker {
    pub fn new(url: impl Into<String>, prefetch: u16) -> Self {
        Self {
            url: url.into(),
            prefetch,
        }
    }

    pub fn from_config(config: &BusConfig) -> Self {
        Self::new(config.url.clone(), config.prefetch)
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    type Connection = AmqpConnection;

    async fn connect(&self) -> Result<Arc<AmqpConnection>> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default()).await?;

        let closed = CancellationToken::new();
        let on_error = closed.clone();
        connection.on_error(move |err| {
            tracing::warn!(error = %err, "AMQP connection error");
            on_error.cancel();
        });

        let channel = connection.create_channel().await?;
        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        tracing::debug!(channel_id = channel.id(), "AMQP channel opened");
        Ok(Arc::new(AmqpConnection {
            connection,
            channel,
            closed,
        }))
    }
}

/// A live AMQP connection with one confirm-mode channel.
pub struct AmqpConnection {
    connection: Connection,
    channel: Channel,
    closed: CancellationToken,
}

impl AmqpConnection {
    /// Marks the connection dead if the channel has stopped.
    fn check_channel(&self) {
        if !self.channel.status().connected() {
            self.closed.cancel();
        }
    }

    fn map_error(&self, err: lapin::Error) -> BusError {
        self.check_channel();
        BusError::from(err)
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn declare(&self, topology: &Topology) -> Result<()> {
        let durable_exchange = ExchangeDeclareOptions {
            durable: true,
            ..Default::default()
        };
        self.channel
            .exchange_declare(
                topology.exchange(),
                ExchangeKind::Topic,
                durable_exchange,
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.map_error(e))?;

        for queue in topology.queues() {
            let durable_queue = QueueDeclareOptions {
                durable: true,
                ..Default::default()
            };
            self.channel
                .queue_declare(queue, durable_queue, FieldTable::default())
                .await
                .map_err(|e| self.map_error(e))?;
            self.channel
                .queue_bind(
                    queue,
                    topology.exchange(),
                    queue,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| self.map_error(e))?;
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, message: &OutboundMessage) -> Result<()> {
        let options = BasicPublishOptions {
            mandatory: true,
            ..Default::default()
        };
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                &message.routing_key,
                options,
                &message.body,
                publish_properties(message),
            )
            .await
            .map_err(|e| self.map_error(e))?;

        match confirm.await.map_err(|e| self.map_error(e))? {
            Confirmation::Ack(None) => Ok(()),
            // A returned mandatory message is acked but was never queued.
            Confirmation::Ack(Some(returned)) => Err(BusError::Rejected(format!(
                "unroutable: {}",
                returned.reply_text.as_str()
            ))),
            Confirmation::Nack(_) => Err(BusError::Rejected("broker nack".to_string())),
            Confirmation::NotRequested => Err(BusError::Transport(
                "channel is not in confirm mode".to_string(),
            )),
        }
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        let tag = format!("{queue}-{}", Uuid::new_v4());
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.map_error(e))?;

        let closed = self.closed.clone();
        let stream = consumer
            .take_while(move |item| {
                let alive = item.is_ok();
                if let Err(err) = item {
                    tracing::warn!(error = %err, "AMQP consumer stopped");
                    closed.cancel();
                }
                std::future::ready(alive)
            })
            .filter_map(|item| {
                std::future::ready(item.ok().map(|delivery| {
                    Delivery::new(
                        delivery.data,
                        delivery.redelivered,
                        Box::new(AmqpAcker {
                            acker: delivery.acker,
                        }),
                    )
                }))
            });
        Ok(Box::pin(stream))
    }

    fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        if self.connection.status().connected() {
            self.connection.close(200, "client shutdown").await?;
        }
        Ok(())
    }
}

struct AmqpAcker {
    acker: lapin::acker::Acker,
}

/// Persistent JSON message tagged with its id and type.
fn publish_properties(message: &OutboundMessage) -> BasicProperties {
    BasicProperties::default()
        .with_delivery_mode(PERSISTENT)
        .with_content_type(CONTENT_TYPE.into())
        .with_message_id(message.message_id.clone().into())
        .with_type(message.message_type.clone().into())
}

#[async_trait]
impl Acknowledge for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}
