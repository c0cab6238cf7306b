//! RabbitMQ integration tests.
//!
//! These start a broker container and are ignored by default. Run with:
//!
//! ```bash
//! cargo test -p messaging --test rabbitmq_container -- --ignored
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use messaging::{
    AmqpBroker, BusConfig, ConnectionState, HandlerError, Message, MessageBusClient,
    MessageHandler,
};
use serde_json::json;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::rabbitmq::RabbitMq;
use tokio::sync::mpsc;

struct Forward(mpsc::UnboundedSender<Message>);

#[async_trait]
impl MessageHandler for Forward {
    async fn handle(&self, message: Message) -> Result<(), HandlerError> {
        self.0.send(message)?;
        Ok(())
    }
}

#[tokio::test]
#[ignore = "requires docker"]
async fn publish_confirm_and_consume_against_rabbitmq() {
    let container = RabbitMq::default().start().await.unwrap();
    let host = container.get_host().await.unwrap();
    let port = container.get_host_port_ipv4(5672).await.unwrap();

    let config = BusConfig {
        url: format!("amqp://guest:guest@{host}:{port}/%2f"),
        connect_retries: 20,
        connect_interval: Duration::from_millis(500),
        ..BusConfig::default()
    };
    let broker = AmqpBroker::from_config(&config);
    let client = MessageBusClient::connect(broker, config).await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);

    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .subscribe("orders", Arc::new(Forward(tx)))
        .await
        .unwrap();

    let message = Message::new("order.created", json!({ "order_id": "o1" }));
    client
        .publish("orders", message.clone(), Duration::from_secs(5))
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, message);

    client.close().await;
    assert_eq!(client.state(), ConnectionState::Closed);
}
