//! Wire envelope and delivery types.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// JSON envelope carried on the wire: `{"type": ..., "payload": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub message_type: String,
    pub payload: serde_json::Value,
}

impl Message {
    /// Creates a message from an already-built JSON payload.
    pub fn new(message_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            message_type: message_type.into(),
            payload,
        }
    }

    /// Creates a message by serializing `payload`.
    pub fn encode<T: Serialize>(
        message_type: impl Into<String>,
        payload: &T,
    ) -> std::result::Result<Self, serde_json::Error> {
        Ok(Self::new(message_type, serde_json::to_value(payload)?))
    }

    /// Deserializes the payload into a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> std::result::Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    pub fn to_bytes(&self) -> std::result::Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// A marshalled message ready for a broker connection.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Routing key; the topic name.
    pub routing_key: String,
    pub message_type: String,
    pub body: Vec<u8>,
    /// Unique per publish call, so consumers can deduplicate redeliveries.
    pub message_id: String,
}

impl OutboundMessage {
    /// Marshals `message` for `topic`.
    pub fn from_message(
        topic: &str,
        message: &Message,
    ) -> std::result::Result<Self, serde_json::Error> {
        Ok(Self {
            routing_key: topic.to_string(),
            message_type: message.message_type.clone(),
            body: message.to_bytes()?,
            message_id: Uuid::new_v4().to_string(),
        })
    }
}

/// Settles a delivery with the broker.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// A message received from a queue, pending acknowledgement.
pub struct Delivery {
    pub body: Vec<u8>,
    pub redelivered: bool,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(body: Vec<u8>, redelivered: bool, acker: Box<dyn Acknowledge>) -> Self {
        Self {
            body,
            redelivered,
            acker,
        }
    }

    /// Acknowledges successful processing.
    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    /// Rejects the delivery, optionally returning it to the queue.
    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}
