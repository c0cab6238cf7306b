//! Message bus error types.

use std::time::Duration;

use thiserror::Error;

/// Errors returned by the message bus client and broker transports.
#[derive(Debug, Error)]
pub enum BusError {
    /// No live broker connection. Retryable once the supervisor reconnects.
    #[error("Not connected to the message broker")]
    NotConnected,

    /// The client was closed; no further operations are possible.
    #[error("Message bus client is closed")]
    Closed,

    /// The broker refused the message. Terminal for this publish.
    #[error("Message rejected by broker: {0}")]
    Rejected(String),

    /// No confirmation arrived before the deadline. The broker may or may not
    /// have accepted the message.
    #[error("Timed out after {0:?} waiting for publish confirmation")]
    ConfirmTimeout(Duration),

    /// The initial connection could not be established within the retry budget.
    #[error("Failed to connect to broker after {attempts} attempts: {source}")]
    StartupFailed {
        attempts: u32,
        #[source]
        source: Box<BusError>,
    },

    /// A handler is already registered for this topic.
    #[error("Topic '{0}' already has a subscriber")]
    AlreadySubscribed(String),

    /// The topic is not part of the declared topology.
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    /// Transport-level failure (socket, channel, protocol).
    #[error("Broker transport error: {0}")]
    Transport(String),

    /// Message body could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BusError {
    /// Returns true if retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::NotConnected | BusError::Transport(_))
    }

    /// Returns true if the outcome of a publish is unknown.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, BusError::ConfirmTimeout(_))
    }
}

impl From<lapin::Error> for BusError {
    fn from(err: lapin::Error) -> Self {
        BusError::Transport(err.to_string())
    }
}

/// Convenience type alias for bus results.
pub type Result<T> = std::result::Result<T, BusError>;
