//! Error types for the bus, its broker adapters and message handlers.

use std::error::Error;

/// Errors reported by a broker adapter (transport, channel or protocol level).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// The broker endpoint could not be reached.
    #[error("broker unreachable: {0}")]
    Unreachable(String),
    /// The broker refused the credentials.
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// An established connection went away.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// The channel is closed and cannot be used any more.
    #[error("channel closed")]
    ChannelClosed,
    /// A declaration conflicts with an existing entity of the same name.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    /// The named entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Any other protocol-level failure.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl BrokerError {
    /// The channel or its connection is gone, as opposed to the broker
    /// refusing a specific operation.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, BrokerError::ChannelClosed | BrokerError::ConnectionLost(_))
    }
}

/// Errors surfaced by the [`Bus`](crate::Bus) facade.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The bus has been closed, or no channel exists.
    #[error("not connected")]
    NotConnected,
    /// Connecting to the broker failed.
    #[error("transport error: {0}")]
    Transport(#[source] BrokerError),
    /// Declaring an exchange, queue or binding failed.
    #[error("declaration of {entity} failed: {source}")]
    Declaration {
        entity: String,
        #[source]
        source: BrokerError,
    },
    /// A channel-level operation failed.
    #[error("channel error: {0}")]
    Channel(#[source] BrokerError),
    /// Releasing the channel or the connection failed.
    #[error("close failed: {0}")]
    Close(#[source] BrokerError),
    /// The subscription arguments are unusable.
    #[error("invalid subscription: {0}")]
    InvalidSubscription(String),
}

/// Error type for publish operations.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// No channel is available (reconnecting, or the bus is closed).
    #[error("not connected")]
    NotConnected,
    /// Exchange or routing key is empty or malformed.
    #[error("invalid publish target: {0}")]
    InvalidTarget(String),
    /// The message could not be serialized to JSON.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Declaring the target exchange failed.
    #[error(transparent)]
    Declaration(#[from] BusError),
    /// The channel refused the message.
    #[error("publish rejected: {0}")]
    Rejected(#[source] BrokerError),
}

/// Error type returned by message handlers.
///
/// Any variant leads to the delivery being negatively acknowledged
/// without requeue.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The message body could not be decoded.
    #[error("decode failed: {0}")]
    DecodeFailed(String),
    /// Business logic rejected the message.
    #[error("rejected: {0}")]
    Rejected(String),
    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),
    /// Other error.
    #[error("handler error: {0}")]
    Other(#[source] Box<dyn Error + Send + Sync>),
}

impl HandlerError {
    /// Wrap any error as a handler failure.
    pub fn other(err: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        HandlerError::Other(err.into())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::DecodeFailed(err.to_string())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),
    #[error("invalid URL for {0}: {1}")]
    InvalidUrl(String, String),
    #[error("unsupported broker scheme `{0}` (expected amqp, amqps or memory)")]
    UnsupportedScheme(String),
    #[error("invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}
