//! Broker abstraction the bus is written against.
//!
//! Implementations:
//! - [`InMemoryBroker`](super::InMemoryBroker) - for tests and single-process scenarios
//! - `AmqpBroker` - RabbitMQ / AMQP 0-9-1 (requires the `amqp` feature)

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::BrokerError;

/// Exchange type. The bus itself only ever declares `Topic` exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    Topic,
    Direct,
    Fanout,
    Headers,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExchangeKind::Topic => "topic",
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Headers => "headers",
        };
        f.write_str(name)
    }
}

/// Stream of deliveries for one consumer. Ends when the channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// Entry point of a broker adapter.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Open a new physical connection.
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

/// A live transport to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a logical channel over this connection.
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    /// Resolves with the reason once the connection is lost or closed.
    async fn closed(&self) -> BrokerError;

    /// Close the connection and every channel on it.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// A logical session multiplexed over a connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare an exchange. Idempotent for identical arguments.
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError>;

    /// Declare a queue. Idempotent for identical arguments.
    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), BrokerError>;

    /// Bind `queue` to `exchange` with a routing pattern. Idempotent.
    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str)
        -> Result<(), BrokerError>;

    /// Publish a message.
    ///
    /// Returns whether the broker accepted the message into its buffer
    /// (flow control), not whether anyone consumed it.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        persistent: bool,
    ) -> Result<bool, BrokerError>;

    /// Start a consumer on `queue`. With `no_ack` the broker considers
    /// messages settled on delivery.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;

    /// Reject the delivery; `requeue = false` drops or dead-letters it.
    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// A message delivered to a consumer.
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Vec<u8>,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        redelivered: bool,
        body: Vec<u8>,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            redelivered,
            body,
            acker,
        }
    }

    /// Acknowledge: the broker removes the message from the queue.
    pub async fn ack(&self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    /// Negatively acknowledge.
    pub async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .finish()
    }
}
