//! RabbitMQ adapter over `lapin` (feature `amqp`).

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPHardError, AMQPSoftError};
use lapin::types::FieldTable;
use lapin::{BasicProperties, ConnectionProperties};
use tokio::sync::watch;
use tracing::warn;

use super::broker::{
    Acknowledger, Broker, BrokerChannel, BrokerConnection, Delivery, DeliveryStream, ExchangeKind,
};
use crate::error::BrokerError;

/// AMQP delivery mode for messages the broker writes to disk.
const PERSISTENT: u8 = 2;
const CONTENT_TYPE: &str = "application/json";

/// Broker at an `amqp://` or `amqps://` URL.
#[derive(Debug, Clone)]
pub struct AmqpBroker {
    uri: String,
}

impl AmqpBroker {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let connection = lapin::Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(|err| match map_error(err) {
                auth @ BrokerError::Authentication(_) => auth,
                other => BrokerError::Unreachable(other.to_string()),
            })?;

        let closed = Arc::new(watch::Sender::new(None));
        let on_error = Arc::clone(&closed);
        connection.on_error(move |err| {
            warn!(error = %err, "amqp connection error");
            on_error.send_replace(Some(BrokerError::ConnectionLost(err.to_string())));
        });

        Ok(Arc::new(AmqpConnection { connection, closed }))
    }
}

struct AmqpConnection {
    connection: lapin::Connection,
    closed: Arc<watch::Sender<Option<BrokerError>>>,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = self.connection.create_channel().await.map_err(map_error)?;
        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn closed(&self) -> BrokerError {
        let mut closed = self.closed.subscribe();
        let reason = match closed.wait_for(Option::is_some).await {
            Ok(reason) => (*reason).clone(),
            Err(_) => None,
        };
        reason.unwrap_or_else(|| BrokerError::ConnectionLost("connection closed".into()))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed
            .send_replace(Some(BrokerError::ConnectionLost("closed by client".into())));
        self.connection.close(200, "OK").await.map_err(map_error)
    }
}

struct AmqpChannel {
    channel: lapin::Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError> {
        let kind = match kind {
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        };
        let options = ExchangeDeclareOptions {
            durable,
            ..ExchangeDeclareOptions::default()
        };
        self.channel
            .exchange_declare(name, kind, options, FieldTable::default())
            .await
            .map_err(map_error)
    }

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), BrokerError> {
        let options = QueueDeclareOptions {
            durable,
            ..QueueDeclareOptions::default()
        };
        self.channel
            .queue_declare(name, options, FieldTable::default())
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_error)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        persistent: bool,
    ) -> Result<bool, BrokerError> {
        let mut properties = BasicProperties::default().with_content_type(CONTENT_TYPE.into());
        if persistent {
            properties = properties.with_delivery_mode(PERSISTENT);
        }
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await
            .map_err(map_error)?;
        let confirmation = confirm.await.map_err(map_error)?;
        Ok(!confirmation.is_nack())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, BrokerError> {
        let options = BasicConsumeOptions {
            no_ack,
            ..BasicConsumeOptions::default()
        };
        let consumer = self
            .channel
            .basic_consume(queue, consumer_tag, options, FieldTable::default())
            .await
            .map_err(map_error)?;

        Ok(consumer
            .map(|next| next.map(into_delivery).map_err(map_error))
            .boxed())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.channel.close(200, "OK").await.map_err(map_error)
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery::new(
        delivery.exchange.as_str().to_owned(),
        delivery.routing_key.as_str().to_owned(),
        delivery.redelivered,
        delivery.data,
        Box::new(AmqpAcker(delivery.acker)),
    )
}

struct AmqpAcker(lapin::acker::Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.0.ack(BasicAckOptions::default()).await.map_err(map_error)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        let options = BasicNackOptions {
            requeue,
            multiple: false,
        };
        self.0.nack(options).await.map_err(map_error)
    }
}

fn map_error(err: lapin::Error) -> BrokerError {
    match &err {
        lapin::Error::ProtocolError(amqp) => match amqp.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                BrokerError::PreconditionFailed(amqp.to_string())
            }
            AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => BrokerError::NotFound(amqp.to_string()),
            AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED) => {
                BrokerError::Authentication(amqp.to_string())
            }
            AMQPErrorKind::Hard(AMQPHardError::CONNECTIONFORCED) => {
                BrokerError::ConnectionLost(amqp.to_string())
            }
            _ => BrokerError::Protocol(amqp.to_string()),
        },
        lapin::Error::InvalidChannelState(_) => BrokerError::ChannelClosed,
        lapin::Error::InvalidConnectionState(_) | lapin::Error::IOError(_) => {
            BrokerError::ConnectionLost(err.to_string())
        }
        _ => BrokerError::Protocol(err.to_string()),
    }
}
