//! Event bus facade - the one object a service holds.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use super::broker::Broker;
use super::channel::ChannelManager;
use super::publisher::Publisher;
use super::stats::{BusStats, Counters};
use super::subscriber::{MessageHandler, Subscriber, Subscription};
use super::supervisor::{ChannelObserver, ConnectionState, ConnectionSupervisor};
use crate::config::BusConfig;
use crate::envelope::PublishOptions;
use crate::error::{BusError, PublishError};

/// Service bus: connection supervisor, channel manager, publisher and
/// subscriber behind one handle.
///
/// Cloning is cheap and every clone drives the same connection.
///
/// ## Example
///
/// ```ignore
/// let bus = Bus::new(BusConfig::from_env()?, InMemoryBroker::new());
///
/// // Subscriptions may be registered before the connection exists
/// bus.subscribe("user.events", "#", "audit-log-queue", audit_handler).await?;
/// bus.connect().await?;
///
/// // `false` means "not guaranteed delivered", never an error to propagate
/// if !bus.publish("user.events", "user.registered", &event).await {
///     tracing::warn!("user.registered not published");
/// }
///
/// bus.close().await?;
/// ```
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

struct BusInner {
    config: BusConfig,
    counters: Arc<Counters>,
    channels: Arc<ChannelManager>,
    publisher: Publisher,
    subscriber: Arc<Subscriber>,
    supervisor: Arc<ConnectionSupervisor>,
}

/// Dropping the last handle without `close()` stops consuming at once; the
/// supervision task releases the channel and the connection as it exits.
impl Drop for BusInner {
    fn drop(&mut self) {
        self.subscriber.abandon();
        self.supervisor.abandon();
    }
}

impl Bus {
    /// Create a bus for `config.service_name()` over `broker`. Nothing
    /// connects until [`connect`](Self::connect).
    pub fn new(config: BusConfig, broker: impl Broker) -> Self {
        Self::with_broker(config, Arc::new(broker))
    }

    /// Create a bus over the RabbitMQ instance at `config.url()`.
    #[cfg(feature = "amqp")]
    pub fn amqp(config: BusConfig) -> Self {
        let broker = super::amqp_broker::AmqpBroker::new(config.url());
        Self::new(config, broker)
    }

    pub fn with_broker(config: BusConfig, broker: Arc<dyn Broker>) -> Self {
        let counters = Arc::new(Counters::default());
        let channels = Arc::new(ChannelManager::new());
        let publisher = Publisher::new(config.service_name(), Arc::clone(&channels));
        let subscriber = Arc::new(Subscriber::new(
            config.service_name(),
            Arc::clone(&channels),
            Arc::clone(&counters),
        ));
        let observer: Arc<dyn ChannelObserver> = subscriber.clone();
        let supervisor = Arc::new(ConnectionSupervisor::new(
            broker,
            config.reconnect(),
            Arc::clone(&channels),
            observer,
            Arc::clone(&counters),
        ));

        Self {
            inner: Arc::new(BusInner {
                config,
                counters,
                channels,
                publisher,
                subscriber,
                supervisor,
            }),
        }
    }

    // ========================================================================
    // Connection
    // ========================================================================

    /// Connect to the broker.
    ///
    /// Waits for the first attempt only. If it fails the bus keeps retrying
    /// in the background and this still returns `Ok`; use
    /// [`wait_connected`](Self::wait_connected) to wait for a usable channel.
    /// Fails with [`BusError::NotConnected`] once the bus is closed.
    pub async fn connect(&self) -> Result<(), BusError> {
        info!(
            service = %self.inner.config.service_name(),
            url = %self.inner.config.redacted_url(),
            "connecting to broker"
        );
        self.inner.supervisor.connect().await
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.supervisor.state()
    }

    /// Wait until a channel is open and all subscriptions are applied.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        self.inner.supervisor.wait_connected(timeout).await
    }

    // ========================================================================
    // Publishing
    // ========================================================================

    /// Publish `message` to `exchange` with `routing_key`.
    ///
    /// Returns `false` when the message was not handed to the broker (no
    /// channel, bad target, serialization or declaration failure) or the
    /// broker signalled back-pressure. The failure is logged; the message is
    /// not retried.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &T,
    ) -> bool {
        self.publish_with(exchange, routing_key, message, &PublishOptions::default())
            .await
    }

    /// [`publish`](Self::publish) with request / user identifiers in the
    /// envelope metadata.
    pub async fn publish_with<T: Serialize + ?Sized>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &T,
        options: &PublishOptions,
    ) -> bool {
        match self.try_publish(exchange, routing_key, message, options).await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(exchange, routing_key, error = %err, "message not published");
                false
            }
        }
    }

    /// Publish and report exactly why a message was not sent.
    pub async fn try_publish<T: Serialize + ?Sized>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &T,
        options: &PublishOptions,
    ) -> Result<bool, PublishError> {
        if self.inner.supervisor.is_closing() {
            self.inner.counters.dropped();
            return Err(PublishError::NotConnected);
        }
        match self
            .inner
            .publisher
            .publish(exchange, routing_key, message, options)
            .await
        {
            Ok(true) => {
                self.inner.counters.published();
                Ok(true)
            }
            other => {
                self.inner.counters.dropped();
                other
            }
        }
    }

    // ========================================================================
    // Subscribing
    // ========================================================================

    /// Subscribe `handler` to messages on `exchange` whose routing key
    /// matches `pattern`, consuming from the durable queue `queue`.
    ///
    /// Instances sharing a queue name compete for messages; distinct queue
    /// names each get their own copy. Safe to call before `connect`.
    pub async fn subscribe(
        &self,
        exchange: &str,
        pattern: &str,
        queue: &str,
        handler: impl MessageHandler,
    ) -> Result<(), BusError> {
        self.subscribe_with(Subscription::new(exchange, pattern, queue, handler))
            .await
    }

    /// Subscribe with a prepared [`Subscription`] (e.g. a non-default
    /// ack mode).
    pub async fn subscribe_with(&self, subscription: Subscription) -> Result<(), BusError> {
        if self.inner.supervisor.is_closing() {
            return Err(BusError::NotConnected);
        }
        self.inner.subscriber.subscribe(subscription).await
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Close the bus: stop reconnecting, stop consumers, release the channel
    /// and then the connection.
    ///
    /// Both releases are always attempted; the first failure is returned.
    /// Afterwards `publish` returns `false` and `subscribe` fails with
    /// [`BusError::NotConnected`].
    pub async fn close(&self) -> Result<(), BusError> {
        let connection = self.inner.supervisor.shutdown().await;
        self.inner.subscriber.close().await;

        let mut first_error = None;
        if let Err(err) = self.inner.channels.release().await {
            warn!(error = %err, "releasing channel failed");
            first_error.get_or_insert(BusError::Close(err));
        }
        if let Some(connection) = connection {
            if let Err(err) = connection.close().await {
                warn!(error = %err, "releasing connection failed");
                first_error.get_or_insert(BusError::Close(err));
            }
        }

        info!(service = %self.inner.config.service_name(), "bus closed");
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn stats(&self) -> BusStats {
        self.inner.counters.snapshot()
    }

    pub fn service_name(&self) -> &str {
        self.inner.config.service_name()
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("config", &self.inner.config)
            .field("state", &self.state())
            .finish()
    }
}
