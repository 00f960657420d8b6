//! Subscriber: durable subscriptions and their consumers.
//!
//! Every subscription is kept in registration order for the lifetime of the
//! bus. When the supervisor opens a channel the whole list is applied again
//! (exchange, queue, binding, consumer), before any new `subscribe` call gets
//! through. While no channel exists, new subscriptions are only recorded.
//!
//! ## Acknowledgment
//!
//! With [`AckMode::Manual`] (the default) a delivery is acked once its
//! handler returns `Ok`, and rejected without requeue when decoding fails,
//! the handler returns an error, or the handler panics. A message that always
//! fails is therefore dropped (or dead-lettered) after one attempt.
//!
//! ## Example
//!
//! ```ignore
//! bus.subscribe("user.events", "user.*", "notification-service", |envelope: Envelope| async move {
//!     let event: UserRegistered = envelope.decode()?;
//!     send_welcome_mail(&event).await.map_err(HandlerError::other)
//! })
//! .await?;
//! ```

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::broker::{Delivery, DeliveryStream};
use super::channel::{ChannelHandle, ChannelManager};
use super::stats::Counters;
use super::supervisor::ChannelObserver;
use crate::envelope::{Envelope, UNKNOWN_SERVICE};
use crate::error::{BusError, HandlerError};
use crate::topic;

/// Processes decoded messages of one subscription.
///
/// Handlers of different subscriptions run concurrently with each other and
/// with publishers. Any `Err` rejects the message without requeue.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, envelope: Envelope) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, envelope: Envelope) -> Result<(), HandlerError> {
        (self)(envelope).await
    }
}

/// How deliveries of a subscription are settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// Ack on success, reject without requeue on failure.
    #[default]
    Manual,
    /// The broker settles on delivery; failures are only logged.
    Auto,
}

/// A durable registration of (exchange, routing pattern, queue, handler).
#[derive(Clone)]
pub struct Subscription {
    exchange: String,
    pattern: String,
    queue: String,
    ack_mode: AckMode,
    handler: Arc<dyn MessageHandler>,
}

impl Subscription {
    pub fn new(
        exchange: impl Into<String>,
        pattern: impl Into<String>,
        queue: impl Into<String>,
        handler: impl MessageHandler,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            pattern: pattern.into(),
            queue: queue.into(),
            ack_mode: AckMode::Manual,
            handler: Arc::new(handler),
        }
    }

    pub fn with_ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    /// Same exchange, queue and pattern.
    pub fn same_identity(&self, other: &Subscription) -> bool {
        self.exchange == other.exchange && self.queue == other.queue && self.pattern == other.pattern
    }

    pub(crate) fn validate(&self) -> Result<(), BusError> {
        if self.exchange.trim().is_empty() {
            return Err(BusError::InvalidSubscription("exchange name is empty".into()));
        }
        if self.queue.trim().is_empty() {
            return Err(BusError::InvalidSubscription("queue name is empty".into()));
        }
        topic::validate_pattern(&self.pattern).map_err(BusError::InvalidSubscription)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("exchange", &self.exchange)
            .field("pattern", &self.pattern)
            .field("queue", &self.queue)
            .field("ack_mode", &self.ack_mode)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct SubscriberState {
    registry: Vec<Arc<Subscription>>,
    active: Option<ChannelHandle>,
    consumers: Vec<JoinHandle<()>>,
    closed: bool,
}

impl SubscriberState {
    fn stop_consumers(&mut self) {
        self.active = None;
        for consumer in self.consumers.drain(..) {
            consumer.abort();
        }
    }
}

pub(crate) struct Subscriber {
    service: String,
    channels: Arc<ChannelManager>,
    counters: Arc<Counters>,
    state: Mutex<SubscriberState>,
}

impl Subscriber {
    pub(crate) fn new(
        service: impl Into<String>,
        channels: Arc<ChannelManager>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            service: service.into(),
            channels,
            counters,
            state: Mutex::new(SubscriberState::default()),
        }
    }

    /// Register `subscription` and apply it if a channel is open.
    ///
    /// A declaration failure is logged and leaves the subscription
    /// registered; it is applied again on the next channel.
    pub(crate) async fn subscribe(&self, subscription: Subscription) -> Result<(), BusError> {
        subscription.validate()?;

        let mut state = self.state.lock().await;
        if state.closed {
            return Err(BusError::NotConnected);
        }
        if state.registry.iter().any(|s| s.same_identity(&subscription)) {
            info!(
                exchange = %subscription.exchange,
                queue = %subscription.queue,
                pattern = %subscription.pattern,
                "already subscribed"
            );
            return Ok(());
        }

        let subscription = Arc::new(subscription);
        state.registry.push(Arc::clone(&subscription));

        let Some(handle) = state.active.clone() else {
            debug!(queue = %subscription.queue, "no channel yet, subscription buffered");
            return Ok(());
        };
        match self.apply(&handle, &subscription).await {
            Ok(consumer) => state.consumers.push(consumer),
            Err(err) => warn!(
                queue = %subscription.queue,
                error = %err,
                "subscription kept for replay after reconnect"
            ),
        }
        Ok(())
    }

    #[cfg(test)]
    async fn subscription_count(&self) -> usize {
        self.state.lock().await.registry.len()
    }

    pub(crate) async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.stop_consumers();
    }

    /// Stop consumers without waiting; used when the bus is dropped.
    ///
    /// When the registry is busy the supervisor stops them instead, as part
    /// of releasing the connection.
    pub(crate) fn abandon(&self) {
        if let Ok(mut state) = self.state.try_lock() {
            state.closed = true;
            state.stop_consumers();
        }
    }

    /// Declare, bind and start consuming for one subscription.
    async fn apply(
        &self,
        handle: &ChannelHandle,
        subscription: &Arc<Subscription>,
    ) -> Result<JoinHandle<()>, BusError> {
        let Subscription {
            exchange,
            pattern,
            queue,
            ack_mode,
            ..
        } = &**subscription;

        self.channels.declare_exchange(handle, exchange).await?;
        self.channels.declare_queue(handle, queue).await?;
        self.channels.bind_queue(handle, queue, exchange, pattern).await?;

        let consumer_tag = format!("{}.{}.{}", self.service, queue, Uuid::new_v4());
        let deliveries = handle
            .channel()
            .consume(queue, &consumer_tag, *ack_mode == AckMode::Auto)
            .await
            .map_err(|err| {
                error!(queue = %queue, error = %err, "starting consumer failed");
                self.channels.invalidate(handle.generation());
                BusError::Channel(err)
            })?;

        info!(exchange = %exchange, queue = %queue, pattern = %pattern, "consuming");
        Ok(tokio::spawn(consume(
            Arc::clone(subscription),
            deliveries,
            Arc::clone(&self.counters),
            Arc::clone(&self.channels),
            handle.generation(),
        )))
    }
}

#[async_trait]
impl ChannelObserver for Subscriber {
    async fn channel_opened(&self, handle: ChannelHandle) -> Result<(), BusError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(BusError::NotConnected);
        }
        state.stop_consumers();

        let registry = state.registry.clone();
        for subscription in &registry {
            let consumer = self.apply(&handle, subscription).await?;
            state.consumers.push(consumer);
        }
        state.active = Some(handle);
        if !registry.is_empty() {
            info!(count = registry.len(), "subscriptions replayed");
        }
        Ok(())
    }

    async fn channel_lost(&self) {
        self.state.lock().await.stop_consumers();
    }
}

/// Run one consumer until its stream ends.
///
/// Consumers are aborted before their channel is released, so a stream that
/// ends on its own means the broker cancelled the consumer or closed the
/// channel. The channel is invalidated so the supervisor reconnects and
/// replays every subscription.
async fn consume(
    subscription: Arc<Subscription>,
    mut deliveries: DeliveryStream,
    counters: Arc<Counters>,
    channels: Arc<ChannelManager>,
    generation: u64,
) {
    while let Some(next) = deliveries.next().await {
        match next {
            Ok(delivery) => process(&subscription, delivery, &counters).await,
            Err(err) => {
                warn!(queue = %subscription.queue, error = %err, "delivery stream failed");
                break;
            }
        }
    }
    warn!(queue = %subscription.queue, generation, "consumer stopped by broker, reopening channel");
    channels.invalidate(generation);
}

async fn process(subscription: &Subscription, delivery: Delivery, counters: &Counters) {
    let (result, event_type, source) = match Envelope::from_delivery(&delivery) {
        Ok(envelope) => {
            let event_type = envelope.event_type().unwrap_or("-").to_string();
            let source = envelope.source_service().to_string();
            let result = AssertUnwindSafe(subscription.handler.handle(envelope))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(&*panic))));
            (result, event_type, source)
        }
        Err(err) => (Err(HandlerError::from(err)), "-".to_string(), UNKNOWN_SERVICE.to_string()),
    };

    // the broker settled these on delivery; acking them again would close the channel
    if subscription.ack_mode == AckMode::Auto {
        match result {
            Ok(()) => {
                counters.handled();
                debug!(queue = %subscription.queue, event_type = %event_type, "message handled");
            }
            Err(err) => {
                counters.failed();
                error!(
                    queue = %subscription.queue,
                    routing_key = %delivery.routing_key,
                    event_type = %event_type,
                    source = %source,
                    error = %err,
                    "message handling failed, already acknowledged on delivery"
                );
            }
        }
        return;
    }

    match result {
        Ok(()) => match delivery.ack().await {
            Ok(()) => {
                counters.handled();
                debug!(queue = %subscription.queue, event_type = %event_type, "message handled");
            }
            Err(err) => warn!(queue = %subscription.queue, error = %err, "ack failed"),
        },
        Err(err) => {
            counters.failed();
            error!(
                queue = %subscription.queue,
                routing_key = %delivery.routing_key,
                event_type = %event_type,
                source = %source,
                error = %err,
                "message handling failed, rejecting without requeue"
            );
            if let Err(err) = delivery.nack(false).await {
                warn!(queue = %subscription.queue, error = %err, "nack failed");
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
