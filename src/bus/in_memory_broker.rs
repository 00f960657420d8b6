//! In-memory broker for tests and local development.
//!
//! This module provides a thread-safe broker that implements the
//! [`Broker`] traits with the AMQP 0-9-1 semantics the bus relies on:
//! - durable topic/direct/fanout exchanges, queues and bindings
//! - each queue receives one copy of every message routed to it
//! - consumers of one queue compete (round-robin)
//! - manual acknowledgment, `nack` with or without requeue
//! - unacknowledged messages are requeued when their channel goes away
//! - conflicting declarations close the channel
//! - settling a delivery of a `no_ack` consumer closes the channel
//!
//! Test hooks let you refuse connections, kill every live connection, cancel
//! consumers, and inspect queue depth and the publish log. The publish and
//! declaration logs keep the most recent [`DEFAULT_LOG_LIMIT`] entries.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::broker::{
    Acknowledger, Broker, BrokerChannel, BrokerConnection, Delivery, DeliveryStream, ExchangeKind,
};
use crate::error::BrokerError;
use crate::topic;

/// Entries kept in each inspection log unless configured otherwise.
pub const DEFAULT_LOG_LIMIT: usize = 10_000;

type SharedState = Arc<Mutex<BrokerState>>;
type WeakState = Weak<Mutex<BrokerState>>;

/// A message as it was handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub persistent: bool,
}

impl PublishedMessage {
    /// Parse the body as JSON.
    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

/// In-memory broker.
///
/// Cloning yields another handle to the same broker, so several
/// [`Bus`](crate::Bus) instances can share it the way separate services
/// share one RabbitMQ.
///
/// ## Example
///
/// ```
/// # async fn demo() {
/// use topic_bus::{Bus, BusConfig, InMemoryBroker};
///
/// let broker = InMemoryBroker::new();
/// let bus = Bus::new(BusConfig::in_memory("auth-service"), broker.clone());
/// bus.connect().await.unwrap();
///
/// let accepted = bus.publish("user.events", "user.registered", &serde_json::json!({ "id": "u-1" })).await;
/// assert!(accepted);
/// assert_eq!(broker.published().len(), 1);
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: SharedState,
}

#[derive(Default)]
struct BrokerState {
    unreachable: bool,
    fail_channel_close: bool,
    next_id: u64,
    connect_attempts: usize,
    connections: HashMap<u64, watch::Sender<Option<BrokerError>>>,
    /// Open channel id -> owning connection id
    channels: HashMap<u64, u64>,
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    published: VecDeque<PublishedMessage>,
    queue_declarations: VecDeque<String>,
    /// `None` means [`DEFAULT_LOG_LIMIT`].
    log_limit: Option<usize>,
}

impl BrokerState {
    fn log_limit(&self) -> usize {
        self.log_limit.unwrap_or(DEFAULT_LOG_LIMIT)
    }
}

fn push_bounded<T>(log: &mut VecDeque<T>, limit: usize, entry: T) {
    log.push_back(entry);
    while log.len() > limit {
        log.pop_front();
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct ExchangeSpec {
    kind: ExchangeKind,
    durable: bool,
}

#[derive(PartialEq, Eq)]
struct Binding {
    queue: String,
    exchange: String,
    pattern: String,
}

#[derive(Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    redelivered: bool,
}

struct Unacked {
    channel: u64,
    message: StoredMessage,
}

struct ConsumerSlot {
    channel: u64,
    no_ack: bool,
    sender: mpsc::UnboundedSender<Result<Delivery, BrokerError>>,
}

struct QueueState {
    durable: bool,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, Unacked>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
    next_tag: u64,
    dead_lettered: usize,
}

impl QueueState {
    fn new(durable: bool) -> Self {
        Self {
            durable,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            consumers: Vec::new(),
            cursor: 0,
            next_tag: 1,
            dead_lettered: 0,
        }
    }
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InMemoryBroker {
    /// Create a new in-memory broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep only the last `limit` entries of the publish and declaration logs.
    pub fn with_log_limit(self, limit: usize) -> Self {
        lock(&self.state).log_limit = Some(limit);
        self
    }

    /// Refuse (`false`) or accept (`true`) new connections.
    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.state).unreachable = !reachable;
    }

    /// Make every subsequent channel close fail.
    pub fn fail_channel_close(&self, fail: bool) {
        lock(&self.state).fail_channel_close = fail;
    }

    /// Forcibly kill every live connection, as a broker restart or
    /// network partition would.
    pub fn drop_connections(&self) {
        let weak = Arc::downgrade(&self.state);
        let mut state = lock(&self.state);
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            close_connection(
                &mut state,
                &weak,
                id,
                BrokerError::ConnectionLost("connection forced closed by broker".into()),
            );
        }
    }

    /// Cancel every consumer of `queue`, as the broker does when the queue
    /// is deleted or fails over. Their delivery streams end.
    pub fn cancel_consumers(&self, queue: &str) {
        if let Some(queue) = lock(&self.state).queues.get_mut(queue) {
            queue.consumers.clear();
        }
    }

    /// Declare an exchange out of band, e.g. to set up a conflicting type.
    pub fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) {
        lock(&self.state)
            .exchanges
            .insert(name.to_string(), ExchangeSpec { kind, durable });
    }

    /// Messages waiting in the queue plus delivered-but-unacknowledged ones.
    pub fn queue_depth(&self, queue: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map(|q| q.ready.len() + q.unacked.len())
            .unwrap_or(0)
    }

    /// Messages waiting for a consumer.
    pub fn ready_count(&self, queue: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Messages rejected without requeue.
    pub fn dead_lettered(&self, queue: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map(|q| q.dead_lettered)
            .unwrap_or(0)
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map(|q| q.consumers.iter().filter(|c| !c.sender.is_closed()).count())
            .unwrap_or(0)
    }

    pub fn is_durable_queue(&self, queue: &str) -> bool {
        lock(&self.state)
            .queues
            .get(queue)
            .map(|q| q.durable)
            .unwrap_or(false)
    }

    /// Messages accepted by the broker, in publish order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.state).published.iter().cloned().collect()
    }

    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        lock(&self.state).exchanges.get(exchange).map(|e| e.kind)
    }

    pub fn open_connections(&self) -> usize {
        lock(&self.state).connections.len()
    }

    pub fn open_channels(&self) -> usize {
        lock(&self.state).channels.len()
    }

    /// Number of `connect` calls seen, successful or not.
    pub fn connect_attempts(&self) -> usize {
        lock(&self.state).connect_attempts
    }

    /// Queue names in declaration order, one entry per declare call.
    pub fn queue_declarations(&self) -> Vec<String> {
        lock(&self.state).queue_declarations.iter().cloned().collect()
    }

    pub fn binding_count(&self, queue: &str) -> usize {
        lock(&self.state)
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .count()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let mut state = lock(&self.state);
        state.connect_attempts += 1;
        if state.unreachable {
            return Err(BrokerError::Unreachable(
                "in-memory broker is refusing connections".into(),
            ));
        }
        state.next_id += 1;
        let id = state.next_id;
        let (closed_tx, closed_rx) = watch::channel(None);
        state.connections.insert(id, closed_tx);

        Ok(Arc::new(InMemoryConnection {
            id,
            state: Arc::clone(&self.state),
            closed_rx,
        }))
    }
}

/// Connection handle returned by [`InMemoryBroker`].
struct InMemoryConnection {
    id: u64,
    state: SharedState,
    closed_rx: watch::Receiver<Option<BrokerError>>,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let mut state = lock(&self.state);
        if !state.connections.contains_key(&self.id) {
            return Err(BrokerError::ConnectionLost("connection is closed".into()));
        }
        state.next_id += 1;
        let id = state.next_id;
        state.channels.insert(id, self.id);

        Ok(Arc::new(InMemoryChannel {
            id,
            state: Arc::clone(&self.state),
        }))
    }

    async fn closed(&self) -> BrokerError {
        let mut rx = self.closed_rx.clone();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => (*reason).clone(),
            Err(_) => None,
        };
        reason.unwrap_or_else(|| BrokerError::ConnectionLost("broker went away".into()))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let weak = Arc::downgrade(&self.state);
        let mut state = lock(&self.state);
        close_connection(
            &mut state,
            &weak,
            self.id,
            BrokerError::ConnectionLost("closed by client".into()),
        );
        Ok(())
    }
}

/// Channel handle returned by [`InMemoryConnection`].
struct InMemoryChannel {
    id: u64,
    state: SharedState,
}

impl InMemoryChannel {
    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>, BrokerError> {
        let state = lock(&self.state);
        if state.channels.contains_key(&self.id) {
            Ok(state)
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }

    /// Channel-level error: close the channel, then report.
    fn fail(&self, state: &mut BrokerState, err: BrokerError) -> BrokerError {
        close_channel(state, &Arc::downgrade(&self.state), self.id);
        err
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError> {
        let mut state = self.open_state()?;
        let requested = ExchangeSpec { kind, durable };
        match state.exchanges.get(name).copied() {
            Some(existing) if existing != requested => {
                let err = BrokerError::PreconditionFailed(format!(
                    "exchange `{}` already declared as {} (durable={}), requested {} (durable={})",
                    name, existing.kind, existing.durable, kind, durable
                ));
                Err(self.fail(&mut state, err))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), requested);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), BrokerError> {
        let mut state = self.open_state()?;
        if let Some(existing) = state.queues.get(name) {
            if existing.durable != durable {
                let err = BrokerError::PreconditionFailed(format!(
                    "queue `{}` already declared with durable={}",
                    name, existing.durable
                ));
                return Err(self.fail(&mut state, err));
            }
        } else {
            state.queues.insert(name.to_string(), QueueState::new(durable));
        }
        let limit = state.log_limit();
        push_bounded(&mut state.queue_declarations, limit, name.to_string());
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.open_state()?;
        if !state.queues.contains_key(queue) {
            let err = BrokerError::NotFound(format!("queue `{}`", queue));
            return Err(self.fail(&mut state, err));
        }
        if !state.exchanges.contains_key(exchange) {
            let err = BrokerError::NotFound(format!("exchange `{}`", exchange));
            return Err(self.fail(&mut state, err));
        }
        let binding = Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            pattern: pattern.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        persistent: bool,
    ) -> Result<bool, BrokerError> {
        let weak = Arc::downgrade(&self.state);
        let mut guard = self.open_state()?;
        let state = &mut *guard;

        let Some(declared) = state.exchanges.get(exchange).copied() else {
            let err = BrokerError::NotFound(format!("exchange `{}`", exchange));
            return Err(self.fail(state, err));
        };

        let limit = state.log_limit();
        push_bounded(
            &mut state.published,
            limit,
            PublishedMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                body: body.clone(),
                persistent,
            },
        );

        // One copy per queue, however many of its bindings match
        let mut targets: Vec<String> = Vec::new();
        for binding in state.bindings.iter().filter(|b| b.exchange == exchange) {
            if routes(declared.kind, &binding.pattern, routing_key) && !targets.contains(&binding.queue)
            {
                targets.push(binding.queue.clone());
            }
        }

        for name in targets {
            if let Some(queue) = state.queues.get_mut(&name) {
                queue.ready.push_back(StoredMessage {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    body: body.clone(),
                    redelivered: false,
                });
                dispatch(&weak, &name, queue);
            }
        }

        Ok(true)
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, BrokerError> {
        let weak = Arc::downgrade(&self.state);
        let mut guard = self.open_state()?;
        let state = &mut *guard;

        let Some(queue_state) = state.queues.get_mut(queue) else {
            let err = BrokerError::NotFound(format!("queue `{}`", queue));
            return Err(self.fail(state, err));
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        queue_state.consumers.push(ConsumerSlot {
            channel: self.id,
            no_ack,
            sender,
        });
        dispatch(&weak, queue, queue_state);

        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        if state.fail_channel_close {
            return Err(BrokerError::Protocol("channel close failed".into()));
        }
        close_channel(&mut state, &Arc::downgrade(&self.state), self.id);
        Ok(())
    }
}

fn routes(kind: ExchangeKind, pattern: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Topic => topic::matches(pattern, routing_key),
        ExchangeKind::Direct => pattern == routing_key,
        ExchangeKind::Fanout => true,
        ExchangeKind::Headers => false,
    }
}

/// Hand ready messages to consumers, round-robin.
fn dispatch(weak: &WeakState, name: &str, queue: &mut QueueState) {
    while !queue.consumers.is_empty() {
        let Some(message) = queue.ready.pop_front() else {
            break;
        };
        let index = queue.cursor % queue.consumers.len();
        let tag = queue.next_tag;
        queue.next_tag += 1;

        let consumer = &queue.consumers[index];
        let acker: Box<dyn Acknowledger> = if consumer.no_ack {
            Box::new(AutoAcker {
                state: weak.clone(),
                channel: consumer.channel,
                tag,
            })
        } else {
            Box::new(MemoryAcker {
                state: weak.clone(),
                queue: name.to_string(),
                tag,
            })
        };
        let delivery = Delivery::new(
            message.exchange.clone(),
            message.routing_key.clone(),
            message.redelivered,
            message.body.clone(),
            acker,
        );

        if consumer.sender.send(Ok(delivery)).is_err() {
            // Receiver gone: forget the consumer and try the next one
            queue.consumers.remove(index);
            queue.ready.push_front(message);
            continue;
        }

        if !consumer.no_ack {
            let channel = consumer.channel;
            queue.unacked.insert(tag, Unacked { channel, message });
        }
        queue.cursor = index + 1;
    }
}

/// Close a channel: drop its consumers and requeue its unacknowledged messages.
fn close_channel(state: &mut BrokerState, weak: &WeakState, channel: u64) {
    if state.channels.remove(&channel).is_none() {
        return;
    }
    for (name, queue) in state.queues.iter_mut() {
        queue.consumers.retain(|c| c.channel != channel);

        let mut orphaned: Vec<u64> = queue
            .unacked
            .iter()
            .filter(|(_, u)| u.channel == channel)
            .map(|(tag, _)| *tag)
            .collect();
        orphaned.sort_unstable();
        for tag in orphaned.into_iter().rev() {
            if let Some(Unacked { mut message, .. }) = queue.unacked.remove(&tag) {
                message.redelivered = true;
                queue.ready.push_front(message);
            }
        }
        dispatch(weak, name, queue);
    }
}

fn close_connection(state: &mut BrokerState, weak: &WeakState, connection: u64, reason: BrokerError) {
    let channels: Vec<u64> = state
        .channels
        .iter()
        .filter(|(_, owner)| **owner == connection)
        .map(|(id, _)| *id)
        .collect();
    for channel in channels {
        close_channel(state, weak, channel);
    }
    if let Some(closed_tx) = state.connections.remove(&connection) {
        closed_tx.send_replace(Some(reason));
    }
}

/// Acknowledger for manual-ack deliveries.
struct MemoryAcker {
    state: WeakState,
    queue: String,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self, requeue: Option<bool>) -> Result<(), BrokerError> {
        let state = self
            .state
            .upgrade()
            .ok_or_else(|| BrokerError::ConnectionLost("broker dropped".into()))?;
        let mut guard = lock(&state);
        let queue = guard
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| BrokerError::NotFound(format!("queue `{}`", self.queue)))?;
        let Unacked { mut message, .. } = queue.unacked.remove(&self.tag).ok_or_else(|| {
            BrokerError::Protocol(format!("unknown delivery tag {}", self.tag))
        })?;

        match requeue {
            None => {}
            Some(true) => {
                message.redelivered = true;
                queue.ready.push_front(message);
                dispatch(&self.state, &self.queue, queue);
            }
            Some(false) => queue.dead_lettered += 1,
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.settle(None)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.settle(Some(requeue))
    }
}

/// Deliveries on `no_ack` consumers are already settled. Settling one
/// again is a protocol violation: the channel is closed.
struct AutoAcker {
    state: WeakState,
    channel: u64,
    tag: u64,
}

impl AutoAcker {
    fn reject(&self) -> BrokerError {
        if let Some(state) = self.state.upgrade() {
            close_channel(&mut lock(&state), &self.state, self.channel);
        }
        BrokerError::PreconditionFailed(format!("unknown delivery tag {}", self.tag))
    }
}

#[async_trait]
impl Acknowledger for AutoAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        Err(self.reject())
    }

    async fn nack(&self, _requeue: bool) -> Result<(), BrokerError> {
        Err(self.reject())
    }
}
