//! Service Bus - reconnecting topic publish/subscribe
//!
//! This module provides the bus each service holds, the broker abstraction
//! it is written against, and an in-memory broker for tests.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Bus (per service)                        │
//! │  connect() / publish() / subscribe() / close()              │
//! └─────────────────────────────────────────────────────────────┘
//!        │                  │                     │
//!        ▼                  ▼                     ▼
//! ┌──────────────┐   ┌─────────────┐   ┌──────────────────────┐
//! │  Connection  │──▶│ Subscriber  │   │      Publisher       │
//! │  Supervisor  │   │ (replays    │   │ (stamps _metadata,   │
//! │ (reconnects) │   │  registry)  │   │  persistent publish) │
//! └──────────────┘   └─────────────┘   └──────────────────────┘
//!        │                  │                     │
//!        ▼                  ▼                     ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │          ChannelManager (one channel per connection)        │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │   Broker traits: Broker / BrokerConnection / BrokerChannel  │
//! └─────────────────────────────────────────────────────────────┘
//!          │                                   │
//!          ▼                                   ▼
//! ┌─────────────────┐               ┌─────────────────────┐
//! │ InMemoryBroker  │               │     AmqpBroker      │
//! │   (included)    │               │  (feature `amqp`)   │
//! └─────────────────┘               └─────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let bus = Bus::amqp(BusConfig::from_env()?);
//! bus.subscribe("user.events", "#", "audit-log-queue", AuditHandler::new(sinks)).await?;
//! bus.connect().await?;
//!
//! bus.publish("user.events", "user.registered", &json!({ "type": "user.registered", "userId": id })).await;
//! ```

#[cfg(feature = "amqp")]
mod amqp_broker;
mod broker;
#[allow(clippy::module_inception)]
mod bus;
mod channel;
mod in_memory_broker;
mod publisher;
mod stats;
mod subscriber;
mod supervisor;

#[cfg(feature = "amqp")]
pub use amqp_broker::AmqpBroker;
pub use broker::{
    Acknowledger, Broker, BrokerChannel, BrokerConnection, Delivery, DeliveryStream, ExchangeKind,
};
pub use bus::Bus;
pub use in_memory_broker::{InMemoryBroker, PublishedMessage, DEFAULT_LOG_LIMIT};
pub use stats::BusStats;
pub use subscriber::{AckMode, MessageHandler, Subscription};
pub use supervisor::ConnectionState;
