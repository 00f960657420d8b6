pub mod audit;
pub mod bus;
pub mod config;
pub mod envelope;
mod error;
pub mod logging;
pub mod topic;

pub use audit::{AuditHandler, AuditRecord, AuditSink, InMemoryAuditSink};
pub use bus::{AckMode, Bus, BusStats, ConnectionState, InMemoryBroker, MessageHandler, Subscription};
#[cfg(feature = "amqp")]
pub use bus::AmqpBroker;
pub use config::{BusConfig, ReconnectPolicy};
pub use envelope::{Envelope, Metadata, PublishOptions};
pub use error::{BrokerError, BusError, ConfigError, HandlerError, PublishError};
pub use logging::{init_tracing, LogFormat, LogSettings};
