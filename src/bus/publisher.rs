//! Publisher: stamps, serializes and hands messages to the current channel.
//!
//! Nothing is buffered. When no channel exists the publish fails at once
//! with [`PublishError::NotConnected`]; retrying is the caller's business.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use super::channel::ChannelManager;
use crate::envelope::{self, Metadata, PublishOptions};
use crate::error::{BusError, PublishError};
use crate::topic;

pub(crate) struct Publisher {
    service: String,
    channels: Arc<ChannelManager>,
}

impl Publisher {
    pub(crate) fn new(service: impl Into<String>, channels: Arc<ChannelManager>) -> Self {
        Self {
            service: service.into(),
            channels,
        }
    }

    /// Publish `message` to `exchange` with `routing_key`, marked persistent.
    ///
    /// Returns the broker's flow-control flag: `true` when the message was
    /// taken into its buffer.
    pub(crate) async fn publish<T: Serialize + ?Sized>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &T,
        options: &PublishOptions,
    ) -> Result<bool, PublishError> {
        if exchange.trim().is_empty() {
            return Err(PublishError::InvalidTarget("exchange name is empty".into()));
        }
        topic::validate_routing_key(routing_key).map_err(PublishError::InvalidTarget)?;

        let handle = self.channels.current().ok_or(PublishError::NotConnected)?;

        // each call takes its own timestamp
        let metadata = Metadata {
            request_id: options.request_id.clone(),
            user_id: options.user_id.clone(),
            ..Metadata::now(self.service.as_str())
        };
        let body = envelope::stamp(message, &metadata)?;

        self.channels
            .declare_exchange(&handle, exchange)
            .await
            .map_err(|err| match err {
                BusError::NotConnected => PublishError::NotConnected,
                other => PublishError::Declaration(other),
            })?;

        let accepted = handle
            .channel()
            .publish(exchange, routing_key, body, true)
            .await
            .map_err(|err| {
                self.channels.invalidate(handle.generation());
                if err.is_disconnect() {
                    warn!(exchange, routing_key, error = %err, "channel lost while publishing");
                    PublishError::NotConnected
                } else {
                    PublishError::Rejected(err)
                }
            })?;
        debug!(exchange, routing_key, accepted, "message published");
        Ok(accepted)
    }
}
