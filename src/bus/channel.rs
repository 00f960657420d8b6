//! Channel manager: the single logical channel a service uses.
//!
//! A fresh channel is opened on every successful (re)connection. Every
//! declaration the bus makes is topic + durable, so repeating it is
//! harmless. A failed declaration is fatal to the channel: the manager
//! drops it and signals the supervisor, which takes the same reconnect path
//! as for a lost connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use tokio::sync::watch;
use tracing::{debug, error, warn};

use super::broker::{BrokerChannel, BrokerConnection, ExchangeKind};
use crate::error::{BrokerError, BusError};

struct ChannelSlot {
    generation: u64,
    channel: Arc<dyn BrokerChannel>,
    /// The channel never keeps its connection alive.
    connection: Weak<dyn BrokerConnection>,
}

/// A usable channel, tagged with the generation it was opened in.
#[derive(Clone)]
pub(crate) struct ChannelHandle {
    generation: u64,
    channel: Arc<dyn BrokerChannel>,
}

impl ChannelHandle {
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn channel(&self) -> &Arc<dyn BrokerChannel> {
        &self.channel
    }
}

pub(crate) struct ChannelManager {
    slot: RwLock<Option<ChannelSlot>>,
    generation: AtomicU64,
    /// Highest generation that has failed.
    failed: watch::Sender<u64>,
}

impl ChannelManager {
    pub(crate) fn new() -> Self {
        Self {
            slot: RwLock::new(None),
            generation: AtomicU64::new(0),
            failed: watch::Sender::new(0),
        }
    }

    /// Open the channel for a freshly established connection.
    pub(crate) async fn open(
        &self,
        connection: &Arc<dyn BrokerConnection>,
    ) -> Result<ChannelHandle, BusError> {
        let channel = connection
            .create_channel()
            .await
            .map_err(BusError::Channel)?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = Some(ChannelSlot {
            generation,
            channel: Arc::clone(&channel),
            connection: Arc::downgrade(connection),
        });
        debug!(generation, "channel opened");

        Ok(ChannelHandle {
            generation,
            channel,
        })
    }

    /// The current channel, if its connection is still alive.
    pub(crate) fn current(&self) -> Option<ChannelHandle> {
        let slot = self.slot.read().unwrap_or_else(PoisonError::into_inner);
        slot.as_ref()
            .filter(|s| s.connection.strong_count() > 0)
            .map(|s| ChannelHandle {
                generation: s.generation,
                channel: Arc::clone(&s.channel),
            })
    }

    pub(crate) async fn declare_exchange(
        &self,
        handle: &ChannelHandle,
        exchange: &str,
    ) -> Result<(), BusError> {
        handle
            .channel
            .declare_exchange(exchange, ExchangeKind::Topic, true)
            .await
            .map_err(|source| self.declaration_failed(handle, format!("exchange `{}`", exchange), source))
    }

    pub(crate) async fn declare_queue(
        &self,
        handle: &ChannelHandle,
        queue: &str,
    ) -> Result<(), BusError> {
        handle
            .channel
            .declare_queue(queue, true)
            .await
            .map_err(|source| self.declaration_failed(handle, format!("queue `{}`", queue), source))
    }

    pub(crate) async fn bind_queue(
        &self,
        handle: &ChannelHandle,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), BusError> {
        handle
            .channel
            .bind_queue(queue, exchange, pattern)
            .await
            .map_err(|source| {
                self.declaration_failed(
                    handle,
                    format!("binding `{}` -> `{}` ({})", exchange, queue, pattern),
                    source,
                )
            })
    }

    fn declaration_failed(&self, handle: &ChannelHandle, entity: String, source: BrokerError) -> BusError {
        self.invalidate(handle.generation);
        if source.is_disconnect() {
            // lost before the supervisor noticed
            warn!(entity = %entity, error = %source, generation = handle.generation, "channel lost during declaration");
            return BusError::NotConnected;
        }
        error!(entity = %entity, error = %source, generation = handle.generation, "declaration failed, channel is unusable");
        BusError::Declaration { entity, source }
    }

    /// Mark the channel of `generation` as failed and drop it.
    pub(crate) fn invalidate(&self, generation: u64) {
        {
            let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
            if slot.as_ref().map(|s| s.generation) == Some(generation) {
                *slot = None;
            }
        }
        self.failed.send_if_modified(|failed| {
            if *failed < generation {
                *failed = generation;
                true
            } else {
                false
            }
        });
    }

    /// Resolves once the channel of `generation` has been invalidated.
    pub(crate) async fn failed(&self, generation: u64) {
        let mut failed = self.failed.subscribe();
        let _ = failed.wait_for(|g| *g >= generation).await;
    }

    /// Forget the channel without closing it (its connection is gone).
    pub(crate) fn clear(&self) {
        self.slot.write().unwrap_or_else(PoisonError::into_inner).take();
    }

    /// Close the current channel, if any.
    pub(crate) async fn release(&self) -> Result<(), BrokerError> {
        let slot = self.slot.write().unwrap_or_else(PoisonError::into_inner).take();
        match slot {
            Some(slot) => slot.channel.close().await,
            None => Ok(()),
        }
    }
}
