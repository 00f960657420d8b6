//! Connection supervisor.
//!
//! Owns the physical connection and runs one background task per bus that
//! connects, watches for loss, and reconnects on a fixed interval until the
//! bus is closed. Each successful connection gets a fresh channel from the
//! [`ChannelManager`], and the subscriptions are replayed on it before the
//! state flips to [`ConnectionState::Connected`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::broker::{Broker, BrokerConnection};
use super::channel::{ChannelHandle, ChannelManager};
use super::stats::Counters;
use crate::config::ReconnectPolicy;
use crate::error::BusError;

/// Lifecycle of the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// A channel is open and every subscription has been applied to it.
    Connected,
    /// `close()` was called. Terminal.
    Closing,
}

/// Told about every channel the supervisor opens and loses.
#[async_trait]
pub(crate) trait ChannelObserver: Send + Sync {
    /// A fresh channel is ready. An error fails the connection attempt.
    async fn channel_opened(&self, handle: ChannelHandle) -> Result<(), BusError>;

    /// The channel is gone, together with everything consuming from it.
    async fn channel_lost(&self);
}

pub(crate) struct ConnectionSupervisor {
    broker: Arc<dyn Broker>,
    policy: ReconnectPolicy,
    channels: Arc<ChannelManager>,
    observer: Arc<dyn ChannelObserver>,
    counters: Arc<Counters>,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
    running: AtomicBool,
    /// The bus was dropped without `close()`; the task cleans up on exit.
    abandoned: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
    connection: Mutex<Option<Arc<dyn BrokerConnection>>>,
}

impl ConnectionSupervisor {
    pub(crate) fn new(
        broker: Arc<dyn Broker>,
        policy: ReconnectPolicy,
        channels: Arc<ChannelManager>,
        observer: Arc<dyn ChannelObserver>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            broker,
            policy,
            channels,
            observer,
            counters,
            state: watch::Sender::new(ConnectionState::Disconnected),
            shutdown: watch::Sender::new(false),
            running: AtomicBool::new(false),
            abandoned: AtomicBool::new(false),
            task: Mutex::new(None),
            connection: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.state() == ConnectionState::Closing
    }

    /// Start supervising and wait for the first attempt to finish.
    ///
    /// Returns at once when supervision is already running. A failed first
    /// attempt is not an error: it is retried in the background.
    pub(crate) async fn connect(self: &Arc<Self>) -> Result<(), BusError> {
        if self.is_closing() {
            return Err(BusError::NotConnected);
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("connect already in progress");
            return Ok(());
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(Arc::clone(self).supervise(ready_tx));
        if let Some(previous) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task)
        {
            // a supervisor that gave up after max_attempts has already finished
            previous.abort();
        }

        match ready_rx.await {
            Ok(()) => Ok(()),
            // the task stopped before finishing its first attempt: close() won
            Err(_) => Err(BusError::NotConnected),
        }
    }

    /// Wait until the state is `Connected`, up to `timeout`.
    pub(crate) async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut state = self.state.subscribe();
        let connected = matches!(
            tokio::time::timeout(timeout, state.wait_for(|s| *s == ConnectionState::Connected)).await,
            Ok(Ok(_))
        );
        connected
    }

    /// Stop supervising for good and hand back the live connection, if any.
    ///
    /// Cancels a pending reconnect and waits for the task to exit.
    pub(crate) async fn shutdown(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.state.send_replace(ConnectionState::Closing);
        self.shutdown.send_replace(true);

        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                if err.is_panic() {
                    error!(error = %err, "connection supervisor panicked");
                }
            }
        }
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Signal shutdown without waiting; used when the bus is dropped.
    ///
    /// The supervision task releases the channel and the connection itself
    /// on its way out.
    pub(crate) fn abandon(&self) {
        self.abandoned.store(true, Ordering::SeqCst);
        self.state.send_replace(ConnectionState::Closing);
        self.shutdown.send_replace(true);
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Closing || *state == next {
                return false;
            }
            debug!(from = ?*state, to = ?next, "connection state changed");
            *state = next;
            true
        });
    }

    async fn supervise(self: Arc<Self>, ready: oneshot::Sender<()>) {
        let mut ready = Some(ready);
        let mut shutdown = self.shutdown.subscribe();
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(ConnectionState::Connecting);

            let attempt = tokio::select! {
                _ = stopped(&mut shutdown) => break,
                attempt = self.establish() => attempt,
            };

            match attempt {
                Ok((connection, handle)) => {
                    failures = 0;
                    self.set_state(ConnectionState::Connected);
                    info!(generation = handle.generation(), "connected to broker");
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(());
                    }

                    let reason = tokio::select! {
                        _ = stopped(&mut shutdown) => break,
                        reason = connection.closed() => reason.to_string(),
                        _ = self.channels.failed(handle.generation()) => "channel failed".to_string(),
                    };
                    warn!(reason = %reason, "broker connection lost");
                    self.teardown(&connection).await;
                    self.set_state(ConnectionState::Disconnected);
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    warn!(error = %err, attempt = failures, "connection attempt failed");
                    self.set_state(ConnectionState::Disconnected);

                    if self.policy.max_attempts.is_some_and(|max| failures >= max) {
                        // cleared before anyone is woken, so the next connect() starts over
                        self.running.store(false, Ordering::SeqCst);
                        error!(attempts = failures, "giving up reconnecting to broker");
                        if let Some(ready) = ready.take() {
                            let _ = ready.send(());
                        }
                        return;
                    }
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(());
                    }
                }
            }

            debug!(interval_ms = self.policy.interval.as_millis() as u64, "reconnect scheduled");
            tokio::select! {
                _ = stopped(&mut shutdown) => break,
                _ = tokio::time::sleep(self.policy.interval) => {}
            }
        }

        if self.abandoned.load(Ordering::SeqCst) {
            self.release_abandoned().await;
        }
        self.running.store(false, Ordering::SeqCst);
        debug!("connection supervisor stopped");
    }

    /// One connection attempt: transport, channel, subscription replay.
    async fn establish(&self) -> Result<(Arc<dyn BrokerConnection>, ChannelHandle), BusError> {
        let connection = self.broker.connect().await.map_err(BusError::Transport)?;
        *self.connection.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&connection));

        let handle = match self.channels.open(&connection).await {
            Ok(handle) => handle,
            Err(err) => {
                self.teardown(&connection).await;
                return Err(err);
            }
        };
        if let Err(err) = self.observer.channel_opened(handle.clone()).await {
            self.teardown(&connection).await;
            return Err(err);
        }

        self.counters.connected();
        Ok((connection, handle))
    }

    async fn teardown(&self, connection: &Arc<dyn BrokerConnection>) {
        self.observer.channel_lost().await;
        self.channels.clear();
        {
            let mut current = self.connection.lock().unwrap_or_else(PoisonError::into_inner);
            if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, connection)) {
                current.take();
            }
        }
        if let Err(err) = connection.close().await {
            debug!(error = %err, "closing a failed connection");
        }
    }

    /// Stop consumers, then release the channel and the connection of a
    /// bus that was dropped without being closed.
    async fn release_abandoned(&self) {
        self.observer.channel_lost().await;
        if let Err(err) = self.channels.release().await {
            debug!(error = %err, "releasing channel of dropped bus");
        }
        let connection = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(connection) = connection {
            if let Err(err) = connection.close().await {
                debug!(error = %err, "releasing connection of dropped bus");
            }
            info!("dropped bus released its connection");
        }
    }
}

/// Resolves once shutdown has been requested.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
