//! Broker connection lifecycle.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> (loss) -> Connecting -> ...
//!                                        \-> (disconnect) -> Disconnected (final)
//! ```
//!
//! Connection loss is picked up by a supervisor task that re-enters the
//! connect loop. The loop is iterative: a failure inside a reconnect
//! sleeps and tries again without nesting.

use crate::config::{BrokerEndpoint, ReconnectPolicy};
use crate::error::{StompError, StompResult};
use crate::transport::{ConnectionEvent, StompTransport};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Owns the broker connection: connect, retry, reconnect, disconnect.
pub struct ConnectionManager {
    endpoint: BrokerEndpoint,
    transport: Arc<dyn StompTransport>,
    policy: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
    stop: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        endpoint: BrokerEndpoint,
        transport: Arc<dyn StompTransport>,
        policy: ReconnectPolicy,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (stop, _) = watch::channel(false);
        Self {
            endpoint,
            transport,
            policy,
            state,
            stop,
            supervisor: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    pub fn transport(&self) -> Arc<dyn StompTransport> {
        self.transport.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Whether a live session exists. Never blocks.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected && self.transport.is_connected()
    }

    /// Whether `disconnect` has been called.
    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Connect, retrying per the reconnect policy.
    ///
    /// With an unbounded policy this only returns an error once
    /// `disconnect` is called.
    pub async fn connect(&self) -> StompResult<()> {
        let mut attempt: u32 = 0;
        loop {
            if self.is_stopped() {
                return Err(StompError::ShuttingDown);
            }
            attempt = attempt.saturating_add(1);
            self.state.send_replace(ConnectionState::Connecting);

            match self.transport.connect(&self.endpoint).await {
                Ok(()) => {
                    self.state.send_replace(ConnectionState::Connected);
                    debug!(host = %self.endpoint.host, attempt, "Connected to stomp server");
                    return Ok(());
                }
                Err(e) if !e.is_retryable() => {
                    self.state.send_replace(ConnectionState::Disconnected);
                    return Err(e);
                }
                Err(e) => {
                    if self.policy.is_exhausted(attempt) {
                        self.state.send_replace(ConnectionState::Disconnected);
                        error!(attempts = attempt, error = %e, "Giving up on stomp server");
                        return Err(StompError::ReconnectExhausted { attempts: attempt });
                    }

                    let delay = self.policy.delay_for(attempt);
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Failed to connect to stomp server, will retry"
                    );
                    if !self.sleep_unless_stopped(delay).await {
                        return Err(StompError::ShuttingDown);
                    }
                }
            }
        }
    }

    /// Returns false if `disconnect` was called during the sleep.
    async fn sleep_unless_stopped(&self, delay: Duration) -> bool {
        let mut stop = self.stop.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(delay) => !self.is_stopped(),
            _ = wait_stopped(&mut stop) => false,
        }
    }

    /// Start watching for connection loss. Idempotent.
    pub fn spawn_supervisor(self: &Arc<Self>) {
        let Ok(mut slot) = self.supervisor.lock() else {
            return;
        };
        if slot.is_some() {
            return;
        }

        let manager = Arc::clone(self);
        let mut events = self.transport.subscribe();
        let mut stop = self.stop.subscribe();

        *slot = Some(tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = events.recv() => event,
                    _ = wait_stopped(&mut stop) => break,
                };

                let reason = match event {
                    Ok(ConnectionEvent::Connected) => continue,
                    Ok(ConnectionEvent::Closed(reason)) => reason,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Missed connection events");
                        if manager.transport.is_connected() {
                            continue;
                        }
                        None
                    }
                    Err(RecvError::Closed) => break,
                };

                if manager.is_stopped() {
                    break;
                }
                if manager.transport.is_connected() {
                    // A newer session is already up
                    continue;
                }

                manager.state.send_replace(ConnectionState::Disconnected);
                warn!(
                    reason = reason.as_deref().unwrap_or("unknown"),
                    "Connection to stomp broker lost, reconnecting"
                );

                match manager.connect().await {
                    Ok(()) => info!("Reconnected to stomp broker"),
                    Err(StompError::ShuttingDown) => break,
                    Err(e) => {
                        error!(error = %e, "Stomp reconnect abandoned");
                        break;
                    }
                }
            }
            debug!("Connection supervisor stopped");
        }));
    }

    /// Send DISCONNECT and wait up to `wait` for `receipt_id`. Final: no
    /// reconnect happens afterwards.
    pub async fn disconnect(&self, receipt_id: &str, wait: Duration) -> StompResult<()> {
        self.stop.send_replace(true);
        if let Some(handle) = self.supervisor.lock().ok().and_then(|mut s| s.take()) {
            handle.abort();
        }

        let result = if self.transport.is_connected() {
            self.transport.disconnect(receipt_id, wait).await
        } else {
            debug!("Not connected, skipping DISCONNECT");
            Ok(())
        };

        self.state.send_replace(ConnectionState::Disconnected);
        match &result {
            Ok(()) => info!(receipt_id = %receipt_id, "Disconnected from stomp broker"),
            Err(e) => warn!(error = %e, "Stomp disconnect did not complete cleanly"),
        }
        result
    }
}

async fn wait_stopped(stop: &mut watch::Receiver<bool>) {
    // Sender outlives every receiver, so an error here never happens
    let _ = stop.wait_for(|stopped| *stopped).await;
}
