//! Shutdown coordination: drain in-flight sends, then disconnect once.

use crate::connection::ConnectionManager;
use crate::error::{StompError, StompResult};
use crate::inflight::InFlightTracker;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Gates teardown on outstanding acknowledgments.
pub struct ShutdownCoordinator {
    stopping: AtomicBool,
    tracker: Arc<InFlightTracker>,
    connection: Arc<ConnectionManager>,
    receipt_id: String,
    drain_timeout: Option<Duration>,
    disconnect_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(
        tracker: Arc<InFlightTracker>,
        connection: Arc<ConnectionManager>,
        receipt_id: impl Into<String>,
        drain_timeout: Option<Duration>,
        disconnect_timeout: Duration,
    ) -> Self {
        Self {
            stopping: AtomicBool::new(false),
            tracker,
            connection,
            receipt_id: receipt_id.into(),
            drain_timeout,
            disconnect_timeout,
        }
    }

    /// Whether `close` has been called.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Wait for every in-flight send to resolve, then disconnect.
    ///
    /// Only the first call does anything. With a drain timeout, an expired
    /// wait still disconnects and then reports `ShutdownTimeout`.
    pub async fn close(&self) -> StompResult<()> {
        if self.stopping.swap(true, Ordering::SeqCst) {
            debug!("Close already in progress");
            return Ok(());
        }

        warn!(in_flight = self.tracker.current(), "Disconnecting from stomp broker");

        let drained = match self.drain_timeout {
            Some(limit) => self.tracker.wait_drained_for(limit).await,
            None => {
                self.tracker.wait_drained().await;
                Ok(())
            }
        };
        if let Err(StompError::ShutdownTimeout { pending }) = &drained {
            warn!(pending, "Gave up waiting for stomp receipts");
        }

        let disconnected = self
            .connection
            .disconnect(&self.receipt_id, self.disconnect_timeout)
            .await;

        drained?;
        disconnected?;
        info!("Stomp output closed");
        Ok(())
    }
}
