//! Count of sends still waiting for the broker's answer.

use crate::error::{StompError, StompResult};
use std::time::Duration;
use tokio::sync::watch;
use tracing::warn;

/// Tracks unresolved sends for one output.
///
/// Zero means every issued send has been acknowledged or has failed.
/// The count never goes below zero.
#[derive(Debug)]
pub struct InFlightTracker {
    count: watch::Sender<usize>,
}

impl Default for InFlightTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl InFlightTracker {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self { count }
    }

    /// Current number of unresolved sends.
    pub fn current(&self) -> usize {
        *self.count.borrow()
    }

    /// Watch the count change.
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.count.subscribe()
    }

    /// Record `n` newly issued sends.
    pub fn add(&self, n: usize) {
        if n > 0 {
            self.count.send_modify(|count| *count += n);
        }
    }

    /// Record one send as resolved. Returns the remaining count.
    pub fn resolve(&self) -> usize {
        self.resolve_many(1)
    }

    /// Record `n` sends as resolved. Returns the remaining count.
    pub fn resolve_many(&self, n: usize) -> usize {
        let mut remaining = 0;
        self.count.send_if_modified(|count| {
            if n > *count {
                warn!(resolved = n, in_flight = *count, "More sends resolved than were in flight");
            }
            let next = count.saturating_sub(n);
            remaining = next;
            if next == *count {
                return false;
            }
            *count = next;
            true
        });
        remaining
    }

    /// Wait until nothing is in flight.
    pub async fn wait_drained(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives in `self`, so the channel cannot close here
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    /// Wait until nothing is in flight, or fail after `limit`.
    pub async fn wait_drained_for(&self, limit: Duration) -> StompResult<()> {
        match tokio::time::timeout(limit, self.wait_drained()).await {
            Ok(()) => Ok(()),
            Err(_) => Err(StompError::ShutdownTimeout {
                pending: self.current(),
            }),
        }
    }
}
