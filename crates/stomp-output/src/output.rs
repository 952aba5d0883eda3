//! The STOMP output: connect on register, one transaction per batch,
//! drain and disconnect on close.

use crate::config::StompOutputConfig;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::{StompError, StompResult};
use crate::event::Event;
use crate::inflight::InFlightTracker;
use crate::sender::{BatchHandle, BatchSender};
use crate::shutdown::ShutdownCoordinator;
use crate::transport::{StompTransport, TcpTransport};
use std::sync::Arc;
use tracing::info;

pub struct StompOutput {
    config: StompOutputConfig,
    connection: Arc<ConnectionManager>,
    tracker: Arc<InFlightTracker>,
    sender: BatchSender,
    shutdown: ShutdownCoordinator,
}

impl StompOutput {
    /// Connect to the broker over TCP.
    ///
    /// With the default reconnect policy this waits until the broker is
    /// reachable.
    pub async fn register(config: StompOutputConfig) -> StompResult<Self> {
        config.validate()?;
        let transport = Arc::new(TcpTransport::new(config.connect_timeout(), config.debug));
        Self::with_transport(config, transport).await
    }

    /// Same as [`StompOutput::register`] with a caller-supplied transport.
    pub async fn with_transport(
        config: StompOutputConfig,
        transport: Arc<dyn StompTransport>,
    ) -> StompResult<Self> {
        config.validate()?;
        let endpoint = config.endpoint();
        info!(
            url = %endpoint.url()?,
            vhost = %endpoint.virtual_host(),
            destination = %config.destination,
            "Registering stomp output"
        );

        let tracker = Arc::new(InFlightTracker::new());
        let connection = Arc::new(ConnectionManager::new(
            endpoint,
            transport.clone(),
            config.reconnect.clone(),
        ));
        connection.connect().await?;
        connection.spawn_supervisor();

        let sender = BatchSender::new(
            transport,
            tracker.clone(),
            config.destination.clone(),
            config.headers.clone(),
            config.host.clone(),
        );
        let shutdown = ShutdownCoordinator::new(
            tracker.clone(),
            connection.clone(),
            config.disconnect_receipt_id.clone(),
            config.drain_timeout(),
            config.disconnect_timeout(),
        );

        Ok(Self {
            config,
            connection,
            tracker,
            sender,
            shutdown,
        })
    }

    /// Send `events` as one transaction.
    pub async fn multi_receive<E: Event>(&self, events: &[E]) -> StompResult<BatchHandle> {
        if self.shutdown.is_stopping() {
            return Err(StompError::ShuttingDown);
        }
        self.sender.send_batch(events).await
    }

    /// Drain in-flight sends and disconnect.
    pub async fn close(&self) -> StompResult<()> {
        self.shutdown.close().await
    }

    /// Sends still waiting for a receipt.
    pub fn in_flight(&self) -> usize {
        self.tracker.current()
    }

    pub fn tracker(&self) -> &Arc<InFlightTracker> {
        &self.tracker
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn config(&self) -> &StompOutputConfig {
        &self.config
    }
}
