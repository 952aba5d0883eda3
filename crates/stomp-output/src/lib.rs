//! Transactional STOMP output for batched log events.
//!
//! Each batch handed to [`StompOutput::multi_receive`] is sent inside one
//! broker transaction, one SEND per event, with destination and headers
//! expanded from `%{field}` templates against the event.
//!
//! # Core Invariants
//!
//! 1. **Counted**: every issued send is tracked until the broker
//!    acknowledges or rejects it, or its connection drops
//! 2. **Never Negative**: the in-flight count saturates at zero
//! 3. **Drain Before Disconnect**: `close` waits for the count to reach
//!    zero before sending DISCONNECT, and sends it at most once
//! 4. **No Carry-Over**: receipts of a lost connection fail; nothing is
//!    resumed on the next session
//!
//! # Architecture
//!
//! ```text
//! events -> BatchSender -> StompTransport -> broker
//!              |                 |
//!        InFlightTracker <- receipts
//!              |
//!     ShutdownCoordinator -> ConnectionManager (reconnect supervisor)
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod frame;
pub mod inflight;
pub mod logging;
pub mod output;
pub mod sender;
pub mod shutdown;
pub mod template;
pub mod transport;

#[cfg(test)]
mod tests;

pub use config::{BrokerEndpoint, ReconnectPolicy, Secret, StompOutputConfig};
pub use connection::{ConnectionManager, ConnectionState};
pub use error::{StompError, StompResult};
pub use event::{Event, JsonEvent};
pub use frame::Frame;
pub use inflight::InFlightTracker;
pub use output::StompOutput;
pub use sender::{BatchHandle, BatchOutcome, BatchSender, OutboundMessage, SendFailure};
pub use shutdown::ShutdownCoordinator;
pub use transport::{ConnectionEvent, PendingReceipt, ReceiptOutcome, StompTransport, TcpTransport};
