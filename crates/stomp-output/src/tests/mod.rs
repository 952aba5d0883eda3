//! Integration tests against a mock broker on a loopback port.
//!
//! - `harness.rs`   - MockBroker and helpers
//! - `batch.rs`     - transactional sends, template expansion, receipts
//! - `reconnect.rs` - connect retries, connection loss mid-batch
//! - `shutdown.rs`  - drain-then-disconnect, idempotent close

mod reconnect;

#[allow(unused_imports)]
pub use harness::{MockBroker, ReceiptBehavior};
