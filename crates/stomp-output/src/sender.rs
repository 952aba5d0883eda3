//! Transactional batch sender.
//!
//! Each batch becomes one broker transaction: BEGIN, one SEND per event
//! with a receipt request, COMMIT. Commit does not wait for receipts;
//! they resolve afterwards and are tallied in the batch's [`BatchHandle`].

use crate::error::{StompError, StompResult};
use crate::event::Event;
use crate::frame::Frame;
use crate::inflight::InFlightTracker;
use crate::template;
use crate::transport::{PendingReceipt, ReceiptOutcome, StompTransport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, warn};

/// A message ready for the wire, with templates already expanded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub destination: String,
    pub body: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl OutboundMessage {
    pub fn into_frame(self, transaction: &str) -> Frame {
        Frame::send(&self.destination, transaction, &self.headers, self.body)
    }
}

/// A send that did not make it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendFailure {
    /// Position of the event in its batch.
    pub sequence: usize,
    pub destination: String,
    pub reason: String,
}

/// Final tally of one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub transaction: String,
    pub acknowledged: usize,
    pub failed: Vec<SendFailure>,
}

impl BatchOutcome {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// `Ok(acknowledged)` or the batch's `Send` error.
    pub fn into_result(self) -> StompResult<usize> {
        if self.failed.is_empty() {
            return Ok(self.acknowledged);
        }
        let reason = self.failed[0].reason.clone();
        Err(StompError::Send {
            transaction: self.transaction,
            failed: self.failed.len(),
            reason,
        })
    }
}

/// Shared record of one batch, updated from receipt tasks.
#[derive(Debug)]
struct BatchLedger {
    aborted: AtomicBool,
    outcome: Mutex<BatchOutcome>,
    remaining: watch::Sender<usize>,
}

impl BatchLedger {
    fn new(transaction: &str, size: usize) -> Self {
        let (remaining, _) = watch::channel(size);
        Self {
            aborted: AtomicBool::new(false),
            outcome: Mutex::new(BatchOutcome {
                transaction: transaction.to_string(),
                ..Default::default()
            }),
            remaining,
        }
    }

    fn record(&self, sequence: usize, destination: &str, outcome: ReceiptOutcome) {
        let outcome = match outcome {
            ReceiptOutcome::Acknowledged if self.aborted.load(Ordering::SeqCst) => {
                ReceiptOutcome::Failed("transaction aborted".to_string())
            }
            other => other,
        };

        if let Ok(mut tally) = self.outcome.lock() {
            match outcome {
                ReceiptOutcome::Acknowledged => tally.acknowledged += 1,
                ReceiptOutcome::Failed(reason) => tally.failed.push(SendFailure {
                    sequence,
                    destination: destination.to_string(),
                    reason,
                }),
            }
        }
        self.remaining.send_modify(|n| *n = n.saturating_sub(1));
    }

    fn snapshot(&self) -> BatchOutcome {
        match self.outcome.lock() {
            Ok(tally) => {
                let mut outcome = tally.clone();
                outcome.failed.sort_by_key(|f| f.sequence);
                outcome
            }
            Err(_) => BatchOutcome::default(),
        }
    }
}

/// Handle on a committed batch whose receipts may still be arriving.
#[derive(Debug, Clone)]
pub struct BatchHandle {
    transaction: String,
    size: usize,
    ledger: Arc<BatchLedger>,
}

impl BatchHandle {
    pub fn transaction(&self) -> &str {
        &self.transaction
    }

    /// Number of messages in the batch.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Sends of this batch still waiting for an answer.
    pub fn pending(&self) -> usize {
        *self.ledger.remaining.borrow()
    }

    /// Wait for every send of the batch to resolve.
    pub async fn completion(&self) -> BatchOutcome {
        let mut rx = self.ledger.remaining.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
        self.ledger.snapshot()
    }
}

/// Sends batches of events inside broker transactions.
pub struct BatchSender {
    transport: Arc<dyn StompTransport>,
    tracker: Arc<InFlightTracker>,
    destination: String,
    headers: Vec<(String, String)>,
    host: String,
}

impl BatchSender {
    pub fn new(
        transport: Arc<dyn StompTransport>,
        tracker: Arc<InFlightTracker>,
        destination: impl Into<String>,
        headers: Vec<(String, String)>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            tracker,
            destination: destination.into(),
            headers,
            host: host.into(),
        }
    }

    /// Expand templates against `event`.
    pub fn build_message<E: Event>(&self, event: &E) -> StompResult<OutboundMessage> {
        Ok(OutboundMessage {
            destination: expand_with(event, &self.destination),
            body: event.to_payload()?,
            headers: self
                .headers
                .iter()
                .map(|(name, template)| (name.clone(), expand_with(event, template)))
                .collect(),
        })
    }

    /// Send `events` in one transaction.
    ///
    /// Returns once COMMIT is queued. If anything fails before that, the
    /// transaction is aborted and every message of the batch is reported
    /// failed; receipts for messages already issued still drain the
    /// in-flight count as they resolve.
    pub async fn send_batch<E: Event>(&self, events: &[E]) -> StompResult<BatchHandle> {
        debug!(host = %self.host, events = events.len(), "stomp sending events in batch");

        let transaction = format!("tx-{}", uuid::Uuid::new_v4());
        let ledger = Arc::new(BatchLedger::new(&transaction, events.len()));
        let handle = BatchHandle {
            transaction: transaction.clone(),
            size: events.len(),
            ledger: ledger.clone(),
        };

        if events.is_empty() {
            return Ok(handle);
        }

        if !self.transport.is_connected() {
            return Err(StompError::Send {
                transaction,
                failed: events.len(),
                reason: "not connected".to_string(),
            });
        }

        self.tracker.add(events.len());

        if let Err(e) = self.transport.send_frame(Frame::begin(&transaction)).await {
            self.tracker.resolve_many(events.len());
            return Err(self.fail(&transaction, &ledger, events.len(), e).await);
        }

        for (sequence, event) in events.iter().enumerate() {
            let issued = self.issue(sequence, event, &transaction).await;
            match issued {
                Ok((destination, pending)) => {
                    self.spawn_receipt_watch(sequence, destination, pending, ledger.clone());
                }
                Err(e) => {
                    // This send and the ones after it were never issued
                    self.tracker.resolve_many(events.len() - sequence);
                    return Err(self.fail(&transaction, &ledger, events.len(), e).await);
                }
            }
        }

        if let Err(e) = self.transport.send_frame(Frame::commit(&transaction)).await {
            return Err(self.fail(&transaction, &ledger, events.len(), e).await);
        }

        debug!(transaction = %transaction, events = events.len(), "Committed batch");
        Ok(handle)
    }

    async fn issue<E: Event>(
        &self,
        sequence: usize,
        event: &E,
        transaction: &str,
    ) -> StompResult<(String, PendingReceipt)> {
        let message = self.build_message(event)?;
        let destination = message.destination.clone();
        let pending = self
            .transport
            .send_with_receipt(message.into_frame(transaction))
            .await?;
        debug!(transaction = %transaction, sequence, destination = %destination, "Issued send");
        Ok((destination, pending))
    }

    /// Acknowledgment callback for one send.
    fn spawn_receipt_watch(
        &self,
        sequence: usize,
        destination: String,
        pending: PendingReceipt,
        ledger: Arc<BatchLedger>,
    ) {
        let tracker = self.tracker.clone();
        tokio::spawn(async move {
            let outcome = pending.outcome().await;
            if let ReceiptOutcome::Failed(reason) = &outcome {
                warn!(sequence, destination = %destination, reason = %reason, "Send not acknowledged");
            }
            ledger.record(sequence, &destination, outcome);
            tracker.resolve();
        });
    }

    /// Abort the transaction and build the error for the whole batch.
    async fn fail(
        &self,
        transaction: &str,
        ledger: &BatchLedger,
        size: usize,
        cause: StompError,
    ) -> StompError {
        ledger.aborted.store(true, Ordering::SeqCst);
        warn!(transaction = %transaction, error = %cause, "Aborting transaction");

        if self.transport.is_connected() {
            if let Err(e) = self.transport.send_frame(Frame::abort(transaction)).await {
                debug!(transaction = %transaction, error = %e, "ABORT not delivered");
            }
        }

        StompError::Send {
            transaction: transaction.to_string(),
            failed: size,
            reason: cause.to_string(),
        }
    }
}

fn expand_with<E: Event>(event: &E, template: &str) -> String {
    if template::has_references(template) {
        event.expand(template)
    } else {
        template.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerEndpoint;
    use crate::event::JsonEvent;
    use crate::frame;
    use crate::transport::ConnectionEvent;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::{broadcast, oneshot};

    /// Live transport that records frames and can be told to fail one step.
    #[derive(Default)]
    struct ScriptedTransport {
        frames: Mutex<Vec<Frame>>,
        receipts: Mutex<Vec<oneshot::Sender<ReceiptOutcome>>>,
        /// Fail the SEND at this position in the batch
        fail_send_at: Option<usize>,
        fail_commit: bool,
    }

    impl ScriptedTransport {
        fn commands(&self) -> Vec<String> {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .map(|f| f.command.clone())
                .collect()
        }

        fn last_frame(&self) -> Frame {
            self.frames.lock().unwrap().last().cloned().unwrap()
        }

        fn acknowledge_all(&self) {
            for tx in self.receipts.lock().unwrap().drain(..) {
                let _ = tx.send(ReceiptOutcome::Acknowledged);
            }
        }
    }

    #[async_trait]
    impl StompTransport for ScriptedTransport {
        async fn connect(&self, _endpoint: &BrokerEndpoint) -> StompResult<()> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
            broadcast::channel(1).1
        }

        async fn send_frame(&self, frame: Frame) -> StompResult<()> {
            if self.fail_commit && frame.is(frame::COMMIT) {
                return Err(StompError::Protocol("commit refused".to_string()));
            }
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }

        async fn send_with_receipt(&self, frame: Frame) -> StompResult<PendingReceipt> {
            let mut receipts = self.receipts.lock().unwrap();
            if self.fail_send_at == Some(receipts.len()) {
                return Err(StompError::Protocol("send refused".to_string()));
            }
            let (tx, pending) = PendingReceipt::channel(format!("r-{}", receipts.len()));
            receipts.push(tx);
            self.frames.lock().unwrap().push(frame);
            Ok(pending)
        }

        async fn disconnect(&self, _receipt_id: &str, _wait: Duration) -> StompResult<()> {
            Ok(())
        }
    }

    fn scripted_sender(transport: Arc<ScriptedTransport>) -> (BatchSender, Arc<InFlightTracker>) {
        let tracker = Arc::new(InFlightTracker::new());
        let sender = BatchSender::new(
            transport,
            tracker.clone(),
            "/topic/%{host}",
            Vec::new(),
            "localhost",
        );
        (sender, tracker)
    }

    fn four_events() -> Vec<JsonEvent> {
        ["a", "b", "c", "d"]
            .iter()
            .map(|host| JsonEvent::new(json!({ "host": host })).unwrap())
            .collect()
    }

    #[test]
    fn test_outcome_into_result() {
        let ok = BatchOutcome {
            transaction: "tx".to_string(),
            acknowledged: 3,
            failed: Vec::new(),
        };
        assert!(ok.is_success());
        assert_eq!(ok.into_result().unwrap(), 3);

        let failed = BatchOutcome {
            transaction: "tx".to_string(),
            acknowledged: 1,
            failed: vec![
                SendFailure {
                    sequence: 1,
                    destination: "/topic/b".to_string(),
                    reason: "connection lost".to_string(),
                },
                SendFailure {
                    sequence: 2,
                    destination: "/topic/c".to_string(),
                    reason: "connection lost".to_string(),
                },
            ],
        };
        match failed.into_result() {
            Err(StompError::Send { failed, reason, .. }) => {
                assert_eq!(failed, 2);
                assert_eq!(reason, "connection lost");
            }
            other => panic!("expected send error, got {:?}", other),
        }
    }

    #[test]
    fn test_ledger_counts_ack_after_abort_as_failure() {
        let ledger = BatchLedger::new("tx-1", 2);
        ledger.record(0, "/q/a", ReceiptOutcome::Acknowledged);
        ledger.aborted.store(true, Ordering::SeqCst);
        ledger.record(1, "/q/b", ReceiptOutcome::Acknowledged);

        let outcome = ledger.snapshot();
        assert_eq!(outcome.acknowledged, 1);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].reason, "transaction aborted");
        assert_eq!(*ledger.remaining.borrow(), 0);
    }

    #[test]
    fn test_outbound_frame_carries_transaction() {
        let message = OutboundMessage {
            destination: "/topic/a".to_string(),
            body: b"{}".to_vec(),
            headers: vec![("x-host".to_string(), "a".to_string())],
        };
        let frame = message.into_frame("tx-9");
        assert_eq!(frame.get_header("transaction"), Some("tx-9"));
        assert_eq!(frame.get_header("destination"), Some("/topic/a"));
        assert_eq!(frame.get_header("x-host"), Some("a"));
    }

    #[test]
    fn test_build_message_expands_independently() {
        let transport: Arc<dyn StompTransport> =
            Arc::new(crate::transport::TcpTransport::new(std::time::Duration::from_secs(1), false));
        let sender = BatchSender::new(
            transport,
            Arc::new(InFlightTracker::new()),
            "/topic/%{host}",
            vec![
                ("amq-msg-type".to_string(), "text".to_string()),
                ("origin".to_string(), "%{host}-%{missing}".to_string()),
            ],
            "localhost",
        );

        let a = JsonEvent::new(json!({ "host": "a" })).unwrap();
        let b = JsonEvent::new(json!({ "host": "b" })).unwrap();

        let message_a = sender.build_message(&a).unwrap();
        let message_b = sender.build_message(&b).unwrap();

        assert_eq!(message_a.destination, "/topic/a");
        assert_eq!(message_b.destination, "/topic/b");
        assert_eq!(
            message_a.headers,
            vec![
                ("amq-msg-type".to_string(), "text".to_string()),
                ("origin".to_string(), "a-%{missing}".to_string()),
            ]
        );
        assert_eq!(message_b.headers[1].1, "b-%{missing}");
        assert_eq!(message_a.body, br#"{"host":"a"}"#.to_vec());
    }

    #[tokio::test]
    async fn test_empty_batch_is_complete() {
        let transport: Arc<dyn StompTransport> =
            Arc::new(crate::transport::TcpTransport::new(std::time::Duration::from_secs(1), false));
        let tracker = Arc::new(InFlightTracker::new());
        let sender = BatchSender::new(transport, tracker.clone(), "/q", Vec::new(), "localhost");

        let handle = sender.send_batch::<JsonEvent>(&[]).await.unwrap();
        assert!(handle.is_empty());
        assert_eq!(handle.pending(), 0);
        assert!(handle.completion().await.is_success());
        assert_eq!(tracker.current(), 0);
    }

    #[tokio::test]
    async fn test_batch_while_disconnected_fails_all() {
        let transport: Arc<dyn StompTransport> =
            Arc::new(crate::transport::TcpTransport::new(std::time::Duration::from_secs(1), false));
        let tracker = Arc::new(InFlightTracker::new());
        let sender = BatchSender::new(transport, tracker.clone(), "/q", Vec::new(), "localhost");

        let events = vec![JsonEvent::from_line("one"), JsonEvent::from_line("two")];
        match sender.send_batch(&events).await {
            Err(StompError::Send { failed, reason, .. }) => {
                assert_eq!(failed, 2);
                assert_eq!(reason, "not connected");
            }
            other => panic!("expected send error, got {:?}", other.map(|h| h.len())),
        }
        assert_eq!(tracker.current(), 0);
    }

    #[tokio::test]
    async fn test_send_failure_mid_batch_aborts_transaction() {
        let transport = Arc::new(ScriptedTransport {
            fail_send_at: Some(2),
            ..Default::default()
        });
        let (sender, tracker) = scripted_sender(transport.clone());

        let transaction = match sender.send_batch(&four_events()).await {
            Err(StompError::Send {
                transaction,
                failed,
                reason,
            }) => {
                assert_eq!(failed, 4);
                assert!(reason.contains("send refused"));
                transaction
            }
            other => panic!("expected send error, got {:?}", other.map(|h| h.len())),
        };

        assert_eq!(transport.commands(), vec!["BEGIN", "SEND", "SEND", "ABORT"]);
        let abort = transport.last_frame();
        assert_eq!(abort.get_header("transaction"), Some(transaction.as_str()));

        // Two sends were issued and still await their receipts
        assert_eq!(tracker.current(), 2);
        transport.acknowledge_all();
        tracker
            .wait_drained_for(Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_commit_failure_aborts_transaction() {
        let transport = Arc::new(ScriptedTransport {
            fail_commit: true,
            ..Default::default()
        });
        let (sender, tracker) = scripted_sender(transport.clone());

        match sender.send_batch(&four_events()).await {
            Err(StompError::Send { failed, .. }) => assert_eq!(failed, 4),
            other => panic!("expected send error, got {:?}", other.map(|h| h.len())),
        }
        assert_eq!(
            transport.commands(),
            vec!["BEGIN", "SEND", "SEND", "SEND", "SEND", "ABORT"]
        );

        assert_eq!(tracker.current(), 4);
        transport.acknowledge_all();
        tracker
            .wait_drained_for(Duration::from_secs(1))
            .await
            .unwrap();
    }
}
