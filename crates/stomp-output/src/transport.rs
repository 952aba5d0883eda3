//! Broker transport: the seam between the output and the STOMP wire.

use crate::config::BrokerEndpoint;
use crate::error::{StompError, StompResult};
use crate::frame::{self, parse_frame, Frame};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Capacity of the per-session outbound frame queue.
const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Events emitted by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A session was established.
    Connected,
    /// The session ended. Carries the reason when one is known.
    Closed(Option<String>),
}

/// Final state of a frame sent with a receipt request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptOutcome {
    Acknowledged,
    Failed(String),
}

impl ReceiptOutcome {
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, ReceiptOutcome::Acknowledged)
    }
}

/// A receipt the broker has not answered yet.
#[derive(Debug)]
pub struct PendingReceipt {
    receipt_id: String,
    rx: oneshot::Receiver<ReceiptOutcome>,
}

impl PendingReceipt {
    /// Create a pending receipt and the sender that resolves it.
    pub fn channel(receipt_id: impl Into<String>) -> (oneshot::Sender<ReceiptOutcome>, Self) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Self {
                receipt_id: receipt_id.into(),
                rx,
            },
        )
    }

    pub fn receipt_id(&self) -> &str {
        &self.receipt_id
    }

    /// Wait for the broker's answer. A dropped resolver counts as failure.
    pub async fn outcome(self) -> ReceiptOutcome {
        self.rx.await.unwrap_or_else(|_| {
            ReceiptOutcome::Failed("connection closed before receipt".to_string())
        })
    }
}

/// What the output needs from a STOMP client.
#[async_trait]
pub trait StompTransport: Send + Sync {
    /// Open a session with the broker and log in.
    async fn connect(&self, endpoint: &BrokerEndpoint) -> StompResult<()>;

    /// Whether a session is currently live. Never blocks.
    fn is_connected(&self) -> bool;

    /// Register for connection events (notably `Closed`).
    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent>;

    /// Send a frame without asking for a receipt.
    async fn send_frame(&self, frame: Frame) -> StompResult<()>;

    /// Send a frame with a `receipt` header and return a handle that
    /// resolves when the broker answers.
    async fn send_with_receipt(&self, frame: Frame) -> StompResult<PendingReceipt>;

    /// Send DISCONNECT asking for `receipt_id`, wait up to `wait` for it,
    /// then close the session.
    async fn disconnect(&self, receipt_id: &str, wait: Duration) -> StompResult<()>;
}

type ReceiptMap = HashMap<String, oneshot::Sender<ReceiptOutcome>>;

/// One live TCP session with the broker.
struct Session {
    id: u64,
    /// Taken when the session ends, which stops the writer task.
    outbound: Mutex<Option<mpsc::Sender<Frame>>>,
    receipts: Mutex<ReceiptMap>,
    connected: AtomicBool,
    /// Set when the close was requested locally.
    closing: AtomicBool,
    shutdown: Notify,
}

impl Session {
    fn new(id: u64, outbound: mpsc::Sender<Frame>) -> Self {
        Self {
            id,
            outbound: Mutex::new(Some(outbound)),
            receipts: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    async fn enqueue(&self, frame: Frame) -> StompResult<()> {
        let outbound = self
            .outbound
            .lock()
            .ok()
            .and_then(|o| o.clone())
            .ok_or(StompError::NotConnected)?;
        outbound.send(frame).await.map_err(|_| StompError::NotConnected)
    }

    fn register(&self, receipt_id: &str) -> PendingReceipt {
        let (tx, pending) = PendingReceipt::channel(receipt_id);
        if let Ok(mut receipts) = self.receipts.lock() {
            receipts.insert(receipt_id.to_string(), tx);
        }
        pending
    }

    fn forget(&self, receipt_id: &str) {
        if let Ok(mut receipts) = self.receipts.lock() {
            receipts.remove(receipt_id);
        }
    }

    fn resolve(&self, receipt_id: &str, outcome: ReceiptOutcome) -> bool {
        let sender = self
            .receipts
            .lock()
            .ok()
            .and_then(|mut receipts| receipts.remove(receipt_id));
        match sender {
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding receipt of this session.
    fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<_> = match self.receipts.lock() {
            Ok(mut receipts) => receipts.drain().collect(),
            Err(_) => Vec::new(),
        };
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(ReceiptOutcome::Failed(reason.to_string()));
        }
        count
    }
}

struct TransportState {
    session: RwLock<Option<Arc<Session>>>,
    events: broadcast::Sender<ConnectionEvent>,
    next_session: AtomicU64,
    next_receipt: AtomicU64,
    connect_timeout: Duration,
    debug_frames: bool,
}

/// STOMP over plain TCP.
///
/// Each session runs a writer task fed by a bounded queue and a reader
/// task that routes receipts. When the reader stops, the session's
/// pending receipts fail and `ConnectionEvent::Closed` is broadcast.
#[derive(Clone)]
pub struct TcpTransport {
    state: Arc<TransportState>,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration, debug_frames: bool) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            state: Arc::new(TransportState {
                session: RwLock::new(None),
                events,
                next_session: AtomicU64::new(1),
                next_receipt: AtomicU64::new(1),
                connect_timeout,
                debug_frames,
            }),
        }
    }

    fn live_session(&self) -> StompResult<Arc<Session>> {
        self.state
            .session
            .read()
            .ok()
            .and_then(|s| s.clone())
            .filter(|s| s.connected.load(Ordering::SeqCst))
            .ok_or(StompError::NotConnected)
    }

    /// Perform the CONNECT/CONNECTED exchange on a fresh stream.
    /// Returns any bytes read past the CONNECTED frame.
    async fn handshake(
        &self,
        stream: &mut TcpStream,
        endpoint: &BrokerEndpoint,
    ) -> StompResult<Vec<u8>> {
        let connect = Frame::connect(endpoint);
        if self.state.debug_frames {
            debug!(frame = %connect, "stomp >>");
        }
        stream.write_all(&connect.encode()).await?;

        let mut buf = Vec::with_capacity(1024);
        loop {
            if let Some((reply, consumed)) = parse_frame(&buf)? {
                buf.drain(..consumed);
                if self.state.debug_frames {
                    debug!(frame = %reply, "stomp <<");
                }
                return match reply.command.as_str() {
                    frame::CONNECTED => Ok(buf),
                    frame::ERROR => Err(StompError::Authentication(error_text(&reply))),
                    other => Err(StompError::Protocol(format!(
                        "expected CONNECTED, got {}",
                        other
                    ))),
                };
            }

            let mut chunk = [0u8; 4096];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(StompError::Connection(
                    "broker closed connection during handshake".to_string(),
                ));
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn spawn_writer(
        &self,
        session: Arc<Session>,
        mut write: OwnedWriteHalf,
        mut outbound: mpsc::Receiver<Frame>,
    ) {
        let debug_frames = self.state.debug_frames;
        tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                if debug_frames {
                    debug!(session = session.id, frame = %frame, "stomp >>");
                }
                if let Err(e) = write.write_all(&frame.encode()).await {
                    warn!(session = session.id, error = %e, "Write to stomp broker failed");
                    session.connected.store(false, Ordering::SeqCst);
                    session.shutdown.notify_one();
                    break;
                }
            }
            let _ = write.shutdown().await;
        });
    }

    /// Read until the session ends, then tear it down. The session is torn
    /// down even if the read loop panics.
    fn spawn_reader(&self, session: Arc<Session>, read: OwnedReadHalf, buf: Vec<u8>) {
        let transport = self.clone();
        let debug_frames = self.state.debug_frames;
        tokio::spawn(async move {
            let reader = tokio::spawn(read_loop(session.clone(), read, buf, debug_frames));
            let reason = match reader.await {
                Ok(reason) => reason,
                Err(e) => Some(format!("stomp reader failed: {}", e)),
            };
            transport.finish_session(&session, reason);
        });
    }

    fn finish_session(&self, session: &Arc<Session>, reason: Option<String>) {
        session.connected.store(false, Ordering::SeqCst);
        if let Ok(mut outbound) = session.outbound.lock() {
            outbound.take();
        }

        if let Ok(mut slot) = self.state.session.write() {
            if slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, session)) {
                *slot = None;
            }
        }

        let failed = session.fail_all(reason.as_deref().unwrap_or("connection closed"));

        if session.closing.load(Ordering::SeqCst) {
            debug!(session = session.id, failed, "Stomp session closed");
            let _ = self.state.events.send(ConnectionEvent::Closed(None));
        } else {
            let reason = reason.unwrap_or_else(|| "write failed".to_string());
            warn!(session = session.id, failed, reason = %reason, "Stomp connection lost");
            let _ = self.state.events.send(ConnectionEvent::Closed(Some(reason)));
        }
    }

    fn next_receipt_id(&self) -> String {
        format!(
            "receipt-{}",
            self.state.next_receipt.fetch_add(1, Ordering::Relaxed)
        )
    }
}

/// Returns the reason the session ended, or `None` on a local shutdown.
async fn read_loop(
    session: Arc<Session>,
    mut read: OwnedReadHalf,
    mut buf: Vec<u8>,
    debug_frames: bool,
) -> Option<String> {
    let mut chunk = [0u8; 4096];
    loop {
        // Drain complete frames before reading more
        loop {
            match parse_frame(&buf) {
                Ok(Some((frame, consumed))) => {
                    buf.drain(..consumed);
                    if debug_frames {
                        debug!(session = session.id, frame = %frame, "stomp <<");
                    }
                    if let Some(reason) = dispatch(&session, frame) {
                        return Some(reason);
                    }
                }
                Ok(None) => break,
                Err(e) => return Some(e.to_string()),
            }
        }

        let read_result = tokio::select! {
            result = read.read(&mut chunk) => result,
            _ = session.shutdown.notified() => return None,
        };

        match read_result {
            Ok(0) => return Some("broker closed connection".to_string()),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) => return Some(e.to_string()),
        }
    }
}

/// Route one inbound frame. Returns a reason when the session must end.
fn dispatch(session: &Session, frame: Frame) -> Option<String> {
    match frame.command.as_str() {
        frame::RECEIPT => {
            if let Some(id) = frame.get_header("receipt-id") {
                if !session.resolve(id, ReceiptOutcome::Acknowledged) {
                    debug!(receipt_id = %id, "Receipt for unknown frame");
                }
            }
            None
        }
        frame::ERROR => {
            let text = error_text(&frame);
            match frame.get_header("receipt-id") {
                Some(id) if session.resolve(id, ReceiptOutcome::Failed(text.clone())) => {
                    warn!(receipt_id = %id, error = %text, "Broker rejected frame");
                    None
                }
                // Brokers close the connection after an unsolicited ERROR
                _ => Some(format!("broker error: {}", text)),
            }
        }
        other => {
            debug!(command = %other, "Ignoring inbound frame");
            None
        }
    }
}

fn error_text(frame: &Frame) -> String {
    match frame.get_header("message") {
        Some(message) => message.to_string(),
        None if !frame.body.is_empty() => String::from_utf8_lossy(&frame.body).into_owned(),
        None => "unspecified broker error".to_string(),
    }
}

#[async_trait]
impl StompTransport for TcpTransport {
    async fn connect(&self, endpoint: &BrokerEndpoint) -> StompResult<()> {
        if self.live_session().is_ok() {
            debug!("Already connected");
            return Ok(());
        }

        let connect_timeout = self.state.connect_timeout;
        let address = (endpoint.host.as_str(), endpoint.port);
        let mut stream = timeout(connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| StompError::Connection(format!("connect to {} timed out", endpoint.host)))?
            .map_err(|e| {
                StompError::Connection(format!("{}:{}: {}", endpoint.host, endpoint.port, e))
            })?;
        let _ = stream.set_nodelay(true);

        let leftover = timeout(connect_timeout, self.handshake(&mut stream, endpoint))
            .await
            .map_err(|_| StompError::Timeout("waiting for CONNECTED".to_string()))??;

        let (read, write) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let session = Arc::new(Session::new(
            self.state.next_session.fetch_add(1, Ordering::Relaxed),
            outbound_tx,
        ));

        if let Ok(mut slot) = self.state.session.write() {
            *slot = Some(session.clone());
        }
        self.spawn_writer(session.clone(), write, outbound_rx);
        self.spawn_reader(session.clone(), read, leftover);

        info!(
            session = session.id,
            host = %endpoint.host,
            port = endpoint.port,
            "Stomp session established"
        );
        let _ = self.state.events.send(ConnectionEvent::Connected);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.live_session().is_ok()
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.state.events.subscribe()
    }

    async fn send_frame(&self, frame: Frame) -> StompResult<()> {
        self.live_session()?.enqueue(frame).await
    }

    async fn send_with_receipt(&self, mut frame: Frame) -> StompResult<PendingReceipt> {
        let session = self.live_session()?;
        let receipt_id = self.next_receipt_id();
        frame.set_header("receipt", &receipt_id);

        let pending = session.register(&receipt_id);
        if let Err(e) = session.enqueue(frame).await {
            session.forget(&receipt_id);
            return Err(e);
        }
        Ok(pending)
    }

    async fn disconnect(&self, receipt_id: &str, wait: Duration) -> StompResult<()> {
        let session = self.live_session()?;
        session.closing.store(true, Ordering::SeqCst);

        let pending = session.register(receipt_id);
        let result = match session.enqueue(Frame::disconnect(receipt_id)).await {
            Ok(()) => match timeout(wait, pending.outcome()).await {
                Ok(ReceiptOutcome::Acknowledged) => Ok(()),
                Ok(ReceiptOutcome::Failed(reason)) => Err(StompError::Connection(reason)),
                Err(_) => Err(StompError::Timeout(format!("receipt {}", receipt_id))),
            },
            Err(e) => Err(e),
        };

        session.connected.store(false, Ordering::SeqCst);
        session.shutdown.notify_one();
        result
    }
}
