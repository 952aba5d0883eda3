//! Connection retry and loss tests.

use super::harness::{eventually, host_events, MockBroker, ReceiptBehavior};
use crate::config::ReconnectPolicy;
use crate::connection::ConnectionState;
use crate::frame;
use crate::output::StompOutput;
use crate::StompError;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

/// Connection drops after 1 of 3 receipts: 2 sends fail, nothing is
/// committed, and the output reconnects.
#[tokio::test]
async fn drop_mid_transaction_fails_unacknowledged_sends() {
    let broker = MockBroker::start().await;
    broker.set_behavior(ReceiptBehavior::AcknowledgeThenDrop { after: 1 });
    let output = StompOutput::register(broker.config("/topic/%{host}"))
        .await
        .unwrap();

    let handle = output
        .multi_receive(&host_events(&["a", "b", "c"]))
        .await
        .unwrap();
    let outcome = tokio::time::timeout(WAIT, handle.completion()).await.unwrap();

    assert_eq!(outcome.acknowledged, 1);
    assert_eq!(outcome.failed.len(), 2);
    assert_eq!(
        outcome.failed.iter().map(|f| f.sequence).collect::<Vec<_>>(),
        vec![1, 2]
    );
    assert_eq!(outcome.failed[0].destination, "/topic/b");
    assert_eq!(output.in_flight(), 0);
    assert!(broker.committed().is_empty());

    match outcome.into_result() {
        Err(StompError::Send { failed, .. }) => assert_eq!(failed, 2),
        other => panic!("expected send error, got {:?}", other),
    }

    assert!(eventually(WAIT, || broker.session_count() == 2 && output.is_connected()).await);

    // The new session carries nothing over and works normally
    broker.set_behavior(ReceiptBehavior::Acknowledge);
    let handle = output.multi_receive(&host_events(&["d"])).await.unwrap();
    let outcome = tokio::time::timeout(WAIT, handle.completion()).await.unwrap();
    assert!(outcome.is_success());
    assert!(eventually(WAIT, || broker.committed().len() == 1).await);

    let last_send = broker
        .frames()
        .into_iter()
        .filter(|r| r.frame.is(frame::SEND))
        .last()
        .unwrap();
    assert_eq!(last_send.connection, 2);

    output.close().await.unwrap();
}

/// Receipts outstanding when the connection drops all fail.
#[tokio::test]
async fn drop_after_commit_fails_outstanding_receipts() {
    let broker = MockBroker::start().await;
    broker.set_behavior(ReceiptBehavior::Withhold);
    let output = StompOutput::register(broker.config("/queue/events"))
        .await
        .unwrap();

    let handle = output
        .multi_receive(&host_events(&["a", "b"]))
        .await
        .unwrap();
    assert!(eventually(WAIT, || broker.committed().len() == 1).await);
    assert_eq!(output.in_flight(), 2);

    broker.drop_connections();
    let outcome = tokio::time::timeout(WAIT, handle.completion()).await.unwrap();
    assert_eq!(outcome.acknowledged, 0);
    assert_eq!(outcome.failed.len(), 2);
    assert_eq!(output.in_flight(), 0);

    assert!(eventually(WAIT, || broker.session_count() == 2 && output.is_connected()).await);
    output.close().await.unwrap();
}

/// A rejected login is retried until the broker accepts it.
#[tokio::test]
async fn rejected_login_is_retried() {
    let broker = MockBroker::start().await;
    broker.reject_logins(2);

    let output = StompOutput::register(broker.config("/queue/events"))
        .await
        .unwrap();
    assert!(output.is_connected());
    assert_eq!(broker.count(frame::CONNECT), 3);
    assert_eq!(broker.session_count(), 1);

    output.close().await.unwrap();
}

/// Connections closed before CONNECTED are retried.
#[tokio::test]
async fn refused_connections_are_retried() {
    let broker = MockBroker::start().await;
    broker.refuse_connections(3);

    let output = StompOutput::register(broker.config("/queue/events"))
        .await
        .unwrap();
    assert!(output.is_connected());
    assert_eq!(broker.accepted_count(), 4);

    output.close().await.unwrap();
}

/// CONNECT carries the credentials and virtual host.
#[tokio::test]
async fn connect_frame_carries_credentials() {
    let broker = MockBroker::start().await;
    let mut config = broker.config("/queue/events");
    config.vhost = Some("vh-logs".to_string());
    let output = StompOutput::register(config).await.unwrap();

    let connect = &broker.frames_with(frame::CONNECT)[0];
    assert_eq!(connect.get_header("login"), Some("guest"));
    assert_eq!(connect.get_header("passcode"), Some("guest"));
    assert_eq!(connect.get_header("host"), Some("vh-logs"));

    output.close().await.unwrap();
}

/// A bounded policy surfaces the failure instead of retrying forever.
#[tokio::test]
async fn bounded_policy_gives_up() {
    let broker = MockBroker::start().await;
    broker.refuse_connections(100);
    let mut config = broker.config("/queue/events");
    config.reconnect = ReconnectPolicy {
        initial_delay_ms: 5,
        max_delay_ms: 5,
        multiplier: 1,
        max_attempts: Some(3),
    };

    let result = StompOutput::register(config).await;
    assert!(matches!(result, Err(StompError::ReconnectExhausted { attempts: 3 })));
    assert_eq!(broker.accepted_count(), 3);
}

/// Batches sent while the broker is away fail at once and leave nothing in flight.
#[tokio::test]
async fn batch_while_disconnected_fails_immediately() {
    let broker = MockBroker::start().await;
    let output = StompOutput::register(broker.config("/queue/events"))
        .await
        .unwrap();

    broker.refuse_connections(usize::MAX);
    broker.drop_connections();
    assert!(eventually(WAIT, || !output.is_connected()).await);

    match output.multi_receive(&host_events(&["a", "b", "c"])).await {
        Err(StompError::Send { failed, reason, .. }) => {
            assert_eq!(failed, 3);
            assert_eq!(reason, "not connected");
        }
        other => panic!("expected send error, got {:?}", other.map(|h| h.len())),
    }
    assert_eq!(output.in_flight(), 0);

    broker.refuse_connections(0);
    assert!(eventually(WAIT, || output.is_connected()).await);
    assert_eq!(output.connection_state(), ConnectionState::Connected);

    let handle = output.multi_receive(&host_events(&["d"])).await.unwrap();
    assert!(tokio::time::timeout(WAIT, handle.completion())
        .await
        .unwrap()
        .is_success());

    output.close().await.unwrap();
}
