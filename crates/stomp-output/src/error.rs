//! Error types for the STOMP output.

use thiserror::Error;

/// STOMP output error type.
#[derive(Error, Debug)]
pub enum StompError {
    /// Broker refused or could not be reached
    #[error("Connection error: {0}")]
    Connection(String),

    /// Broker answered CONNECT with an ERROR frame
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Bounded reconnect policy ran out of attempts
    #[error("Gave up connecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// No live broker session
    #[error("Not connected to stomp broker")]
    NotConnected,

    /// Sends inside a transaction failed; the transaction is aborted
    #[error("Send failed in transaction {transaction}: {failed} message(s) not delivered ({reason})")]
    Send {
        transaction: String,
        failed: usize,
        reason: String,
    },

    /// Drain wait expired during close
    #[error("Timed out waiting for {pending} in-flight send(s) to resolve")]
    ShutdownTimeout { pending: usize },

    /// Output is closing and accepts no more work
    #[error("Output is shutting down")]
    ShuttingDown,

    /// Bounded wait expired
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Malformed frame or unexpected broker reply
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StompError {
    /// Whether the connect loop should keep retrying after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StompError::Connection(_)
                | StompError::Authentication(_)
                | StompError::Timeout(_)
                | StompError::Protocol(_)
                | StompError::Io(_)
        )
    }
}

/// Result type alias using StompError.
pub type StompResult<T> = Result<T, StompError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_error_display() {
        let err = StompError::Send {
            transaction: "tx-1".to_string(),
            failed: 2,
            reason: "connection lost".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Send failed in transaction tx-1: 2 message(s) not delivered (connection lost)"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(StompError::Connection("refused".into()).is_retryable());
        assert!(StompError::Authentication("bad login".into()).is_retryable());
        assert!(!StompError::ShuttingDown.is_retryable());
        assert!(!StompError::Config("host".into()).is_retryable());
    }
}
