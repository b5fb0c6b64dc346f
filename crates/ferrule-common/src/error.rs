//! Error types for ferrule
//!
//! A single taxonomy shared by the client library and the CLI. Server-side
//! failures keep the query text that produced them so callers can log or
//! retry with full context.

use std::fmt;

/// Result type alias using FerruleError
pub type Result<T> = std::result::Result<T, FerruleError>;

/// Substring ClickHouse puts in the error body when every replica lags
/// behind `max_replica_delay_for_distributed_queries`.
pub const ALL_REPLICAS_STALE_MARKER: &str = "ALL_REPLICAS_ARE_STALE";

/// Main error type for ferrule
#[derive(Debug, thiserror::Error)]
pub enum FerruleError {
    /// A query method was called outside of an open session
    #[error("ClickHouseClient is not connected. Are you running inside an open session?")]
    NotConnected,

    /// ClickHouse answered with a non-success status
    #[error("ClickHouse error: {message}")]
    Server { query: String, message: String },

    /// ClickHouse refused the query because all replicas are stale.
    ///
    /// This is a transient cluster-health condition, not a query or auth problem.
    #[error("All ClickHouse replicas are stale: {message}")]
    AllReplicasStale { query: String, message: String },

    /// The response body ended in the middle of a record or frame
    #[error("Malformed stream: {0}")]
    MalformedStream(String),

    /// Arrow IPC decoding error
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Query parameters could not be formatted into the query text
    #[error("Query formatting failed: {0}")]
    Format(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// TLS/Certificate error
    #[error("TLS error: {0}")]
    Tls(String),

    /// The consumer side of a record batch queue went away
    #[error("Record batch queue closed by consumer")]
    QueueClosed,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FerruleError {
    /// Create an internal error from any error type
    pub fn internal<E: fmt::Display>(err: E) -> Self {
        FerruleError::Internal(err.to_string())
    }

    /// Classify a non-success response body.
    pub fn from_response(query: impl Into<String>, message: impl Into<String>) -> Self {
        let query = query.into();
        let message = message.into();
        if message.contains(ALL_REPLICAS_STALE_MARKER) {
            FerruleError::AllReplicasStale { query, message }
        } else {
            FerruleError::Server { query, message }
        }
    }

    /// Get the error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            FerruleError::NotConnected => "NOT_CONNECTED",
            FerruleError::Server { .. } => "SERVER_ERROR",
            FerruleError::AllReplicasStale { .. } => "ALL_REPLICAS_ARE_STALE",
            FerruleError::MalformedStream(_) => "MALFORMED_STREAM",
            FerruleError::Arrow(_) => "ARROW_ERROR",
            FerruleError::Http(_) => "HTTP_ERROR",
            FerruleError::Format(_) => "FORMAT_ERROR",
            FerruleError::Config(_) => "CONFIG_ERROR",
            FerruleError::Tls(_) => "TLS_ERROR",
            FerruleError::QueueClosed => "QUEUE_CLOSED",
            FerruleError::Internal(_) => "INTERNAL",
        }
    }

    /// True for every error ClickHouse itself reported, stale replicas included.
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            FerruleError::Server { .. } | FerruleError::AllReplicasStale { .. }
        )
    }

    /// Whether a caller may reasonably retry. The client never retries on its own.
    pub fn is_retryable(&self) -> bool {
        match self {
            FerruleError::AllReplicasStale { .. } => true,
            FerruleError::Http(err) => err.is_timeout() || err.is_connect(),
            _ => false,
        }
    }

    /// The query text attached to server errors
    pub fn query(&self) -> Option<&str> {
        match self {
            FerruleError::Server { query, .. } | FerruleError::AllReplicasStale { query, .. } => {
                Some(query)
            }
            _ => None,
        }
    }
}

impl From<config::ConfigError> for FerruleError {
    fn from(err: config::ConfigError) -> Self {
        FerruleError::Config(err.to_string())
    }
}

impl From<tokio::task::JoinError> for FerruleError {
    fn from(err: tokio::task::JoinError) -> Self {
        FerruleError::Internal(format!("Task failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(FerruleError::NotConnected.code(), "NOT_CONNECTED");
        assert_eq!(FerruleError::QueueClosed.code(), "QUEUE_CLOSED");
        assert_eq!(FerruleError::MalformedStream("x".into()).code(), "MALFORMED_STREAM");
        assert_eq!(FerruleError::Format("x".into()).code(), "FORMAT_ERROR");
        assert_eq!(FerruleError::Config("x".into()).code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_stale_replicas_classification() {
        let err = FerruleError::from_response(
            "SELECT 1",
            "Code: 369. DB::Exception: All connection tries failed. ALL_REPLICAS_ARE_STALE",
        );
        assert!(matches!(err, FerruleError::AllReplicasStale { .. }));
        assert!(err.is_server_error());
        assert!(err.is_retryable());
        assert_eq!(err.query(), Some("SELECT 1"));
    }

    #[test]
    fn test_generic_server_error() {
        let err = FerruleError::from_response("SELECT x", "Code: 47. DB::Exception: Unknown identifier");
        assert!(matches!(err, FerruleError::Server { .. }));
        assert!(err.is_server_error());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Unknown identifier"));
    }

    #[test]
    fn test_not_connected_is_not_server_error() {
        assert!(!FerruleError::NotConnected.is_server_error());
        assert!(FerruleError::NotConnected.query().is_none());
    }
}
