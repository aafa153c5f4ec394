//! Error types for AgentLink Core

use crate::types::ResponseError;
use std::time::Duration;
use thiserror::Error;

/// Main error type for AgentLink operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Byte-stream level failures
#[derive(Error, Debug)]
pub enum TransportError {
    /// A frame could not be decoded into an envelope. Connection-fatal.
    #[error("Protocol decode error: {0}")]
    Decode(String),

    #[error("Failed to encode envelope: {0}")]
    Encode(String),

    #[error("Transport IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The writer side is gone (broken pipe or torn-down connection).
    #[error("Transport closed")]
    Closed,
}

/// Failures of a single outgoing call, or of an inbound request handler
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Request '{method}' timed out after {after:?}")]
    Timeout { method: String, after: Duration },

    #[error("Connection to worker lost (generation {generation})")]
    ConnectionLost { generation: u64 },

    #[error("Worker returned error: {0}")]
    Remote(ResponseError),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Send failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Handler failed: {0}")]
    Handler(String),
}

impl RpcError {
    /// Whether retrying once a new worker generation is running may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RpcError::Timeout { .. } | RpcError::ConnectionLost { .. } | RpcError::Transport(_)
        )
    }
}

/// Worker process lifecycle errors
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Protocol version mismatch: expected {expected}, got {actual:?}")]
    VersionMismatch { expected: u32, actual: Option<u32> },

    #[error("Worker crashed {restarts} times within {window:?}; giving up")]
    RestartLimitExceeded { restarts: usize, window: Duration },

    #[error("Worker not running")]
    NotRunning,

    #[error("Worker already running")]
    AlreadyRunning,
}

impl WorkerError {
    /// Fatal errors stop the supervisor instead of scheduling a restart.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WorkerError::VersionMismatch { .. } | WorkerError::RestartLimitExceeded { .. }
        )
    }
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors surfaced to feature code through the typed client.
///
/// This is the caller-facing taxonomy: it hides transport details and says
/// what the caller can do about the failure.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The worker is restarting or not started; retry later.
    #[error("Agent unavailable: {0}")]
    Unavailable(String),

    #[error("Agent did not answer '{method}' within {after:?}")]
    TimedOut { method: String, after: Duration },

    #[error("Agent rejected request ({code}): {message}")]
    Rejected {
        code: i32,
        message: String,
        /// Worker-supplied detail, passed through untouched
        data: Option<serde_json::Value>,
    },

    #[error("Request cancelled")]
    Cancelled,

    /// The supervisor gave up; user action is required.
    #[error("Agent stopped permanently: {0}")]
    Fatal(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unexpected response for '{method}': {reason}")]
    InvalidResponse { method: String, reason: String },
}

impl ClientError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Unavailable(_) | ClientError::TimedOut { .. })
    }
}

impl From<RpcError> for ClientError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Timeout { method, after } => ClientError::TimedOut { method, after },
            RpcError::ConnectionLost { .. } | RpcError::Transport(_) => {
                ClientError::Unavailable(err.to_string())
            }
            RpcError::Remote(e) => ClientError::Rejected {
                code: e.code,
                message: e.message,
                data: e.data,
            },
            RpcError::Cancelled => ClientError::Cancelled,
            RpcError::Handler(msg) => ClientError::Unavailable(msg),
        }
    }
}

impl serde::Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_error_maps_to_client_taxonomy() {
        let timeout = RpcError::Timeout {
            method: "chat/new".to_string(),
            after: Duration::from_millis(10),
        };
        assert!(matches!(
            ClientError::from(timeout),
            ClientError::TimedOut { ref method, .. } if method == "chat/new"
        ));

        let lost = ClientError::from(RpcError::ConnectionLost { generation: 3 });
        assert!(matches!(lost, ClientError::Unavailable(_)));
        assert!(lost.is_retryable());

        let remote = ClientError::from(RpcError::Remote(ResponseError::new(-32601, "nope")));
        assert!(matches!(remote, ClientError::Rejected { code: -32601, data: None, .. }));

        let detailed = ResponseError::new(-32602, "bad params").with_data(serde_json::json!({ "field": "uri" }));
        match ClientError::from(RpcError::Remote(detailed)) {
            ClientError::Rejected { code, data, .. } => {
                assert_eq!(code, -32602);
                assert_eq!(data, Some(serde_json::json!({ "field": "uri" })));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!remote.is_retryable());
    }

    #[test]
    fn test_crate_error_wraps_and_serializes() {
        let err: Error = WorkerError::NotRunning.into();
        assert!(matches!(err, Error::Worker(WorkerError::NotRunning)));
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            serde_json::json!("Worker error: Worker not running")
        );
    }

    #[test]
    fn test_fatal_worker_errors() {
        assert!(WorkerError::VersionMismatch {
            expected: 1,
            actual: None
        }
        .is_fatal());
        assert!(!WorkerError::HandshakeFailed("timeout".into()).is_fatal());
    }
}
