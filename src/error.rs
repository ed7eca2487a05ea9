//! Error types for the switchboard.

use crate::types::SnapshotId;
use thiserror::Error;

/// Main error type for bus, store, storage and pool operations.
#[derive(Debug, Error)]
pub enum SwitchboardError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Action rejected by middleware '{middleware}': {reason}")]
    ActionRejected { middleware: String, reason: String },

    #[error("Middleware '{middleware}' failed: {message}")]
    Middleware { middleware: String, message: String },

    #[error("Invalid action: {0}")]
    InvalidAction(String),

    #[error("Unknown slice: {0}")]
    UnknownSlice(String),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(SnapshotId),

    #[error("Dispatch was cancelled before it committed")]
    DispatchCancelled,

    /// A job of this store awaited another job of the same store.
    #[error("'{0}' awaited from inside a running state job; use enqueue instead")]
    ReentrantDispatch(String),

    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Connection to channel '{channel}' timed out after {timeout_ms}ms")]
    ConnectTimeout { channel: String, timeout_ms: u64 },

    #[error("Transport error on channel '{channel}': {message}")]
    Transport { channel: String, message: String },

    #[error("No Tokio runtime to {0}")]
    NoRuntime(&'static str),

    #[error("Storage is locked by another process")]
    Locked,

    #[error("Invalid storage format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },
}

impl From<serde_json::Error> for SwitchboardError {
    fn from(e: serde_json::Error) -> Self {
        SwitchboardError::Serialization(e.to_string())
    }
}

/// Why a middleware refused to let an action through.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MiddlewareError {
    /// The action was deliberately rejected (validation fault).
    #[error("rejected: {0}")]
    Rejected(String),

    /// The middleware itself failed.
    #[error("failed: {0}")]
    Failed(String),
}

impl MiddlewareError {
    /// Attach the name of the middleware that produced this error.
    pub fn into_store_error(self, middleware: &str) -> SwitchboardError {
        match self {
            MiddlewareError::Rejected(reason) => SwitchboardError::ActionRejected {
                middleware: middleware.to_string(),
                reason,
            },
            MiddlewareError::Failed(message) => SwitchboardError::Middleware {
                middleware: middleware.to_string(),
                message,
            },
        }
    }
}

/// Error returned by event handlers. Isolated and logged by the bus.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Render a caught panic payload for logging.
pub(crate) fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

/// Result type for switchboard operations.
pub type Result<T> = std::result::Result<T, SwitchboardError>;
