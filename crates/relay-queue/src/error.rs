//! Error taxonomy for broker and worker pool operations.

use relay_core::TaskId;
use thiserror::Error;

/// Result type alias using `QueueError`.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors from the task broker and worker pool.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Broker storage operation failed.
    #[error("broker error: {0}")]
    Broker(String),

    /// Envelope could not be serialized or deserialized.
    #[error("envelope serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Task referenced by ack/nack does not exist or its lease expired.
    #[error("unknown task: {0}")]
    UnknownTask(TaskId),

    /// Task kind has no registered handler.
    #[error("no handler registered for task kind '{0}'")]
    UnknownTaskKind(String),

    /// Worker pool failed to stop within the shutdown timeout.
    #[error("worker pool shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// The timeout that was exceeded.
        timeout: std::time::Duration,
    },
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        Self::Broker(err.to_string())
    }
}

impl QueueError {
    /// Creates a broker error from any displayable source.
    pub fn broker(message: impl Into<String>) -> Self {
        Self::Broker(message.into())
    }
}
