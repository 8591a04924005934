//! Queue Error Types

/// Errors surfaced by public queue operations.
///
/// The queue never panics for flow control; every failure a caller can
/// observe is one of these variants. `NoSpace` is deliberately distinct
/// from `Io` so embedding applications can react to disk exhaustion
/// (alerting, shedding load) without string-matching storage errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue has not been started")]
    NotStarted,

    #[error("Queue was already started")]
    AlreadyStarted,

    #[error("Queue is stopped")]
    Stopped,

    #[error("Invalid configuration: {message}")]
    InvalidArg { message: String },

    #[error("Queue is full (max size: {max_size})")]
    QueueFull { max_size: usize },

    #[error("Queue store is out of disk space")]
    NoSpace,

    #[error("Storage operation failed: {message}")]
    Io { message: String },

    #[error("Operation interrupted by shutdown")]
    Interrupted,
}

impl QueueError {
    /// Build an `InvalidArg` from any displayable message.
    pub(crate) fn invalid_arg(message: impl Into<String>) -> Self {
        QueueError::InvalidArg {
            message: message.into(),
        }
    }

    /// Build an `Io` from any displayable source error.
    pub(crate) fn io(message: impl std::fmt::Display) -> Self {
        QueueError::Io {
            message: message.to_string(),
        }
    }
}

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;
