//! Error types shared across the crate

use crate::item::WorkItem;

/// Errors raised by a backend data source or connection
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// A connection could not be acquired
    #[error("failed to open backend connection: {0}")]
    Connect(String),

    /// The connection was used after it was closed
    #[error("backend connection is closed")]
    Closed,

    /// A single statement was refused while staging it into a batch
    #[error("statement rejected: {reason}")]
    Rejected { statement: String, reason: String },

    /// Driver or server error
    #[error("database error: {0}")]
    Database(String),
}

impl BackendError {
    /// Whether the connection that produced this error must be re-acquired.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connect(_) | Self::Closed | Self::Database(_)
        )
    }
}

/// Error delivered to a work item's completion callback
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkError {
    /// The payload is not something this worker can process
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The backend refused the item's operations
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// A handler function reported a failure
    #[error("handler error: {0}")]
    Handler(String),

    /// The worker shut down before the item was processed
    #[error("work item cancelled before it was processed")]
    Cancelled,
}

/// Worker pool lifecycle errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// `start` was called with zero units
    #[error("worker pool size must be greater than zero")]
    InvalidSize,

    /// `start` was called while the pool is running or draining
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// `start` was called outside of a tokio runtime
    #[error("worker pool must be started from within a tokio runtime")]
    NoRuntime,
}

/// A work queue refused an item.
///
/// The rejected item is handed back so the caller keeps the completion
/// obligation.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queue is at capacity
    #[error("work queue is full")]
    Full(WorkItem),

    /// The queue no longer accepts items
    #[error("work queue is closed")]
    Closed(WorkItem),
}

impl QueueError {
    /// Take back the rejected item
    pub fn into_item(self) -> WorkItem {
        match self {
            Self::Full(item) | Self::Closed(item) => item,
        }
    }
}

/// Invalid configuration value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The value could not be parsed
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    /// The value must be non-zero
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_backend_errors() {
        assert!(BackendError::Closed.is_fatal());
        assert!(BackendError::Connect("refused".into()).is_fatal());
        assert!(BackendError::Database("broken pipe".into()).is_fatal());
        assert!(!BackendError::Rejected {
            statement: String::new(),
            reason: "empty statement".into(),
        }
        .is_fatal());
    }

    #[test]
    fn test_work_error_wraps_backend_error() {
        let error: WorkError = BackendError::Closed.into();
        assert_eq!(error, WorkError::Backend(BackendError::Closed));
        assert_eq!(error.to_string(), "backend connection is closed");
    }

    #[test]
    fn test_queue_error_returns_item() {
        let (item, _rx) = WorkItem::with_receiver(serde_json::json!(["SELECT 1"]));
        let id = item.id();
        let error = QueueError::Full(item);
        assert_eq!(error.to_string(), "work queue is full");
        assert_eq!(error.into_item().id(), id);
    }
}
