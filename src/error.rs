//! Error types for forgepool operations.

use thiserror::Error;

/// Result type used throughout forgepool.
pub type PoolResult<T> = Result<T, PoolError>;

/// Main error type for pool operations.
///
/// The first four variants are the outcomes a caller of
/// [`WorkerPool::execute`](crate::core::WorkerPool::execute) has to handle;
/// none of them is retried by the pool itself.
#[derive(Error, Debug)]
pub enum PoolError {
    /// The handler ran and reported a failure
    #[error("Task execution failed: {message}")]
    TaskExecution {
        /// Error message reported by the handler, verbatim
        message: String,
    },

    /// No completion arrived within the allotted time
    #[error("Task {task_id} timed out after {timeout_ms}ms")]
    TaskTimeout {
        /// The task that timed out
        task_id: String,
        /// Timeout that was applied (in milliseconds)
        timeout_ms: u64,
    },

    /// The execution unit died outside the protocol while holding the task
    #[error("Worker {worker_id} crashed: {reason}")]
    WorkerCrash {
        /// Worker that held the task
        worker_id: usize,
        /// Panic message or exit description
        reason: String,
    },

    /// The pool is shutting down or has shut down
    #[error("Pool is shutting down")]
    PoolShuttingDown,

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// A typed operation failed validation before enqueue
    #[error("Invalid operation: {message}")]
    InvalidOperation {
        /// Error message
        message: String,
    },

    /// No pool registered under the given name
    #[error("Pool '{name}' not found in registry")]
    UnknownPool {
        /// The pool name that wasn't found
        name: String,
    },

    /// A pool with the same name is already registered
    #[error("Pool '{name}' is already registered")]
    DuplicatePool {
        /// The duplicated pool name
        name: String,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Error message
        message: String,
    },

    /// Prometheus registry error
    #[cfg(feature = "metrics")]
    #[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Stable discriminant of a [`PoolError`], handy for matching and counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`PoolError::TaskExecution`]
    TaskExecution,
    /// See [`PoolError::TaskTimeout`]
    TaskTimeout,
    /// See [`PoolError::WorkerCrash`]
    WorkerCrash,
    /// See [`PoolError::PoolShuttingDown`]
    PoolShuttingDown,
    /// Any setup, lookup or encoding error
    Other,
}

impl PoolError {
    /// Create a task execution error from a handler message
    pub fn task_execution(message: impl Into<String>) -> Self {
        Self::TaskExecution {
            message: message.into(),
        }
    }

    /// Create an invalid operation error
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Get the kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TaskExecution { .. } => ErrorKind::TaskExecution,
            Self::TaskTimeout { .. } => ErrorKind::TaskTimeout,
            Self::WorkerCrash { .. } => ErrorKind::WorkerCrash,
            Self::PoolShuttingDown => ErrorKind::PoolShuttingDown,
            _ => ErrorKind::Other,
        }
    }

    /// Whether a caller may retry the task (with backoff).
    ///
    /// Only timeouts and crashes qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::TaskTimeout | ErrorKind::WorkerCrash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_execution_message_is_verbatim() {
        let error = PoolError::task_execution("unsupported image format");
        match &error {
            PoolError::TaskExecution { message } => {
                assert_eq!(message, "unsupported image format");
            }
            other => panic!("Expected TaskExecution, got: {:?}", other),
        }
        assert_eq!(
            error.to_string(),
            "Task execution failed: unsupported image format"
        );
    }

    #[test]
    fn test_error_kinds_and_retryability() {
        let timeout = PoolError::TaskTimeout {
            task_id: "t-1".to_string(),
            timeout_ms: 100,
        };
        let crash = PoolError::WorkerCrash {
            worker_id: 2,
            reason: "panicked".to_string(),
        };

        assert_eq!(timeout.kind(), ErrorKind::TaskTimeout);
        assert_eq!(crash.kind(), ErrorKind::WorkerCrash);
        assert!(timeout.is_retryable());
        assert!(crash.is_retryable());

        assert!(!PoolError::task_execution("boom").is_retryable());
        assert!(!PoolError::PoolShuttingDown.is_retryable());
        assert_eq!(PoolError::config("bad").kind(), ErrorKind::Other);
    }
}
