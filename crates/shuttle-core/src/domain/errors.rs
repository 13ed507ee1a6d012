//! Errors and their operational classification.

use std::path::PathBuf;

use super::ids::ItemId;

/// Operational class of a failure.
///
/// - Transient: the lease may simply be retried (lost lease, busy database)
/// - Permanent: retrying cannot help (unknown executor, executor failure)
/// - Infrastructure: the store itself failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

/// Failure of the work item store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error during {operation}: {message}")]
    Sqlite { operation: String, message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("work item {0} not found")]
    NotFound(ItemId),

    /// A guarded write found the row in an unexpected state.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("corrupt value in store: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn sqlite(operation: &str, error: impl std::fmt::Display) -> Self {
        StoreError::Sqlite {
            operation: operation.to_string(),
            message: error.to_string(),
        }
    }
}

/// Failure reported by an executor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ExecutionError {
    pub message: String,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Failure of one dispatch attempt.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown executor '{0}'")]
    UnknownExecutor(String),

    #[error("execution failed: {0}")]
    Execution(#[from] ExecutionError),

    #[error("lease lost for {0}")]
    LeaseLost(ItemId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::UnknownExecutor(_) | DispatchError::Execution(_) => ErrorKind::Permanent,
            DispatchError::LeaseLost(_) => ErrorKind::Transient,
            DispatchError::Store(_) => ErrorKind::Infrastructure,
        }
    }
}

/// Workflow definition and lookup errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("workflow '{0}' not found")]
    NotFound(String),

    #[error("workflow '{0}' is defined more than once")]
    Duplicate(String),

    #[error("workflow '{name}' is invalid: {reason}")]
    Invalid { name: String, reason: String },

    #[error("failed to read workflow source {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse workflow source {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_errors_are_classified() {
        assert_eq!(
            DispatchError::UnknownExecutor("x".into()).kind(),
            ErrorKind::Permanent
        );
        assert_eq!(
            DispatchError::from(ExecutionError::new("boom")).kind(),
            ErrorKind::Permanent
        );
        assert_eq!(
            DispatchError::LeaseLost(ItemId::from_ulid(ulid::Ulid::new())).kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            DispatchError::from(StoreError::Conflict("x".into())).kind(),
            ErrorKind::Infrastructure
        );
    }

    #[test]
    fn execution_error_displays_message_only() {
        assert_eq!(ExecutionError::new("model timeout").to_string(), "model timeout");
    }
}
