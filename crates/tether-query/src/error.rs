use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::event::ExecutionKind;

/// Unified error type for the data-access core
#[derive(Error, Debug)]
pub enum QueryError {
    /// A required value was absent or empty
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A cache entry holds a different type than the one requested
    #[error("Cache is corrupted. Cache key \"{key}\" holds a {stored}, not a {requested}")]
    CacheCorrupted {
        key: String,
        stored: &'static str,
        requested: &'static str,
    },

    /// An extension's construction contract failed
    #[error("Failed to construct extension {type_name}: {message}")]
    ExtensionConstruction {
        type_name: &'static str,
        message: String,
    },

    /// An event listener returned an error during dispatch
    #[error("Execution {kind} listener failed: {source}")]
    Subscriber {
        kind: ExecutionKind,
        #[source]
        source: anyhow::Error,
    },

    /// The backend operation failed
    #[error("Execution failed: {0}")]
    Execution(ExecutionFailure),

    /// The operation exceeded its command timeout
    #[error("Command timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The caller aborted the operation
    #[error("Execution was canceled")]
    Canceled,

    /// Reading schema metadata from the backend failed
    #[error("Failed to read metadata for {object}: {source}")]
    Metadata {
        object: String,
        #[source]
        source: ExecutionFailure,
    },

    /// Object members and database schema do not line up
    #[error("Mapping error: {0}")]
    Mapping(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueryError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        QueryError::InvalidArgument(msg.into())
    }

    pub fn mapping(msg: impl Into<String>) -> Self {
        QueryError::Mapping(msg.into())
    }

    pub fn metadata<E>(object: impl Into<String>, error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        QueryError::Metadata {
            object: object.into(),
            source: ExecutionFailure::new(error),
        }
    }

    /// Returns the backend failure if this error carries one
    pub fn execution_failure(&self) -> Option<&ExecutionFailure> {
        match self {
            QueryError::Execution(failure) | QueryError::Metadata { source: failure, .. } => {
                Some(failure)
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, QueryError>;

/// A backend error shared between event listeners and the caller.
///
/// Cloning is cheap; every clone refers to the same underlying error value.
#[derive(Clone)]
pub struct ExecutionFailure(Arc<dyn std::error::Error + Send + Sync>);

impl ExecutionFailure {
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self(Arc::new(error))
    }

    /// Attempt to view the underlying error as a concrete type
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    pub fn inner(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self.0.as_ref()
    }

    /// True when both handles point at the same error value
    pub fn ptr_eq(&self, other: &ExecutionFailure) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for ExecutionFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

/// Error reported to listeners when an operation exceeds its command timeout
#[derive(Error, Debug, Clone, Copy)]
#[error("command timeout of {}ms elapsed", .0.as_millis())]
pub struct CommandTimeout(pub Duration);

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Error, Debug)]
    #[error("disk on fire")]
    struct DiskError;

    #[test]
    fn test_execution_failure_downcast() {
        let failure = ExecutionFailure::new(DiskError);
        assert!(failure.downcast_ref::<DiskError>().is_some());
        assert!(failure.downcast_ref::<CommandTimeout>().is_none());
        assert_eq!(failure.to_string(), "disk on fire");
    }

    #[test]
    fn test_execution_failure_clone_shares_value() {
        let failure = ExecutionFailure::new(DiskError);
        let copy = failure.clone();
        assert!(failure.ptr_eq(&copy));
    }

    #[test]
    fn test_cache_corrupted_message() {
        let err = QueryError::CacheCorrupted {
            key: "k".to_string(),
            stored: "alloc::string::String",
            requested: "i64",
        };
        assert_eq!(
            err.to_string(),
            "Cache is corrupted. Cache key \"k\" holds a alloc::string::String, not a i64"
        );
    }

    #[test]
    fn test_timeout_message() {
        let err = QueryError::Timeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "Command timed out after 1500ms");
    }

    #[test]
    fn test_metadata_keeps_backend_error() {
        let err = QueryError::metadata("items", DiskError);
        assert_eq!(err.to_string(), "Failed to read metadata for items: disk on fire");
        assert!(err
            .execution_failure()
            .and_then(|failure| failure.downcast_ref::<DiskError>())
            .is_some());
    }
}
