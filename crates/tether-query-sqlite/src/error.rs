use thiserror::Error;

/// Errors raised by the SQLite backend.
///
/// Failures inside an execution reach listeners and callers wrapped in
/// `tether_query::ExecutionFailure`, and can be recovered with `downcast_ref`.
#[derive(Error, Debug)]
pub enum SqliteError {
    /// SQLite rejected the statement or the connection failed
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The core refused the operation
    #[error(transparent)]
    Query(#[from] tether_query::QueryError),

    /// The blocking worker running the statement panicked or was aborted
    #[error("SQLite worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// The statement was stopped before it started stepping
    #[error("Statement was interrupted before it ran")]
    Interrupted,

    /// A checked delete matched no row
    #[error("Expected rows to be affected in table {table}, but none were")]
    NoRowsAffected { table: String },

    /// A column value could not be read as the requested type
    #[error("Unexpected value for column {column}: expected {expected}, found {found}")]
    UnexpectedValue {
        column: String,
        expected: &'static str,
        found: String,
    },
}

pub type Result<T> = std::result::Result<T, SqliteError>;
