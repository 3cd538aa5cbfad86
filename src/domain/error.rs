//! Error taxonomy of the sync engine.

use serde::Serialize;
use thiserror::Error;

/// Result type for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Coarse classification used by the retry policy and the run report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Cannot open an endpoint.
    Connection,
    /// A read or write statement failed for a non-transient reason.
    Query,
    /// Lock wait timeout, deadlock or busy database. Retried.
    Contention,
    /// A value could not be cast to the destination column type.
    Coercion,
    /// DDL failed or cannot be expressed by the dialect.
    Schema,
    /// The server rolled back the open transaction; every uncommitted write
    /// of the session is gone.
    TransactionLost,
    /// Anything else (bad identifiers, unsupported tables, I/O).
    Other,
}

/// Errors that can occur while synchronizing a table.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Opening a session to an endpoint failed.
    #[error("cannot connect to {endpoint}: {message}")]
    Connection { endpoint: String, message: String },

    /// A statement failed.
    #[error("query failed on {table}: {message}")]
    Query { table: String, message: String },

    /// Lock contention (lock wait timeout, deadlock, busy).
    #[error("lock contention on {table}: {message}")]
    Contention { table: String, message: String },

    /// A value does not fit the destination column type.
    #[error("cannot coerce {value} to {column_type} for column {column}")]
    Coercion {
        column: String,
        column_type: String,
        value: String,
    },

    /// The open transaction was rolled back and could not be rebuilt.
    #[error("transaction on {table} was rolled back: {message}")]
    TransactionLost { table: String, message: String },

    /// DDL failure.
    #[error("schema change on {table} failed: {message}")]
    Schema { table: String, message: String },

    /// The table has no primary key and cannot be diffed.
    #[error("table {0} has no primary key")]
    MissingPrimaryKey(String),

    /// The table has more than one primary-key column.
    #[error("table {table} has a composite primary key ({columns}); only single-column keys are supported")]
    CompositePrimaryKey { table: String, columns: String },

    /// A snapshot contains the same key twice.
    #[error("duplicate primary key {key} in snapshot of {table}")]
    DuplicateKey { table: String, key: String },

    /// A snapshot exceeds the configured memory ceiling.
    #[error("snapshot of {table} exceeds {limit} rows")]
    SnapshotTooLarge { table: String, limit: usize },

    /// An identifier, type or collation failed allow-list validation.
    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),

    /// The dialect cannot express the requested operation.
    #[error("{0} is not supported by this driver")]
    Unsupported(String),

    /// Local file I/O (bulk transfer).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Returns the classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Connection { .. } => ErrorKind::Connection,
            SyncError::Query { .. } | SyncError::DuplicateKey { .. } => ErrorKind::Query,
            SyncError::Contention { .. } => ErrorKind::Contention,
            SyncError::Coercion { .. } => ErrorKind::Coercion,
            SyncError::TransactionLost { .. } => ErrorKind::TransactionLost,
            SyncError::Schema { .. } | SyncError::Unsupported(_) => ErrorKind::Schema,
            SyncError::MissingPrimaryKey(_)
            | SyncError::CompositePrimaryKey { .. }
            | SyncError::SnapshotTooLarge { .. }
            | SyncError::InvalidIdentifier(_)
            | SyncError::Io(_) => ErrorKind::Other,
        }
    }

    /// Returns true if the statement may succeed when retried.
    pub fn is_contention(&self) -> bool {
        self.kind() == ErrorKind::Contention
    }
}
