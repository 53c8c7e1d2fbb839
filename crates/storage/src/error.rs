use crate::record::ExecutionStatus;

/// All errors that can be returned by a `TableStore` or `AuditLedger` implementation.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Single-writer violation: another execution holds the write lease on
    /// the target table.
    #[error("table {table} is already being merged by execution {holder}")]
    ConcurrentMerge { table: String, holder: String },

    /// The table advanced past the version a snapshot was staged against.
    #[error("table {table} moved from version {expected} to {found} while staged")]
    VersionConflict {
        table: String,
        expected: i64,
        found: i64,
    },

    /// Point-in-time read of a version that was never committed.
    #[error("table {table} has no version {version}")]
    VersionNotFound { table: String, version: i64 },

    /// Execution record not found.
    #[error("execution not found: {execution_id}")]
    ExecutionNotFound { execution_id: String },

    /// An execution record with this id already exists.
    #[error("execution already recorded: {execution_id}")]
    AlreadyExists { execution_id: String },

    /// Conditional terminal write found the execution no longer RUNNING.
    #[error("execution {execution_id} is {found}, not RUNNING")]
    StatusConflict {
        execution_id: String,
        found: ExecutionStatus,
    },

    /// A backend-specific storage error (I/O, serialization, poisoned lock, etc.).
    #[error("storage backend error: {0}")]
    Backend(String),
}
