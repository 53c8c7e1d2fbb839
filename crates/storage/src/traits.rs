use async_trait::async_trait;

use crate::error::StorageError;
use crate::record::{
    CommitInfo, ExecutionFilter, ExecutionOutcome, ExecutionRecord, RowKey, TableRef, TableState,
};

/// Transactional key-range store backing the versioned target tables.
///
/// ## Snapshot Semantics
///
/// Writes are staged on `Self::Snapshot`, which represents one in-flight
/// merge against one table:
///
/// 1. `begin_snapshot()`: take the single-writer lease on the table
/// 2. `upsert_row()` any number of times against `&mut snapshot`
/// 3. `commit_snapshot(snapshot)`: publish every staged row as one new
///    table version, OR `abort_snapshot(snapshot)` to discard them
///
/// If a `Snapshot` is dropped without committing, staged rows MUST be
/// discarded and the lease released.
///
/// ## Single Writer
///
/// At most one snapshot may be open per table. A second `begin_snapshot`
/// on the same table returns `Err(StorageError::ConcurrentMerge { .. })`.
/// `commit_snapshot` additionally fails with `VersionConflict` if the table
/// version moved since `begin_snapshot`.
///
/// ## Versions
///
/// Every commit that writes at least one row produces version `n + 1`.
/// Version 0 is the empty table. Past versions stay readable through
/// `read_state_at`.
#[async_trait]
pub trait TableStore: Send + Sync + 'static {
    /// The snapshot (transaction) type used by this backend.
    type Snapshot: Send;

    // ── Snapshot lifecycle ────────────────────────────────────────────────────

    /// Begin a snapshot on `table` on behalf of `execution_id`.
    async fn begin_snapshot(
        &self,
        table: &TableRef,
        execution_id: &str,
    ) -> Result<Self::Snapshot, StorageError>;

    /// Committed table state as of the moment the snapshot was opened.
    async fn snapshot_state(&self, snapshot: &Self::Snapshot) -> Result<TableState, StorageError>;

    /// Stage an insert-or-replace of the row with `key`.
    async fn upsert_row(
        &self,
        snapshot: &mut Self::Snapshot,
        key: RowKey,
        columns: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), StorageError>;

    /// Commit a snapshot, publishing all staged rows atomically.
    ///
    /// A snapshot with no staged rows commits as a no-op and returns the
    /// unchanged current version with `rows_written == 0`.
    async fn commit_snapshot(&self, snapshot: Self::Snapshot) -> Result<CommitInfo, StorageError>;

    /// Abort a snapshot, discarding staged rows and releasing the lease.
    async fn abort_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    // ── Reads (outside any snapshot) ─────────────────────────────────────────

    /// Latest committed state. Tables never written read as empty at version 0.
    async fn read_current_state(&self, table: &TableRef) -> Result<TableState, StorageError>;

    /// Point-in-time read of a committed version.
    ///
    /// Returns `Err(StorageError::VersionNotFound)` for versions never committed.
    async fn read_state_at(&self, table: &TableRef, version: i64)
        -> Result<TableState, StorageError>;

    /// Commit history of a table, oldest first.
    async fn history(&self, table: &TableRef) -> Result<Vec<CommitInfo>, StorageError>;
}

/// Append/update-by-key persistence for execution records.
///
/// Only the execution tracker writes through this trait. Records are never
/// deleted.
#[async_trait]
pub trait AuditLedger: Send + Sync + 'static {
    /// Insert a new RUNNING record.
    ///
    /// Returns `Err(StorageError::AlreadyExists)` if the id was ever used.
    async fn insert_execution(&self, record: ExecutionRecord) -> Result<(), StorageError>;

    /// Move a RUNNING record to its terminal status.
    ///
    /// The write is conditional on the stored status being RUNNING
    /// (`UPDATE ... WHERE status = 'RUNNING'`). Otherwise returns
    /// `Err(StorageError::StatusConflict)`; unknown ids return
    /// `Err(StorageError::ExecutionNotFound)`.
    async fn finish_execution(
        &self,
        execution_id: &str,
        outcome: ExecutionOutcome,
        end_time: &str,
    ) -> Result<ExecutionRecord, StorageError>;

    /// Read one record.
    async fn get_execution(&self, execution_id: &str) -> Result<ExecutionRecord, StorageError>;

    /// List records matching `filter`, ordered by `start_time` then id.
    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ExecutionRecord>, StorageError>;
}
