//! In-process backends for `TableStore` and `AuditLedger`.
//!
//! Both keep their state behind an `Arc<Mutex<..>>` and can optionally be
//! persisted to a single JSON file, rewritten (temp file + rename) after every
//! successful mutation. Locks are never held across an `.await`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::record::{
    CommitInfo, ExecutionFilter, ExecutionOutcome, ExecutionRecord, ExecutionStatus, RowKey,
    StoredRow, TableRef, TableState,
};
use crate::traits::{AuditLedger, TableStore};

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StorageError> {
    mutex
        .lock()
        .map_err(|_| StorageError::Backend("state lock poisoned".to_string()))
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

fn load_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StorageError> {
    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).map_err(|e| {
            StorageError::Backend(format!("could not parse '{}': {}", path.display(), e))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(StorageError::Backend(format!(
            "could not read '{}': {}",
            path.display(),
            e
        ))),
    }
}

fn persist_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    let content = serde_json::to_string_pretty(value)
        .map_err(|e| StorageError::Backend(format!("serialization error: {}", e)))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content).map_err(|e| {
        StorageError::Backend(format!("could not write '{}': {}", tmp.display(), e))
    })?;
    std::fs::rename(&tmp, path).map_err(|e| {
        StorageError::Backend(format!("could not replace '{}': {}", path.display(), e))
    })
}

// ── Table store ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TableVersion {
    info: CommitInfo,
    rows: Vec<StoredRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TableHistory {
    table: TableRef,
    versions: Vec<TableVersion>,
}

impl TableHistory {
    fn current_version(&self) -> i64 {
        self.versions.last().map_or(0, |v| v.info.version)
    }

    fn state_at(&self, version: i64) -> Option<TableState> {
        if version == 0 {
            return Some(TableState::empty(self.table.clone()));
        }
        let entry = self.versions.iter().find(|v| v.info.version == version)?;
        Some(TableState {
            table: self.table.clone(),
            version,
            rows: entry
                .rows
                .iter()
                .map(|r| (r.key.clone(), r.clone()))
                .collect(),
        })
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TablesInner {
    tables: Vec<TableHistory>,
    /// Single-writer leases: table -> holding execution id.
    #[serde(skip)]
    leases: BTreeMap<TableRef, String>,
}

impl TablesInner {
    fn history(&self, table: &TableRef) -> Option<&TableHistory> {
        self.tables.iter().find(|t| &t.table == table)
    }

    fn current_state(&self, table: &TableRef) -> TableState {
        self.history(table)
            .and_then(|h| h.state_at(h.current_version()))
            .unwrap_or_else(|| TableState::empty(table.clone()))
    }
}

/// Releases the table lease when the owning snapshot goes away.
#[derive(Debug)]
struct LeaseGuard {
    inner: Arc<Mutex<TablesInner>>,
    table: TableRef,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.leases.remove(&self.table);
        }
    }
}

/// Open write transaction against one table of an [`InMemoryTableStore`].
#[derive(Debug)]
pub struct MemorySnapshot {
    table: TableRef,
    execution_id: String,
    base: TableState,
    staged: BTreeMap<RowKey, serde_json::Map<String, serde_json::Value>>,
    _lease: LeaseGuard,
}

impl MemorySnapshot {
    /// Number of rows staged so far.
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }
}

/// Versioned table store held in memory, optionally mirrored to a JSON file.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTableStore {
    inner: Arc<Mutex<TablesInner>>,
    persist_path: Option<PathBuf>,
}

impl InMemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store persisted at `path`, loading any existing content.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let inner: TablesInner = load_json(&path)?;
        Ok(InMemoryTableStore {
            inner: Arc::new(Mutex::new(inner)),
            persist_path: Some(path),
        })
    }

    /// All tables that have at least one committed version.
    pub fn tables(&self) -> Result<Vec<TableRef>, StorageError> {
        let inner = lock(&self.inner)?;
        Ok(inner.tables.iter().map(|t| t.table.clone()).collect())
    }

    fn persist(&self, inner: &TablesInner) -> Result<(), StorageError> {
        match &self.persist_path {
            Some(path) => persist_json(path, inner),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TableStore for InMemoryTableStore {
    type Snapshot = MemorySnapshot;

    async fn begin_snapshot(
        &self,
        table: &TableRef,
        execution_id: &str,
    ) -> Result<MemorySnapshot, StorageError> {
        let mut inner = lock(&self.inner)?;
        if let Some(holder) = inner.leases.get(table) {
            return Err(StorageError::ConcurrentMerge {
                table: table.to_string(),
                holder: holder.clone(),
            });
        }
        inner
            .leases
            .insert(table.clone(), execution_id.to_string());
        let base = inner.current_state(table);
        Ok(MemorySnapshot {
            table: table.clone(),
            execution_id: execution_id.to_string(),
            base,
            staged: BTreeMap::new(),
            _lease: LeaseGuard {
                inner: Arc::clone(&self.inner),
                table: table.clone(),
            },
        })
    }

    async fn snapshot_state(&self, snapshot: &MemorySnapshot) -> Result<TableState, StorageError> {
        Ok(snapshot.base.clone())
    }

    async fn upsert_row(
        &self,
        snapshot: &mut MemorySnapshot,
        key: RowKey,
        columns: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), StorageError> {
        snapshot.staged.insert(key, columns);
        Ok(())
    }

    async fn commit_snapshot(&self, snapshot: MemorySnapshot) -> Result<CommitInfo, StorageError> {
        let mut inner = lock(&self.inner)?;
        let found = inner
            .history(&snapshot.table)
            .map_or(0, TableHistory::current_version);
        if found != snapshot.base.version {
            return Err(StorageError::VersionConflict {
                table: snapshot.table.to_string(),
                expected: snapshot.base.version,
                found,
            });
        }

        let committed_at = now_rfc3339();
        if snapshot.staged.is_empty() {
            return Ok(CommitInfo {
                table: snapshot.table.clone(),
                version: found,
                execution_id: snapshot.execution_id.clone(),
                committed_at,
                rows_written: 0,
            });
        }

        let mut rows = snapshot.base.rows.clone();
        for (key, columns) in &snapshot.staged {
            rows.insert(
                key.clone(),
                StoredRow {
                    key: key.clone(),
                    columns: columns.clone(),
                    last_execution_id: snapshot.execution_id.clone(),
                    updated_at: committed_at.clone(),
                },
            );
        }
        let info = CommitInfo {
            table: snapshot.table.clone(),
            version: found + 1,
            execution_id: snapshot.execution_id.clone(),
            committed_at,
            rows_written: snapshot.staged.len(),
        };
        let version = TableVersion {
            info: info.clone(),
            rows: rows.into_values().collect(),
        };

        let created = match inner.tables.iter_mut().find(|t| t.table == snapshot.table) {
            Some(history) => {
                history.versions.push(version);
                false
            }
            None => {
                inner.tables.push(TableHistory {
                    table: snapshot.table.clone(),
                    versions: vec![version],
                });
                true
            }
        };
        // Undone under the same lock, so readers never see an unpersisted version.
        if let Err(e) = self.persist(&inner) {
            if created {
                inner.tables.retain(|t| t.table != snapshot.table);
            } else if let Some(history) =
                inner.tables.iter_mut().find(|t| t.table == snapshot.table)
            {
                history.versions.pop();
            }
            return Err(e);
        }
        // The lock guard drops before `snapshot`, whose lease re-locks.
        Ok(info)
    }

    async fn abort_snapshot(&self, snapshot: MemorySnapshot) -> Result<(), StorageError> {
        drop(snapshot);
        Ok(())
    }

    async fn read_current_state(&self, table: &TableRef) -> Result<TableState, StorageError> {
        let inner = lock(&self.inner)?;
        Ok(inner.current_state(table))
    }

    async fn read_state_at(
        &self,
        table: &TableRef,
        version: i64,
    ) -> Result<TableState, StorageError> {
        let inner = lock(&self.inner)?;
        let state = match inner.history(table) {
            Some(history) => history.state_at(version),
            None if version == 0 => Some(TableState::empty(table.clone())),
            None => None,
        };
        state.ok_or_else(|| StorageError::VersionNotFound {
            table: table.to_string(),
            version,
        })
    }

    async fn history(&self, table: &TableRef) -> Result<Vec<CommitInfo>, StorageError> {
        let inner = lock(&self.inner)?;
        Ok(inner
            .history(table)
            .map(|h| h.versions.iter().map(|v| v.info.clone()).collect())
            .unwrap_or_default())
    }
}

// ── Audit ledger ─────────────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerInner {
    executions: BTreeMap<String, ExecutionRecord>,
}

/// Execution audit ledger held in memory, optionally mirrored to a JSON file.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAuditLedger {
    inner: Arc<Mutex<LedgerInner>>,
    persist_path: Option<PathBuf>,
}

impl InMemoryAuditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a ledger persisted at `path`, loading any existing content.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let inner: LedgerInner = load_json(&path)?;
        Ok(InMemoryAuditLedger {
            inner: Arc::new(Mutex::new(inner)),
            persist_path: Some(path),
        })
    }

    fn persist(&self, inner: &LedgerInner) -> Result<(), StorageError> {
        match &self.persist_path {
            Some(path) => persist_json(path, inner),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl AuditLedger for InMemoryAuditLedger {
    async fn insert_execution(&self, record: ExecutionRecord) -> Result<(), StorageError> {
        let mut inner = lock(&self.inner)?;
        if inner.executions.contains_key(&record.execution_id) {
            return Err(StorageError::AlreadyExists {
                execution_id: record.execution_id,
            });
        }
        let execution_id = record.execution_id.clone();
        inner.executions.insert(execution_id.clone(), record);
        if let Err(e) = self.persist(&inner) {
            inner.executions.remove(&execution_id);
            return Err(e);
        }
        Ok(())
    }

    async fn finish_execution(
        &self,
        execution_id: &str,
        outcome: ExecutionOutcome,
        end_time: &str,
    ) -> Result<ExecutionRecord, StorageError> {
        let mut inner = lock(&self.inner)?;
        let record = inner.executions.get_mut(execution_id).ok_or_else(|| {
            StorageError::ExecutionNotFound {
                execution_id: execution_id.to_string(),
            }
        })?;
        if record.status != ExecutionStatus::Running {
            return Err(StorageError::StatusConflict {
                execution_id: execution_id.to_string(),
                found: record.status,
            });
        }
        let previous = record.clone();
        record.status = outcome.status();
        record.end_time = Some(end_time.to_string());
        match outcome {
            ExecutionOutcome::Success { records_processed } => {
                record.records_processed = records_processed;
            }
            ExecutionOutcome::Failed { error_message } => {
                record.error_message = Some(error_message);
            }
        }
        let updated = record.clone();
        if let Err(e) = self.persist(&inner) {
            inner.executions.insert(execution_id.to_string(), previous);
            return Err(e);
        }
        Ok(updated)
    }

    async fn get_execution(&self, execution_id: &str) -> Result<ExecutionRecord, StorageError> {
        let inner = lock(&self.inner)?;
        inner
            .executions
            .get(execution_id)
            .cloned()
            .ok_or_else(|| StorageError::ExecutionNotFound {
                execution_id: execution_id.to_string(),
            })
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ExecutionRecord>, StorageError> {
        let inner = lock(&self.inner)?;
        let mut records: Vec<ExecutionRecord> = inner
            .executions
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then_with(|| a.execution_id.cmp(&b.execution_id))
        });
        if filter.limit > 0 {
            records.truncate(filter.limit);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Namespace, Zone};

    fn table() -> TableRef {
        TableRef::new(Namespace::new("silver", Zone::Pseudonymized), "dim_doctor")
    }

    fn row(name: &str) -> serde_json::Map<String, serde_json::Value> {
        let mut m = serde_json::Map::new();
        m.insert("name".to_string(), serde_json::json!(name));
        m
    }

    #[tokio::test]
    async fn dropped_snapshot_releases_lease() {
        let store = InMemoryTableStore::new();
        {
            let _snap = store.begin_snapshot(&table(), "exec-1").await.unwrap();
        }
        assert!(store.begin_snapshot(&table(), "exec-2").await.is_ok());
    }

    #[tokio::test]
    async fn persisted_store_reloads_committed_versions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tables.json");

        let store = InMemoryTableStore::open(&path).unwrap();
        let mut snap = store.begin_snapshot(&table(), "exec-1").await.unwrap();
        store
            .upsert_row(&mut snap, RowKey::single("D-1"), row("Ana"))
            .await
            .unwrap();
        store.commit_snapshot(snap).await.unwrap();

        let reopened = InMemoryTableStore::open(&path).unwrap();
        let state = reopened.read_current_state(&table()).await.unwrap();
        assert_eq!(state.version, 1);
        assert_eq!(
            state.get(&RowKey::single("D-1")).unwrap().columns["name"],
            "Ana"
        );
        // Leases are never persisted.
        assert!(reopened.begin_snapshot(&table(), "exec-2").await.is_ok());
    }

    #[tokio::test]
    async fn persisted_ledger_reloads_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("executions.json");

        let ledger = InMemoryAuditLedger::open(&path).unwrap();
        ledger
            .insert_execution(ExecutionRecord {
                execution_id: "exec-1".to_string(),
                pipeline_name: "doctors_pipeline".to_string(),
                start_time: "2026-03-01T08:00:00Z".to_string(),
                end_time: None,
                status: ExecutionStatus::Running,
                records_processed: 0,
                error_message: None,
                run_date: "2026-03-01".to_string(),
                executed_by: "Manual".to_string(),
            })
            .await
            .unwrap();

        let reopened = InMemoryAuditLedger::open(&path).unwrap();
        let record = reopened.get_execution("exec-1").await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Running);
        assert_eq!(record.executed_by, "Manual");
    }

    fn running(execution_id: &str) -> ExecutionRecord {
        ExecutionRecord {
            execution_id: execution_id.to_string(),
            pipeline_name: "doctors_pipeline".to_string(),
            start_time: "2026-03-01T08:00:00Z".to_string(),
            end_time: None,
            status: ExecutionStatus::Running,
            records_processed: 0,
            error_message: None,
            run_date: "2026-03-01".to_string(),
            executed_by: "Scheduler".to_string(),
        }
    }

    #[tokio::test]
    async fn commit_that_cannot_persist_stays_invisible() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");
        let store = InMemoryTableStore::open(state_dir.join("tables.json")).unwrap();

        let mut snap = store.begin_snapshot(&table(), "exec-1").await.unwrap();
        store
            .upsert_row(&mut snap, RowKey::single("D-1"), row("Ana"))
            .await
            .unwrap();
        let err = store.commit_snapshot(snap).await.unwrap_err();
        assert!(matches!(err, StorageError::Backend(_)));

        let state = store.read_current_state(&table()).await.unwrap();
        assert_eq!(state.version, 0);
        assert!(state.is_empty());
        assert!(store.history(&table()).await.unwrap().is_empty());
        assert!(store.tables().unwrap().is_empty());

        std::fs::create_dir_all(&state_dir).unwrap();
        let mut snap = store.begin_snapshot(&table(), "exec-2").await.unwrap();
        store
            .upsert_row(&mut snap, RowKey::single("D-1"), row("Ana"))
            .await
            .unwrap();
        let info = store.commit_snapshot(snap).await.unwrap();
        assert_eq!(info.version, 1);
    }

    #[tokio::test]
    async fn later_commit_that_cannot_persist_keeps_prior_version() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");
        std::fs::create_dir_all(&state_dir).unwrap();
        let store = InMemoryTableStore::open(state_dir.join("tables.json")).unwrap();

        let mut snap = store.begin_snapshot(&table(), "exec-1").await.unwrap();
        store
            .upsert_row(&mut snap, RowKey::single("D-1"), row("Ana"))
            .await
            .unwrap();
        store.commit_snapshot(snap).await.unwrap();

        std::fs::remove_dir_all(&state_dir).unwrap();
        let mut snap = store.begin_snapshot(&table(), "exec-2").await.unwrap();
        store
            .upsert_row(&mut snap, RowKey::single("D-1"), row("Ana Maria"))
            .await
            .unwrap();
        assert!(store.commit_snapshot(snap).await.is_err());

        let state = store.read_current_state(&table()).await.unwrap();
        assert_eq!(state.version, 1);
        assert_eq!(
            state.get(&RowKey::single("D-1")).unwrap().columns["name"],
            "Ana"
        );
    }

    #[tokio::test]
    async fn ledger_writes_that_cannot_persist_are_undone() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");
        let ledger = InMemoryAuditLedger::open(state_dir.join("executions.json")).unwrap();

        assert!(ledger.insert_execution(running("exec-1")).await.is_err());
        assert!(matches!(
            ledger.get_execution("exec-1").await,
            Err(StorageError::ExecutionNotFound { .. })
        ));

        std::fs::create_dir_all(&state_dir).unwrap();
        ledger.insert_execution(running("exec-1")).await.unwrap();
        std::fs::remove_dir_all(&state_dir).unwrap();

        let outcome = ExecutionOutcome::Success {
            records_processed: 3,
        };
        let err = ledger
            .finish_execution("exec-1", outcome.clone(), "2026-03-01T08:05:00Z")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Backend(_)));
        let record = ledger.get_execution("exec-1").await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Running);
        assert_eq!(record.end_time, None);

        std::fs::create_dir_all(&state_dir).unwrap();
        let done = ledger
            .finish_execution("exec-1", outcome, "2026-03-01T08:06:00Z")
            .await
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Success);
        assert_eq!(done.records_processed, 3);
    }
}
