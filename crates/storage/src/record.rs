use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Access zone of a target namespace. Raw identity lives only in
/// `Identity` namespaces; everything else carries tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Zone {
    Identity,
    Pseudonymized,
}

impl Zone {
    pub fn as_str(self) -> &'static str {
        match self {
            Zone::Identity => "identity",
            Zone::Pseudonymized => "pseudonymized",
        }
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A physically separate target location (schema / bucket prefix).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace {
    pub name: String,
    pub zone: Zone,
}

impl Namespace {
    pub fn new(name: impl Into<String>, zone: Zone) -> Self {
        Namespace {
            name: name.into(),
            zone,
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Address of one versioned table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    pub namespace: Namespace,
    pub table: String,
}

impl TableRef {
    pub fn new(namespace: Namespace, table: impl Into<String>) -> Self {
        TableRef {
            namespace,
            table: table.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.table)
    }
}

/// Canonical text of each natural-key column, in key order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowKey(pub Vec<String>);

impl RowKey {
    pub fn single(value: impl Into<String>) -> Self {
        RowKey(vec![value.into()])
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("|"))
    }
}

/// One committed row of a versioned table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRow {
    pub key: RowKey,
    pub columns: serde_json::Map<String, serde_json::Value>,
    /// Execution that last wrote this row.
    pub last_execution_id: String,
    /// RFC 3339 timestamp of the commit that last wrote this row.
    pub updated_at: String,
}

/// A consistent read of a table at one version.
#[derive(Debug, Clone)]
pub struct TableState {
    pub table: TableRef,
    /// Version 0 is the empty table before its first commit.
    pub version: i64,
    pub rows: BTreeMap<RowKey, StoredRow>,
}

impl TableState {
    pub fn empty(table: TableRef) -> Self {
        TableState {
            table,
            version: 0,
            rows: BTreeMap::new(),
        }
    }

    pub fn contains_key(&self, key: &RowKey) -> bool {
        self.rows.contains_key(key)
    }

    pub fn get(&self, key: &RowKey) -> Option<&StoredRow> {
        self.rows.get(key)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Metadata of one committed table version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub table: TableRef,
    pub version: i64,
    pub execution_id: String,
    /// RFC 3339 timestamp string.
    pub committed_at: String,
    pub rows_written: usize,
}

// ── Execution audit ──────────────────────────────────────────────────────────

/// Lifecycle status of one pipeline execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Success => "SUCCESS",
            ExecutionStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RUNNING" => Ok(ExecutionStatus::Running),
            "SUCCESS" => Ok(ExecutionStatus::Success),
            "FAILED" => Ok(ExecutionStatus::Failed),
            other => Err(format!(
                "unknown execution status '{}', expected RUNNING, SUCCESS or FAILED",
                other
            )),
        }
    }
}

/// One row of the execution audit ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub pipeline_name: String,
    /// RFC 3339 timestamp string.
    pub start_time: String,
    /// RFC 3339 timestamp string. None while RUNNING.
    pub end_time: Option<String>,
    pub status: ExecutionStatus,
    pub records_processed: u64,
    pub error_message: Option<String>,
    /// `YYYY-MM-DD` (UTC) of `start_time`.
    pub run_date: String,
    pub executed_by: String,
}

/// Terminal outcome written by `AuditLedger::finish_execution`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Success { records_processed: u64 },
    Failed { error_message: String },
}

impl ExecutionOutcome {
    pub fn status(&self) -> ExecutionStatus {
        match self {
            ExecutionOutcome::Success { .. } => ExecutionStatus::Success,
            ExecutionOutcome::Failed { .. } => ExecutionStatus::Failed,
        }
    }
}

/// Query filter over the audit ledger. `limit` of 0 means no limit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionFilter {
    pub pipeline_name: Option<String>,
    pub run_date: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub limit: usize,
}

impl ExecutionFilter {
    pub fn matches(&self, record: &ExecutionRecord) -> bool {
        self.pipeline_name
            .as_deref()
            .is_none_or(|p| p == record.pipeline_name)
            && self.run_date.as_deref().is_none_or(|d| d == record.run_date)
            && self.status.is_none_or(|s| s == record.status)
    }
}
