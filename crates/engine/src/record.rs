//! Records, natural keys and batches.

use std::collections::BTreeMap;
use std::fmt;

use medallion_storage::RowKey;
use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Audit column stamped at the landing boundary: RFC 3339 arrival time.
pub const INGESTION_TIMESTAMP: &str = "ingestion_timestamp";
/// Audit column stamped at the landing boundary: `YYYY-MM-DD` arrival date.
pub const INGESTION_DATE: &str = "ingestion_date";

pub fn is_audit_column(name: &str) -> bool {
    name == INGESTION_TIMESTAMP || name == INGESTION_DATE
}

/// A landed record before validation.
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

static NULL: Value = Value::Null;

/// A validated record: column name to typed value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record(pub BTreeMap<String, Value>);

impl Record {
    pub fn new() -> Self {
        Record(BTreeMap::new())
    }

    /// Value of `column`, `Value::Null` when absent.
    pub fn get(&self, column: &str) -> &Value {
        self.0.get(column).unwrap_or(&NULL)
    }

    pub fn insert(&mut self, column: impl Into<String>, value: Value) {
        self.0.insert(column.into(), value);
    }

    pub fn contains(&self, column: &str) -> bool {
        self.0.get(column).is_some_and(|v| !v.is_null())
    }

    pub fn key(&self, natural_key: &NaturalKey) -> RowKey {
        RowKey(
            natural_key
                .columns()
                .iter()
                .map(|c| self.get(c).canonical_text())
                .collect(),
        )
    }

    /// Stored JSON form of every column.
    pub fn to_columns(&self) -> serde_json::Map<String, serde_json::Value> {
        self.0
            .iter()
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect()
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Record(iter.into_iter().collect())
    }
}

/// Ordered tuple of column names identifying one logical entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NaturalKey(pub Vec<String>);

impl NaturalKey {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        NaturalKey(columns.into_iter().map(Into::into).collect())
    }

    pub fn columns(&self) -> &[String] {
        &self.0
    }

    pub fn contains(&self, column: &str) -> bool {
        self.0.iter().any(|c| c == column)
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.0.join(", "))
    }
}

/// Records read from one source file, in input order.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Opaque handle passed back to `mark_processed` / `mark_failed`.
    pub source_ref: String,
    pub records: Vec<RawRecord>,
    /// Why the source could not be read. Such a batch carries no records.
    pub unreadable: Option<String>,
}

impl Batch {
    pub fn new(source_ref: impl Into<String>, records: Vec<RawRecord>) -> Self {
        Batch {
            source_ref: source_ref.into(),
            records,
            unreadable: None,
        }
    }

    /// A landed source that exists but could not be read or parsed.
    pub fn unreadable(source_ref: impl Into<String>, reason: impl Into<String>) -> Self {
        Batch {
            source_ref: source_ref.into(),
            records: Vec::new(),
            unreadable: Some(reason.into()),
        }
    }

    pub fn is_readable(&self) -> bool {
        self.unreadable.is_none()
    }
}
