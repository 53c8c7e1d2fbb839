//! Rule sets: declared columns plus named record predicates.
//!
//! Rule sets are configuration data (see [`crate::config`]); the validator
//! is the only consumer.

use std::collections::BTreeSet;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::Date;

use crate::record::{Record, INGESTION_DATE, INGESTION_TIMESTAMP};
use crate::value::{ColumnType, Value};

/// Whether a failing rule rejects the record or only warns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Reject,
    Warn,
}

fn default_nullable() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, column_type: ColumnType, nullable: bool) -> Self {
        ColumnSpec {
            name: name.into(),
            column_type,
            nullable,
        }
    }
}

/// A named predicate over one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(flatten)]
    pub check: Check,
}

/// The predicate of a rule. Every check reads exactly one column and
/// passes on null (null-ability is checked per column).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Check {
    /// Inclusive numeric range; either bound may be omitted.
    Range {
        column: String,
        #[serde(default)]
        min: Option<Decimal>,
        #[serde(default)]
        max: Option<Decimal>,
    },
    /// After stripping non-digits exactly `count` digits remain. Accepted
    /// records carry the stripped digit string.
    Digits { column: String, count: usize },
    OneOf { column: String, values: Vec<String> },
    MaxLength { column: String, max: usize },
    /// A date or timestamp no later than the record's ingestion date.
    NotFuture { column: String },
}

impl Check {
    pub fn column(&self) -> &str {
        match self {
            Check::Range { column, .. }
            | Check::Digits { column, .. }
            | Check::OneOf { column, .. }
            | Check::MaxLength { column, .. }
            | Check::NotFuture { column } => column,
        }
    }

    /// Evaluate against a coerced record. `today` stands in for a missing
    /// ingestion date.
    pub fn passes(&self, record: &Record, today: Date) -> bool {
        let value = record.get(self.column());
        if value.is_null() {
            return true;
        }
        match self {
            Check::Range { min, max, .. } => match value.as_decimal() {
                Some(n) => min.is_none_or(|lo| n >= lo) && max.is_none_or(|hi| n <= hi),
                None => false,
            },
            Check::Digits { count, .. } => digits_of(value).len() == *count,
            Check::OneOf { values, .. } => {
                let text = value.canonical_text();
                values.iter().any(|v| *v == text)
            }
            Check::MaxLength { max, .. } => value.canonical_text().chars().count() <= *max,
            Check::NotFuture { .. } => {
                let reference = record.get(INGESTION_DATE).as_date().unwrap_or(today);
                value.as_date().is_some_and(|d| d <= reference)
            }
        }
    }

    /// Cleaning applied once the record is accepted.
    pub(crate) fn normalize(&self, record: &mut Record) {
        if let Check::Digits { column, .. } = self {
            let value = record.get(column);
            if !value.is_null() {
                let digits = digits_of(value);
                record.insert(column.clone(), Value::Text(digits));
            }
        }
    }
}

fn digits_of(value: &Value) -> String {
    value
        .canonical_text()
        .chars()
        .filter(char::is_ascii_digit)
        .collect()
}

/// Declared columns and rules of one table group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleSet {
    pub columns: Vec<ColumnSpec>,
    pub rules: Vec<Rule>,
    /// Columns whose raw values never appear in rejection reasons.
    pub redacted: BTreeSet<String>,
}

impl RuleSet {
    pub fn new(columns: Vec<ColumnSpec>, rules: Vec<Rule>) -> Self {
        RuleSet {
            columns,
            rules,
            redacted: BTreeSet::new(),
        }
    }

    pub fn with_redacted<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.redacted.extend(columns.into_iter().map(Into::into));
        self
    }

    pub fn is_redacted(&self, column: &str) -> bool {
        self.redacted.contains(column)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Declared columns plus the implicit audit columns, unless redeclared.
    pub fn effective_columns(&self) -> Vec<ColumnSpec> {
        let mut columns = self.columns.clone();
        for (name, ty) in [
            (INGESTION_TIMESTAMP, ColumnType::Timestamp),
            (INGESTION_DATE, ColumnType::Date),
        ] {
            if self.column(name).is_none() {
                columns.push(ColumnSpec::new(name, ty, true));
            }
        }
        columns
    }
}
