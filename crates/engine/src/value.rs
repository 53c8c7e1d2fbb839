//! Typed cell values and fail-closed coercion of landed JSON.
//!
//! All numeric values use `rust_decimal::Decimal` or `i64`, never `f64`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime};

use crate::error::RecordError;

// ──────────────────────────────────────────────
// Column types
// ──────────────────────────────────────────────

/// Declared type of a column in a rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Int,
    Decimal,
    Date,
    Bool,
    Timestamp,
}

impl ColumnType {
    pub fn as_str(self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Int => "int",
            ColumnType::Decimal => "decimal",
            ColumnType::Date => "date",
            ColumnType::Bool => "bool",
            ColumnType::Timestamp => "timestamp",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ──────────────────────────────────────────────
// Values
// ──────────────────────────────────────────────

/// One typed cell of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Null,
    Text(String),
    Int(i64),
    Decimal(Decimal),
    Date(Date),
    Bool(bool),
    Timestamp(OffsetDateTime),
}

impl Value {
    /// Returns a human-readable type name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Text(_) => "text",
            Value::Int(_) => "int",
            Value::Decimal(_) => "decimal",
            Value::Date(_) => "date",
            Value::Bool(_) => "bool",
            Value::Timestamp(_) => "timestamp",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Value::Int(i) => Some(Decimal::from(*i)),
            Value::Decimal(d) => Some(*d),
            _ => None,
        }
    }

    /// Calendar date of a date or timestamp value.
    pub fn as_date(&self) -> Option<Date> {
        match self {
            Value::Date(d) => Some(*d),
            Value::Timestamp(ts) => Some(ts.date()),
            _ => None,
        }
    }

    /// Canonical text used for natural keys and foreign-key lookups.
    ///
    /// Decimals are normalized so `12.50` and `12.5` produce the same key.
    pub fn canonical_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Text(s) => s.clone(),
            Value::Int(i) => i.to_string(),
            Value::Decimal(d) => d.normalize().to_string(),
            Value::Date(d) => format_date(*d),
            Value::Bool(b) => b.to_string(),
            Value::Timestamp(ts) => format_timestamp(*ts),
        }
    }

    /// Stored JSON form. Decimals, dates and timestamps are strings in
    /// canonical text so stored rows compare stably.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Bool(b) => serde_json::Value::Bool(*b),
            other => serde_json::Value::String(other.canonical_text()),
        }
    }

    /// Best-effort typing of an undeclared column. Never fails.
    pub fn infer(raw: &serde_json::Value) -> Value {
        match raw {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Decimal::from_str(&n.to_string())
                    .map(Value::Decimal)
                    .unwrap_or_else(|_| Value::Text(n.to_string())),
            },
            serde_json::Value::String(s) => Value::Text(s.clone()),
            other => Value::Text(other.to_string()),
        }
    }

    /// Ordering between comparable values. Ints and decimals compare
    /// numerically; dates and timestamps compare by calendar date when mixed.
    /// Null and mismatched types are incomparable.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::Date(_), Value::Timestamp(_)) | (Value::Timestamp(_), Value::Date(_)) => {
                Some(self.as_date()?.cmp(&other.as_date()?))
            }
            (a, b) => Some(a.as_decimal()?.cmp(&b.as_decimal()?)),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            other => f.write_str(&other.canonical_text()),
        }
    }
}

pub fn format_date(date: Date) -> String {
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

pub fn format_timestamp(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339)
        .unwrap_or_else(|_| ts.unix_timestamp().to_string())
}

// ──────────────────────────────────────────────
// Coercion
// ──────────────────────────────────────────────

/// Coerce a raw landed value to `ty`, failing closed.
///
/// JSON null and blank strings coerce to `Value::Null`; null-ability is
/// checked by the caller. Anything that does not parse exactly as the
/// declared type is a `CoercionError`.
pub fn coerce(column: &str, raw: &serde_json::Value, ty: ColumnType) -> Result<Value, RecordError> {
    if let serde_json::Value::String(s) = raw {
        if s.trim().is_empty() {
            return Ok(Value::Null);
        }
    }
    if raw.is_null() {
        return Ok(Value::Null);
    }

    let parsed = match (ty, raw) {
        (ColumnType::Text, serde_json::Value::String(s)) => Some(Value::Text(s.trim().to_string())),
        (ColumnType::Text, serde_json::Value::Number(n)) => Some(Value::Text(n.to_string())),
        (ColumnType::Text, serde_json::Value::Bool(b)) => Some(Value::Text(b.to_string())),

        (ColumnType::Int, serde_json::Value::Number(n)) => n.as_i64().map(Value::Int),
        (ColumnType::Int, serde_json::Value::String(s)) => s.trim().parse().ok().map(Value::Int),

        (ColumnType::Decimal, serde_json::Value::Number(n)) => parse_decimal(&n.to_string()),
        (ColumnType::Decimal, serde_json::Value::String(s)) => parse_decimal(s.trim()),

        (ColumnType::Date, serde_json::Value::String(s)) => parse_date(s.trim()).map(Value::Date),

        (ColumnType::Bool, serde_json::Value::Bool(b)) => Some(Value::Bool(*b)),
        (ColumnType::Bool, serde_json::Value::Number(n)) => match n.as_i64() {
            Some(0) => Some(Value::Bool(false)),
            Some(1) => Some(Value::Bool(true)),
            _ => None,
        },
        (ColumnType::Bool, serde_json::Value::String(s)) => {
            match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Some(Value::Bool(true)),
                "false" | "0" => Some(Value::Bool(false)),
                _ => None,
            }
        }

        (ColumnType::Timestamp, serde_json::Value::String(s)) => {
            parse_timestamp(s.trim()).map(Value::Timestamp)
        }

        _ => None,
    };

    parsed.ok_or_else(|| RecordError::Coercion {
        column: column.to_string(),
        expected: ty.to_string(),
        found: raw.to_string(),
    })
}

fn parse_decimal(s: &str) -> Option<Value> {
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .ok()
        .map(Value::Decimal)
}

/// `YYYY-MM-DD` only.
pub fn parse_date(s: &str) -> Option<Date> {
    Date::parse(s, format_description!("[year]-[month]-[day]")).ok()
}

/// RFC 3339, or `YYYY-MM-DD HH:MM:SS` read as UTC.
pub fn parse_timestamp(s: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(s, &Rfc3339).ok().or_else(|| {
        PrimitiveDateTime::parse(
            s,
            format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
        )
        .ok()
        .map(PrimitiveDateTime::assume_utc)
    })
}
