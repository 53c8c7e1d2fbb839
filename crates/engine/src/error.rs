//! Error taxonomy of the layer-transition engine.
//!
//! [`RecordError`] is per record and recovered: the record is rejected and
//! the transition continues. [`PipelineError`] is per transition and fatal:
//! the execution is marked FAILED with the error's message.

use medallion_storage::{ExecutionStatus, StorageError, TableRef};
use thiserror::Error;

/// Why one record was rejected. The `Display` form is the reason string
/// reported to operators (`RuleViolationError: year_range`).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("CoercionError: {column} expected {expected}, got {found}")]
    Coercion {
        column: String,
        expected: String,
        found: String,
    },

    /// A reject-classified rule (or a null-ability check) failed.
    #[error("RuleViolationError: {rule}")]
    RuleViolation { rule: String },

    #[error("ForeignKeyViolationError: {column}={value} not found in {references}")]
    ForeignKeyViolation {
        column: String,
        value: String,
        references: String,
    },
}

impl RecordError {
    pub fn not_null(column: &str) -> Self {
        RecordError::RuleViolation {
            rule: format!("{}_not_null", column),
        }
    }

    /// The same error with the offending raw value withheld.
    pub fn redacted(self) -> Self {
        match self {
            RecordError::Coercion {
                column, expected, ..
            } => RecordError::Coercion {
                column,
                expected,
                found: "<redacted>".to_string(),
            },
            other => other,
        }
    }
}

/// Fatal error of one transition.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(
        "DataQualityError: rejection rate {rejected}/{total} exceeds threshold {threshold}"
    )]
    DataQuality {
        rejected: usize,
        total: usize,
        threshold: f64,
    },

    #[error("ConcurrentMergeError: {table} is being merged by {holder}")]
    ConcurrentMerge { table: String, holder: String },

    #[error("InvalidTransitionError: execution {execution_id} expected {expected}, found {}", display_found(.found))]
    InvalidTransition {
        execution_id: String,
        expected: ExecutionStatus,
        found: Option<ExecutionStatus>,
    },

    /// The terminal audit write failed. `original` is the error that was
    /// being recorded, if any.
    #[error("AuditWriteFailure: execution {execution_id}: {}{audit}", display_original(.original))]
    AuditWriteFailure {
        execution_id: String,
        original: Option<String>,
        audit: String,
    },

    #[error("IdentityLeak: {table}: {detail}")]
    IdentityLeak { table: TableRef, detail: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("input error: {0}")]
    Input(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

fn display_found(found: &Option<ExecutionStatus>) -> &'static str {
    match found {
        Some(status) => status.as_str(),
        None => "none",
    }
}

fn display_original(original: &Option<String>) -> String {
    match original {
        Some(message) => format!("{}; audit write failed: ", message),
        None => "audit write failed: ".to_string(),
    }
}

impl PipelineError {
    /// Map a store error raised while merging into the transition taxonomy.
    pub(crate) fn from_merge(err: StorageError) -> Self {
        match err {
            StorageError::ConcurrentMerge { table, holder } => {
                PipelineError::ConcurrentMerge { table, holder }
            }
            StorageError::VersionConflict { table, .. } => PipelineError::ConcurrentMerge {
                table,
                holder: "a concurrent commit".to_string(),
            },
            other => PipelineError::Storage(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_errors_render_operator_reasons() {
        let err = RecordError::RuleViolation {
            rule: "year_range".into(),
        };
        assert_eq!(err.to_string(), "RuleViolationError: year_range");
        assert_eq!(
            RecordError::not_null("doctor_id").to_string(),
            "RuleViolationError: doctor_id_not_null"
        );
        let fk = RecordError::ForeignKeyViolation {
            column: "doctor_id".into(),
            value: "D-999".into(),
            references: "silver.dim_doctor".into(),
        };
        assert!(fk.to_string().starts_with("ForeignKeyViolationError: doctor_id=D-999"));
    }

    #[test]
    fn invalid_transition_names_found_status() {
        let err = PipelineError::InvalidTransition {
            execution_id: "e1".into(),
            expected: ExecutionStatus::Running,
            found: Some(ExecutionStatus::Success),
        };
        assert_eq!(
            err.to_string(),
            "InvalidTransitionError: execution e1 expected RUNNING, found SUCCESS"
        );
        let unknown = PipelineError::InvalidTransition {
            execution_id: "e2".into(),
            expected: ExecutionStatus::Running,
            found: None,
        };
        assert!(unknown.to_string().ends_with("found none"));
    }

    #[test]
    fn audit_write_failure_carries_both_messages() {
        let err = PipelineError::AuditWriteFailure {
            execution_id: "e1".into(),
            original: Some("DataQualityError: too many rejects".into()),
            audit: "ledger offline".into(),
        };
        let text = err.to_string();
        assert!(text.contains("DataQualityError: too many rejects"));
        assert!(text.contains("ledger offline"));
    }
}
