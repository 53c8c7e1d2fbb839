//! Record validator: coercion, null-ability and rule checks.
//!
//! Validation is total and side-effect free: every input record lands in
//! exactly one of `accepted` or `rejected`.

use serde::Serialize;
use time::{Date, OffsetDateTime};

use crate::error::RecordError;
use crate::record::{RawRecord, Record};
use crate::rules::{RuleSet, Severity};
use crate::value::{coerce, Value};

/// A record that failed at least one reject-classified check.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub record: RawRecord,
    pub reasons: Vec<RecordError>,
}

impl Rejection {
    pub fn reason_strings(&self) -> Vec<String> {
        self.reasons.iter().map(ToString::to_string).collect()
    }
}

/// A warn-classified rule that failed on an accepted record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleWarning {
    /// Position of the record in the validated batch.
    pub index: usize,
    pub rule: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Validation {
    pub accepted: Vec<Record>,
    pub rejected: Vec<Rejection>,
    pub warnings: Vec<RuleWarning>,
}

impl Validation {
    pub fn total(&self) -> usize {
        self.accepted.len() + self.rejected.len()
    }
}

/// Validate `batch` against `ruleset`, using today's UTC date where a
/// record has no `ingestion_date`.
pub fn validate(batch: &[RawRecord], ruleset: &RuleSet) -> Validation {
    validate_at(batch, ruleset, OffsetDateTime::now_utc().date())
}

pub fn validate_at(batch: &[RawRecord], ruleset: &RuleSet, today: Date) -> Validation {
    let mut out = Validation::default();
    for (index, raw) in batch.iter().enumerate() {
        match validate_record(raw, ruleset, today) {
            Ok((record, warned)) => {
                out.warnings
                    .extend(warned.into_iter().map(|rule| RuleWarning { index, rule }));
                out.accepted.push(record);
            }
            Err(reasons) => out.rejected.push(Rejection {
                record: raw.clone(),
                reasons,
            }),
        }
    }
    out
}

/// Validate one record. On success returns the cleaned record and the
/// names of warn rules it failed; on failure, every reject reason.
pub fn validate_record(
    raw: &RawRecord,
    ruleset: &RuleSet,
    today: Date,
) -> Result<(Record, Vec<String>), Vec<RecordError>> {
    let mut reasons = Vec::new();
    let mut record = Record::new();

    for (name, value) in raw {
        if ruleset.column(name).is_none() {
            record.insert(name.clone(), Value::infer(value));
        }
    }

    for spec in ruleset.effective_columns() {
        let raw_value = raw.get(&spec.name).unwrap_or(&serde_json::Value::Null);
        match coerce(&spec.name, raw_value, spec.column_type) {
            Ok(value) => {
                if value.is_null() && !spec.nullable {
                    reasons.push(RecordError::not_null(&spec.name));
                }
                record.insert(spec.name, value);
            }
            Err(err) if ruleset.is_redacted(&spec.name) => reasons.push(err.redacted()),
            Err(err) => reasons.push(err),
        }
    }

    let mut warned = Vec::new();
    for rule in &ruleset.rules {
        if rule.check.passes(&record, today) {
            continue;
        }
        match rule.severity {
            Severity::Reject => reasons.push(RecordError::RuleViolation {
                rule: rule.name.clone(),
            }),
            Severity::Warn => warned.push(rule.name.clone()),
        }
    }

    if !reasons.is_empty() {
        return Err(reasons);
    }
    for rule in &ruleset.rules {
        if rule.check.passes(&record, today) {
            rule.check.normalize(&mut record);
        }
    }
    Ok((record, warned))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{Check, ColumnSpec, Rule};
    use crate::value::ColumnType;
    use rust_decimal::Decimal;
    use serde_json::json;
    use time::macros::date;

    fn raw(value: serde_json::Value) -> RawRecord {
        value.as_object().cloned().unwrap()
    }

    fn doctor_rules() -> RuleSet {
        RuleSet::new(
            vec![
                ColumnSpec::new("doctor_id", ColumnType::Text, false),
                ColumnSpec::new("year", ColumnType::Int, true),
                ColumnSpec::new("specialty", ColumnType::Text, true),
            ],
            vec![
                Rule {
                    name: "year_range".into(),
                    severity: Severity::Reject,
                    check: Check::Range {
                        column: "year".into(),
                        min: Some(Decimal::from(1900)),
                        max: Some(Decimal::from(2026)),
                    },
                },
                Rule {
                    name: "specialty_known".into(),
                    severity: Severity::Warn,
                    check: Check::OneOf {
                        column: "specialty".into(),
                        values: vec!["GP".into(), "CARDIO".into()],
                    },
                },
            ],
        )
    }

    #[test]
    fn out_of_range_year_is_rejected_with_rule_name() {
        let batch = vec![
            raw(json!({"doctor_id": "D-1", "year": 1987})),
            raw(json!({"doctor_id": "D-2", "year": 1850})),
            raw(json!({"doctor_id": "D-3", "year": "2001"})),
        ];
        let out = validate_at(&batch, &doctor_rules(), date!(2026 - 01 - 01));
        assert_eq!(out.accepted.len(), 2);
        assert_eq!(out.rejected.len(), 1);
        assert_eq!(
            out.rejected[0].reason_strings(),
            vec!["RuleViolationError: year_range".to_string()]
        );
        assert_eq!(out.rejected[0].record["doctor_id"], json!("D-2"));
        assert_eq!(out.accepted[1].get("year"), &Value::Int(2001));
    }

    #[test]
    fn every_failing_check_is_reported() {
        let batch = vec![raw(json!({"year": "nineteen"}))];
        let out = validate_at(&batch, &doctor_rules(), date!(2026 - 01 - 01));
        let reasons = out.rejected[0].reason_strings();
        assert_eq!(reasons.len(), 2);
        assert!(reasons.contains(&"RuleViolationError: doctor_id_not_null".to_string()));
        assert!(reasons[1].starts_with("CoercionError: year"));
    }

    #[test]
    fn redacted_column_hides_raw_value_in_reason() {
        let rules = RuleSet::new(
            vec![
                ColumnSpec::new("patient_token", ColumnType::Text, false),
                ColumnSpec::new("birth_date", ColumnType::Date, true),
                ColumnSpec::new("visit_date", ColumnType::Date, true),
            ],
            vec![],
        )
        .with_redacted(["birth_date"]);
        let batch = vec![raw(json!({
            "patient_token": "t-1",
            "birth_date": "14/02/1961",
            "visit_date": "03/03/2026",
        }))];
        let out = validate_at(&batch, &rules, date!(2026 - 10 - 18));
        let reasons = out.rejected[0].reason_strings();
        assert_eq!(
            reasons,
            vec![
                "CoercionError: birth_date expected date, got <redacted>".to_string(),
                "CoercionError: visit_date expected date, got \"03/03/2026\"".to_string(),
            ]
        );
    }

    #[test]
    fn warn_rules_do_not_reject() {
        let batch = vec![raw(json!({"doctor_id": "D-1", "specialty": "ASTROLOGY"}))];
        let out = validate_at(&batch, &doctor_rules(), date!(2026 - 01 - 01));
        assert_eq!(out.accepted.len(), 1);
        assert_eq!(
            out.warnings,
            vec![RuleWarning {
                index: 0,
                rule: "specialty_known".into()
            }]
        );
    }

    #[test]
    fn undeclared_and_audit_columns_are_typed() {
        let batch = vec![raw(json!({
            "doctor_id": "D-1",
            "note": "hello",
            "ingestion_timestamp": "2024-05-01T08:00:00Z",
            "ingestion_date": "2024-05-01"
        }))];
        let out = validate_at(&batch, &doctor_rules(), date!(2026 - 01 - 01));
        let record = &out.accepted[0];
        assert_eq!(record.get("note"), &Value::Text("hello".into()));
        assert_eq!(record.get("ingestion_date"), &Value::Date(date!(2024 - 05 - 01)));
        assert!(matches!(record.get("ingestion_timestamp"), Value::Timestamp(_)));
    }

    #[test]
    fn malformed_audit_timestamp_rejects() {
        let batch = vec![raw(json!({"doctor_id": "D-1", "ingestion_timestamp": "yesterday"}))];
        let out = validate_at(&batch, &doctor_rules(), date!(2026 - 01 - 01));
        assert_eq!(out.rejected.len(), 1);
    }

    #[test]
    fn empty_batch_validates_to_nothing() {
        let out = validate(&[], &doctor_rules());
        assert_eq!(out.total(), 0);
    }
}
