//! Layer transition orchestrator.
//!
//! Per group: `begin` → read → tokenize → validate → (over threshold:
//! `fail`) → dedupe → stage merge → (over threshold: abort, `fail`) →
//! commit → `complete`. Any error after `begin` becomes a FAILED execution
//! carrying the error's message, and the landed sources are marked failed.
//! Unreadable sources fail the execution before anything is read; only they
//! are marked failed.

use std::sync::Arc;

use medallion_storage::TableStore;
use serde::Serialize;
use tracing::{error, info, warn, Instrument};

use crate::config::{GroupConfig, PipelineConfig};
use crate::dedupe::dedupe;
use crate::error::PipelineError;
use crate::merge::{MergeEngine, MergeResult};
use crate::observability::transition_span;
use crate::pseudonymize::Tokenizer;
use crate::record::{Batch, RawRecord};
use crate::source::InputReader;
use crate::tracker::ExecutionTracker;
use crate::validate::{validate, RuleWarning};

/// What one successful transition did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionReport {
    pub group: String,
    pub pipeline_name: String,
    pub execution_id: String,
    pub sources: Vec<String>,
    pub records_read: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub duplicates_dropped: usize,
    pub fk_rejected: usize,
    pub merge: MergeResult,
    pub table_version: i64,
    pub records_processed: u64,
    pub warnings: Vec<RuleWarning>,
}

/// Result of one group within `run_all`.
#[derive(Debug)]
pub struct GroupOutcome {
    pub group: String,
    pub result: Result<TransitionReport, PipelineError>,
}

impl GroupOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

pub struct LayerTransition<S: TableStore> {
    config: Arc<PipelineConfig>,
    reader: Arc<dyn InputReader>,
    merger: MergeEngine<S>,
    tracker: ExecutionTracker,
}

impl<S: TableStore> LayerTransition<S> {
    pub fn new(
        config: Arc<PipelineConfig>,
        reader: Arc<dyn InputReader>,
        store: Arc<S>,
        tracker: ExecutionTracker,
    ) -> Self {
        LayerTransition {
            config,
            reader,
            merger: MergeEngine::new(store),
            tracker,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn tracker(&self) -> &ExecutionTracker {
        &self.tracker
    }

    pub fn store(&self) -> &Arc<S> {
        self.merger.store()
    }

    /// Run every group: dimensions, then identities, then facts. A failed
    /// group does not stop the rest.
    pub async fn run_all(&self, executed_by: &str) -> Result<Vec<GroupOutcome>, PipelineError> {
        let mut outcomes = Vec::new();
        for group in self.config.run_order()? {
            let result = self.run_group(&group, executed_by).await;
            outcomes.push(GroupOutcome { group, result });
        }
        Ok(outcomes)
    }

    /// Run one group's transition under a fresh execution.
    pub async fn run_group(
        &self,
        group: &str,
        executed_by: &str,
    ) -> Result<TransitionReport, PipelineError> {
        let cfg = self.config.group(group)?;
        let pipeline_name = self.config.pipeline_name_for(group);
        let execution_id = self.tracker.begin(&pipeline_name, executed_by).await?;
        let span = transition_span(group, &pipeline_name, &execution_id);
        self.run_tracked(group, cfg, &pipeline_name, &execution_id)
            .instrument(span)
            .await
    }

    async fn run_tracked(
        &self,
        group: &str,
        cfg: &GroupConfig,
        pipeline_name: &str,
        execution_id: &str,
    ) -> Result<TransitionReport, PipelineError> {
        let batches = match self.reader.list_batches(group).await {
            Ok(batches) => batches,
            Err(e) => return self.fail_transition(execution_id, &[], e).await,
        };
        let (batches, unreadable): (Vec<Batch>, Vec<Batch>) =
            batches.into_iter().partition(Batch::is_readable);
        if !unreadable.is_empty() {
            // Readable siblings stay landed for the next run.
            let failed: Vec<String> = unreadable.iter().map(|b| b.source_ref.clone()).collect();
            let reasons: Vec<&str> = unreadable
                .iter()
                .filter_map(|b| b.unreadable.as_deref())
                .collect();
            let err = PipelineError::Input(reasons.join("; "));
            return self.fail_transition(execution_id, &failed, err).await;
        }
        let sources: Vec<String> = batches.iter().map(|b| b.source_ref.clone()).collect();

        let report = match self
            .transition(group, cfg, pipeline_name, execution_id, batches)
            .await
        {
            Ok(report) => report,
            Err(e) => return self.fail_transition(execution_id, &sources, e).await,
        };

        // The merge is committed: sources are settled as processed even when
        // the SUCCESS row cannot be written.
        let completed = self
            .tracker
            .complete(execution_id, report.records_processed)
            .await;
        for source in &sources {
            if let Err(e) = self.reader.mark_processed(source).await {
                error!(source = %source, error = %e, "could not mark source processed");
            }
        }
        completed?;
        Ok(report)
    }

    async fn transition(
        &self,
        group: &str,
        cfg: &GroupConfig,
        pipeline_name: &str,
        execution_id: &str,
        batches: Vec<Batch>,
    ) -> Result<TransitionReport, PipelineError> {
        let sources: Vec<String> = batches.iter().map(|b| b.source_ref.clone()).collect();
        let mut raw: Vec<RawRecord> = batches.into_iter().flat_map(|b| b.records).collect();
        let records_read = raw.len();

        if let Some(spec) = &cfg.tokenize {
            let tokenizer = Tokenizer::from_env(spec.clone())?;
            for record in &mut raw {
                tokenizer.apply(record);
            }
        }

        let validation = validate(&raw, &self.config.ruleset_for(group)?);
        for rejection in &validation.rejected {
            warn!(reasons = ?rejection.reason_strings(), "record rejected");
        }
        for warning in &validation.warnings {
            warn!(rule = %warning.rule, index = warning.index, "warn rule failed");
        }
        let rejected = validation.rejected.len();
        let accepted = validation.accepted.len();
        self.check_threshold(rejected, records_read)?;

        let deduped = dedupe(validation.accepted, &cfg.natural_key, &cfg.recency_column);
        let target = self.config.merge_target(group)?;
        let staged = self
            .merger
            .stage(&target, deduped.records, execution_id)
            .await?;

        for rejection in staged.fk_rejected() {
            warn!(reasons = ?rejection.reason_strings(), "record rejected");
        }
        let fk_rejected = staged.fk_rejected().len();
        if let Err(e) = self.check_threshold(rejected + fk_rejected, records_read) {
            if let Err(abort) = staged.abort().await {
                error!(error = %abort, "could not abort staged merge");
            }
            return Err(e);
        }

        let outcome = staged.commit().await?;
        let records_processed = outcome.result.processed() as u64;
        info!(
            records_read,
            accepted,
            rejected,
            duplicates_dropped = deduped.duplicates_dropped,
            fk_rejected,
            inserted = outcome.result.inserted,
            updated = outcome.result.updated,
            unchanged = outcome.result.unchanged,
            "transition merged"
        );

        Ok(TransitionReport {
            group: group.to_string(),
            pipeline_name: pipeline_name.to_string(),
            execution_id: execution_id.to_string(),
            sources,
            records_read,
            accepted,
            rejected,
            duplicates_dropped: deduped.duplicates_dropped,
            fk_rejected,
            merge: outcome.result,
            table_version: outcome.version,
            records_processed,
            warnings: validation.warnings,
        })
    }

    fn check_threshold(&self, rejected: usize, total: usize) -> Result<(), PipelineError> {
        if total == 0 {
            return Ok(());
        }
        let threshold = self.config.max_rejection_rate;
        if rejected as f64 / total as f64 > threshold {
            return Err(PipelineError::DataQuality {
                rejected,
                total,
                threshold,
            });
        }
        Ok(())
    }

    /// Record the failure, then surface the original error. If the audit
    /// write fails too, the combined `AuditWriteFailure` is returned.
    async fn fail_transition(
        &self,
        execution_id: &str,
        sources: &[String],
        err: PipelineError,
    ) -> Result<TransitionReport, PipelineError> {
        for source in sources {
            if let Err(e) = self.reader.mark_failed(source).await {
                error!(source = %source, error = %e, "could not mark source failed");
            }
        }
        match self.tracker.fail(execution_id, &err.to_string()).await {
            Ok(_) => Err(err),
            Err(audit) => Err(audit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::RecordingAlertSink;
    use crate::source::InMemoryReader;
    use medallion_storage::{
        AuditLedger, ExecutionFilter, ExecutionOutcome, ExecutionRecord, ExecutionStatus,
        InMemoryAuditLedger, InMemoryTableStore, RowKey, StorageError,
    };
    use serde_json::json;

    const CONFIG: &str = r#"
pipeline_name = "clinic"
max_rejection_rate = 0.5
running_timeout_secs = 3600

[groups.doctors]
kind = "dimension"
namespace = { name = "silver", zone = "pseudonymized" }
table = "dim_doctor"
natural_key = ["doctor_id"]
columns = [
  { name = "doctor_id", type = "text", nullable = false },
  { name = "year", type = "int" },
]
rules = [ { name = "year_range", kind = "range", column = "year", min = 1900, max = 2026 } ]

[groups.visits]
kind = "fact"
namespace = { name = "silver", zone = "pseudonymized" }
table = "fact_visit"
natural_key = ["visit_id"]
columns = [
  { name = "visit_id", type = "text", nullable = false },
  { name = "doctor_id", type = "text", nullable = false },
]
foreign_keys = [ { column = "doctor_id", references = "doctors" } ]
"#;

    struct Harness {
        transition: LayerTransition<InMemoryTableStore>,
        reader: Arc<InMemoryReader>,
        alerts: Arc<RecordingAlertSink>,
    }

    fn harness(config: &str) -> Harness {
        let config = Arc::new(PipelineConfig::from_toml_str(config).unwrap());
        let reader = Arc::new(InMemoryReader::new());
        let alerts = Arc::new(RecordingAlertSink::new());
        let tracker = ExecutionTracker::new(Arc::new(InMemoryAuditLedger::new()), alerts.clone());
        let transition = LayerTransition::new(
            config,
            reader.clone(),
            Arc::new(InMemoryTableStore::new()),
            tracker,
        );
        Harness {
            transition,
            reader,
            alerts,
        }
    }

    fn batch(source: &str, records: serde_json::Value) -> Batch {
        let records = records
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r.as_object().cloned().unwrap())
            .collect();
        Batch::new(source, records)
    }

    #[tokio::test]
    async fn dimension_transition_rejects_bad_year_and_completes() {
        let h = harness(CONFIG);
        h.reader
            .push(
                "doctors",
                batch(
                    "doctors/001.json",
                    json!([
                        {"doctor_id": "D-1", "year": 1987},
                        {"doctor_id": "D-2", "year": 1850},
                        {"doctor_id": "D-3", "year": 2001},
                    ]),
                ),
            )
            .unwrap();

        let report = h.transition.run_group("doctors", "Manual").await.unwrap();
        assert_eq!(report.records_read, 3);
        assert_eq!(report.accepted, 2);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.merge.inserted, 2);
        assert_eq!(report.records_processed, 2);
        assert_eq!(report.table_version, 1);

        let record = h
            .transition
            .tracker()
            .execution(&report.execution_id)
            .await
            .unwrap();
        assert_eq!(record.status, ExecutionStatus::Success);
        assert_eq!(record.pipeline_name, "doctors_pipeline");
        assert_eq!(record.executed_by, "Manual");
        assert_eq!(h.reader.processed(), vec!["doctors/001.json".to_string()]);
    }

    #[tokio::test]
    async fn threshold_breach_fails_execution_and_writes_nothing() {
        let h = harness(CONFIG);
        h.reader
            .push(
                "doctors",
                batch(
                    "doctors/bad.json",
                    json!([
                        {"doctor_id": "D-1", "year": 1700},
                        {"doctor_id": "D-2", "year": 1850},
                        {"doctor_id": "D-3", "year": 2001},
                    ]),
                ),
            )
            .unwrap();

        let err = h.transition.run_group("doctors", "Scheduler").await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::DataQuality {
                rejected: 2,
                total: 3,
                ..
            }
        ));

        let failed = h
            .transition
            .tracker()
            .executions(&ExecutionFilter {
                status: Some(ExecutionStatus::Failed),
                ..ExecutionFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert!(failed[0]
            .error_message
            .as_deref()
            .unwrap()
            .starts_with("DataQualityError"));
        assert_eq!(h.alerts.failures().len(), 1);
        assert_eq!(h.reader.failed(), vec!["doctors/bad.json".to_string()]);

        let state = h
            .transition
            .store()
            .read_current_state(&h.transition.config().groups["doctors"].table_ref())
            .await
            .unwrap();
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn fact_rejects_unknown_dimension_key() {
        let h = harness(CONFIG);
        h.reader
            .push("doctors", batch("d.json", json!([{"doctor_id": "D-1"}])))
            .unwrap();
        h.reader
            .push(
                "visits",
                batch(
                    "v.json",
                    json!([
                        {"visit_id": "V-1", "doctor_id": "D-1"},
                        {"visit_id": "V-2", "doctor_id": "D-1"},
                        {"visit_id": "V-3", "doctor_id": "D-999"},
                    ]),
                ),
            )
            .unwrap();

        let outcomes = h.transition.run_all("Scheduler").await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].group, "doctors");
        let visits = outcomes[1].result.as_ref().unwrap();
        assert_eq!(visits.fk_rejected, 1);
        assert_eq!(visits.merge.inserted, 2);

        let state = h
            .transition
            .store()
            .read_current_state(&h.transition.config().groups["visits"].table_ref())
            .await
            .unwrap();
        assert!(!state.contains_key(&RowKey::single("V-3")));
    }

    #[tokio::test]
    async fn fk_rejects_count_toward_threshold() {
        let h = harness(CONFIG);
        h.reader
            .push(
                "visits",
                batch(
                    "v.json",
                    json!([
                        {"visit_id": "V-1", "doctor_id": "D-404"},
                        {"visit_id": "V-2", "doctor_id": "D-405"},
                        {"visit_id": "V-3", "doctor_id": "D-406"},
                    ]),
                ),
            )
            .unwrap();
        let err = h.transition.run_group("visits", "Scheduler").await.unwrap_err();
        assert!(matches!(err, PipelineError::DataQuality { rejected: 3, .. }));

        let history = h
            .transition
            .store()
            .history(&h.transition.config().groups["visits"].table_ref())
            .await
            .unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn empty_input_succeeds_with_zero_processed() {
        let h = harness(CONFIG);
        let report = h.transition.run_group("doctors", "Scheduler").await.unwrap();
        assert_eq!(report.records_read, 0);
        assert_eq!(report.records_processed, 0);
        assert_eq!(report.table_version, 0);
    }

    #[tokio::test]
    async fn redelivered_batch_is_idempotent() {
        let h = harness(CONFIG);
        let records = json!([
            {"doctor_id": "D-1", "year": 1987, "ingestion_timestamp": "2026-10-18T06:00:00Z"},
            {"doctor_id": "D-1", "year": 1988, "ingestion_timestamp": "2026-10-18T07:00:00Z"},
        ]);
        h.reader.push("doctors", batch("a.json", records.clone())).unwrap();
        let first = h.transition.run_group("doctors", "Scheduler").await.unwrap();
        assert_eq!(first.duplicates_dropped, 1);
        assert_eq!(first.merge.inserted, 1);

        h.reader.push("doctors", batch("a-again.json", records)).unwrap();
        let second = h.transition.run_group("doctors", "Scheduler").await.unwrap();
        assert_eq!(second.merge.unchanged, 1);
        assert_eq!(second.merge.written(), 0);
        assert_eq!(second.table_version, first.table_version);

        let state = h
            .transition
            .store()
            .read_current_state(&h.transition.config().groups["doctors"].table_ref())
            .await
            .unwrap();
        let row = state.get(&RowKey::single("D-1")).unwrap();
        assert_eq!(row.columns["year"], json!(1988));
    }

    #[tokio::test]
    async fn identity_group_tokenizes_before_validation() {
        std::env::set_var("ORCH_TEST_TOKEN_SALT", "pepper");
        let config = r#"
pipeline_name = "clinic"
max_rejection_rate = 0.0
running_timeout_secs = 3600
identifying_columns = ["national_id"]

[groups.patients]
kind = "identity"
namespace = { name = "restricted", zone = "identity" }
table = "patient_identity"
natural_key = ["patient_token"]
columns = [
  { name = "patient_token", type = "text", nullable = false },
  { name = "national_id", type = "text", nullable = false },
]
rules = [ { name = "national_id_format", kind = "digits", column = "national_id", count = 11 } ]

[groups.patients.tokenize]
source = "national_id"
target = "patient_token"
salt_env = "ORCH_TEST_TOKEN_SALT"
"#;
        let h = harness(config);
        h.reader
            .push(
                "patients",
                batch("p.json", json!([{"national_id": "123.456.789-09"}])),
            )
            .unwrap();
        let report = h.transition.run_group("patients", "Scheduler").await.unwrap();
        assert_eq!(report.merge.inserted, 1);

        let state = h
            .transition
            .store()
            .read_current_state(&h.transition.config().groups["patients"].table_ref())
            .await
            .unwrap();
        let expected = crate::pseudonymize::token("12345678909", "pepper");
        let row = state.get(&RowKey::single(expected)).unwrap();
        assert_eq!(row.columns["national_id"], json!("12345678909"));
    }

    #[tokio::test]
    async fn missing_salt_fails_the_execution() {
        let config = r#"
pipeline_name = "clinic"
max_rejection_rate = 0.0
running_timeout_secs = 3600

[groups.patients]
kind = "identity"
namespace = { name = "restricted", zone = "identity" }
table = "patient_identity"
natural_key = ["patient_token"]
columns = [
  { name = "patient_token", type = "text", nullable = false },
  { name = "national_id", type = "text" },
]

[groups.patients.tokenize]
source = "national_id"
target = "patient_token"
salt_env = "ORCH_TEST_SALT_THAT_IS_NEVER_SET"
"#;
        let h = harness(config);
        let err = h.transition.run_group("patients", "Scheduler").await.unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
        assert_eq!(h.alerts.failures().len(), 1);
    }

    #[tokio::test]
    async fn unreadable_source_is_failed_alone_and_siblings_promote_next_run() {
        let h = harness(CONFIG);
        h.reader
            .push(
                "doctors",
                batch("doctors/001.json", json!([{"doctor_id": "D-1", "year": 1987}])),
            )
            .unwrap();
        h.reader
            .push(
                "doctors",
                Batch::unreadable("doctors/002.json", "doctors/002.json: expected a JSON array"),
            )
            .unwrap();

        let err = h.transition.run_group("doctors", "Scheduler").await.unwrap_err();
        assert!(err.to_string().contains("002.json: expected a JSON array"));
        assert_eq!(h.reader.failed(), vec!["doctors/002.json".to_string()]);
        assert!(h.reader.processed().is_empty());
        assert_eq!(h.alerts.failures().len(), 1);

        let report = h.transition.run_group("doctors", "Scheduler").await.unwrap();
        assert_eq!(report.sources, vec!["doctors/001.json".to_string()]);
        assert_eq!(report.merge.inserted, 1);
        assert_eq!(h.reader.processed(), vec!["doctors/001.json".to_string()]);
    }

    #[tokio::test]
    async fn unknown_group_starts_no_execution() {
        let h = harness(CONFIG);
        let err = h.transition.run_group("nurses", "Scheduler").await.unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
        let all = h
            .transition
            .tracker()
            .executions(&ExecutionFilter::default())
            .await
            .unwrap();
        assert!(all.is_empty());
    }

    /// Accepts new executions but cannot write terminal rows.
    struct OfflineFinishLedger(InMemoryAuditLedger);

    #[async_trait::async_trait]
    impl AuditLedger for OfflineFinishLedger {
        async fn insert_execution(&self, record: ExecutionRecord) -> Result<(), StorageError> {
            self.0.insert_execution(record).await
        }

        async fn finish_execution(
            &self,
            _execution_id: &str,
            _outcome: ExecutionOutcome,
            _end_time: &str,
        ) -> Result<ExecutionRecord, StorageError> {
            Err(StorageError::Backend("ledger offline".into()))
        }

        async fn get_execution(&self, execution_id: &str) -> Result<ExecutionRecord, StorageError> {
            self.0.get_execution(execution_id).await
        }

        async fn list_executions(
            &self,
            filter: &ExecutionFilter,
        ) -> Result<Vec<ExecutionRecord>, StorageError> {
            self.0.list_executions(filter).await
        }
    }

    #[tokio::test]
    async fn unrecorded_success_alerts_and_settles_sources() {
        let config = Arc::new(PipelineConfig::from_toml_str(CONFIG).unwrap());
        let reader = Arc::new(InMemoryReader::new());
        let alerts = Arc::new(RecordingAlertSink::new());
        let tracker = ExecutionTracker::new(
            Arc::new(OfflineFinishLedger(InMemoryAuditLedger::new())),
            alerts.clone(),
        );
        let transition = LayerTransition::new(
            config,
            reader.clone(),
            Arc::new(InMemoryTableStore::new()),
            tracker,
        );
        reader
            .push(
                "doctors",
                batch("doctors/001.json", json!([{"doctor_id": "D-1", "year": 1987}])),
            )
            .unwrap();

        let err = transition.run_group("doctors", "Scheduler").await.unwrap_err();
        assert!(matches!(err, PipelineError::AuditWriteFailure { .. }));

        let sent = alerts.failures();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].pipeline_name, "doctors_pipeline");
        assert!(sent[0].error_message.contains("ledger offline"));
        assert_eq!(reader.processed(), vec!["doctors/001.json".to_string()]);
        assert!(reader.failed().is_empty());

        let state = transition
            .store()
            .read_current_state(&transition.config().groups["doctors"].table_ref())
            .await
            .unwrap();
        assert!(state.contains_key(&RowKey::single("D-1")));
    }
}
