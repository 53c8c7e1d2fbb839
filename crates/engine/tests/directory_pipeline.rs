//! End-to-end transitions over landed files and file-backed state.

use std::path::Path;
use std::sync::Arc;

use medallion_engine::{
    DirectoryReader, ExecutionTracker, LayerTransition, PipelineConfig, PipelineError,
    RecordingAlertSink,
};
use medallion_storage::{
    AuditLedger, ExecutionFilter, ExecutionStatus, InMemoryAuditLedger, InMemoryTableStore,
    RowKey, TableStore,
};

const CONFIG: &str = r#"
pipeline_name = "clinic"
max_rejection_rate = 0.4
running_timeout_secs = 7200

[groups.doctors]
kind = "dimension"
namespace = { name = "silver", zone = "pseudonymized" }
table = "dim_doctor"
natural_key = ["doctor_id"]
columns = [
  { name = "doctor_id", type = "text", nullable = false },
  { name = "name", type = "text" },
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
  { name = "amount", type = "decimal" },
]
foreign_keys = [ { column = "doctor_id", references = "doctors" } ]
"#;

fn land(root: &Path, group: &str, file: &str, body: &str) {
    let dir = root.join(group);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(file), body).unwrap();
}

struct Stack {
    transition: LayerTransition<InMemoryTableStore>,
    ledger: Arc<InMemoryAuditLedger>,
}

fn open_stack(landing: &Path, state: &Path) -> Stack {
    let config = Arc::new(PipelineConfig::from_toml_str(CONFIG).unwrap());
    let store = Arc::new(InMemoryTableStore::open(state.join("tables.json")).unwrap());
    let ledger = Arc::new(InMemoryAuditLedger::open(state.join("executions.json")).unwrap());
    let tracker = ExecutionTracker::new(ledger.clone(), Arc::new(RecordingAlertSink::new()));
    let transition = LayerTransition::new(
        config,
        Arc::new(DirectoryReader::new(landing)),
        store,
        tracker,
    );
    Stack { transition, ledger }
}

#[tokio::test]
async fn full_run_promotes_dimensions_then_facts() {
    let landing = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    land(
        landing.path(),
        "doctors",
        "001.json",
        r#"[
            {"doctor_id": "D-1", "name": "Ana", "year": 1987},
            {"doctor_id": "D-2", "name": "Bruno", "year": 1850},
            {"doctor_id": "D-3", "name": "Carla", "year": "2001"}
        ]"#,
    );
    land(
        landing.path(),
        "visits",
        "001.json",
        r#"[
            {"visit_id": "V-1", "doctor_id": "D-1", "amount": "120.50"},
            {"visit_id": "V-2", "doctor_id": "D-3", "amount": 80},
            {"visit_id": "V-3", "doctor_id": "D-1", "amount": "15"},
            {"visit_id": "V-4", "doctor_id": "D-999", "amount": "10"}
        ]"#,
    );

    let stack = open_stack(landing.path(), state.path());
    let outcomes = stack.transition.run_all("Scheduler").await.unwrap();
    assert!(outcomes.iter().all(|o| o.is_success()), "{outcomes:#?}");

    let doctors = outcomes[0].result.as_ref().unwrap();
    assert_eq!((doctors.accepted, doctors.rejected), (2, 1));
    let visits = outcomes[1].result.as_ref().unwrap();
    assert_eq!(visits.fk_rejected, 1);
    assert_eq!(visits.merge.inserted, 3);

    assert!(landing
        .path()
        .join("doctors/_processed/001.json")
        .exists());
    assert!(landing.path().join("visits/_processed/001.json").exists());

    let visit_table = stack.transition.config().groups["visits"].table_ref();
    let facts = stack
        .transition
        .store()
        .read_current_state(&visit_table)
        .await
        .unwrap();
    let v1 = facts.get(&RowKey::single("V-1")).unwrap();
    assert_eq!(v1.columns["amount"], serde_json::json!("120.5"));
    assert!(!facts.contains_key(&RowKey::single("V-4")));

    let runs = stack
        .ledger
        .list_executions(&ExecutionFilter {
            status: Some(ExecutionStatus::Success),
            ..ExecutionFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(runs.len(), 2);
}

#[tokio::test]
async fn state_survives_reopen_and_redelivery_is_idempotent() {
    let landing = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let body = r#"[{"doctor_id": "D-1", "name": "Ana", "year": 1987,
                    "ingestion_timestamp": "2026-10-18T06:00:00Z"}]"#;
    land(landing.path(), "doctors", "001.json", body);
    {
        let stack = open_stack(landing.path(), state.path());
        let report = stack
            .transition
            .run_group("doctors", "Manual")
            .await
            .unwrap();
        assert_eq!(report.merge.inserted, 1);
    }

    land(landing.path(), "doctors", "001-redelivered.json", body);
    let stack = open_stack(landing.path(), state.path());
    let report = stack
        .transition
        .run_group("doctors", "Manual")
        .await
        .unwrap();
    assert_eq!(report.merge.unchanged, 1);
    assert_eq!(report.table_version, 1);

    let all = stack
        .ledger
        .list_executions(&ExecutionFilter::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.iter().all(|r| r.end_time.is_some()));
}

#[tokio::test]
async fn unreadable_landing_file_fails_execution_and_is_quarantined() {
    let landing = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    land(landing.path(), "doctors", "001.json", r#"[{"doctor_id": "D-1"}]"#);
    land(landing.path(), "doctors", "002.json", r#"{"not": "an array"}"#);

    let stack = open_stack(landing.path(), state.path());
    let err = stack
        .transition
        .run_group("doctors", "Scheduler")
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Input(_)));

    let failed = stack
        .ledger
        .list_executions(&ExecutionFilter {
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
        .contains("expected a JSON array"));
    assert!(landing.path().join("doctors/_failed/002.json").exists());
    assert!(landing.path().join("doctors/001.json").exists());

    let report = stack
        .transition
        .run_group("doctors", "Scheduler")
        .await
        .unwrap();
    assert_eq!(report.merge.inserted, 1);
    assert!(landing.path().join("doctors/_processed/001.json").exists());
    assert!(!landing.path().join("doctors/002.json").exists());
}

#[tokio::test]
async fn lease_held_elsewhere_fails_with_concurrent_merge() {
    let landing = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    land(
        landing.path(),
        "doctors",
        "001.json",
        r#"[{"doctor_id": "D-1"}]"#,
    );
    let stack = open_stack(landing.path(), state.path());
    let table = stack.transition.config().groups["doctors"].table_ref();
    let held = stack
        .transition
        .store()
        .begin_snapshot(&table, "someone-else")
        .await
        .unwrap();

    let err = stack
        .transition
        .run_group("doctors", "Scheduler")
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::ConcurrentMerge { .. }));
    assert!(landing.path().join("doctors/_failed/001.json").exists());
    stack.transition.store().abort_snapshot(held).await.unwrap();
}
