use std::future::Future;

use super::{make_running, TestResult};
use crate::record::{ExecutionFilter, ExecutionOutcome, ExecutionStatus};
use crate::{AuditLedger, StorageError};

pub(super) async fn run_ledger_tests<L, F, Fut>(factory: &F) -> Vec<TestResult>
where
    L: AuditLedger,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    vec![
        TestResult::from_result(
            "ledger",
            "insert_then_get_round_trips",
            insert_then_get_round_trips(factory).await,
        ),
        TestResult::from_result(
            "ledger",
            "duplicate_execution_id_rejected",
            duplicate_execution_id_rejected(factory).await,
        ),
        TestResult::from_result(
            "ledger",
            "finish_sets_terminal_fields",
            finish_sets_terminal_fields(factory).await,
        ),
        TestResult::from_result(
            "ledger",
            "second_finish_conflicts",
            second_finish_conflicts(factory).await,
        ),
        TestResult::from_result(
            "ledger",
            "finish_unknown_execution_not_found",
            finish_unknown_execution_not_found(factory).await,
        ),
        TestResult::from_result(
            "ledger",
            "list_filters_by_pipeline_date_and_status",
            list_filters_by_pipeline_date_and_status(factory).await,
        ),
    ]
}

async fn insert_then_get_round_trips<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: AuditLedger,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let ledger = factory().await;
    let record = make_running("exec-1", "doctors_pipeline", "2026-03-01");
    ledger
        .insert_execution(record.clone())
        .await
        .map_err(|e| format!("insert: {e}"))?;
    let read = ledger
        .get_execution("exec-1")
        .await
        .map_err(|e| format!("get: {e}"))?;
    if read != record {
        return Err(format!("round trip mismatch: {:?} != {:?}", read, record));
    }
    Ok(())
}

async fn duplicate_execution_id_rejected<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: AuditLedger,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let ledger = factory().await;
    ledger
        .insert_execution(make_running("exec-1", "doctors_pipeline", "2026-03-01"))
        .await
        .map_err(|e| format!("insert: {e}"))?;
    match ledger
        .insert_execution(make_running("exec-1", "facts_pipeline", "2026-03-02"))
        .await
    {
        Err(StorageError::AlreadyExists { execution_id }) if execution_id == "exec-1" => Ok(()),
        Err(e) => Err(format!("expected AlreadyExists, got {e}")),
        Ok(()) => Err("duplicate execution id accepted".to_string()),
    }
}

async fn finish_sets_terminal_fields<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: AuditLedger,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let ledger = factory().await;
    ledger
        .insert_execution(make_running("exec-ok", "facts_pipeline", "2026-03-01"))
        .await
        .map_err(|e| format!("insert ok: {e}"))?;
    ledger
        .insert_execution(make_running("exec-bad", "facts_pipeline", "2026-03-01"))
        .await
        .map_err(|e| format!("insert bad: {e}"))?;

    let ok = ledger
        .finish_execution(
            "exec-ok",
            ExecutionOutcome::Success {
                records_processed: 120,
            },
            "2026-03-01T06:05:00Z",
        )
        .await
        .map_err(|e| format!("finish ok: {e}"))?;
    if ok.status != ExecutionStatus::Success
        || ok.records_processed != 120
        || ok.end_time.as_deref() != Some("2026-03-01T06:05:00Z")
        || ok.error_message.is_some()
    {
        return Err(format!("unexpected success record: {:?}", ok));
    }

    let bad = ledger
        .finish_execution(
            "exec-bad",
            ExecutionOutcome::Failed {
                error_message: "boom".to_string(),
            },
            "2026-03-01T06:06:00Z",
        )
        .await
        .map_err(|e| format!("finish bad: {e}"))?;
    if bad.status != ExecutionStatus::Failed
        || bad.error_message.as_deref() != Some("boom")
        || bad.end_time.is_none()
    {
        return Err(format!("unexpected failure record: {:?}", bad));
    }
    Ok(())
}

async fn second_finish_conflicts<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: AuditLedger,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let ledger = factory().await;
    ledger
        .insert_execution(make_running("exec-1", "facts_pipeline", "2026-03-01"))
        .await
        .map_err(|e| format!("insert: {e}"))?;
    ledger
        .finish_execution(
            "exec-1",
            ExecutionOutcome::Success {
                records_processed: 1,
            },
            "2026-03-01T06:05:00Z",
        )
        .await
        .map_err(|e| format!("first finish: {e}"))?;

    let second = ledger
        .finish_execution(
            "exec-1",
            ExecutionOutcome::Failed {
                error_message: "late".to_string(),
            },
            "2026-03-01T06:09:00Z",
        )
        .await;
    match second {
        Err(StorageError::StatusConflict {
            found: ExecutionStatus::Success,
            ..
        }) => {}
        Err(e) => return Err(format!("expected StatusConflict, got {e}")),
        Ok(r) => return Err(format!("second finish accepted: {:?}", r)),
    }

    let stored = ledger
        .get_execution("exec-1")
        .await
        .map_err(|e| format!("get: {e}"))?;
    if stored.status != ExecutionStatus::Success || stored.error_message.is_some() {
        return Err(format!("terminal record was modified: {:?}", stored));
    }
    Ok(())
}

async fn finish_unknown_execution_not_found<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: AuditLedger,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let ledger = factory().await;
    match ledger
        .finish_execution(
            "missing",
            ExecutionOutcome::Success {
                records_processed: 0,
            },
            "2026-03-01T06:05:00Z",
        )
        .await
    {
        Err(StorageError::ExecutionNotFound { execution_id }) if execution_id == "missing" => {
            Ok(())
        }
        Err(e) => Err(format!("expected ExecutionNotFound, got {e}")),
        Ok(_) => Err("finished an execution that was never inserted".to_string()),
    }
}

async fn list_filters_by_pipeline_date_and_status<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: AuditLedger,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let ledger = factory().await;
    for (id, pipeline, date) in [
        ("e1", "doctors_pipeline", "2026-03-01"),
        ("e2", "facts_pipeline", "2026-03-01"),
        ("e3", "facts_pipeline", "2026-03-02"),
    ] {
        ledger
            .insert_execution(make_running(id, pipeline, date))
            .await
            .map_err(|e| format!("insert {id}: {e}"))?;
    }
    ledger
        .finish_execution(
            "e2",
            ExecutionOutcome::Failed {
                error_message: "x".to_string(),
            },
            "2026-03-01T07:00:00Z",
        )
        .await
        .map_err(|e| format!("finish e2: {e}"))?;

    let ids = |records: Vec<crate::ExecutionRecord>| -> Vec<String> {
        records.into_iter().map(|r| r.execution_id).collect()
    };

    let facts = ledger
        .list_executions(&ExecutionFilter {
            pipeline_name: Some("facts_pipeline".to_string()),
            ..ExecutionFilter::default()
        })
        .await
        .map_err(|e| format!("list: {e}"))?;
    if ids(facts.clone()) != ["e2", "e3"] {
        return Err(format!("pipeline filter returned {:?}", ids(facts)));
    }

    let day_one = ledger
        .list_executions(&ExecutionFilter {
            run_date: Some("2026-03-01".to_string()),
            ..ExecutionFilter::default()
        })
        .await
        .map_err(|e| format!("list: {e}"))?;
    if day_one.len() != 2 {
        return Err(format!("run_date filter returned {}", day_one.len()));
    }

    let failed = ledger
        .list_executions(&ExecutionFilter {
            status: Some(ExecutionStatus::Failed),
            ..ExecutionFilter::default()
        })
        .await
        .map_err(|e| format!("list: {e}"))?;
    if ids(failed.clone()) != ["e2"] {
        return Err(format!("status filter returned {:?}", ids(failed)));
    }

    let limited = ledger
        .list_executions(&ExecutionFilter {
            limit: 1,
            ..ExecutionFilter::default()
        })
        .await
        .map_err(|e| format!("list: {e}"))?;
    if limited.len() != 1 {
        return Err(format!("limit 1 returned {}", limited.len()));
    }
    Ok(())
}
