use std::future::Future;

use serde_json::json;

use super::{columns, silver, TestResult};
use crate::record::RowKey;
use crate::TableStore;

pub(super) async fn run_snapshot_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: TableStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "snapshot",
            "unwritten_table_reads_empty_at_version_0",
            unwritten_table_reads_empty_at_version_0(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "staged_rows_invisible_before_commit",
            staged_rows_invisible_before_commit(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "abort_discards_staged_rows",
            abort_discards_staged_rows(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "snapshot_state_matches_committed_state",
            snapshot_state_matches_committed_state(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "tables_are_isolated",
            tables_are_isolated(factory).await,
        ),
    ]
}

async fn unwritten_table_reads_empty_at_version_0<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TableStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let state = s
        .read_current_state(&silver("dim_doctor"))
        .await
        .map_err(|e| format!("read: {e}"))?;
    if state.version != 0 || !state.is_empty() {
        return Err(format!(
            "expected empty version 0, got version {} with {} rows",
            state.version,
            state.len()
        ));
    }
    Ok(())
}

async fn staged_rows_invisible_before_commit<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TableStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let table = silver("dim_doctor");
    let mut snap = s
        .begin_snapshot(&table, "exec-1")
        .await
        .map_err(|e| format!("begin: {e}"))?;
    s.upsert_row(&mut snap, RowKey::single("D-1"), columns(&[("name", json!("Ana"))]))
        .await
        .map_err(|e| format!("upsert: {e}"))?;

    let before = s
        .read_current_state(&table)
        .await
        .map_err(|e| format!("read: {e}"))?;
    if !before.is_empty() {
        return Err("staged row visible before commit".to_string());
    }

    s.commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;
    let after = s
        .read_current_state(&table)
        .await
        .map_err(|e| format!("read: {e}"))?;
    if !after.contains_key(&RowKey::single("D-1")) {
        return Err("committed row not visible".to_string());
    }
    Ok(())
}

async fn abort_discards_staged_rows<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TableStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let table = silver("dim_doctor");
    let mut snap = s
        .begin_snapshot(&table, "exec-1")
        .await
        .map_err(|e| format!("begin: {e}"))?;
    for id in ["D-1", "D-2", "D-3"] {
        s.upsert_row(&mut snap, RowKey::single(id), columns(&[("name", json!(id))]))
            .await
            .map_err(|e| format!("upsert {id}: {e}"))?;
    }
    s.abort_snapshot(snap)
        .await
        .map_err(|e| format!("abort: {e}"))?;

    let state = s
        .read_current_state(&table)
        .await
        .map_err(|e| format!("read: {e}"))?;
    if state.version != 0 || !state.is_empty() {
        return Err(format!(
            "abort left version {} with {} rows",
            state.version,
            state.len()
        ));
    }
    let history = s.history(&table).await.map_err(|e| format!("history: {e}"))?;
    if !history.is_empty() {
        return Err(format!("abort produced {} history entries", history.len()));
    }
    Ok(())
}

async fn snapshot_state_matches_committed_state<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TableStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let table = silver("dim_doctor");
    let mut snap = s
        .begin_snapshot(&table, "exec-1")
        .await
        .map_err(|e| format!("begin: {e}"))?;
    s.upsert_row(&mut snap, RowKey::single("D-1"), columns(&[("name", json!("Ana"))]))
        .await
        .map_err(|e| format!("upsert: {e}"))?;
    s.commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let snap = s
        .begin_snapshot(&table, "exec-2")
        .await
        .map_err(|e| format!("begin second: {e}"))?;
    let seen = s
        .snapshot_state(&snap)
        .await
        .map_err(|e| format!("snapshot_state: {e}"))?;
    s.abort_snapshot(snap)
        .await
        .map_err(|e| format!("abort: {e}"))?;

    if seen.version != 1 || !seen.contains_key(&RowKey::single("D-1")) {
        return Err(format!(
            "snapshot saw version {} with {} rows, expected version 1 with D-1",
            seen.version,
            seen.len()
        ));
    }
    Ok(())
}

async fn tables_are_isolated<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TableStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let doctors = silver("dim_doctor");
    let clinics = silver("dim_clinic");
    let mut snap = s
        .begin_snapshot(&doctors, "exec-1")
        .await
        .map_err(|e| format!("begin: {e}"))?;
    s.upsert_row(&mut snap, RowKey::single("D-1"), columns(&[("name", json!("Ana"))]))
        .await
        .map_err(|e| format!("upsert: {e}"))?;
    s.commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let other = s
        .read_current_state(&clinics)
        .await
        .map_err(|e| format!("read: {e}"))?;
    if !other.is_empty() || other.version != 0 {
        return Err("commit to one table leaked into another".to_string());
    }
    Ok(())
}
