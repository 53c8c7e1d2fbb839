use std::future::Future;

use serde_json::json;

use super::{columns, silver, TestResult};
use crate::record::RowKey;
use crate::{StorageError, TableStore};

pub(super) async fn run_commit_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: TableStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "commit",
            "multi_row_commit_is_one_version",
            multi_row_commit_is_one_version(factory).await,
        ),
        TestResult::from_result(
            "commit",
            "upsert_replaces_existing_row",
            upsert_replaces_existing_row(factory).await,
        ),
        TestResult::from_result(
            "commit",
            "empty_commit_creates_no_version",
            empty_commit_creates_no_version(factory).await,
        ),
        TestResult::from_result(
            "commit",
            "commit_records_execution_on_rows",
            commit_records_execution_on_rows(factory).await,
        ),
        TestResult::from_result(
            "commit",
            "point_in_time_read_returns_old_version",
            point_in_time_read_returns_old_version(factory).await,
        ),
        TestResult::from_result(
            "commit",
            "read_unknown_version_fails",
            read_unknown_version_fails(factory).await,
        ),
    ]
}

async fn commit_one<S: TableStore>(
    s: &S,
    table: &crate::TableRef,
    execution_id: &str,
    rows: &[(&str, &str)],
) -> Result<crate::CommitInfo, String> {
    let mut snap = s
        .begin_snapshot(table, execution_id)
        .await
        .map_err(|e| format!("begin: {e}"))?;
    for (key, name) in rows {
        s.upsert_row(&mut snap, RowKey::single(*key), columns(&[("name", json!(name))]))
            .await
            .map_err(|e| format!("upsert {key}: {e}"))?;
    }
    s.commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))
}

async fn multi_row_commit_is_one_version<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TableStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let table = silver("dim_doctor");
    let info = commit_one(&s, &table, "exec-1", &[("D-1", "Ana"), ("D-2", "Bo"), ("D-3", "Cy")])
        .await?;
    if info.version != 1 || info.rows_written != 3 {
        return Err(format!(
            "expected version 1 with 3 rows written, got version {} with {}",
            info.version, info.rows_written
        ));
    }
    let state = s
        .read_current_state(&table)
        .await
        .map_err(|e| format!("read: {e}"))?;
    if state.len() != 3 {
        return Err(format!("expected 3 rows, got {}", state.len()));
    }
    Ok(())
}

async fn upsert_replaces_existing_row<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TableStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let table = silver("dim_doctor");
    commit_one(&s, &table, "exec-1", &[("D-1", "Ana"), ("D-2", "Bo")]).await?;
    let info = commit_one(&s, &table, "exec-2", &[("D-1", "Ana Maria")]).await?;
    if info.version != 2 {
        return Err(format!("expected version 2, got {}", info.version));
    }
    let state = s
        .read_current_state(&table)
        .await
        .map_err(|e| format!("read: {e}"))?;
    if state.len() != 2 {
        return Err(format!("expected 2 rows after upsert, got {}", state.len()));
    }
    let name = state
        .get(&RowKey::single("D-1"))
        .and_then(|r| r.columns.get("name"))
        .cloned();
    if name != Some(json!("Ana Maria")) {
        return Err(format!("expected replaced name, got {:?}", name));
    }
    Ok(())
}

async fn empty_commit_creates_no_version<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TableStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let table = silver("dim_doctor");
    commit_one(&s, &table, "exec-1", &[("D-1", "Ana")]).await?;
    let info = commit_one(&s, &table, "exec-2", &[]).await?;
    if info.version != 1 || info.rows_written != 0 {
        return Err(format!(
            "empty commit reported version {} with {} rows",
            info.version, info.rows_written
        ));
    }
    let history = s.history(&table).await.map_err(|e| format!("history: {e}"))?;
    if history.len() != 1 {
        return Err(format!("expected 1 history entry, got {}", history.len()));
    }
    Ok(())
}

async fn commit_records_execution_on_rows<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TableStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let table = silver("dim_doctor");
    commit_one(&s, &table, "exec-1", &[("D-1", "Ana"), ("D-2", "Bo")]).await?;
    commit_one(&s, &table, "exec-2", &[("D-2", "Bob")]).await?;
    let state = s
        .read_current_state(&table)
        .await
        .map_err(|e| format!("read: {e}"))?;
    let writer = |key: &str| {
        state
            .get(&RowKey::single(key))
            .map(|r| r.last_execution_id.clone())
    };
    if writer("D-1").as_deref() != Some("exec-1") || writer("D-2").as_deref() != Some("exec-2") {
        return Err(format!(
            "unexpected row writers: D-1={:?} D-2={:?}",
            writer("D-1"),
            writer("D-2")
        ));
    }
    let history = s.history(&table).await.map_err(|e| format!("history: {e}"))?;
    let ids: Vec<&str> = history.iter().map(|h| h.execution_id.as_str()).collect();
    if ids != ["exec-1", "exec-2"] {
        return Err(format!("unexpected history: {:?}", ids));
    }
    Ok(())
}

async fn point_in_time_read_returns_old_version<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TableStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let table = silver("dim_doctor");
    commit_one(&s, &table, "exec-1", &[("D-1", "Ana")]).await?;
    commit_one(&s, &table, "exec-2", &[("D-2", "Bo")]).await?;

    let v1 = s
        .read_state_at(&table, 1)
        .await
        .map_err(|e| format!("read v1: {e}"))?;
    if v1.len() != 1 || v1.contains_key(&RowKey::single("D-2")) {
        return Err(format!("version 1 should hold only D-1, has {} rows", v1.len()));
    }
    let v0 = s
        .read_state_at(&table, 0)
        .await
        .map_err(|e| format!("read v0: {e}"))?;
    if !v0.is_empty() {
        return Err("version 0 should be empty".to_string());
    }
    Ok(())
}

async fn read_unknown_version_fails<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TableStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let table = silver("dim_doctor");
    commit_one(&s, &table, "exec-1", &[("D-1", "Ana")]).await?;
    match s.read_state_at(&table, 7).await {
        Err(StorageError::VersionNotFound { version: 7, .. }) => Ok(()),
        Err(e) => Err(format!("expected VersionNotFound, got {e}")),
        Ok(_) => Err("expected VersionNotFound, got a state".to_string()),
    }
}
