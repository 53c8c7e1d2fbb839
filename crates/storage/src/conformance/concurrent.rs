use std::future::Future;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::Barrier;

use super::{columns, silver, TestResult};
use crate::record::RowKey;
use crate::{StorageError, TableStore};

/// Number of concurrent tasks to spawn in each test.
const N: usize = 10;

pub(super) async fn run_concurrent_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: TableStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "concurrent",
            "second_writer_on_same_table_rejected",
            second_writer_on_same_table_rejected(factory).await,
        ),
        TestResult::from_result(
            "concurrent",
            "concurrent_merges_exactly_one_wins",
            concurrent_merges_exactly_one_wins(factory).await,
        ),
        TestResult::from_result(
            "concurrent",
            "concurrent_merges_different_tables_all_succeed",
            concurrent_merges_different_tables_all_succeed(factory).await,
        ),
        TestResult::from_result(
            "concurrent",
            "lease_released_after_commit",
            lease_released_after_commit(factory).await,
        ),
    ]
}

async fn second_writer_on_same_table_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TableStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let table = silver("fct_consultation");
    let first = s
        .begin_snapshot(&table, "exec-1")
        .await
        .map_err(|e| format!("begin first: {e}"))?;
    let second = s.begin_snapshot(&table, "exec-2").await;
    let outcome = match second {
        Err(StorageError::ConcurrentMerge { holder, .. }) if holder == "exec-1" => Ok(()),
        Err(e) => Err(format!("expected ConcurrentMerge held by exec-1, got {e}")),
        Ok(snap) => {
            let _ = s.abort_snapshot(snap).await;
            Err("second writer was admitted".to_string())
        }
    };
    s.abort_snapshot(first)
        .await
        .map_err(|e| format!("abort: {e}"))?;
    outcome
}

/// N tasks each try to open a snapshot on the same table, then meet at a
/// barrier before committing. The lease holder commits; every other task
/// must have been turned away with ConcurrentMerge.
async fn concurrent_merges_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TableStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    let barrier = Arc::new(Barrier::new(N));
    let table = silver("fct_consultation");

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        let barrier = barrier.clone();
        let table = table.clone();
        handles.push(tokio::spawn(async move {
            let begun = s.begin_snapshot(&table, &format!("exec-{i}")).await;
            barrier.wait().await;
            match begun {
                Ok(mut snap) => {
                    s.upsert_row(
                        &mut snap,
                        RowKey::single("C-1"),
                        columns(&[("writer", json!(i))]),
                    )
                    .await?;
                    s.commit_snapshot(snap).await?;
                    Ok(true)
                }
                Err(StorageError::ConcurrentMerge { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        }));
    }

    let mut winners = 0usize;
    let mut losers = 0usize;
    for handle in handles {
        let won = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e: StorageError| format!("storage error: {e}"))?;
        if won {
            winners += 1;
        } else {
            losers += 1;
        }
    }

    if winners != 1 {
        return Err(format!("expected exactly 1 winner, got {winners}"));
    }
    if losers != N - 1 {
        return Err(format!("expected {} losers, got {losers}", N - 1));
    }

    let state = storage
        .read_current_state(&table)
        .await
        .map_err(|e| format!("read: {e}"))?;
    if state.version != 1 {
        return Err(format!("expected version 1, got {}", state.version));
    }
    Ok(())
}

/// N tasks each merge into a different table. All should succeed.
async fn concurrent_merges_different_tables_all_succeed<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: TableStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    let barrier = Arc::new(Barrier::new(N));

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            let table = silver(&format!("table_{i}"));
            let mut snap = s.begin_snapshot(&table, &format!("exec-{i}")).await?;
            barrier.wait().await;
            s.upsert_row(&mut snap, RowKey::single("K"), columns(&[("i", json!(i))]))
                .await?;
            s.commit_snapshot(snap).await?;
            Ok::<(), StorageError>(())
        }));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        handle
            .await
            .map_err(|e| format!("task {i} panic: {e}"))?
            .map_err(|e| format!("task {i} failed: {e}"))?;
    }

    for i in 0..N {
        let state = storage
            .read_current_state(&silver(&format!("table_{i}")))
            .await
            .map_err(|e| format!("read table_{i}: {e}"))?;
        if state.version != 1 || state.len() != 1 {
            return Err(format!(
                "table_{i}: expected version 1 with 1 row, got version {} with {}",
                state.version,
                state.len()
            ));
        }
    }
    Ok(())
}

async fn lease_released_after_commit<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TableStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let table = silver("fct_consultation");
    for i in 0..3 {
        let mut snap = s
            .begin_snapshot(&table, &format!("exec-{i}"))
            .await
            .map_err(|e| format!("begin {i}: {e}"))?;
        s.upsert_row(&mut snap, RowKey::single(format!("C-{i}")), columns(&[]))
            .await
            .map_err(|e| format!("upsert {i}: {e}"))?;
        s.commit_snapshot(snap)
            .await
            .map_err(|e| format!("commit {i}: {e}"))?;
    }
    let history = s.history(&table).await.map_err(|e| format!("history: {e}"))?;
    if history.len() != 3 {
        return Err(format!("expected 3 versions, got {}", history.len()));
    }
    Ok(())
}
