//! Conformance test suite for `TableStore` and `AuditLedger` implementations.
//!
//! Backend-agnostic checks any backend can run to verify correctness:
//!
//! - **Snapshot isolation**: staged rows invisible until commit, discarded on abort
//! - **Atomic commit**: all-or-nothing versions, history and point-in-time reads
//! - **Single writer**: a second open snapshot on the same table is rejected
//! - **Ledger**: insert-once, conditional terminal writes, filtered queries
//!
//! # Usage
//!
//! ```ignore
//! use medallion_storage::conformance::run_table_store_suite;
//!
//! #[tokio::test]
//! async fn my_backend_conformance() {
//!     let report = run_table_store_suite(|| async { MyStore::connect().await }).await;
//!     assert!(report.failed == 0, "{report}");
//! }
//! ```

mod commit;
mod concurrent;
mod ledger;
mod snapshot;

use std::fmt;
use std::future::Future;

use crate::record::{ExecutionRecord, ExecutionStatus, Namespace, TableRef, Zone};
use crate::{AuditLedger, TableStore};

/// Result of a single conformance test.
#[derive(Debug, Clone)]
pub struct TestResult {
    /// Test category (e.g. "snapshot", "commit", "ledger").
    pub category: String,
    /// Test name (e.g. "abort_discards_staged_rows").
    pub name: String,
    /// Whether the test passed.
    pub passed: bool,
    /// Error message if the test failed.
    pub message: Option<String>,
}

impl TestResult {
    fn pass(category: &str, name: &str) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: true,
            message: None,
        }
    }

    fn fail(category: &str, name: &str, msg: String) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: false,
            message: Some(msg),
        }
    }

    fn from_result(category: &str, name: &str, result: Result<(), String>) -> Self {
        match result {
            Ok(()) => Self::pass(category, name),
            Err(msg) => Self::fail(category, name, msg),
        }
    }
}

/// Aggregated report from a full conformance suite run.
#[derive(Debug, Clone)]
pub struct ConformanceReport {
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
}

impl ConformanceReport {
    fn from_results(results: Vec<TestResult>) -> Self {
        let passed = results.iter().filter(|r| r.passed).count();
        let total = results.len();
        ConformanceReport {
            results,
            passed,
            failed: total - passed,
            total,
        }
    }
}

impl fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Conformance: {}/{} passed ({} failed)",
            self.passed, self.total, self.failed
        )?;
        for r in &self.results {
            if !r.passed {
                writeln!(
                    f,
                    "  FAIL [{}/{}]: {}",
                    r.category,
                    r.name,
                    r.message.as_deref().unwrap_or("(no message)")
                )?;
            }
        }
        Ok(())
    }
}

/// Run the table store suite. `factory` is called once per test and must
/// return a fresh, empty store.
pub async fn run_table_store_suite<S, F, Fut>(factory: F) -> ConformanceReport
where
    S: TableStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.extend(snapshot::run_snapshot_tests(&factory).await);
    results.extend(commit::run_commit_tests(&factory).await);
    results.extend(concurrent::run_concurrent_tests(&factory).await);

    ConformanceReport::from_results(results)
}

/// Run the audit ledger suite. `factory` is called once per test and must
/// return a fresh, empty ledger.
pub async fn run_audit_ledger_suite<L, F, Fut>(factory: F) -> ConformanceReport
where
    L: AuditLedger,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    ConformanceReport::from_results(ledger::run_ledger_tests(&factory).await)
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn silver(table: &str) -> TableRef {
    TableRef::new(Namespace::new("silver", Zone::Pseudonymized), table)
}

fn columns(pairs: &[(&str, serde_json::Value)]) -> serde_json::Map<String, serde_json::Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn make_running(execution_id: &str, pipeline_name: &str, run_date: &str) -> ExecutionRecord {
    ExecutionRecord {
        execution_id: execution_id.to_string(),
        pipeline_name: pipeline_name.to_string(),
        start_time: format!("{run_date}T06:00:00Z"),
        end_time: None,
        status: ExecutionStatus::Running,
        records_processed: 0,
        error_message: None,
        run_date: run_date.to_string(),
        executed_by: "Scheduler".to_string(),
    }
}
