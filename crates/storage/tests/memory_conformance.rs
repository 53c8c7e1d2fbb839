use medallion_storage::conformance::{run_audit_ledger_suite, run_table_store_suite};
use medallion_storage::{InMemoryAuditLedger, InMemoryTableStore};

#[tokio::test]
async fn in_memory_table_store_conformance() {
    let report = run_table_store_suite(|| async { InMemoryTableStore::new() }).await;
    assert!(report.failed == 0, "{report}");
    assert!(report.total > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn in_memory_table_store_conformance_multi_thread() {
    let report = run_table_store_suite(|| async { InMemoryTableStore::new() }).await;
    assert!(report.failed == 0, "{report}");
}

#[tokio::test]
async fn in_memory_audit_ledger_conformance() {
    let report = run_audit_ledger_suite(|| async { InMemoryAuditLedger::new() }).await;
    assert!(report.failed == 0, "{report}");
}

#[tokio::test]
async fn file_backed_backends_conformance() {
    let dir = tempfile::tempdir().unwrap();
    let counter = std::sync::atomic::AtomicUsize::new(0);

    let tables = run_table_store_suite(|| {
        let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let path = dir.path().join(format!("tables-{n}.json"));
        async move { InMemoryTableStore::open(path).unwrap() }
    })
    .await;
    assert!(tables.failed == 0, "{tables}");

    let ledger = run_audit_ledger_suite(|| {
        let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let path = dir.path().join(format!("executions-{n}.json"));
        async move { InMemoryAuditLedger::open(path).unwrap() }
    })
    .await;
    assert!(ledger.failed == 0, "{ledger}");
}
