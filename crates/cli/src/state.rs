//! File-backed state directory shared by the commands.

use std::path::Path;
use std::sync::Arc;

use medallion_engine::{ExecutionTracker, LogAlertSink, PipelineConfig};
use medallion_storage::{InMemoryAuditLedger, InMemoryTableStore};

use crate::{fail, OutputFormat};

pub(crate) const TABLES_FILE: &str = "tables.json";
pub(crate) const EXECUTIONS_FILE: &str = "executions.json";

pub(crate) fn load_config(path: &Path, output: OutputFormat, quiet: bool) -> PipelineConfig {
    match PipelineConfig::load(path) {
        Ok(config) => config,
        Err(e) => fail(&e.to_string(), output, quiet),
    }
}

pub(crate) fn open_tables(dir: &Path, output: OutputFormat, quiet: bool) -> Arc<InMemoryTableStore> {
    ensure_dir(dir, output, quiet);
    match InMemoryTableStore::open(dir.join(TABLES_FILE)) {
        Ok(store) => Arc::new(store),
        Err(e) => fail(&e.to_string(), output, quiet),
    }
}

pub(crate) fn open_ledger(dir: &Path, output: OutputFormat, quiet: bool) -> Arc<InMemoryAuditLedger> {
    ensure_dir(dir, output, quiet);
    match InMemoryAuditLedger::open(dir.join(EXECUTIONS_FILE)) {
        Ok(ledger) => Arc::new(ledger),
        Err(e) => fail(&e.to_string(), output, quiet),
    }
}

/// Tracker over the ledger in `dir`, alerting through the log.
pub(crate) fn open_tracker(dir: &Path, output: OutputFormat, quiet: bool) -> ExecutionTracker {
    ExecutionTracker::new(open_ledger(dir, output, quiet), Arc::new(LogAlertSink))
}

fn ensure_dir(dir: &Path, output: OutputFormat, quiet: bool) {
    if let Err(e) = std::fs::create_dir_all(dir) {
        fail(
            &format!("cannot create state directory {}: {}", dir.display(), e),
            output,
            quiet,
        );
    }
}
