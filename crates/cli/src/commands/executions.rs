use std::path::Path;

use medallion_engine::value::parse_date;
use medallion_storage::{ExecutionFilter, ExecutionStatus};

use crate::state::open_tracker;
use crate::{fail, print_json, runtime, OutputFormat};

/// List audit ledger rows, oldest start first.
pub(crate) fn cmd_executions(
    state: &Path,
    pipeline: Option<String>,
    status: Option<ExecutionStatus>,
    run_date: Option<String>,
    limit: usize,
    output: OutputFormat,
    quiet: bool,
) {
    if let Some(date) = &run_date {
        if parse_date(date).is_none() {
            fail(
                &format!("invalid --run-date '{}', expected YYYY-MM-DD", date),
                output,
                quiet,
            );
        }
    }
    let filter = ExecutionFilter {
        pipeline_name: pipeline,
        run_date,
        status,
        limit,
    };

    let tracker = open_tracker(state, output, quiet);
    let rt = runtime(output, quiet);
    let records = match rt.block_on(tracker.executions(&filter)) {
        Ok(records) => records,
        Err(e) => fail(&e.to_string(), output, quiet),
    };

    match output {
        OutputFormat::Json => print_json(&records, output, quiet),
        OutputFormat::Text => {
            if quiet {
                return;
            }
            if records.is_empty() {
                println!("no executions");
                return;
            }
            for r in &records {
                println!(
                    "{}  {}  {}  start={}  end={}  records={}{}",
                    r.execution_id,
                    r.pipeline_name,
                    r.status,
                    r.start_time,
                    r.end_time.as_deref().unwrap_or("-"),
                    r.records_processed,
                    r.error_message
                        .as_deref()
                        .map(|m| format!("  error={}", m))
                        .unwrap_or_default(),
                );
            }
        }
    }
}
