use std::path::Path;
use std::process;
use std::sync::Arc;

use medallion_engine::{DirectoryReader, GroupOutcome, LayerTransition};
use serde_json::json;

use crate::state::{load_config, open_tables, open_tracker};
use crate::{fail, print_json, runtime, OutputFormat};

/// Run one group (or every group in dependency order) over the landing
/// directory. Exits 1 when any group fails.
pub(crate) fn cmd_run(
    config_path: &Path,
    landing: &Path,
    state: &Path,
    group: Option<&str>,
    executed_by: Option<&str>,
    output: OutputFormat,
    quiet: bool,
) {
    let config = load_config(config_path, output, quiet);
    let executed_by = executed_by
        .map(str::to_string)
        .unwrap_or_else(|| config.executed_by.clone());
    let store = open_tables(state, output, quiet);
    let tracker = open_tracker(state, output, quiet);
    let transition = LayerTransition::new(
        Arc::new(config),
        Arc::new(DirectoryReader::new(landing)),
        store,
        tracker,
    );

    let rt = runtime(output, quiet);
    let outcomes = match group {
        Some(name) => {
            let result = rt.block_on(transition.run_group(name, &executed_by));
            vec![GroupOutcome {
                group: name.to_string(),
                result,
            }]
        }
        None => match rt.block_on(transition.run_all(&executed_by)) {
            Ok(outcomes) => outcomes,
            Err(e) => fail(&e.to_string(), output, quiet),
        },
    };

    let failed = outcomes.iter().filter(|o| !o.is_success()).count();
    match output {
        OutputFormat::Json => {
            let groups: Vec<_> = outcomes.iter().map(outcome_json).collect();
            print_json(&json!({ "groups": groups, "failed": failed }), output, quiet);
        }
        OutputFormat::Text => {
            if !quiet {
                for outcome in &outcomes {
                    println!("{}", outcome_line(outcome));
                }
            }
        }
    }

    if failed > 0 {
        process::exit(1);
    }
}

fn outcome_json(outcome: &GroupOutcome) -> serde_json::Value {
    match &outcome.result {
        Ok(report) => json!({
            "group": outcome.group,
            "status": "SUCCESS",
            "report": report,
        }),
        Err(e) => json!({
            "group": outcome.group,
            "status": "FAILED",
            "error": e.to_string(),
        }),
    }
}

fn outcome_line(outcome: &GroupOutcome) -> String {
    match &outcome.result {
        Ok(r) => format!(
            "{}: SUCCESS execution={} read={} accepted={} rejected={} duplicates={} \
             fk_rejected={} inserted={} updated={} unchanged={} version={}",
            outcome.group,
            r.execution_id,
            r.records_read,
            r.accepted,
            r.rejected,
            r.duplicates_dropped,
            r.fk_rejected,
            r.merge.inserted,
            r.merge.updated,
            r.merge.unchanged,
            r.table_version,
        ),
        Err(e) => format!("{}: FAILED {}", outcome.group, e),
    }
}
