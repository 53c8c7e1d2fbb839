use std::path::Path;
use std::process;

use serde_json::json;
use time::OffsetDateTime;

use crate::state::{load_config, open_tracker};
use crate::{fail, print_json, runtime, OutputFormat};

/// Report RUNNING executions past the configured timeout. Exits 1 when any
/// are found.
pub(crate) fn cmd_stale(config_path: &Path, state: &Path, output: OutputFormat, quiet: bool) {
    let config = load_config(config_path, output, quiet);
    let tracker = open_tracker(state, output, quiet);
    let rt = runtime(output, quiet);
    let stale = match rt.block_on(
        tracker.report_stale(config.running_timeout(), OffsetDateTime::now_utc()),
    ) {
        Ok(stale) => stale,
        Err(e) => fail(&e.to_string(), output, quiet),
    };

    match output {
        OutputFormat::Json => print_json(
            &json!({
                "timeout_secs": config.running_timeout_secs,
                "stale": stale,
            }),
            output,
            quiet,
        ),
        OutputFormat::Text => {
            if !quiet {
                if stale.is_empty() {
                    println!("no stale executions");
                }
                for s in &stale {
                    println!(
                        "{}  {}  started={}  running {}s",
                        s.execution_id, s.pipeline_name, s.start_time, s.running_secs
                    );
                }
            }
        }
    }

    if !stale.is_empty() {
        process::exit(1);
    }
}
