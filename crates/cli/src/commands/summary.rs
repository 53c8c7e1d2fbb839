use std::path::Path;

use medallion_engine::value::parse_date;
use time::OffsetDateTime;

use crate::state::open_tracker;
use crate::{fail, print_json, runtime, OutputFormat};

/// Per-pipeline status counts for one run date, also sent to the alert sink.
pub(crate) fn cmd_summary(state: &Path, date: Option<&str>, output: OutputFormat, quiet: bool) {
    let run_date = match date {
        Some(s) => match parse_date(s) {
            Some(d) => d,
            None => fail(
                &format!("invalid --date '{}', expected YYYY-MM-DD", s),
                output,
                quiet,
            ),
        },
        None => OffsetDateTime::now_utc().date(),
    };

    let tracker = open_tracker(state, output, quiet);
    let rt = runtime(output, quiet);
    let summary = match rt.block_on(tracker.send_daily_summary(run_date)) {
        Ok(summary) => summary,
        Err(e) => fail(&e.to_string(), output, quiet),
    };

    match output {
        OutputFormat::Json => print_json(&summary, output, quiet),
        OutputFormat::Text => {
            if quiet {
                return;
            }
            println!("run date {}", summary.run_date);
            for (pipeline, counts) in &summary.pipelines {
                println!(
                    "  {}: success={} failed={} running={}",
                    pipeline, counts.success, counts.failed, counts.running
                );
            }
            let totals = summary.totals();
            println!(
                "  total: success={} failed={} running={}",
                totals.success, totals.failed, totals.running
            );
        }
    }
}
