use std::path::Path;
use std::process;

use medallion_engine::pseudonymize::Tokenizer;
use medallion_engine::source::parse_batch_file;
use medallion_engine::validate;
use serde_json::json;

use crate::state::load_config;
use crate::{fail, print_json, OutputFormat};

/// Apply a group's rule set to a JSON array file without writing anything.
/// Exits 1 when the rejection rate exceeds the configured threshold.
pub(crate) fn cmd_validate(
    config_path: &Path,
    group: &str,
    input: &Path,
    output: OutputFormat,
    quiet: bool,
) {
    let config = load_config(config_path, output, quiet);
    let cfg = match config.group(group) {
        Ok(cfg) => cfg,
        Err(e) => fail(&e.to_string(), output, quiet),
    };

    let contents = match std::fs::read_to_string(input) {
        Ok(s) => s,
        Err(e) => fail(
            &format!("cannot read {}: {}", input.display(), e),
            output,
            quiet,
        ),
    };
    let mut records = match parse_batch_file(input, &contents) {
        Ok(records) => records,
        Err(e) => fail(&e.to_string(), output, quiet),
    };

    if let Some(spec) = &cfg.tokenize {
        let tokenizer = match Tokenizer::from_env(spec.clone()) {
            Ok(t) => t,
            Err(e) => fail(&e.to_string(), output, quiet),
        };
        for record in &mut records {
            tokenizer.apply(record);
        }
    }

    let ruleset = match config.ruleset_for(group) {
        Ok(ruleset) => ruleset,
        Err(e) => fail(&e.to_string(), output, quiet),
    };
    let validation = validate(&records, &ruleset);
    let total = validation.total();
    let rejected = validation.rejected.len();
    let over_threshold =
        total > 0 && rejected as f64 / total as f64 > config.max_rejection_rate;

    match output {
        OutputFormat::Json => {
            let rejections: Vec<_> = validation
                .rejected
                .iter()
                .map(|r| json!({ "record": r.record, "reasons": r.reason_strings() }))
                .collect();
            print_json(
                &json!({
                    "group": group,
                    "total": total,
                    "accepted": validation.accepted.len(),
                    "rejected": rejections,
                    "warnings": validation.warnings,
                    "over_threshold": over_threshold,
                }),
                output,
                quiet,
            );
        }
        OutputFormat::Text => {
            if !quiet {
                println!(
                    "{}: {} accepted, {} rejected of {}",
                    group,
                    validation.accepted.len(),
                    rejected,
                    total
                );
                for rejection in &validation.rejected {
                    println!(
                        "  rejected {}: {}",
                        serde_json::Value::Object(rejection.record.clone()),
                        rejection.reason_strings().join("; ")
                    );
                }
                for warning in &validation.warnings {
                    println!("  warning record {}: {}", warning.index, warning.rule);
                }
                if over_threshold {
                    println!(
                        "rejection rate exceeds max_rejection_rate {}",
                        config.max_rejection_rate
                    );
                }
            }
        }
    }

    if over_threshold {
        process::exit(1);
    }
}
