mod commands;
mod state;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use medallion_engine::observability::{init_logging, LogFormat};
use medallion_storage::ExecutionStatus;

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

/// Log line format (logs always go to stderr).
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormatArg {
    Pretty,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

/// Medallion layer-transition engine.
#[derive(Parser)]
#[command(name = "medallion", version, about = "Medallion layer-transition engine")]
struct Cli {
    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    output: OutputFormat,

    /// Suppress non-essential output
    #[arg(long, global = true)]
    quiet: bool,

    /// Log format (pretty or json)
    #[arg(long, global = true, default_value = "pretty", value_enum)]
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the transition of one group, or of every group
    Run {
        /// Path to the pipeline config TOML
        #[arg(long)]
        config: PathBuf,
        /// Landing directory holding <group>/*.json
        #[arg(long)]
        landing: PathBuf,
        /// State directory holding tables.json and executions.json
        #[arg(long)]
        state: PathBuf,
        /// Run only this group
        #[arg(long)]
        group: Option<String>,
        /// Executor label recorded on each execution (default from config)
        #[arg(long)]
        executed_by: Option<String>,
    },

    /// Dry-run the validator of a group over a JSON array file
    Validate {
        /// Path to the pipeline config TOML
        #[arg(long)]
        config: PathBuf,
        /// Group whose rule set to apply
        #[arg(long)]
        group: String,
        /// JSON file holding an array of records
        #[arg(long)]
        input: PathBuf,
    },

    /// List recorded executions
    Executions {
        /// State directory holding executions.json
        #[arg(long)]
        state: PathBuf,
        /// Only executions of this pipeline
        #[arg(long)]
        pipeline: Option<String>,
        /// Only executions with this status (RUNNING, SUCCESS, FAILED)
        #[arg(long)]
        status: Option<ExecutionStatus>,
        /// Only executions started on this date (YYYY-MM-DD)
        #[arg(long)]
        run_date: Option<String>,
        /// Maximum number of executions to list (0 = all)
        #[arg(long, default_value_t = 0)]
        limit: usize,
    },

    /// Daily execution counts by status per pipeline
    Summary {
        /// State directory holding executions.json
        #[arg(long)]
        state: PathBuf,
        /// Run date (YYYY-MM-DD), default today (UTC)
        #[arg(long)]
        date: Option<String>,
    },

    /// Report RUNNING executions older than the configured timeout
    Stale {
        /// Path to the pipeline config TOML
        #[arg(long)]
        config: PathBuf,
        /// State directory holding executions.json
        #[arg(long)]
        state: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format.into());

    match cli.command {
        Commands::Run {
            config,
            landing,
            state,
            group,
            executed_by,
        } => {
            commands::run::cmd_run(
                &config,
                &landing,
                &state,
                group.as_deref(),
                executed_by.as_deref(),
                cli.output,
                cli.quiet,
            );
        }
        Commands::Validate {
            config,
            group,
            input,
        } => {
            commands::validate::cmd_validate(&config, &group, &input, cli.output, cli.quiet);
        }
        Commands::Executions {
            state,
            pipeline,
            status,
            run_date,
            limit,
        } => {
            commands::executions::cmd_executions(
                &state,
                pipeline,
                status,
                run_date,
                limit,
                cli.output,
                cli.quiet,
            );
        }
        Commands::Summary { state, date } => {
            commands::summary::cmd_summary(&state, date.as_deref(), cli.output, cli.quiet);
        }
        Commands::Stale { config, state } => {
            commands::stale::cmd_stale(&config, &state, cli.output, cli.quiet);
        }
    }
}

/// Report an error in the selected output format.
pub(crate) fn report_error(msg: &str, output: OutputFormat, quiet: bool) {
    if quiet {
        return;
    }
    match output {
        OutputFormat::Text => eprintln!("error: {}", msg),
        OutputFormat::Json => {
            eprintln!("{}", serde_json::json!({ "error": msg }));
        }
    }
}

/// Report and exit with status 1.
pub(crate) fn fail(msg: &str, output: OutputFormat, quiet: bool) -> ! {
    report_error(msg, output, quiet);
    process::exit(1);
}

/// Current-thread runtime for one command.
pub(crate) fn runtime(output: OutputFormat, quiet: bool) -> tokio::runtime::Runtime {
    match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => fail(&format!("could not start async runtime: {}", e), output, quiet),
    }
}

/// Print a value as pretty JSON on stdout.
pub(crate) fn print_json<T: serde::Serialize>(value: &T, output: OutputFormat, quiet: bool) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{}", s),
        Err(e) => fail(&format!("could not serialize output: {}", e), output, quiet),
    }
}
