//! Medallion layer-transition engine.
//!
//! Reads newly landed records for a table group, validates and cleans them,
//! deduplicates them by natural key and merges them idempotently into a
//! versioned table, while an execution tracker records every run's
//! lifecycle in the audit ledger and drives failure alerting.
//!
//! Data flows strictly validator → deduplicator → merge engine; the tracker
//! observes the start and end of each transition. Storage lives behind the
//! `medallion-storage` traits.

pub mod alert;
pub mod config;
pub mod dedupe;
pub mod error;
pub mod merge;
pub mod observability;
pub mod orchestrator;
pub mod pseudonymize;
pub mod record;
pub mod rules;
pub mod source;
pub mod tracker;
pub mod validate;
pub mod value;

pub use alert::{
    AlertError, AlertSink, DailySummary, FailureAlert, LogAlertSink, RecordingAlertSink,
    StaleExecution, StatusCounts,
};
pub use config::{GroupConfig, GroupKind, PipelineConfig};
pub use dedupe::{dedupe, Deduplicated};
pub use error::{PipelineError, RecordError};
pub use merge::{ForeignKey, MergeEngine, MergeOutcome, MergeResult, MergeTarget, StagedMerge};
pub use orchestrator::{GroupOutcome, LayerTransition, TransitionReport};
pub use record::{Batch, NaturalKey, RawRecord, Record};
pub use rules::{Check, ColumnSpec, Rule, RuleSet, Severity};
pub use source::{DirectoryReader, InMemoryReader, InputReader};
pub use tracker::ExecutionTracker;
pub use validate::{validate, Rejection, RuleWarning, Validation};
pub use value::{ColumnType, Value};
