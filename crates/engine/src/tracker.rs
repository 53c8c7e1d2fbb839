//! Execution tracker: the RUNNING → SUCCESS | FAILED state machine over the
//! audit ledger.
//!
//! The tracker is the only writer of the ledger. Terminal writes are
//! compare-and-set on RUNNING at the ledger, so two racing terminal
//! transitions produce exactly one winner.

use std::collections::BTreeMap;
use std::sync::Arc;

use medallion_storage::{
    AuditLedger, ExecutionFilter, ExecutionOutcome, ExecutionRecord, ExecutionStatus,
    StorageError,
};
use time::{Date, Duration, OffsetDateTime};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::alert::{AlertSink, DailySummary, FailureAlert, StaleExecution, StatusCounts};
use crate::error::PipelineError;
use crate::value::{format_date, format_timestamp, parse_timestamp};

pub struct ExecutionTracker {
    ledger: Arc<dyn AuditLedger>,
    alerts: Arc<dyn AlertSink>,
    clock: fn() -> OffsetDateTime,
}

impl Clone for ExecutionTracker {
    fn clone(&self) -> Self {
        ExecutionTracker {
            ledger: Arc::clone(&self.ledger),
            alerts: Arc::clone(&self.alerts),
            clock: self.clock,
        }
    }
}

impl ExecutionTracker {
    pub fn new(ledger: Arc<dyn AuditLedger>, alerts: Arc<dyn AlertSink>) -> Self {
        ExecutionTracker {
            ledger,
            alerts,
            clock: OffsetDateTime::now_utc,
        }
    }

    /// Replace the wall clock used for start/end times.
    pub fn with_clock(mut self, clock: fn() -> OffsetDateTime) -> Self {
        self.clock = clock;
        self
    }

    /// Record a new RUNNING execution and return its id.
    pub async fn begin(
        &self,
        pipeline_name: &str,
        executed_by: &str,
    ) -> Result<String, PipelineError> {
        let now = (self.clock)();
        let execution_id = Uuid::new_v4().to_string();
        self.ledger
            .insert_execution(ExecutionRecord {
                execution_id: execution_id.clone(),
                pipeline_name: pipeline_name.to_string(),
                start_time: format_timestamp(now),
                end_time: None,
                status: ExecutionStatus::Running,
                records_processed: 0,
                error_message: None,
                run_date: format_date(now.date()),
                executed_by: executed_by.to_string(),
            })
            .await?;
        info!(
            execution_id = %execution_id,
            pipeline = %pipeline_name,
            executed_by = %executed_by,
            "execution started"
        );
        Ok(execution_id)
    }

    /// RUNNING → SUCCESS. When the ledger write fails the alert sink is
    /// notified, since the execution is left RUNNING.
    pub async fn complete(
        &self,
        execution_id: &str,
        records_processed: u64,
    ) -> Result<ExecutionRecord, PipelineError> {
        let now = (self.clock)();
        let outcome = ExecutionOutcome::Success { records_processed };
        let record = match self.finish(execution_id, outcome, now).await {
            Ok(record) => record,
            Err(PipelineError::AuditWriteFailure { audit, .. }) => {
                let pipeline = self.pipeline_of(execution_id).await;
                let message = format!(
                    "success with {} records processed not recorded: audit write failed: {}",
                    records_processed, audit
                );
                self.alert_failure(&pipeline, execution_id, &message, now).await;
                return Err(PipelineError::AuditWriteFailure {
                    execution_id: execution_id.to_string(),
                    original: None,
                    audit,
                });
            }
            Err(e) => return Err(e),
        };
        info!(
            execution_id = %execution_id,
            pipeline = %record.pipeline_name,
            records_processed,
            "execution succeeded"
        );
        Ok(record)
    }

    /// RUNNING → FAILED. The alert sink is notified whether or not the
    /// ledger write succeeds.
    pub async fn fail(
        &self,
        execution_id: &str,
        error_message: &str,
    ) -> Result<ExecutionRecord, PipelineError> {
        let now = (self.clock)();
        let outcome = ExecutionOutcome::Failed {
            error_message: error_message.to_string(),
        };
        match self.finish(execution_id, outcome, now).await {
            Ok(record) => {
                self.alert_failure(&record.pipeline_name, execution_id, error_message, now)
                    .await;
                Ok(record)
            }
            Err(PipelineError::AuditWriteFailure { audit, .. }) => {
                let pipeline = self.pipeline_of(execution_id).await;
                let message = format!("{}; audit write failed: {}", error_message, audit);
                self.alert_failure(&pipeline, execution_id, &message, now).await;
                Err(PipelineError::AuditWriteFailure {
                    execution_id: execution_id.to_string(),
                    original: Some(error_message.to_string()),
                    audit,
                })
            }
            Err(transition) => {
                let pipeline = self.pipeline_of(execution_id).await;
                let message = format!("{}; {}", error_message, transition);
                self.alert_failure(&pipeline, execution_id, &message, now).await;
                Err(transition)
            }
        }
    }

    async fn finish(
        &self,
        execution_id: &str,
        outcome: ExecutionOutcome,
        now: OffsetDateTime,
    ) -> Result<ExecutionRecord, PipelineError> {
        let end_time = format_timestamp(now);
        self.ledger
            .finish_execution(execution_id, outcome, &end_time)
            .await
            .map_err(|e| match e {
                StorageError::ExecutionNotFound { .. } => PipelineError::InvalidTransition {
                    execution_id: execution_id.to_string(),
                    expected: ExecutionStatus::Running,
                    found: None,
                },
                StorageError::StatusConflict { found, .. } => PipelineError::InvalidTransition {
                    execution_id: execution_id.to_string(),
                    expected: ExecutionStatus::Running,
                    found: Some(found),
                },
                other => PipelineError::AuditWriteFailure {
                    execution_id: execution_id.to_string(),
                    original: None,
                    audit: other.to_string(),
                },
            })
    }

    async fn pipeline_of(&self, execution_id: &str) -> String {
        match self.ledger.get_execution(execution_id).await {
            Ok(record) => record.pipeline_name,
            Err(_) => "unknown".to_string(),
        }
    }

    async fn alert_failure(
        &self,
        pipeline_name: &str,
        execution_id: &str,
        error_message: &str,
        at: OffsetDateTime,
    ) {
        let alert = FailureAlert {
            pipeline_name: pipeline_name.to_string(),
            execution_id: execution_id.to_string(),
            error_message: error_message.to_string(),
            timestamp: format_timestamp(at),
        };
        if let Err(e) = self.alerts.send_failure(&alert).await {
            error!(execution_id = %execution_id, error = %e, "failure alert not delivered");
        }
    }

    // ── Anomalies and reporting ──────────────────────────────────────────────

    /// RUNNING executions started more than `timeout` before `now`. They are
    /// reported, never resolved.
    pub async fn stale_executions(
        &self,
        timeout: Duration,
        now: OffsetDateTime,
    ) -> Result<Vec<StaleExecution>, PipelineError> {
        let running = self
            .ledger
            .list_executions(&ExecutionFilter {
                status: Some(ExecutionStatus::Running),
                ..ExecutionFilter::default()
            })
            .await?;
        let mut stale = Vec::new();
        for record in running {
            let Some(started) = parse_timestamp(&record.start_time) else {
                warn!(
                    execution_id = %record.execution_id,
                    start_time = %record.start_time,
                    "unparseable start_time on RUNNING execution"
                );
                continue;
            };
            let elapsed = now - started;
            if elapsed > timeout {
                stale.push(StaleExecution {
                    execution_id: record.execution_id,
                    pipeline_name: record.pipeline_name,
                    start_time: record.start_time,
                    running_secs: elapsed.whole_seconds(),
                });
            }
        }
        Ok(stale)
    }

    /// Find stale executions and push each to the alert sink.
    pub async fn report_stale(
        &self,
        timeout: Duration,
        now: OffsetDateTime,
    ) -> Result<Vec<StaleExecution>, PipelineError> {
        let stale = self.stale_executions(timeout, now).await?;
        for item in &stale {
            if let Err(e) = self.alerts.send_stale(item).await {
                error!(execution_id = %item.execution_id, error = %e, "stale alert not delivered");
            }
        }
        Ok(stale)
    }

    /// Execution counts by status per pipeline for one run date.
    pub async fn daily_summary(&self, run_date: Date) -> Result<DailySummary, PipelineError> {
        let run_date = format_date(run_date);
        let records = self
            .ledger
            .list_executions(&ExecutionFilter {
                run_date: Some(run_date.clone()),
                ..ExecutionFilter::default()
            })
            .await?;
        let mut pipelines: BTreeMap<String, StatusCounts> = BTreeMap::new();
        for record in records {
            let counts = pipelines.entry(record.pipeline_name).or_default();
            match record.status {
                ExecutionStatus::Running => counts.running += 1,
                ExecutionStatus::Success => counts.success += 1,
                ExecutionStatus::Failed => counts.failed += 1,
            }
        }
        Ok(DailySummary {
            run_date,
            pipelines,
        })
    }

    pub async fn send_daily_summary(&self, run_date: Date) -> Result<DailySummary, PipelineError> {
        let summary = self.daily_summary(run_date).await?;
        if let Err(e) = self.alerts.send_daily_summary(&summary).await {
            error!(run_date = %summary.run_date, error = %e, "daily summary not delivered");
        }
        Ok(summary)
    }

    pub async fn executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ExecutionRecord>, PipelineError> {
        Ok(self.ledger.list_executions(filter).await?)
    }

    pub async fn execution(&self, execution_id: &str) -> Result<ExecutionRecord, PipelineError> {
        Ok(self.ledger.get_execution(execution_id).await?)
    }
}
