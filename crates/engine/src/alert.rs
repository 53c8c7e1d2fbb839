//! Alerting sink abstraction and the shipped sinks.
//!
//! The tracker pushes one [`FailureAlert`] per failed execution, stale
//! RUNNING executions as they are detected, and a [`DailySummary`] on
//! request. Delivery (mail, chat) is the sink's concern.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureAlert {
    pub pipeline_name: String,
    pub execution_id: String,
    pub error_message: String,
    /// RFC 3339 timestamp of the failure.
    pub timestamp: String,
}

/// A RUNNING execution older than the configured timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaleExecution {
    pub execution_id: String,
    pub pipeline_name: String,
    pub start_time: String,
    pub running_secs: i64,
}

/// Execution counts of one pipeline on one day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub running: usize,
    pub success: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.running + self.success + self.failed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DailySummary {
    /// `YYYY-MM-DD`.
    pub run_date: String,
    pub pipelines: BTreeMap<String, StatusCounts>,
}

impl DailySummary {
    pub fn totals(&self) -> StatusCounts {
        self.pipelines
            .values()
            .fold(StatusCounts::default(), |acc, c| StatusCounts {
                running: acc.running + c.running,
                success: acc.success + c.success,
                failed: acc.failed + c.failed,
            })
    }
}

#[derive(Debug, Error)]
#[error("alert delivery failed: {0}")]
pub struct AlertError(pub String);

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send_failure(&self, alert: &FailureAlert) -> Result<(), AlertError>;

    async fn send_stale(&self, stale: &StaleExecution) -> Result<(), AlertError>;

    async fn send_daily_summary(&self, summary: &DailySummary) -> Result<(), AlertError>;
}

// ──────────────────────────────────────────────
// LogAlertSink
// ──────────────────────────────────────────────

/// Emits every alert as a structured log event.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send_failure(&self, alert: &FailureAlert) -> Result<(), AlertError> {
        error!(
            pipeline = %alert.pipeline_name,
            execution_id = %alert.execution_id,
            timestamp = %alert.timestamp,
            error = %alert.error_message,
            "pipeline execution failed"
        );
        Ok(())
    }

    async fn send_stale(&self, stale: &StaleExecution) -> Result<(), AlertError> {
        error!(
            pipeline = %stale.pipeline_name,
            execution_id = %stale.execution_id,
            start_time = %stale.start_time,
            running_secs = stale.running_secs,
            "execution still RUNNING past timeout"
        );
        Ok(())
    }

    async fn send_daily_summary(&self, summary: &DailySummary) -> Result<(), AlertError> {
        for (pipeline, counts) in &summary.pipelines {
            info!(
                run_date = %summary.run_date,
                pipeline = %pipeline,
                running = counts.running,
                success = counts.success,
                failed = counts.failed,
                "daily execution summary"
            );
        }
        Ok(())
    }
}

// ──────────────────────────────────────────────
// RecordingAlertSink
// ──────────────────────────────────────────────

/// Keeps every alert in memory for inspection.
#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    failures: Mutex<Vec<FailureAlert>>,
    stale: Mutex<Vec<StaleExecution>>,
    summaries: Mutex<Vec<DailySummary>>,
}

fn push<T>(slot: &Mutex<Vec<T>>, item: T) -> Result<(), AlertError> {
    slot.lock()
        .map_err(|e| AlertError(format!("lock poisoned: {}", e)))?
        .push(item);
    Ok(())
}

fn snapshot<T: Clone>(slot: &Mutex<Vec<T>>) -> Vec<T> {
    slot.lock().map(|v| v.clone()).unwrap_or_default()
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures(&self) -> Vec<FailureAlert> {
        snapshot(&self.failures)
    }

    pub fn stale(&self) -> Vec<StaleExecution> {
        snapshot(&self.stale)
    }

    pub fn summaries(&self) -> Vec<DailySummary> {
        snapshot(&self.summaries)
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn send_failure(&self, alert: &FailureAlert) -> Result<(), AlertError> {
        push(&self.failures, alert.clone())
    }

    async fn send_stale(&self, stale: &StaleExecution) -> Result<(), AlertError> {
        push(&self.stale, stale.clone())
    }

    async fn send_daily_summary(&self, summary: &DailySummary) -> Result<(), AlertError> {
        push(&self.summaries, summary.clone())
    }
}
