//! Input layer readers: where landed batches come from and where they go
//! once a transition settles.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::record::{Batch, RawRecord, INGESTION_DATE, INGESTION_TIMESTAMP};
use crate::value::{format_date, format_timestamp};

const PROCESSED_DIR: &str = "_processed";
const FAILED_DIR: &str = "_failed";

#[async_trait]
pub trait InputReader: Send + Sync {
    /// Every unsettled batch landed for `table_group`, oldest first. A source
    /// that cannot be read is listed as [`Batch::unreadable`] so it can still
    /// be settled.
    async fn list_batches(&self, table_group: &str) -> Result<Vec<Batch>, PipelineError>;

    async fn mark_processed(&self, source_ref: &str) -> Result<(), PipelineError>;

    async fn mark_failed(&self, source_ref: &str) -> Result<(), PipelineError>;
}

/// Stamp the audit columns on a landed record unless already present.
pub fn stamp_ingestion(record: &mut RawRecord, at: OffsetDateTime) {
    record
        .entry(INGESTION_TIMESTAMP)
        .or_insert_with(|| serde_json::Value::String(format_timestamp(at)));
    record
        .entry(INGESTION_DATE)
        .or_insert_with(|| serde_json::Value::String(format_date(at.date())));
}

// ──────────────────────────────────────────────
// InMemoryReader
// ──────────────────────────────────────────────

#[derive(Debug, Default)]
struct ReaderState {
    pending: BTreeMap<String, Vec<Batch>>,
    processed: Vec<String>,
    failed: Vec<String>,
}

/// Batches pushed by the caller; settled batches are no longer listed.
#[derive(Debug, Default)]
pub struct InMemoryReader {
    state: Mutex<ReaderState>,
}

impl InMemoryReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, table_group: &str, batch: Batch) -> Result<(), PipelineError> {
        self.lock()?
            .pending
            .entry(table_group.to_string())
            .or_default()
            .push(batch);
        Ok(())
    }

    pub fn processed(&self) -> Vec<String> {
        self.lock().map(|s| s.processed.clone()).unwrap_or_default()
    }

    pub fn failed(&self) -> Vec<String> {
        self.lock().map(|s| s.failed.clone()).unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ReaderState>, PipelineError> {
        self.state
            .lock()
            .map_err(|e| PipelineError::Input(format!("reader lock poisoned: {}", e)))
    }

    fn settle(&self, source_ref: &str, failed: bool) -> Result<(), PipelineError> {
        let mut state = self.lock()?;
        let mut found = false;
        for batches in state.pending.values_mut() {
            let before = batches.len();
            batches.retain(|b| b.source_ref != source_ref);
            found |= batches.len() != before;
        }
        if !found {
            return Err(PipelineError::Input(format!(
                "unknown source '{}'",
                source_ref
            )));
        }
        if failed {
            state.failed.push(source_ref.to_string());
        } else {
            state.processed.push(source_ref.to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl InputReader for InMemoryReader {
    async fn list_batches(&self, table_group: &str) -> Result<Vec<Batch>, PipelineError> {
        Ok(self
            .lock()?
            .pending
            .get(table_group)
            .cloned()
            .unwrap_or_default())
    }

    async fn mark_processed(&self, source_ref: &str) -> Result<(), PipelineError> {
        self.settle(source_ref, false)
    }

    async fn mark_failed(&self, source_ref: &str) -> Result<(), PipelineError> {
        self.settle(source_ref, true)
    }
}

// ──────────────────────────────────────────────
// DirectoryReader
// ──────────────────────────────────────────────

/// Reads `<root>/<group>/*.json`, each file a JSON array of objects.
///
/// Settled files move to `<root>/<group>/_processed/` or `_failed/`.
#[derive(Debug, Clone)]
pub struct DirectoryReader {
    root: PathBuf,
    clock: fn() -> OffsetDateTime,
}

impl DirectoryReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirectoryReader {
            root: root.into(),
            clock: OffsetDateTime::now_utc,
        }
    }

    pub fn with_clock(mut self, clock: fn() -> OffsetDateTime) -> Self {
        self.clock = clock;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn settle(&self, source_ref: &str, dir: &str) -> Result<(), PipelineError> {
        let source = Path::new(source_ref);
        let (Some(parent), Some(name)) = (source.parent(), source.file_name()) else {
            return Err(PipelineError::Input(format!(
                "invalid source '{}'",
                source_ref
            )));
        };
        let dest_dir = parent.join(dir);
        tokio::fs::create_dir_all(&dest_dir)
            .await
            .map_err(|e| io_error(&dest_dir, e))?;
        let dest = dest_dir.join(name);
        tokio::fs::rename(source, &dest)
            .await
            .map_err(|e| io_error(source, e))?;
        debug!(source = %source_ref, dest = %dest.display(), "settled landed file");
        Ok(())
    }
}

fn io_error(path: &Path, e: std::io::Error) -> PipelineError {
    PipelineError::Input(format!("{}: {}", path.display(), e))
}

/// Parse one landed file: a JSON array of objects.
pub fn parse_batch_file(path: &Path, contents: &str) -> Result<Vec<RawRecord>, PipelineError> {
    let values: Vec<serde_json::Value> = serde_json::from_str(contents).map_err(|e| {
        PipelineError::Input(format!("{}: expected a JSON array: {}", path.display(), e))
    })?;
    values
        .into_iter()
        .enumerate()
        .map(|(i, v)| match v {
            serde_json::Value::Object(map) => Ok(map),
            other => Err(PipelineError::Input(format!(
                "{}: element {} is not an object: {}",
                path.display(),
                i,
                other
            ))),
        })
        .collect()
}

#[async_trait]
impl InputReader for DirectoryReader {
    async fn list_batches(&self, table_group: &str) -> Result<Vec<Batch>, PipelineError> {
        let dir = self.root.join(table_group);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&dir, e)),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir, e))? {
            let file_type = entry.file_type().await.map_err(|e| io_error(&dir, e))?;
            let path = entry.path();
            if file_type.is_file() && path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let now = (self.clock)();
        let mut batches = Vec::with_capacity(paths.len());
        for path in paths {
            let source_ref = path.to_string_lossy().into_owned();
            let parsed = match tokio::fs::read_to_string(&path).await {
                Ok(contents) => parse_batch_file(&path, &contents),
                Err(e) => Err(io_error(&path, e)),
            };
            match parsed {
                Ok(mut records) => {
                    for record in &mut records {
                        stamp_ingestion(record, now);
                    }
                    batches.push(Batch::new(source_ref, records));
                }
                Err(e) => {
                    warn!(source = %source_ref, error = %e, "unreadable landed file");
                    batches.push(Batch::unreadable(source_ref, e.to_string()));
                }
            }
        }
        Ok(batches)
    }

    async fn mark_processed(&self, source_ref: &str) -> Result<(), PipelineError> {
        self.settle(source_ref, PROCESSED_DIR).await
    }

    async fn mark_failed(&self, source_ref: &str) -> Result<(), PipelineError> {
        self.settle(source_ref, FAILED_DIR).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    fn fixed_now() -> OffsetDateTime {
        datetime!(2026-10-18 06:30:00 UTC)
    }

    #[test]
    fn stamping_keeps_existing_audit_values() {
        let mut record = json!({"id": 1, "ingestion_date": "2026-10-01"})
            .as_object()
            .cloned()
            .unwrap();
        stamp_ingestion(&mut record, fixed_now());
        assert_eq!(record["ingestion_date"], json!("2026-10-01"));
        assert_eq!(record["ingestion_timestamp"], json!("2026-10-18T06:30:00Z"));
    }

    #[tokio::test]
    async fn in_memory_reader_hides_settled_batches() {
        let reader = InMemoryReader::new();
        reader.push("doctors", Batch::new("a", vec![])).unwrap();
        reader.push("doctors", Batch::new("b", vec![])).unwrap();
        reader.mark_processed("a").await.unwrap();
        let left = reader.list_batches("doctors").await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].source_ref, "b");
        assert_eq!(reader.processed(), vec!["a".to_string()]);
        assert!(reader.mark_failed("a").await.is_err());
    }

    #[tokio::test]
    async fn directory_reader_lists_stamps_and_moves_files() {
        let dir = tempfile::tempdir().unwrap();
        let group = dir.path().join("doctors");
        std::fs::create_dir_all(&group).unwrap();
        std::fs::write(group.join("002.json"), r#"[{"doctor_id": "D-2"}]"#).unwrap();
        std::fs::write(group.join("001.json"), r#"[{"doctor_id": "D-1"}]"#).unwrap();
        std::fs::write(group.join("notes.txt"), "ignored").unwrap();

        let reader = DirectoryReader::new(dir.path()).with_clock(fixed_now);
        let batches = reader.list_batches("doctors").await.unwrap();
        assert_eq!(batches.len(), 2);
        assert!(batches[0].source_ref.ends_with("001.json"));
        assert_eq!(
            batches[0].records[0]["ingestion_date"],
            json!("2026-10-18")
        );

        reader.mark_processed(&batches[0].source_ref).await.unwrap();
        reader.mark_failed(&batches[1].source_ref).await.unwrap();
        assert!(group.join("_processed").join("001.json").exists());
        assert!(group.join("_failed").join("002.json").exists());
        assert!(reader.list_batches("doctors").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn broken_file_is_listed_as_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let group = dir.path().join("doctors");
        std::fs::create_dir_all(&group).unwrap();
        std::fs::write(group.join("001.json"), r#"[{"doctor_id": "D-1"}]"#).unwrap();
        std::fs::write(group.join("002.json"), "not json").unwrap();
        std::fs::create_dir_all(group.join("003.json")).unwrap();

        let reader = DirectoryReader::new(dir.path()).with_clock(fixed_now);
        let batches = reader.list_batches("doctors").await.unwrap();
        assert_eq!(batches.len(), 2);
        assert!(batches[0].is_readable());
        assert!(!batches[1].is_readable());
        assert!(batches[1].records.is_empty());
        assert!(batches[1]
            .unreadable
            .as_deref()
            .unwrap()
            .contains("expected a JSON array"));

        reader.mark_failed(&batches[1].source_ref).await.unwrap();
        assert!(group.join("_failed").join("002.json").exists());
    }

    #[tokio::test]
    async fn missing_group_directory_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let reader = DirectoryReader::new(dir.path());
        assert!(reader.list_batches("facts").await.unwrap().is_empty());
    }

    #[test]
    fn non_array_file_is_an_input_error() {
        let err = parse_batch_file(Path::new("x.json"), r#"{"a": 1}"#).unwrap_err();
        assert!(matches!(err, PipelineError::Input(_)));
        let err = parse_batch_file(Path::new("x.json"), "[1]").unwrap_err();
        assert!(err.to_string().contains("element 0"));
    }
}
