//! Merge engine: keyed upsert of a deduplicated batch into a versioned table.
//!
//! Merging is two-phase. [`MergeEngine::stage`] takes the target's
//! single-writer lease, reads the target and every referenced dimension,
//! splits off foreign-key rejects and stages the diff. The caller then
//! either commits the [`StagedMerge`] atomically or aborts it; nothing is
//! visible to readers until commit.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use medallion_storage::{RowKey, TableRef, TableStore, Zone};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::error::{PipelineError, RecordError};
use crate::record::{is_audit_column, NaturalKey, Record};
use crate::validate::Rejection;

/// A single-column foreign key into another table's natural key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub column: String,
    pub references: TableRef,
}

/// Where and how a batch is merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeTarget {
    pub table: TableRef,
    pub natural_key: NaturalKey,
    pub foreign_keys: Vec<ForeignKey>,
    /// Columns that may only ever be written into identity-zone namespaces.
    pub identifying_columns: Vec<String>,
}

impl MergeTarget {
    pub fn new(table: TableRef, natural_key: NaturalKey) -> Self {
        MergeTarget {
            table,
            natural_key,
            foreign_keys: Vec::new(),
            identifying_columns: Vec::new(),
        }
    }

    pub fn with_foreign_key(mut self, column: impl Into<String>, references: TableRef) -> Self {
        self.foreign_keys.push(ForeignKey {
            column: column.into(),
            references,
        });
        self
    }

    pub fn with_identifying_columns(mut self, columns: Vec<String>) -> Self {
        self.identifying_columns = columns;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeResult {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl MergeResult {
    /// Records the merge accounted for (inserted + updated + unchanged).
    pub fn processed(&self) -> usize {
        self.inserted + self.updated + self.unchanged
    }

    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Outcome of a committed merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub result: MergeResult,
    pub fk_rejected: Vec<Rejection>,
    /// Table version after commit. Unchanged when nothing was written.
    pub version: i64,
    /// Version of each referenced table the foreign keys were checked against.
    pub reference_versions: Vec<(TableRef, i64)>,
}

// ──────────────────────────────────────────────
// Engine
// ──────────────────────────────────────────────

pub struct MergeEngine<S: TableStore> {
    store: Arc<S>,
}

impl<S: TableStore> Clone for MergeEngine<S> {
    fn clone(&self) -> Self {
        MergeEngine {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: TableStore> MergeEngine<S> {
    pub fn new(store: Arc<S>) -> Self {
        MergeEngine { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Stage `records` against `target` on behalf of `execution_id`.
    ///
    /// Fails with `ConcurrentMerge` if another execution holds the target's
    /// lease, and with `IdentityLeak` before taking the lease if the batch
    /// would put an identifying column into a pseudonymized namespace.
    pub async fn stage(
        &self,
        target: &MergeTarget,
        records: Vec<Record>,
        execution_id: &str,
    ) -> Result<StagedMerge<S>, PipelineError> {
        check_zones(target, &records)?;

        let mut snapshot = self
            .store
            .begin_snapshot(&target.table, execution_id)
            .await
            .map_err(PipelineError::from_merge)?;

        match self.stage_diff(target, records, &mut snapshot).await {
            Ok((result, fk_rejected, reference_versions)) => Ok(StagedMerge {
                store: Arc::clone(&self.store),
                snapshot,
                table: target.table.clone(),
                result,
                fk_rejected,
                reference_versions,
            }),
            Err(e) => {
                if let Err(abort) = self.store.abort_snapshot(snapshot).await {
                    error!(table = %target.table, error = %abort, "could not abort staged merge");
                }
                Err(e)
            }
        }
    }

    /// Stage and commit in one step.
    pub async fn merge(
        &self,
        target: &MergeTarget,
        records: Vec<Record>,
        execution_id: &str,
    ) -> Result<MergeOutcome, PipelineError> {
        self.stage(target, records, execution_id).await?.commit().await
    }

    async fn stage_diff(
        &self,
        target: &MergeTarget,
        records: Vec<Record>,
        snapshot: &mut S::Snapshot,
    ) -> Result<(MergeResult, Vec<Rejection>, Vec<(TableRef, i64)>), PipelineError> {
        let mut references = Vec::with_capacity(target.foreign_keys.len());
        for fk in &target.foreign_keys {
            let state = self.store.read_current_state(&fk.references).await?;
            let keys: HashSet<String> = state
                .rows
                .keys()
                .filter_map(|k| k.0.first().cloned())
                .collect();
            references.push((fk, state.version, keys));
        }

        let base = self.store.snapshot_state(snapshot).await?;
        let mut result = MergeResult::default();
        let mut fk_rejected = Vec::new();
        let mut staged: HashMap<RowKey, serde_json::Map<String, serde_json::Value>> =
            HashMap::new();

        for record in records {
            let violations: Vec<RecordError> = references
                .iter()
                .filter_map(|(fk, _, keys)| {
                    let value = record.get(&fk.column);
                    if value.is_null() {
                        return None;
                    }
                    let text = value.canonical_text();
                    (!keys.contains(&text)).then(|| RecordError::ForeignKeyViolation {
                        column: fk.column.clone(),
                        value: text,
                        references: fk.references.to_string(),
                    })
                })
                .collect();
            if !violations.is_empty() {
                debug!(table = %target.table, reasons = ?violations, "foreign key reject");
                fk_rejected.push(Rejection {
                    record: record.to_columns(),
                    reasons: violations,
                });
                continue;
            }

            let key = record.key(&target.natural_key);
            let columns = record.to_columns();
            let previous = staged
                .get(&key)
                .or_else(|| base.get(&key).map(|row| &row.columns));
            match previous {
                None => result.inserted += 1,
                Some(prev) if same_values(prev, &columns, &target.natural_key) => {
                    result.unchanged += 1;
                    continue;
                }
                Some(_) => result.updated += 1,
            }
            staged.insert(key.clone(), columns.clone());
            self.store.upsert_row(snapshot, key, columns).await?;
        }

        let reference_versions = references
            .into_iter()
            .map(|(fk, version, _)| (fk.references.clone(), version))
            .collect();
        Ok((result, fk_rejected, reference_versions))
    }
}

/// A staged, uncommitted merge holding the target's write lease.
///
/// Dropping it without `commit` discards the staged rows.
pub struct StagedMerge<S: TableStore> {
    store: Arc<S>,
    snapshot: S::Snapshot,
    table: TableRef,
    result: MergeResult,
    fk_rejected: Vec<Rejection>,
    reference_versions: Vec<(TableRef, i64)>,
}

impl<S: TableStore> StagedMerge<S> {
    pub fn table(&self) -> &TableRef {
        &self.table
    }

    pub fn result(&self) -> MergeResult {
        self.result
    }

    pub fn fk_rejected(&self) -> &[Rejection] {
        &self.fk_rejected
    }

    pub fn reference_versions(&self) -> &[(TableRef, i64)] {
        &self.reference_versions
    }

    /// Publish the staged diff as one table version.
    pub async fn commit(self) -> Result<MergeOutcome, PipelineError> {
        let StagedMerge {
            store,
            snapshot,
            table,
            result,
            fk_rejected,
            reference_versions,
        } = self;
        let info = store
            .commit_snapshot(snapshot)
            .await
            .map_err(PipelineError::from_merge)?;
        info!(
            table = %table,
            version = info.version,
            inserted = result.inserted,
            updated = result.updated,
            unchanged = result.unchanged,
            fk_rejected = fk_rejected.len(),
            "merge committed"
        );
        Ok(MergeOutcome {
            result,
            fk_rejected,
            version: info.version,
            reference_versions,
        })
    }

    /// Discard the staged diff and release the lease.
    pub async fn abort(self) -> Result<(), PipelineError> {
        debug!(table = %self.table, "merge aborted");
        self.store.abort_snapshot(self.snapshot).await?;
        Ok(())
    }
}

/// Identity and pseudonymized state never meet: foreign keys stay within a
/// zone and identifying columns never land in a pseudonymized namespace.
fn check_zones(target: &MergeTarget, records: &[Record]) -> Result<(), PipelineError> {
    let zone = target.table.namespace.zone;
    for fk in &target.foreign_keys {
        if fk.references.namespace.zone != zone {
            return Err(PipelineError::IdentityLeak {
                table: target.table.clone(),
                detail: format!(
                    "foreign key '{}' references {} in the {} zone",
                    fk.column, fk.references, fk.references.namespace.zone
                ),
            });
        }
    }
    if zone == Zone::Pseudonymized {
        for column in &target.identifying_columns {
            if records.iter().any(|r| r.contains(column)) {
                return Err(PipelineError::IdentityLeak {
                    table: target.table.clone(),
                    detail: format!(
                        "identifying column '{}' cannot be written to a pseudonymized namespace",
                        column
                    ),
                });
            }
        }
    }
    Ok(())
}

/// True when every column outside the natural key and the audit columns is
/// identical. Absent and null compare equal.
fn same_values(
    stored: &serde_json::Map<String, serde_json::Value>,
    incoming: &serde_json::Map<String, serde_json::Value>,
    natural_key: &NaturalKey,
) -> bool {
    let null = serde_json::Value::Null;
    stored
        .keys()
        .chain(incoming.keys())
        .filter(|name| !natural_key.contains(name) && !is_audit_column(name))
        .all(|name| stored.get(name).unwrap_or(&null) == incoming.get(name).unwrap_or(&null))
}
