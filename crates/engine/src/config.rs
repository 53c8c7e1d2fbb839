//! Pipeline configuration: one TOML file describing every table group.
//!
//! Group branching lives here as data. A group names its rule set, natural
//! key, target namespace and foreign keys; the orchestrator has no
//! per-group code.
//!
//! # Example
//!
//! ```toml
//! pipeline_name = "clinic"
//! executed_by = "Scheduler"
//! max_rejection_rate = 0.25
//! running_timeout_secs = 7200
//! identifying_columns = ["national_id", "full_name"]
//!
//! [groups.doctors]
//! kind = "dimension"
//! namespace = { name = "silver", zone = "pseudonymized" }
//! table = "dim_doctor"
//! natural_key = ["doctor_id"]
//! columns = [
//!   { name = "doctor_id", type = "text", nullable = false },
//!   { name = "year", type = "int" },
//! ]
//! rules = [
//!   { name = "year_range", kind = "range", column = "year", min = 1900, max = 2026 },
//! ]
//!
//! [groups.visits]
//! kind = "fact"
//! namespace = { name = "silver", zone = "pseudonymized" }
//! table = "fact_visit"
//! natural_key = ["visit_id"]
//! columns = [
//!   { name = "visit_id", type = "text", nullable = false },
//!   { name = "doctor_id", type = "text", nullable = false },
//! ]
//! foreign_keys = [ { column = "doctor_id", references = "doctors" } ]
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use medallion_storage::{Namespace, TableRef, Zone};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::merge::{ForeignKey, MergeTarget};
use crate::pseudonymize::TokenizeSpec;
use crate::record::{is_audit_column, NaturalKey, INGESTION_TIMESTAMP};
use crate::rules::{ColumnSpec, Rule, RuleSet};

// ── Types ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub pipeline_name: String,
    /// Executor label recorded when the caller does not name one.
    #[serde(default = "default_executed_by")]
    pub executed_by: String,
    /// Fraction of records read that may be rejected before the transition
    /// fails with `DataQualityError`.
    pub max_rejection_rate: f64,
    /// Age after which a RUNNING execution is reported as stale.
    pub running_timeout_secs: u64,
    /// Columns that may only be written to identity-zone namespaces.
    #[serde(default)]
    pub identifying_columns: Vec<String>,
    #[serde(default)]
    pub groups: BTreeMap<String, GroupConfig>,
}

fn default_executed_by() -> String {
    "Scheduler".to_string()
}

fn default_recency_column() -> String {
    INGESTION_TIMESTAMP.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    Dimension,
    Identity,
    Fact,
}

impl GroupKind {
    pub fn as_str(self) -> &'static str {
        match self {
            GroupKind::Dimension => "dimension",
            GroupKind::Identity => "identity",
            GroupKind::Fact => "fact",
        }
    }

    /// Zone every group of this kind must target.
    pub fn zone(self) -> Zone {
        match self {
            GroupKind::Identity => Zone::Identity,
            GroupKind::Dimension | GroupKind::Fact => Zone::Pseudonymized,
        }
    }
}

/// `[groups.<name>]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupConfig {
    pub kind: GroupKind,
    /// Defaults to `<group>_pipeline`.
    #[serde(default)]
    pub pipeline_name: Option<String>,
    pub namespace: Namespace,
    pub table: String,
    pub natural_key: NaturalKey,
    #[serde(default = "default_recency_column")]
    pub recency_column: String,
    #[serde(default)]
    pub columns: Vec<ColumnSpec>,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyConfig>,
    #[serde(default)]
    pub tokenize: Option<TokenizeSpec>,
}

/// A foreign key naming the referenced group rather than its table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForeignKeyConfig {
    pub column: String,
    pub references: String,
}

impl GroupConfig {
    pub fn table_ref(&self) -> TableRef {
        TableRef::new(self.namespace.clone(), self.table.clone())
    }

    pub fn ruleset(&self) -> RuleSet {
        RuleSet::new(self.columns.clone(), self.rules.clone())
    }

    fn declares(&self, column: &str) -> bool {
        is_audit_column(column) || self.columns.iter().any(|c| c.name == column)
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl PipelineConfig {
    /// Read, parse and validate a config file.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("could not read '{}': {}", path.display(), e))
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            PipelineError::Config(msg) => {
                PipelineError::Config(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, PipelineError> {
        let config: PipelineConfig = toml::from_str(content)
            .map_err(|e| PipelineError::Config(format!("could not parse: {}", e)))?;
        validate_pipeline_config(&config).map_err(|errors| PipelineError::Config(errors.join("; ")))?;
        Ok(config)
    }

    pub fn group(&self, name: &str) -> Result<&GroupConfig, PipelineError> {
        self.groups
            .get(name)
            .ok_or_else(|| PipelineError::Config(format!("unknown group '{}'", name)))
    }

    pub fn pipeline_name_for(&self, group: &str) -> String {
        self.groups
            .get(group)
            .and_then(|g| g.pipeline_name.clone())
            .unwrap_or_else(|| format!("{}_pipeline", group))
    }

    pub fn running_timeout(&self) -> time::Duration {
        time::Duration::seconds(i64::try_from(self.running_timeout_secs).unwrap_or(i64::MAX))
    }

    /// Rule set of `group`. Identifying columns and the tokenize source are
    /// redacted from rejection reasons.
    pub fn ruleset_for(&self, group: &str) -> Result<RuleSet, PipelineError> {
        let cfg = self.group(group)?;
        let tokenize_source = cfg.tokenize.iter().map(|t| t.source.clone());
        Ok(cfg
            .ruleset()
            .with_redacted(self.identifying_columns.iter().cloned().chain(tokenize_source)))
    }

    /// Merge target of `group`, with foreign keys resolved to tables.
    pub fn merge_target(&self, group: &str) -> Result<MergeTarget, PipelineError> {
        let cfg = self.group(group)?;
        let mut foreign_keys = Vec::with_capacity(cfg.foreign_keys.len());
        for fk in &cfg.foreign_keys {
            let referenced = self.group(&fk.references)?;
            foreign_keys.push(ForeignKey {
                column: fk.column.clone(),
                references: referenced.table_ref(),
            });
        }
        Ok(MergeTarget {
            table: cfg.table_ref(),
            natural_key: cfg.natural_key.clone(),
            foreign_keys,
            identifying_columns: self.identifying_columns.clone(),
        })
    }

    /// Group names in run order: dimensions, then identities, then facts.
    /// Within a kind a group runs after the groups it references, otherwise
    /// by name.
    pub fn run_order(&self) -> Result<Vec<String>, PipelineError> {
        run_order(&self.groups).map_err(PipelineError::Config)
    }
}

fn run_order(groups: &BTreeMap<String, GroupConfig>) -> Result<Vec<String>, String> {
    let mut pending: Vec<(&String, &GroupConfig)> = groups.iter().collect();
    pending.sort_by(|a, b| (a.1.kind, a.0).cmp(&(b.1.kind, b.0)));

    let mut placed: BTreeSet<&str> = BTreeSet::new();
    let mut order = Vec::with_capacity(pending.len());
    while !pending.is_empty() {
        let ready = pending.iter().position(|(name, g)| {
            g.foreign_keys.iter().all(|fk| {
                fk.references == **name
                    || placed.contains(fk.references.as_str())
                    || !groups.contains_key(&fk.references)
            })
        });
        let Some(index) = ready else {
            let names: Vec<&str> = pending.iter().map(|(n, _)| n.as_str()).collect();
            return Err(format!(
                "foreign keys form a cycle among groups: {}",
                names.join(", ")
            ));
        };
        let (name, _) = pending.remove(index);
        placed.insert(name.as_str());
        order.push(name.clone());
    }
    Ok(order)
}

// ── Validation ────────────────────────────────────────────────────────────────

/// Validate a parsed config.
///
/// Returns `Ok(())` if valid, or `Err(Vec<String>)` listing every problem.
pub fn validate_pipeline_config(config: &PipelineConfig) -> Result<(), Vec<String>> {
    let mut errors: Vec<String> = Vec::new();

    if config.pipeline_name.trim().is_empty() {
        errors.push("pipeline_name must not be empty".to_string());
    }
    if !(0.0..=1.0).contains(&config.max_rejection_rate) {
        errors.push(format!(
            "max_rejection_rate must be between 0.0 and 1.0, got {}",
            config.max_rejection_rate
        ));
    }
    if config.running_timeout_secs == 0 {
        errors.push("running_timeout_secs must be greater than 0".to_string());
    }
    if config.groups.is_empty() {
        errors.push("no groups configured, add a [groups.<name>] section".to_string());
    }

    let mut tables: BTreeMap<(&str, &str), &str> = BTreeMap::new();
    let mut namespace_zones: BTreeMap<&str, (Zone, &str)> = BTreeMap::new();

    for (name, group) in &config.groups {
        validate_group(config, name, group, &mut errors);

        let ns = group.namespace.name.as_str();
        if let Some(other) = tables.insert((ns, group.table.as_str()), name.as_str()) {
            errors.push(format!(
                "groups '{}' and '{}' both target {}.{}",
                other, name, ns, group.table
            ));
        }
        match namespace_zones.get(ns) {
            Some((zone, other)) if *zone != group.namespace.zone => errors.push(format!(
                "namespace '{}' is {} for group '{}' but {} for group '{}'",
                ns, zone, other, group.namespace.zone, name
            )),
            Some(_) => {}
            None => {
                namespace_zones.insert(ns, (group.namespace.zone, name.as_str()));
            }
        }
    }

    if let Err(e) = run_order(&config.groups) {
        errors.push(e);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_group(config: &PipelineConfig, name: &str, group: &GroupConfig, errors: &mut Vec<String>) {
    let expected_zone = group.kind.zone();
    if group.namespace.zone != expected_zone {
        errors.push(format!(
            "group '{}': {} groups must target the {} zone, namespace '{}' is {}",
            name,
            group.kind.as_str(),
            expected_zone,
            group.namespace.name,
            group.namespace.zone
        ));
    }
    if group.table.trim().is_empty() {
        errors.push(format!("group '{}': table must not be empty", name));
    }

    if group.natural_key.columns().is_empty() {
        errors.push(format!("group '{}': natural_key must not be empty", name));
    }
    for key in group.natural_key.columns() {
        match group.columns.iter().find(|c| &c.name == key) {
            Some(col) if col.nullable => errors.push(format!(
                "group '{}': key column '{}' must be declared nullable = false",
                name, key
            )),
            Some(_) => {}
            None => errors.push(format!(
                "group '{}': key column '{}' is not declared in columns",
                name, key
            )),
        }
    }

    let mut seen = BTreeSet::new();
    for col in &group.columns {
        if !seen.insert(col.name.as_str()) {
            errors.push(format!("group '{}': column '{}' declared twice", name, col.name));
        }
    }

    if !group.declares(&group.recency_column) {
        errors.push(format!(
            "group '{}': recency_column '{}' is not declared",
            name, group.recency_column
        ));
    }

    for rule in &group.rules {
        if !group.declares(rule.check.column()) {
            errors.push(format!(
                "group '{}': rule '{}' reads undeclared column '{}'",
                name,
                rule.name,
                rule.check.column()
            ));
        }
    }

    if group.namespace.zone == Zone::Pseudonymized {
        for col in &group.columns {
            if config.identifying_columns.contains(&col.name) {
                errors.push(format!(
                    "group '{}': identifying column '{}' cannot be declared in pseudonymized namespace '{}'",
                    name, col.name, group.namespace.name
                ));
            }
        }
    }

    for fk in &group.foreign_keys {
        if !group.declares(&fk.column) {
            errors.push(format!(
                "group '{}': foreign key column '{}' is not declared",
                name, fk.column
            ));
        }
        let Some(referenced) = config.groups.get(&fk.references) else {
            errors.push(format!(
                "group '{}': foreign key '{}' references unknown group '{}'",
                name, fk.column, fk.references
            ));
            continue;
        };
        if referenced.kind == GroupKind::Fact {
            errors.push(format!(
                "group '{}': foreign key '{}' references fact group '{}'",
                name, fk.column, fk.references
            ));
        }
        if referenced.namespace.zone != group.namespace.zone {
            errors.push(format!(
                "group '{}': foreign key '{}' crosses from the {} zone into the {} zone",
                name, fk.column, group.namespace.zone, referenced.namespace.zone
            ));
        }
        if referenced.natural_key.columns().len() != 1 {
            errors.push(format!(
                "group '{}': foreign key '{}' references group '{}' whose natural key is not a single column",
                name, fk.column, fk.references
            ));
        }
    }

    if let Some(tokenize) = &group.tokenize {
        if group.kind != GroupKind::Identity {
            errors.push(format!(
                "group '{}': tokenize is only allowed on identity groups",
                name
            ));
        }
        if !group.declares(&tokenize.source) {
            errors.push(format!(
                "group '{}': tokenize source '{}' is not declared",
                name, tokenize.source
            ));
        }
        if tokenize.salt_env.trim().is_empty() {
            errors.push(format!("group '{}': tokenize salt_env must not be empty", name));
        }
    }
}
