//! The export–normalize–diff–transform–apply–version pipeline.
//!
//! One run per dataset, stages strictly in order: fetch both snapshots,
//! transform the source into the target's record shape, canonicalize both
//! sides, diff, generate a change script, submit it as one bulk transaction,
//! then create a released repository version and rotate the cached baseline.
//! A byte-level baseline pre-check short-circuits runs where the source has
//! not moved at all; the canonical diff remains the source of truth whenever
//! the pre-check reports a difference.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use dictsync_client::{
    FixtureSourceSystem, FixtureTargetRepository, HttpClient, HttpClientConfig, HttpSourceSystem,
    HttpTargetRepository, SourceSystem, TargetRepository,
};
use dictsync_core::{
    CanonicalRecord, ChangeOperation, ChangedRecord, DiffResult, ImportStatus, ImportTask,
    OperationCounts, OperationKind, RecordKind, RepositorySnapshot, RepositoryVersion, SyncError,
};
use dictsync_state::{SnapshotCache, SyncMarker, VersionLedger};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dictsync-pipeline";

/// Fields the target server generates or rewrites on every touch. Stripped on
/// both sides before comparison, in addition to per-profile exclusions.
pub const BUILTIN_VOLATILE_FIELDS: &[&str] = &[
    "uuid",
    "url",
    "checksum",
    "display_cache",
    "created_on",
    "created_by",
    "updated_on",
    "updated_by",
    "version_created_on",
];

fn default_true() -> bool {
    true
}

fn default_natural_key_field() -> String {
    "code".to_string()
}

fn default_record_type_field() -> String {
    "type".to_string()
}

fn default_entity_type() -> String {
    "concept".to_string()
}

fn default_relation_type() -> String {
    "mapping".to_string()
}

fn default_relation_ref_fields() -> Vec<String> {
    vec!["from".to_string(), "to".to_string()]
}

/// Per-dataset sync configuration, loaded from `datasets.yaml`. One profile
/// replaces what used to be one hand-maintained script per dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetProfile {
    pub dataset_id: String,
    /// Target repository in `owner/name` form.
    pub repository: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Field on raw source records holding the stable natural key.
    #[serde(default = "default_natural_key_field")]
    pub natural_key_field: String,
    /// Field on target-shaped records naming the record type.
    #[serde(default = "default_record_type_field")]
    pub record_type_field: String,
    #[serde(default = "default_entity_type")]
    pub entity_type: String,
    #[serde(default = "default_relation_type")]
    pub relation_type: String,
    /// One-to-many membership fields on source records, each expanded into
    /// individual relation records during transform. Order matters: it fixes
    /// the order derived relations are emitted in.
    #[serde(default)]
    pub membership_fields: Vec<String>,
    /// Fields on relation records whose values reference other natural keys.
    #[serde(default = "default_relation_ref_fields")]
    pub relation_ref_fields: Vec<String>,
    /// Volatile fields per record type, on top of [`BUILTIN_VOLATILE_FIELDS`].
    /// The `*` key applies to every type.
    #[serde(default)]
    pub excluded_fields: BTreeMap<String, BTreeSet<String>>,
}

impl DatasetProfile {
    pub fn new(dataset_id: impl Into<String>, repository: impl Into<String>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            repository: repository.into(),
            enabled: true,
            natural_key_field: default_natural_key_field(),
            record_type_field: default_record_type_field(),
            entity_type: default_entity_type(),
            relation_type: default_relation_type(),
            membership_fields: Vec::new(),
            relation_ref_fields: default_relation_ref_fields(),
            excluded_fields: BTreeMap::new(),
        }
    }

    fn is_volatile(&self, record_type: &str, field: &str) -> bool {
        BUILTIN_VOLATILE_FIELDS.contains(&field)
            || self
                .excluded_fields
                .get(record_type)
                .is_some_and(|set| set.contains(field))
            || self
                .excluded_fields
                .get("*")
                .is_some_and(|set| set.contains(field))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetRegistry {
    #[allow(dead_code)]
    #[serde(default)]
    version: u32,
    pub datasets: Vec<DatasetProfile>,
}

/// Process-wide configuration, read once from the environment and passed in
/// explicitly everywhere.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub source_base_url: String,
    pub source_token: Option<String>,
    pub target_base_url: String,
    pub target_token: Option<String>,
    pub target_owner: String,
    pub sync_attribute: String,
    pub state_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub offline: bool,
    pub poll_interval_secs: u64,
    pub poll_deadline_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            source_base_url: std::env::var("DICTSYNC_SOURCE_URL")
                .unwrap_or_else(|_| "http://localhost:8080/api".to_string()),
            source_token: std::env::var("DICTSYNC_SOURCE_TOKEN").ok(),
            target_base_url: std::env::var("DICTSYNC_TARGET_URL")
                .unwrap_or_else(|_| "http://localhost:8000".to_string()),
            target_token: std::env::var("DICTSYNC_TARGET_TOKEN").ok(),
            target_owner: std::env::var("DICTSYNC_TARGET_OWNER")
                .unwrap_or_else(|_| "hq".to_string()),
            sync_attribute: std::env::var("DICTSYNC_SYNC_ATTRIBUTE")
                .unwrap_or_else(|_| "dictsync".to_string()),
            state_dir: std::env::var("DICTSYNC_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./state")),
            workspace_root: std::env::var("DICTSYNC_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            offline: std::env::var("DICTSYNC_OFFLINE")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            poll_interval_secs: std::env::var("DICTSYNC_POLL_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            poll_deadline_secs: std::env::var("DICTSYNC_POLL_DEADLINE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(900),
            scheduler_enabled: std::env::var("DICTSYNC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron_1: std::env::var("SYNC_CRON_1").unwrap_or_else(|_| "0 6 * * *".to_string()),
            sync_cron_2: std::env::var("SYNC_CRON_2").unwrap_or_else(|_| "0 18 * * *".to_string()),
            user_agent: std::env::var("DICTSYNC_USER_AGENT")
                .unwrap_or_else(|_| "dictsync/0.1".to_string()),
            http_timeout_secs: std::env::var("DICTSYNC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }
}

/// Deterministic target identifier for a record: a pure function of the
/// repository, record type, and natural key. Never derived from invocation
/// order or wall-clock time, so re-runs mint identical ids.
pub fn deterministic_record_id(repository: &str, record_type: &str, natural_key: &str) -> Uuid {
    let name = format!("{repository}/{record_type}/{natural_key}");
    Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes())
}

fn ref_values(value: &JsonValue) -> Option<Vec<String>> {
    match value {
        JsonValue::String(s) => Some(vec![s.clone()]),
        JsonValue::Array(items) => items
            .iter()
            .map(|item| item.as_str().map(str::to_string))
            .collect(),
        _ => None,
    }
}

/// Map one raw source candidate record into the target record shape: the
/// entity itself plus one synthesized relation record per membership entry.
/// Output order follows profile field order, then source array order.
pub fn transform_record(
    profile: &DatasetProfile,
    raw: &JsonValue,
) -> Result<Vec<JsonValue>, SyncError> {
    let obj = raw.as_object().ok_or_else(|| SyncError::MalformedRecord {
        stage: "transform",
        natural_key: None,
        problem: "record is not a JSON object".to_string(),
    })?;

    let code = obj
        .get(&profile.natural_key_field)
        .and_then(JsonValue::as_str)
        .filter(|code| !code.is_empty())
        .ok_or_else(|| SyncError::MalformedRecord {
            stage: "transform",
            natural_key: None,
            problem: format!("missing natural key field `{}`", profile.natural_key_field),
        })?;

    let mut entity = JsonMap::new();
    for (key, value) in obj {
        if key == &profile.natural_key_field || profile.membership_fields.contains(key) {
            continue;
        }
        entity.insert(key.clone(), value.clone());
    }
    let record_type = entity
        .get(&profile.record_type_field)
        .and_then(JsonValue::as_str)
        .unwrap_or(&profile.entity_type)
        .to_string();
    entity.insert(profile.record_type_field.clone(), json!(record_type));
    entity.insert("id".to_string(), json!(code));
    entity.insert(
        "uuid".to_string(),
        json!(deterministic_record_id(&profile.repository, &record_type, code).to_string()),
    );

    let mut shaped = vec![JsonValue::Object(entity)];

    for field in &profile.membership_fields {
        let Some(value) = obj.get(field) else {
            continue;
        };
        let targets = ref_values(value).ok_or_else(|| SyncError::MalformedRecord {
            stage: "transform",
            natural_key: Some(code.to_string()),
            problem: format!("membership field `{field}` is not a string or string array"),
        })?;
        for target in targets {
            let key = format!("{code}:{field}:{target}");
            let mut relation = JsonMap::new();
            relation.insert("id".to_string(), json!(key));
            relation.insert(
                profile.record_type_field.clone(),
                json!(profile.relation_type),
            );
            relation.insert("map_type".to_string(), json!(field));
            relation.insert("from".to_string(), json!(code));
            relation.insert("to".to_string(), json!(target));
            relation.insert(
                "uuid".to_string(),
                json!(
                    deterministic_record_id(&profile.repository, &profile.relation_type, &key)
                        .to_string()
                ),
            );
            shaped.push(JsonValue::Object(relation));
        }
    }

    Ok(shaped)
}

/// Transform a whole source snapshot. Fatal on the first malformed record:
/// a partial transform would feed the differ a false picture.
pub fn transform_snapshot(
    snapshot: &RepositorySnapshot,
    profile: &DatasetProfile,
) -> Result<Vec<JsonValue>, SyncError> {
    let mut shaped = Vec::with_capacity(snapshot.records.len());
    for record in &snapshot.records {
        shaped.extend(transform_record(profile, record)?);
    }
    Ok(shaped)
}

/// Reduce target-shaped records to comparable canonical form, keyed by
/// natural key. Strips volatile fields, pulls reference fields into the
/// relations set, and rejects records without identity.
pub fn canonicalize(
    records: &[JsonValue],
    profile: &DatasetProfile,
    stage: &'static str,
) -> Result<BTreeMap<String, CanonicalRecord>, SyncError> {
    let mut out: BTreeMap<String, CanonicalRecord> = BTreeMap::new();

    for record in records {
        let obj = record.as_object().ok_or_else(|| SyncError::MalformedRecord {
            stage,
            natural_key: None,
            problem: "record is not a JSON object".to_string(),
        })?;

        let key = obj
            .get("id")
            .and_then(JsonValue::as_str)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| SyncError::MalformedRecord {
                stage,
                natural_key: None,
                problem: "missing identity field `id`".to_string(),
            })?
            .to_string();

        let record_type = obj
            .get(&profile.record_type_field)
            .and_then(JsonValue::as_str)
            .unwrap_or(&profile.entity_type)
            .to_string();
        let kind = if record_type == profile.relation_type {
            RecordKind::Relation
        } else {
            RecordKind::Entity
        };

        let mut relations: Vec<String> = Vec::new();
        for field in &profile.relation_ref_fields {
            match obj.get(field) {
                Some(value) => {
                    let refs = ref_values(value).ok_or_else(|| SyncError::MalformedRecord {
                        stage,
                        natural_key: Some(key.clone()),
                        problem: format!("relation field `{field}` is not a string or string array"),
                    })?;
                    relations.extend(refs);
                }
                None if kind == RecordKind::Relation => {
                    return Err(SyncError::MalformedRecord {
                        stage,
                        natural_key: Some(key.clone()),
                        problem: format!("missing relation field `{field}`"),
                    });
                }
                None => {}
            }
        }

        let mut fields: BTreeMap<String, JsonValue> = BTreeMap::new();
        for (name, value) in obj {
            if name == "id"
                || profile.relation_ref_fields.contains(name)
                || profile.is_volatile(&record_type, name)
            {
                continue;
            }
            fields.insert(name.clone(), value.clone());
        }

        let canonical = CanonicalRecord::new(key.clone(), kind, fields, relations);
        if out.insert(key.clone(), canonical).is_some() {
            return Err(SyncError::MalformedRecord {
                stage,
                natural_key: Some(key),
                problem: "duplicate natural key".to_string(),
            });
        }
    }

    Ok(out)
}

/// Structural diff of two canonical sets. Pure and total: identical inputs
/// always produce an identical, empty result.
pub fn diff(
    target: &BTreeMap<String, CanonicalRecord>,
    source: &BTreeMap<String, CanonicalRecord>,
) -> DiffResult {
    let mut result = DiffResult::default();

    for (key, record) in source {
        if !target.contains_key(key) {
            result.added.push(record.clone());
        }
    }
    for (key, before) in target {
        match source.get(key) {
            None => result.removed.push(key.clone()),
            Some(after) if after != before => {
                result.changed.insert(
                    key.clone(),
                    ChangedRecord {
                        before: before.clone(),
                        after: after.clone(),
                    },
                );
            }
            Some(_) => {}
        }
    }

    result
}

fn full_payload(record: &CanonicalRecord) -> JsonValue {
    json!({
        "id": record.natural_key,
        "fields": record.fields,
        "relations": record.relations,
    })
}

/// Turn a diff into the ordered bulk change script.
///
/// Ordering: relation retires, entity retires, entity creates, entity
/// updates, relation creates, relation updates — so no relation operation
/// ever references an entity the script has not yet created, and removals
/// never leave a relation pointing at a retired entity. Within each group,
/// operations are sorted by natural key; the whole script is byte-stable for
/// a given diff.
pub fn build_change_script(
    diff: &DiffResult,
    prior: &BTreeMap<String, CanonicalRecord>,
) -> Vec<ChangeOperation> {
    let mut script = Vec::with_capacity(diff.entry_count());

    let retire_kind = |key: &String| {
        prior
            .get(key)
            .map(|record| record.kind)
            .unwrap_or(RecordKind::Entity)
    };
    for wanted in [RecordKind::Relation, RecordKind::Entity] {
        for key in diff.removed.iter().filter(|key| retire_kind(key) == wanted) {
            script.push(ChangeOperation {
                kind: OperationKind::Retire,
                target: wanted,
                natural_key: key.clone(),
                payload: json!({ "id": key, "retired": true }),
            });
        }
    }

    // Updates carry only the new semantic fields and relations, never a full
    // server-side replace.
    let creates = |wanted: RecordKind, script: &mut Vec<ChangeOperation>| {
        for record in diff.added.iter().filter(|r| r.kind == wanted) {
            script.push(ChangeOperation {
                kind: OperationKind::Create,
                target: wanted,
                natural_key: record.natural_key.clone(),
                payload: full_payload(record),
            });
        }
    };
    let updates = |wanted: RecordKind, script: &mut Vec<ChangeOperation>| {
        for (key, change) in diff.changed.iter().filter(|(_, c)| c.after.kind == wanted) {
            script.push(ChangeOperation {
                kind: OperationKind::Update,
                target: wanted,
                natural_key: key.clone(),
                payload: full_payload(&change.after),
            });
        }
    };
    creates(RecordKind::Entity, &mut script);
    updates(RecordKind::Entity, &mut script);
    creates(RecordKind::Relation, &mut script);
    updates(RecordKind::Relation, &mut script);

    script
}

/// Submit the script as one bulk transaction and poll until terminal or the
/// deadline passes. On deadline the import's outcome is unknown: the error
/// says so, and the caller must not version or assume failure.
pub async fn submit_and_wait(
    target: &dyn TargetRepository,
    repository: &str,
    script: &[ChangeOperation],
    script_path: &Path,
    poll_interval: Duration,
    poll_deadline: Duration,
) -> Result<ImportTask, SyncError> {
    let started = Instant::now();
    let mut task = target
        .submit_bulk(repository, script)
        .await
        .map_err(|err| match err {
            SyncError::SubmissionRejected { reason, .. } => SyncError::SubmissionRejected {
                reason,
                script_path: script_path.display().to_string(),
            },
            other => other,
        })?;

    while !task.status.is_terminal() {
        if started.elapsed() >= poll_deadline {
            return Err(SyncError::ImportTimedOut {
                task_id: task.task_id,
                waited_secs: started.elapsed().as_secs(),
            });
        }
        tokio::time::sleep(poll_interval).await;
        task = target.poll_task(&task.task_id).await?;
    }

    Ok(task)
}

/// After a succeeded import: create the released version, then rotate the
/// baseline snapshot and the ledger. Any failure here is `VersioningFailed`,
/// reported distinctly so the operator can create the version by hand instead
/// of re-importing.
#[allow(clippy::too_many_arguments)]
pub async fn finalize(
    target: &dyn TargetRepository,
    profile: &DatasetProfile,
    task: &ImportTask,
    counts: OperationCounts,
    source_raw: &[u8],
    cache: &SnapshotCache,
    ledger: &VersionLedger,
) -> Result<RepositoryVersion, SyncError> {
    if task.status != ImportStatus::Succeeded {
        return Err(SyncError::VersioningFailed {
            repository: profile.repository.clone(),
            task_id: task.task_id.clone(),
            reason: format!("finalize invoked with task status {:?}", task.status),
        });
    }

    let completed_at = Utc::now();
    let version_id = completed_at.format("v%Y%m%d.%H%M%S").to_string();
    let description = format!(
        "Sync of dataset {}: {} created, {} updated, {} retired",
        profile.dataset_id, counts.created, counts.updated, counts.retired
    );

    let version = target
        .create_version(&profile.repository, &version_id, &description)
        .await
        .map_err(|err| SyncError::VersioningFailed {
            repository: profile.repository.clone(),
            task_id: task.task_id.clone(),
            reason: err.to_string(),
        })?;

    // Baseline rotation happens only after the version exists; a retried run
    // after a crash here re-derives the same diff instead of losing it.
    cache
        .replace(&profile.dataset_id, source_raw)
        .await
        .map_err(|err| SyncError::VersioningFailed {
            repository: profile.repository.clone(),
            task_id: task.task_id.clone(),
            reason: format!(
                "version {} created but baseline rotation failed: {err:#}",
                version.version_id
            ),
        })?;
    ledger
        .record(&profile.dataset_id, version.clone())
        .await
        .map_err(|err| SyncError::VersioningFailed {
            repository: profile.repository.clone(),
            task_id: task.task_id.clone(),
            reason: format!(
                "version {} created but ledger update failed: {err:#}",
                version.version_id
            ),
        })?;

    Ok(version)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    NoChange,
    DryRun { operations: usize },
    Applied { version_id: String, operations: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub dataset_id: String,
    pub repository: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source_records: usize,
    pub target_records: usize,
    pub diff_entries: usize,
    pub counts: OperationCounts,
    pub outcome: RunOutcome,
}

pub struct SyncPipeline {
    config: SyncConfig,
    source: Arc<dyn SourceSystem>,
    target: Arc<dyn TargetRepository>,
    cache: SnapshotCache,
    marker: SyncMarker,
    ledger: VersionLedger,
    dry_run: bool,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        source: Arc<dyn SourceSystem>,
        target: Arc<dyn TargetRepository>,
    ) -> Self {
        let cache = SnapshotCache::new(&config.state_dir);
        let marker = SyncMarker::new(&config.state_dir);
        let ledger = VersionLedger::new(&config.state_dir);
        Self {
            config,
            source,
            target,
            cache,
            marker,
            ledger,
            dry_run: false,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    async fn load_dataset_registry(&self) -> Result<DatasetRegistry> {
        let path = self.config.workspace_root.join("datasets.yaml");
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Run every selected dataset once, sequentially. Datasets are
    /// independent: one failing does not stop the others, but any failure
    /// makes the whole run fail after the loop.
    pub async fn run_once(&self) -> Result<Vec<SyncRunSummary>> {
        let registry = self.load_dataset_registry().await?;
        let enabled: Vec<DatasetProfile> = registry
            .datasets
            .into_iter()
            .filter(|profile| profile.enabled)
            .collect();

        let active = self.target.list_active_datasets().await?;
        let selected: Vec<DatasetProfile> = if active.is_empty() {
            // No collection carries the sync attribute (typical for fixture
            // targets); fall back to the local registry alone.
            enabled
        } else {
            let active_ids: BTreeSet<&str> =
                active.iter().map(|d| d.external_id.as_str()).collect();
            enabled
                .into_iter()
                .filter(|profile| active_ids.contains(profile.dataset_id.as_str()))
                .collect()
        };

        let mut summaries = Vec::new();
        let mut first_failure: Option<(String, anyhow::Error)> = None;
        for profile in &selected {
            match self.run_dataset(profile).await {
                Ok(summary) => {
                    info!(
                        dataset_id = %profile.dataset_id,
                        outcome = ?summary.outcome,
                        "dataset run finished"
                    );
                    summaries.push(summary);
                }
                Err(err) => {
                    error!(
                        dataset_id = %profile.dataset_id,
                        error = %format!("{err:#}"),
                        "dataset run failed"
                    );
                    if first_failure.is_none() {
                        first_failure = Some((profile.dataset_id.clone(), err));
                    }
                }
            }
        }

        match first_failure {
            Some((dataset_id, err)) => {
                Err(err.context(format!("dataset {dataset_id} failed (see log for others)")))
            }
            None => Ok(summaries),
        }
    }

    async fn run_dataset(&self, profile: &DatasetProfile) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let guard = self.marker.acquire(&profile.repository, run_id).await?;
        let result = self
            .run_dataset_locked(profile, run_id, started_at)
            .instrument(info_span!("sync_run", %run_id, dataset_id = %profile.dataset_id))
            .await;
        let released = guard.release().await;

        let summary = result?;
        released?;
        Ok(summary)
    }

    async fn run_dataset_locked(
        &self,
        profile: &DatasetProfile,
        run_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<SyncRunSummary> {
        let snapshot = self.source.fetch_snapshot(&profile.dataset_id).await?;
        info!(records = snapshot.records.len(), "fetched source snapshot");

        if self.cache.matches(&profile.dataset_id, &snapshot.raw).await? {
            info!("source snapshot matches cached baseline byte-for-byte; nothing to do");
            let summary = self.summary(
                run_id,
                profile,
                started_at,
                snapshot.records.len(),
                0,
                0,
                OperationCounts::default(),
                RunOutcome::NoChange,
            );
            self.write_summary(&summary).await?;
            return Ok(summary);
        }

        let export = self.target.fetch_latest_export(&profile.repository).await?;
        info!(records = export.records.len(), "fetched target export");

        let shaped = transform_snapshot(&snapshot, profile)?;
        let source_canonical = canonicalize(&shaped, profile, "canonicalize-source")?;
        let target_canonical = canonicalize(&export.records, profile, "canonicalize-target")?;
        let changes = diff(&target_canonical, &source_canonical);

        if changes.is_empty() {
            info!("canonical sets already match; rotating baseline without a new version");
            self.cache.replace(&profile.dataset_id, &snapshot.raw).await?;
            let summary = self.summary(
                run_id,
                profile,
                started_at,
                source_canonical.len(),
                target_canonical.len(),
                0,
                OperationCounts::default(),
                RunOutcome::NoChange,
            );
            self.write_summary(&summary).await?;
            return Ok(summary);
        }

        let script = build_change_script(&changes, &target_canonical);
        let counts = OperationCounts::tally(&script);
        let script_path = self.write_change_script(run_id, profile, &script).await?;
        info!(
            created = counts.created,
            updated = counts.updated,
            retired = counts.retired,
            "generated change script"
        );

        if self.dry_run {
            let summary = self.summary(
                run_id,
                profile,
                started_at,
                source_canonical.len(),
                target_canonical.len(),
                changes.entry_count(),
                counts,
                RunOutcome::DryRun {
                    operations: script.len(),
                },
            );
            self.write_summary(&summary).await?;
            return Ok(summary);
        }

        let task = submit_and_wait(
            self.target.as_ref(),
            &profile.repository,
            &script,
            &script_path,
            Duration::from_secs(self.config.poll_interval_secs),
            Duration::from_secs(self.config.poll_deadline_secs),
        )
        .await?;

        if task.status == ImportStatus::Failed {
            let detail = task
                .result_summary
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "<no summary>".to_string());
            bail!("import task {} reported failure: {detail}", task.task_id);
        }

        let version = finalize(
            self.target.as_ref(),
            profile,
            &task,
            counts,
            &snapshot.raw,
            &self.cache,
            &self.ledger,
        )
        .await?;
        info!(version_id = %version.version_id, "created repository version");

        let summary = self.summary(
            run_id,
            profile,
            started_at,
            source_canonical.len(),
            target_canonical.len(),
            changes.entry_count(),
            counts,
            RunOutcome::Applied {
                version_id: version.version_id,
                operations: script.len(),
            },
        );
        self.write_summary(&summary).await?;
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    fn summary(
        &self,
        run_id: Uuid,
        profile: &DatasetProfile,
        started_at: DateTime<Utc>,
        source_records: usize,
        target_records: usize,
        diff_entries: usize,
        counts: OperationCounts,
        outcome: RunOutcome,
    ) -> SyncRunSummary {
        SyncRunSummary {
            run_id,
            dataset_id: profile.dataset_id.clone(),
            repository: profile.repository.clone(),
            started_at,
            finished_at: Utc::now(),
            source_records,
            target_records,
            diff_entries,
            counts,
            outcome,
        }
    }

    fn reports_dir(&self, run_id: Uuid, profile: &DatasetProfile) -> PathBuf {
        self.config
            .workspace_root
            .join("reports")
            .join(run_id.to_string())
            .join(&profile.dataset_id)
    }

    async fn write_change_script(
        &self,
        run_id: Uuid,
        profile: &DatasetProfile,
        script: &[ChangeOperation],
    ) -> Result<PathBuf> {
        let dir = self.reports_dir(run_id, profile);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join("change_script.json");
        let bytes = serde_json::to_vec_pretty(script).context("serializing change script")?;
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }

    async fn write_summary(&self, summary: &SyncRunSummary) -> Result<()> {
        let dir = self
            .config
            .workspace_root
            .join("reports")
            .join(summary.run_id.to_string())
            .join(&summary.dataset_id);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join("summary.json");
        let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

/// Build a pipeline from config alone, choosing live or fixture clients.
pub fn pipeline_from_config(config: SyncConfig, dry_run: bool) -> Result<SyncPipeline> {
    let (source, target): (Arc<dyn SourceSystem>, Arc<dyn TargetRepository>) = if config.offline {
        (
            Arc::new(FixtureSourceSystem::new(config.workspace_root.clone())),
            Arc::new(FixtureTargetRepository::new(config.workspace_root.clone())),
        )
    } else {
        let http_config = HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        };
        let source_http = HttpClient::new(http_config.clone(), config.source_token.clone())?;
        let target_http = HttpClient::new(http_config, config.target_token.clone())?;
        (
            Arc::new(HttpSourceSystem::new(
                config.source_base_url.clone(),
                source_http,
            )),
            Arc::new(HttpTargetRepository::new(
                config.target_base_url.clone(),
                config.target_owner.clone(),
                config.sync_attribute.clone(),
                target_http,
            )),
        )
    };
    Ok(SyncPipeline::new(config, source, target).with_dry_run(dry_run))
}

pub async fn run_sync_once_from_env(offline: bool, dry_run: bool) -> Result<Vec<SyncRunSummary>> {
    let mut config = SyncConfig::from_env();
    if offline {
        config.offline = true;
    }
    let pipeline = pipeline_from_config(config, dry_run)?;
    pipeline.run_once().await
}

/// Render a markdown digest of the most recent runs from the reports
/// directory, newest first.
pub fn report_recent_markdown(runs: usize, workspace_root: Option<PathBuf>) -> Result<String> {
    let root = workspace_root.unwrap_or_else(|| PathBuf::from("."));
    let reports_root = root.join("reports");
    let mut dirs = std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();
    let dirs = dirs.into_iter().take(runs.max(1)).collect::<Vec<_>>();

    let mut lines = vec!["# DictSync Recent Runs".to_string(), String::new()];
    for dir in dirs {
        let run_id = dir.file_name().to_string_lossy().to_string();
        lines.push(format!("## Run `{run_id}`"));
        let mut dataset_dirs = std::fs::read_dir(dir.path())
            .with_context(|| format!("reading {}", dir.path().display()))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
            .collect::<Vec<_>>();
        dataset_dirs.sort_by_key(|e| e.file_name());
        for dataset_dir in dataset_dirs {
            let dataset = dataset_dir.file_name().to_string_lossy().to_string();
            let summary_path = dataset_dir.path().join("summary.json");
            let summary: JsonValue = serde_json::from_str(
                &std::fs::read_to_string(&summary_path)
                    .with_context(|| format!("reading {}", summary_path.display()))?,
            )
            .with_context(|| format!("parsing {}", summary_path.display()))?;
            let outcome = summary["outcome"]["kind"].as_str().unwrap_or("unknown");
            let counts = &summary["counts"];
            lines.push(format!(
                "- {dataset}: {outcome} ({} created, {} updated, {} retired)",
                counts["created"].as_u64().unwrap_or(0),
                counts["updated"].as_u64().unwrap_or(0),
                counts["retired"].as_u64().unwrap_or(0),
            ));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

/// Wire the two configured cron expressions to full pipeline runs.
pub async fn maybe_build_scheduler(config: &SyncConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in [&config.sync_cron_1, &config.sync_cron_2] {
        let job_config = config.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let config = job_config.clone();
            Box::pin(async move {
                match pipeline_from_config(config, false) {
                    Ok(pipeline) => {
                        if let Err(err) = pipeline.run_once().await {
                            error!(error = %format!("{err:#}"), "scheduled sync run failed");
                        }
                    }
                    Err(err) => {
                        error!(error = %format!("{err:#}"), "building scheduled pipeline failed");
                    }
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dictsync_core::SnapshotOrigin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn profile() -> DatasetProfile {
        let mut profile = DatasetProfile::new("lab-panels", "hq/CoreDictionary");
        profile.membership_fields = vec!["answers".to_string()];
        profile
    }

    fn src(code: &str, name: &str, answers: &[&str]) -> JsonValue {
        json!({
            "code": code,
            "name": name,
            "class": "Diagnosis",
            "answers": answers,
        })
    }

    fn snapshot_of(records: Vec<JsonValue>) -> RepositorySnapshot {
        let raw = serde_json::to_vec(&records).expect("serialize records");
        RepositorySnapshot::new(SnapshotOrigin::Source, "lab-panels", Utc::now(), records, raw)
    }

    fn export_entity(code: &str, name: &str) -> JsonValue {
        json!({
            "id": code,
            "type": "concept",
            "name": name,
            "class": "Diagnosis",
            "uuid": "server-assigned",
            "updated_on": "2026-08-01T00:00:00Z",
        })
    }

    fn export_relation(from: &str, field: &str, to: &str) -> JsonValue {
        json!({
            "id": format!("{from}:{field}:{to}"),
            "type": "mapping",
            "map_type": field,
            "from": from,
            "to": to,
            "uuid": "server-assigned",
            "updated_on": "2026-08-01T00:00:00Z",
        })
    }

    #[test]
    fn diff_of_identical_canonical_sets_is_empty() {
        let profile = profile();
        let snapshot = snapshot_of(vec![src("ANEMIA", "Anemia", &["MILD", "SEVERE"])]);
        let shaped = transform_snapshot(&snapshot, &profile).expect("transform");
        let canonical = canonicalize(&shaped, &profile, "canonicalize-source").expect("canon");
        assert!(diff(&canonical, &canonical).is_empty());
    }

    #[test]
    fn transform_is_deterministic_and_byte_stable() {
        let profile = profile();
        let snapshot = snapshot_of(vec![src("ANEMIA", "Anemia", &["MILD", "SEVERE"])]);
        let first = transform_snapshot(&snapshot, &profile).expect("transform");
        let second = transform_snapshot(&snapshot, &profile).expect("transform");
        assert_eq!(
            serde_json::to_vec(&first).expect("serialize"),
            serde_json::to_vec(&second).expect("serialize")
        );
    }

    #[test]
    fn transform_rejects_record_without_natural_key() {
        let profile = profile();
        let err = transform_record(&profile, &json!({ "name": "No code here" }))
            .expect_err("must reject");
        assert!(matches!(err, SyncError::MalformedRecord { stage: "transform", .. }));
    }

    #[test]
    fn volatile_only_changes_produce_an_empty_diff() {
        let profile = profile();
        let snapshot = snapshot_of(vec![src("ANEMIA", "Anemia", &["MILD"])]);
        let shaped = transform_snapshot(&snapshot, &profile).expect("transform");
        let source_canonical =
            canonicalize(&shaped, &profile, "canonicalize-source").expect("canon");

        // Target export carries different server-generated volatile values.
        let export = vec![
            export_entity("ANEMIA", "Anemia"),
            export_relation("ANEMIA", "answers", "MILD"),
        ];
        let target_canonical =
            canonicalize(&export, &profile, "canonicalize-target").expect("canon");

        assert!(diff(&target_canonical, &source_canonical).is_empty());
    }

    #[test]
    fn added_and_removed_entities_become_create_and_retire() {
        let profile = profile();
        let snapshot = snapshot_of(vec![
            src("A", "Alpha", &[]),
            src("C", "Gamma", &[]),
        ]);
        let shaped = transform_snapshot(&snapshot, &profile).expect("transform");
        let source_canonical =
            canonicalize(&shaped, &profile, "canonicalize-source").expect("canon");

        let export = vec![export_entity("A", "Alpha"), export_entity("B", "Beta")];
        let target_canonical =
            canonicalize(&export, &profile, "canonicalize-target").expect("canon");

        let changes = diff(&target_canonical, &source_canonical);
        assert_eq!(changes.added.len(), 1);
        assert_eq!(changes.added[0].natural_key, "C");
        assert_eq!(changes.removed, vec!["B".to_string()]);
        assert!(changes.changed.is_empty());

        let script = build_change_script(&changes, &target_canonical);
        assert_eq!(script.len(), 2);
        assert_eq!(script[0].kind, OperationKind::Retire);
        assert_eq!(script[0].natural_key, "B");
        assert_eq!(script[1].kind, OperationKind::Create);
        assert_eq!(script[1].natural_key, "C");

        // Stable output: regenerating from the same diff is byte-identical.
        let again = build_change_script(&changes, &target_canonical);
        assert_eq!(
            serde_json::to_vec(&script).expect("serialize"),
            serde_json::to_vec(&again).expect("serialize")
        );
    }

    #[test]
    fn entity_creates_precede_relation_creates_referencing_them() {
        let profile = profile();
        let snapshot = snapshot_of(vec![
            src("E", "Entity E", &["G"]),
            src("G", "Group G", &[]),
        ]);
        let shaped = transform_snapshot(&snapshot, &profile).expect("transform");
        let source_canonical =
            canonicalize(&shaped, &profile, "canonicalize-source").expect("canon");
        let target_canonical = BTreeMap::new();

        let changes = diff(&target_canonical, &source_canonical);
        let script = build_change_script(&changes, &target_canonical);

        let pos = |key: &str| {
            script
                .iter()
                .position(|op| op.natural_key == key)
                .unwrap_or_else(|| panic!("operation for {key} missing"))
        };
        assert!(pos("E") < pos("E:answers:G"));
        assert!(pos("G") < pos("E:answers:G"));
    }

    fn apply_script(
        prior: &BTreeMap<String, CanonicalRecord>,
        script: &[ChangeOperation],
    ) -> BTreeMap<String, CanonicalRecord> {
        let mut state = prior.clone();
        for op in script {
            match op.kind {
                OperationKind::Create | OperationKind::Update => {
                    let fields: BTreeMap<String, JsonValue> =
                        serde_json::from_value(op.payload["fields"].clone()).expect("fields");
                    let relations: BTreeSet<String> =
                        serde_json::from_value(op.payload["relations"].clone())
                            .expect("relations");
                    state.insert(
                        op.natural_key.clone(),
                        CanonicalRecord {
                            natural_key: op.natural_key.clone(),
                            kind: op.target,
                            fields,
                            relations,
                        },
                    );
                }
                OperationKind::Retire => {
                    state.remove(&op.natural_key);
                }
            }
        }
        state
    }

    #[test]
    fn applying_the_script_round_trips_to_the_source_state() {
        let profile = profile();
        let snapshot = snapshot_of(vec![
            src("ANEMIA", "Anemia (revised)", &["MILD", "SEVERE"]),
            src("FEVER", "Fever", &[]),
        ]);
        let shaped = transform_snapshot(&snapshot, &profile).expect("transform");
        let source_canonical =
            canonicalize(&shaped, &profile, "canonicalize-source").expect("canon");

        let export = vec![
            export_entity("ANEMIA", "Anemia"),
            export_relation("ANEMIA", "answers", "MILD"),
            export_entity("STALE", "Retired soon"),
        ];
        let target_canonical =
            canonicalize(&export, &profile, "canonicalize-target").expect("canon");

        let changes = diff(&target_canonical, &source_canonical);
        let script = build_change_script(&changes, &target_canonical);
        let applied = apply_script(&target_canonical, &script);

        assert_eq!(applied, source_canonical);
    }

    struct FakeTarget {
        export: Mutex<Vec<JsonValue>>,
        submissions: AtomicUsize,
        versions: AtomicUsize,
        pending_forever: bool,
        reject_submissions: bool,
    }

    impl FakeTarget {
        fn new(export: Vec<JsonValue>) -> Self {
            Self {
                export: Mutex::new(export),
                submissions: AtomicUsize::new(0),
                versions: AtomicUsize::new(0),
                pending_forever: false,
                reject_submissions: false,
            }
        }
    }

    #[async_trait]
    impl TargetRepository for FakeTarget {
        async fn list_active_datasets(
            &self,
        ) -> Result<Vec<dictsync_client::DatasetRef>, SyncError> {
            Ok(Vec::new())
        }

        async fn fetch_latest_export(
            &self,
            repository: &str,
        ) -> Result<RepositorySnapshot, SyncError> {
            let records = self.export.lock().expect("export lock").clone();
            let raw = serde_json::to_vec(&records).expect("serialize export");
            Ok(RepositorySnapshot::new(
                SnapshotOrigin::Target,
                repository,
                Utc::now(),
                records,
                raw,
            ))
        }

        async fn submit_bulk(
            &self,
            _repository: &str,
            script: &[ChangeOperation],
        ) -> Result<ImportTask, SyncError> {
            if self.reject_submissions {
                return Err(SyncError::SubmissionRejected {
                    reason: "status 400: unknown operation kind".to_string(),
                    script_path: "<not yet persisted>".to_string(),
                });
            }
            self.submissions.fetch_add(1, Ordering::SeqCst);
            let status = if self.pending_forever {
                ImportStatus::Pending
            } else {
                ImportStatus::Succeeded
            };
            Ok(ImportTask {
                task_id: "task-1".to_string(),
                status,
                result_summary: Some(json!({ "accepted": script.len() })),
            })
        }

        async fn poll_task(&self, task_id: &str) -> Result<ImportTask, SyncError> {
            let status = if self.pending_forever {
                ImportStatus::Pending
            } else {
                ImportStatus::Succeeded
            };
            Ok(ImportTask {
                task_id: task_id.to_string(),
                status,
                result_summary: None,
            })
        }

        async fn create_version(
            &self,
            _repository: &str,
            version_id: &str,
            description: &str,
        ) -> Result<RepositoryVersion, SyncError> {
            self.versions.fetch_add(1, Ordering::SeqCst);
            Ok(RepositoryVersion {
                version_id: version_id.to_string(),
                created_at: Utc::now(),
                description: description.to_string(),
                released: true,
            })
        }
    }

    fn test_config(workspace: &Path, state: &Path) -> SyncConfig {
        SyncConfig {
            source_base_url: "http://unused".to_string(),
            source_token: None,
            target_base_url: "http://unused".to_string(),
            target_token: None,
            target_owner: "hq".to_string(),
            sync_attribute: "dictsync".to_string(),
            state_dir: state.to_path_buf(),
            workspace_root: workspace.to_path_buf(),
            offline: true,
            poll_interval_secs: 0,
            poll_deadline_secs: 5,
            scheduler_enabled: false,
            sync_cron_1: "0 6 * * *".to_string(),
            sync_cron_2: "0 18 * * *".to_string(),
            user_agent: "dictsync-test".to_string(),
            http_timeout_secs: 5,
        }
    }

    fn write_source_fixture(workspace: &Path, dataset_id: &str, records: &[JsonValue]) {
        let dir = workspace.join("fixtures").join(dataset_id);
        std::fs::create_dir_all(&dir).expect("fixture dir");
        std::fs::write(
            dir.join("source.json"),
            serde_json::to_vec_pretty(records).expect("serialize fixture"),
        )
        .expect("write fixture");
    }

    #[tokio::test]
    async fn second_unchanged_run_short_circuits_without_a_new_version() {
        let workspace = tempdir().expect("workspace");
        let state = tempdir().expect("state");
        let profile = profile();
        write_source_fixture(
            workspace.path(),
            &profile.dataset_id,
            &[src("HB", "Hemoglobin", &[])],
        );

        let target = Arc::new(FakeTarget::new(Vec::new()));
        let pipeline = SyncPipeline::new(
            test_config(workspace.path(), state.path()),
            Arc::new(FixtureSourceSystem::new(workspace.path())),
            target.clone(),
        );

        let first = pipeline.run_dataset(&profile).await.expect("first run");
        assert!(matches!(first.outcome, RunOutcome::Applied { .. }));
        assert_eq!(target.submissions.load(Ordering::SeqCst), 1);
        assert_eq!(target.versions.load(Ordering::SeqCst), 1);

        let second = pipeline.run_dataset(&profile).await.expect("second run");
        assert_eq!(second.outcome, RunOutcome::NoChange);
        assert_eq!(target.submissions.load(Ordering::SeqCst), 1);
        assert_eq!(target.versions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dry_run_writes_the_script_but_never_submits() {
        let workspace = tempdir().expect("workspace");
        let state = tempdir().expect("state");
        let profile = profile();
        write_source_fixture(
            workspace.path(),
            &profile.dataset_id,
            &[src("HB", "Hemoglobin", &[])],
        );

        let target = Arc::new(FakeTarget::new(Vec::new()));
        let pipeline = SyncPipeline::new(
            test_config(workspace.path(), state.path()),
            Arc::new(FixtureSourceSystem::new(workspace.path())),
            target.clone(),
        )
        .with_dry_run(true);

        let summary = pipeline.run_dataset(&profile).await.expect("dry run");
        assert_eq!(summary.outcome, RunOutcome::DryRun { operations: 1 });
        assert_eq!(target.submissions.load(Ordering::SeqCst), 0);

        let script_path = workspace
            .path()
            .join("reports")
            .join(summary.run_id.to_string())
            .join(&profile.dataset_id)
            .join("change_script.json");
        assert!(script_path.exists());
    }

    #[tokio::test]
    async fn polling_past_the_deadline_times_out_without_versioning() {
        let mut target = FakeTarget::new(Vec::new());
        target.pending_forever = true;
        let target = Arc::new(target);

        let script = vec![ChangeOperation {
            kind: OperationKind::Create,
            target: RecordKind::Entity,
            natural_key: "HB".to_string(),
            payload: json!({ "id": "HB", "fields": {}, "relations": [] }),
        }];
        let err = submit_and_wait(
            target.as_ref(),
            "hq/CoreDictionary",
            &script,
            Path::new("/tmp/script.json"),
            Duration::from_millis(1),
            Duration::from_millis(5),
        )
        .await
        .expect_err("must time out");

        assert!(matches!(err, SyncError::ImportTimedOut { .. }));
        assert_eq!(target.versions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejected_submission_reports_the_preserved_script_path() {
        let mut target = FakeTarget::new(Vec::new());
        target.reject_submissions = true;
        let target = Arc::new(target);

        let err = submit_and_wait(
            target.as_ref(),
            "hq/CoreDictionary",
            &[],
            Path::new("/workspace/reports/run/ds/change_script.json"),
            Duration::from_millis(1),
            Duration::from_millis(5),
        )
        .await
        .expect_err("must be rejected");

        match err {
            SyncError::SubmissionRejected { script_path, .. } => {
                assert_eq!(script_path, "/workspace/reports/run/ds/change_script.json");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn concurrent_runs_on_one_repository_are_refused() {
        let workspace = tempdir().expect("workspace");
        let state = tempdir().expect("state");
        let profile = profile();
        write_source_fixture(
            workspace.path(),
            &profile.dataset_id,
            &[src("HB", "Hemoglobin", &[])],
        );

        let pipeline = SyncPipeline::new(
            test_config(workspace.path(), state.path()),
            Arc::new(FixtureSourceSystem::new(workspace.path())),
            Arc::new(FakeTarget::new(Vec::new())),
        );

        let held = pipeline
            .marker
            .acquire(&profile.repository, Uuid::new_v4())
            .await
            .expect("hold marker");

        let err = pipeline
            .run_dataset(&profile)
            .await
            .expect_err("run must refuse while marker held");
        assert!(err.to_string().contains("already being synchronized"));

        held.release().await.expect("release");
    }
}
