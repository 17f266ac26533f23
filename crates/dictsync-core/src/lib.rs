//! Core domain model and error taxonomy for DictSync.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "dictsync-core";

/// Which system a snapshot was retrieved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotOrigin {
    Source,
    Target,
}

/// Full point-in-time record dump from one system. Immutable once fetched.
///
/// `raw` keeps the body exactly as it came off the wire (or out of a fixture
/// file); the baseline pre-check compares these bytes, never the parsed form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositorySnapshot {
    pub origin: SnapshotOrigin,
    pub dataset_id: String,
    pub fetched_at: DateTime<Utc>,
    pub records: Vec<JsonValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub raw: Vec<u8>,
}

impl RepositorySnapshot {
    pub fn new(
        origin: SnapshotOrigin,
        dataset_id: impl Into<String>,
        fetched_at: DateTime<Utc>,
        records: Vec<JsonValue>,
        raw: Vec<u8>,
    ) -> Self {
        Self {
            origin,
            dataset_id: dataset_id.into(),
            fetched_at,
            records,
            raw,
        }
    }
}

/// Whether a record is a standalone entity (concept) or a relation between
/// entities (mapping).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Entity,
    Relation,
}

/// Comparison-ready record: natural key, semantic fields, referenced keys.
///
/// Relations are a set, so two records that reference the same keys in a
/// different order are equal. Volatile fields (server timestamps, surrogate
/// UUIDs, audit metadata) must never appear in `fields`; the canonicalizer
/// strips them before construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub natural_key: String,
    pub kind: RecordKind,
    pub fields: BTreeMap<String, JsonValue>,
    pub relations: BTreeSet<String>,
}

impl CanonicalRecord {
    pub fn new(
        natural_key: impl Into<String>,
        kind: RecordKind,
        fields: BTreeMap<String, JsonValue>,
        relations: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            natural_key: natural_key.into(),
            kind,
            fields,
            relations: relations.into_iter().collect(),
        }
    }
}

/// Old and new canonical forms of one changed record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangedRecord {
    pub before: CanonicalRecord,
    pub after: CanonicalRecord,
}

/// Structural difference between two canonical record sets.
///
/// `added` is sorted by natural key, `removed` is sorted, `changed` is keyed
/// by natural key; the whole value serializes deterministically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffResult {
    pub added: Vec<CanonicalRecord>,
    pub removed: Vec<String>,
    pub changed: BTreeMap<String, ChangedRecord>,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.added.len() + self.removed.len() + self.changed.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Retire,
}

/// One step of a change script, in the target repository's bulk format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeOperation {
    pub kind: OperationKind,
    pub target: RecordKind,
    pub natural_key: String,
    pub payload: JsonValue,
}

/// Create/Update/Retire totals for a change script; feeds version descriptions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationCounts {
    pub created: usize,
    pub updated: usize,
    pub retired: usize,
}

impl OperationCounts {
    pub fn tally(script: &[ChangeOperation]) -> Self {
        let mut counts = Self::default();
        for op in script {
            match op.kind {
                OperationKind::Create => counts.created += 1,
                OperationKind::Update => counts.updated += 1,
                OperationKind::Retire => counts.retired += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.created + self.updated + self.retired
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl ImportStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ImportStatus::Succeeded | ImportStatus::Failed)
    }
}

/// Handle for a bulk import running on the target repository. The remote
/// system owns all mutation; DictSync only reads it back while polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportTask {
    pub task_id: String,
    pub status: ImportStatus,
    #[serde(default)]
    pub result_summary: Option<JsonValue>,
}

/// Immutable repository version created after a successful import. Durable
/// proof of a completed sync cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryVersion {
    pub version_id: String,
    pub created_at: DateTime<Utc>,
    pub description: String,
    pub released: bool,
}

/// Failure taxonomy for a pipeline run. Every variant names its stage so a
/// failed run is diagnosable without re-running verbose.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("source system unavailable for dataset {dataset_id}: {reason}")]
    SourceUnavailable { dataset_id: String, reason: String },

    #[error("no released export ready for repository {repository}")]
    ExportNotReady { repository: String },

    #[error("malformed record in {stage}: {problem}{}", natural_key.as_deref().map(|k| format!(" (natural key {k})")).unwrap_or_default())]
    MalformedRecord {
        stage: &'static str,
        natural_key: Option<String>,
        problem: String,
    },

    #[error("bulk submission rejected by target: {reason} (script preserved at {script_path})")]
    SubmissionRejected { reason: String, script_path: String },

    #[error("import task {task_id} still not terminal after {waited_secs}s; outcome unknown")]
    ImportTimedOut { task_id: String, waited_secs: u64 },

    #[error("import succeeded (task {task_id}) but versioning failed for {repository}: {reason}")]
    VersioningFailed {
        repository: String,
        task_id: String,
        reason: String,
    },

    #[error("transport failure in {stage}: {reason}")]
    Transport { stage: &'static str, reason: String },
}

impl SyncError {
    /// Pipeline stage the error belongs to.
    pub fn stage(&self) -> &'static str {
        match self {
            SyncError::SourceUnavailable { .. } => "fetch-source",
            SyncError::ExportNotReady { .. } => "fetch-target-export",
            SyncError::MalformedRecord { stage, .. } => stage,
            SyncError::SubmissionRejected { .. } => "submit",
            SyncError::ImportTimedOut { .. } => "poll",
            SyncError::VersioningFailed { .. } => "version",
            SyncError::Transport { stage, .. } => stage,
        }
    }

    /// Whether re-running the whole pipeline later can succeed without any
    /// operator intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::SourceUnavailable { .. }
                | SyncError::ExportNotReady { .. }
                | SyncError::Transport { .. }
        )
    }
}
