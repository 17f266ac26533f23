//! Persistent mutable state for DictSync runs.
//!
//! Three things survive between runs: the cached baseline source snapshot per
//! dataset, the "currently synchronizing" marker per repository, and the
//! ledger of last-created versions. Everything else is ephemeral.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use dictsync_core::RepositoryVersion;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "dictsync-state";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("repository {repository} is already being synchronized (run {holder})")]
    MarkerHeld { repository: String, holder: Uuid },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Baseline source snapshots, one file per dataset, written atomically via a
/// temp file + rename so a crashed run never leaves a torn baseline behind.
#[derive(Debug, Clone)]
pub struct SnapshotCache {
    root: PathBuf,
}

impl SnapshotCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn baseline_path(&self, dataset_id: &str) -> PathBuf {
        self.root.join("baselines").join(format!("{dataset_id}.json"))
    }

    pub async fn load(&self, dataset_id: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.baseline_path(dataset_id);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("reading baseline {}", path.display()))
            }
        }
    }

    /// Cheap pre-check: does the freshly fetched body match the cached
    /// baseline byte for byte? Length first, then contents.
    pub async fn matches(&self, dataset_id: &str, body: &[u8]) -> anyhow::Result<bool> {
        match self.load(dataset_id).await? {
            Some(cached) => Ok(cached.len() == body.len() && cached == body),
            None => Ok(false),
        }
    }

    /// Replace the baseline atomically. Only called after the corresponding
    /// state has actually been committed to the target.
    pub async fn replace(&self, dataset_id: &str, body: &[u8]) -> anyhow::Result<()> {
        let path = self.baseline_path(dataset_id);
        let parent = path
            .parent()
            .expect("baseline path always has parent")
            .to_path_buf();
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating baseline directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), body.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp baseline {}", temp_path.display()))?;
        file.write_all(body)
            .await
            .with_context(|| format!("writing temp baseline {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp baseline {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming baseline {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }
        debug!(dataset_id, hash = %sha256_hex(body), "baseline rotated");
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MarkerFile {
    run_id: Uuid,
    acquired_at: DateTime<Utc>,
}

/// Guard for the per-repository mutual-exclusion marker. Released explicitly;
/// a crashed run leaves the file behind for the operator to inspect and clear.
#[derive(Debug)]
pub struct MarkerGuard {
    path: PathBuf,
    pub run_id: Uuid,
}

impl MarkerGuard {
    pub async fn release(self) -> anyhow::Result<()> {
        fs::remove_file(&self.path)
            .await
            .with_context(|| format!("removing sync marker {}", self.path.display()))
    }
}

/// At most one run per target repository may hold the marker at a time.
#[derive(Debug, Clone)]
pub struct SyncMarker {
    root: PathBuf,
}

impl SyncMarker {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn marker_path(&self, repository: &str) -> PathBuf {
        self.root
            .join("markers")
            .join(format!("{}.lock", repository.replace('/', "__")))
    }

    pub async fn acquire(&self, repository: &str, run_id: Uuid) -> Result<MarkerGuard, StateError> {
        let path = self.marker_path(repository);
        let parent = path.parent().expect("marker path always has parent");
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating marker directory {}", parent.display()))?;

        let body = serde_json::to_vec_pretty(&MarkerFile {
            run_id,
            acquired_at: Utc::now(),
        })
        .context("serializing sync marker")?;

        let open_result = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .await;
        match open_result {
            Ok(mut file) => {
                file.write_all(&body)
                    .await
                    .with_context(|| format!("writing sync marker {}", path.display()))?;
                file.flush()
                    .await
                    .with_context(|| format!("flushing sync marker {}", path.display()))?;
                Ok(MarkerGuard {
                    path,
                    run_id,
                })
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = match fs::read(&path).await {
                    Ok(bytes) => serde_json::from_slice::<MarkerFile>(&bytes)
                        .map(|m| m.run_id)
                        .unwrap_or(Uuid::nil()),
                    Err(_) => Uuid::nil(),
                };
                Err(StateError::MarkerHeld {
                    repository: repository.to_string(),
                    holder,
                })
            }
            Err(err) => Err(StateError::Other(anyhow::Error::new(err).context(format!(
                "creating sync marker {}",
                path.display()
            )))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LedgerFile {
    #[serde(default)]
    datasets: std::collections::BTreeMap<String, RepositoryVersion>,
}

/// Last version created per dataset; the durable proof a sync cycle finished
/// and the anchor for resuming after a crash between runs.
#[derive(Debug, Clone)]
pub struct VersionLedger {
    path: PathBuf,
}

impl VersionLedger {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            path: root.into().join("versions.json"),
        }
    }

    async fn load(&self) -> anyhow::Result<LedgerFile> {
        match fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing version ledger {}", self.path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(LedgerFile::default()),
            Err(err) => Err(err)
                .with_context(|| format!("reading version ledger {}", self.path.display())),
        }
    }

    pub async fn last_version(
        &self,
        dataset_id: &str,
    ) -> anyhow::Result<Option<RepositoryVersion>> {
        Ok(self.load().await?.datasets.get(dataset_id).cloned())
    }

    pub async fn record(
        &self,
        dataset_id: &str,
        version: RepositoryVersion,
    ) -> anyhow::Result<()> {
        let mut ledger = self.load().await?;
        ledger.datasets.insert(dataset_id.to_string(), version);
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating ledger directory {}", parent.display()))?;
        }
        let bytes = serde_json::to_vec_pretty(&ledger).context("serializing version ledger")?;
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, &bytes)
            .await
            .with_context(|| format!("writing temp ledger {}", temp_path.display()))?;
        fs::rename(&temp_path, &self.path)
            .await
            .with_context(|| format!("renaming ledger into place {}", self.path.display()))?;
        Ok(())
    }
}
