//! Remote-system contracts + HTTP and fixture-backed implementations.
//!
//! The pipeline only ever talks to the [`SourceSystem`] and
//! [`TargetRepository`] traits; it never learns whether records came over the
//! wire or out of a local fixture directory.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use dictsync_core::{
    ChangeOperation, ImportStatus, ImportTask, RepositorySnapshot, RepositoryVersion,
    SnapshotOrigin, SyncError,
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dictsync-client";

/// One dataset the target repository has marked for synchronization: an
/// organizing collection carrying the source dataset's external id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRef {
    pub collection_id: String,
    pub external_id: String,
    pub repository: String,
}

/// Read-only view of the external catalog.
#[async_trait]
pub trait SourceSystem: Send + Sync {
    /// Full current-state snapshot of one dataset's records.
    async fn fetch_snapshot(&self, dataset_id: &str) -> Result<RepositorySnapshot, SyncError>;
}

/// The versioned repository receiving synchronized records.
#[async_trait]
pub trait TargetRepository: Send + Sync {
    /// Collections flagged for sync, each pointing at a source dataset.
    async fn list_active_datasets(&self) -> Result<Vec<DatasetRef>, SyncError>;

    /// Export of the latest *released* version of a repository.
    async fn fetch_latest_export(&self, repository: &str)
        -> Result<RepositorySnapshot, SyncError>;

    /// Submit one all-or-nothing bulk change script; returns a task handle.
    async fn submit_bulk(
        &self,
        repository: &str,
        script: &[ChangeOperation],
    ) -> Result<ImportTask, SyncError>;

    /// Read back the current state of a previously submitted task.
    async fn poll_task(&self, task_id: &str) -> Result<ImportTask, SyncError>;

    /// Create a released version of a repository.
    async fn create_version(
        &self,
        repository: &str,
        version_id: &str,
        description: &str,
    ) -> Result<RepositoryVersion, SyncError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body_snippet}")]
    HttpStatus {
        status: u16,
        url: String,
        body_snippet: String,
    },
}

impl HttpError {
    pub fn status(&self) -> Option<u16> {
        match self {
            HttpError::HttpStatus { status, .. } => Some(*status),
            HttpError::Request(_) => None,
        }
    }
}

/// Thin wrapper over `reqwest` with status classification and capped
/// exponential backoff. GETs are retried; POSTs are sent exactly once so a
/// bulk submission can never be duplicated by the transport layer.
#[derive(Debug)]
pub struct HttpClient {
    client: reqwest::Client,
    backoff: BackoffPolicy,
    token: Option<String>,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig, token: Option<String>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
            token,
        })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.header("Authorization", format!("Token {token}")),
            None => req,
        }
    }

    pub async fn get_bytes(&self, url: &str) -> Result<(StatusCode, Vec<u8>), HttpError> {
        let span = info_span!("http_get", url);
        self.get_bytes_inner(url).instrument(span).await
    }

    async fn get_bytes_inner(&self, url: &str) -> Result<(StatusCode, Vec<u8>), HttpError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let resp_result = self.authorize(self.client.get(url)).send().await;
            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let body = resp.bytes().await?.to_vec();

                    if status.is_success() {
                        return Ok((status, body));
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(HttpError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        body_snippet: snippet(&body),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(HttpError::Request(err));
                }
            }
        }

        Err(HttpError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }

    /// Single-attempt POST; the caller decides whether re-sending is safe.
    pub async fn post_json(
        &self,
        url: &str,
        body: &JsonValue,
    ) -> Result<(StatusCode, Vec<u8>), HttpError> {
        let span = info_span!("http_post", url);
        async {
            let resp = self.authorize(self.client.post(url)).json(body).send().await?;
            let status = resp.status();
            let bytes = resp.bytes().await?.to_vec();
            Ok((status, bytes))
        }
        .instrument(span)
        .await
    }
}

fn snippet(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim();
    if trimmed.chars().count() > 200 {
        let cut: String = trimmed.chars().take(200).collect();
        format!("{cut}…")
    } else {
        trimmed.to_string()
    }
}

fn parse_record_array(body: &[u8]) -> Result<Vec<JsonValue>, serde_json::Error> {
    serde_json::from_slice::<Vec<JsonValue>>(body)
}

/// Live catalog over HTTP.
#[derive(Debug)]
pub struct HttpSourceSystem {
    base_url: String,
    http: HttpClient,
}

impl HttpSourceSystem {
    pub fn new(base_url: impl Into<String>, http: HttpClient) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        }
    }
}

#[async_trait]
impl SourceSystem for HttpSourceSystem {
    async fn fetch_snapshot(&self, dataset_id: &str) -> Result<RepositorySnapshot, SyncError> {
        let url = format!(
            "{}/records?dataset={}&includeRetired=false",
            self.base_url, dataset_id
        );
        let (status, body) =
            self.http
                .get_bytes(&url)
                .await
                .map_err(|err| SyncError::SourceUnavailable {
                    dataset_id: dataset_id.to_string(),
                    reason: err.to_string(),
                })?;
        if !status.is_success() {
            return Err(SyncError::SourceUnavailable {
                dataset_id: dataset_id.to_string(),
                reason: format!("status {status}"),
            });
        }
        let records = parse_record_array(&body).map_err(|err| SyncError::SourceUnavailable {
            dataset_id: dataset_id.to_string(),
            reason: format!("unparseable snapshot body: {err}"),
        })?;
        Ok(RepositorySnapshot::new(
            SnapshotOrigin::Source,
            dataset_id,
            Utc::now(),
            records,
            body,
        ))
    }
}

#[derive(Debug, Deserialize)]
struct CollectionRow {
    id: String,
    external_id: Option<String>,
    repository: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskRow {
    task_id: String,
    status: String,
    #[serde(default)]
    result_summary: Option<JsonValue>,
}

fn task_from_row(row: TaskRow, stage: &'static str) -> Result<ImportTask, SyncError> {
    let status = match row.status.as_str() {
        "pending" => ImportStatus::Pending,
        "running" => ImportStatus::Running,
        "succeeded" => ImportStatus::Succeeded,
        "failed" => ImportStatus::Failed,
        other => {
            return Err(SyncError::Transport {
                stage,
                reason: format!("unknown task status `{other}` for task {}", row.task_id),
            })
        }
    };
    Ok(ImportTask {
        task_id: row.task_id,
        status,
        result_summary: row.result_summary,
    })
}

/// Live target repository over HTTP, scoped to one owner (organization).
#[derive(Debug)]
pub struct HttpTargetRepository {
    base_url: String,
    owner: String,
    sync_attribute: String,
    http: HttpClient,
}

impl HttpTargetRepository {
    pub fn new(
        base_url: impl Into<String>,
        owner: impl Into<String>,
        sync_attribute: impl Into<String>,
        http: HttpClient,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            owner: owner.into(),
            sync_attribute: sync_attribute.into(),
            http,
        }
    }

    fn repo_url(&self, repository: &str, tail: &str) -> String {
        format!("{}/{}/{repository}/{tail}", self.base_url, self.owner)
    }
}

#[async_trait]
impl TargetRepository for HttpTargetRepository {
    async fn list_active_datasets(&self) -> Result<Vec<DatasetRef>, SyncError> {
        let url = format!(
            "{}/{}/collections?attribute={}",
            self.base_url, self.owner, self.sync_attribute
        );
        let (status, body) = self
            .http
            .get_bytes(&url)
            .await
            .map_err(|err| SyncError::Transport {
                stage: "discover",
                reason: err.to_string(),
            })?;
        if !status.is_success() {
            return Err(SyncError::Transport {
                stage: "discover",
                reason: format!("status {status} listing collections"),
            });
        }
        let rows: Vec<CollectionRow> =
            serde_json::from_slice(&body).map_err(|err| SyncError::Transport {
                stage: "discover",
                reason: format!("unparseable collection list: {err}"),
            })?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let external_id = row.external_id?;
                let repository = row.repository?;
                Some(DatasetRef {
                    collection_id: row.id,
                    external_id,
                    repository,
                })
            })
            .collect())
    }

    async fn fetch_latest_export(
        &self,
        repository: &str,
    ) -> Result<RepositorySnapshot, SyncError> {
        let url = self.repo_url(repository, "latest/export");
        let (status, body) = self
            .http
            .get_bytes(&url)
            .await
            .map_err(|err| match err.status() {
                Some(404) => SyncError::ExportNotReady {
                    repository: repository.to_string(),
                },
                _ => SyncError::Transport {
                    stage: "fetch-target-export",
                    reason: err.to_string(),
                },
            })?;
        if status == StatusCode::NO_CONTENT {
            // Export generation still running on the target side.
            return Err(SyncError::ExportNotReady {
                repository: repository.to_string(),
            });
        }
        let records = parse_record_array(&body).map_err(|err| SyncError::Transport {
            stage: "fetch-target-export",
            reason: format!("unparseable export body: {err}"),
        })?;
        Ok(RepositorySnapshot::new(
            SnapshotOrigin::Target,
            repository,
            Utc::now(),
            records,
            body,
        ))
    }

    async fn submit_bulk(
        &self,
        repository: &str,
        script: &[ChangeOperation],
    ) -> Result<ImportTask, SyncError> {
        let url = self.repo_url(repository, "bulk");
        let body = serde_json::json!({ "operations": script });
        let (status, bytes) =
            self.http
                .post_json(&url, &body)
                .await
                .map_err(|err| SyncError::Transport {
                    stage: "submit",
                    reason: err.to_string(),
                })?;

        if status.is_client_error() {
            return Err(SyncError::SubmissionRejected {
                reason: format!("status {status}: {}", snippet(&bytes)),
                script_path: "<not yet persisted>".to_string(),
            });
        }
        if !status.is_success() {
            return Err(SyncError::Transport {
                stage: "submit",
                reason: format!("status {status}: {}", snippet(&bytes)),
            });
        }

        let row: TaskRow = serde_json::from_slice(&bytes).map_err(|err| SyncError::Transport {
            stage: "submit",
            reason: format!("unparseable task handle: {err}"),
        })?;
        task_from_row(row, "submit")
    }

    async fn poll_task(&self, task_id: &str) -> Result<ImportTask, SyncError> {
        let url = format!("{}/tasks/{task_id}", self.base_url);
        let (status, body) = self
            .http
            .get_bytes(&url)
            .await
            .map_err(|err| SyncError::Transport {
                stage: "poll",
                reason: err.to_string(),
            })?;
        if !status.is_success() {
            return Err(SyncError::Transport {
                stage: "poll",
                reason: format!("status {status} polling task {task_id}"),
            });
        }
        let row: TaskRow = serde_json::from_slice(&body).map_err(|err| SyncError::Transport {
            stage: "poll",
            reason: format!("unparseable task body: {err}"),
        })?;
        task_from_row(row, "poll")
    }

    async fn create_version(
        &self,
        repository: &str,
        version_id: &str,
        description: &str,
    ) -> Result<RepositoryVersion, SyncError> {
        let url = self.repo_url(repository, "versions");
        let body = serde_json::json!({
            "id": version_id,
            "description": description,
            "released": true,
        });
        let (status, bytes) =
            self.http
                .post_json(&url, &body)
                .await
                .map_err(|err| SyncError::Transport {
                    stage: "version",
                    reason: err.to_string(),
                })?;
        if !status.is_success() {
            return Err(SyncError::Transport {
                stage: "version",
                reason: format!("status {status}: {}", snippet(&bytes)),
            });
        }
        serde_json::from_slice(&bytes).map_err(|err| SyncError::Transport {
            stage: "version",
            reason: format!("unparseable version descriptor: {err}"),
        })
    }
}

/// Fixture-backed catalog for offline runs: reads
/// `fixtures/<dataset>/source.json` under the workspace root.
#[derive(Debug, Clone)]
pub struct FixtureSourceSystem {
    root: PathBuf,
}

impl FixtureSourceSystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn snapshot_path(&self, dataset_id: &str) -> PathBuf {
        self.root
            .join("fixtures")
            .join(dataset_id)
            .join("source.json")
    }
}

#[async_trait]
impl SourceSystem for FixtureSourceSystem {
    async fn fetch_snapshot(&self, dataset_id: &str) -> Result<RepositorySnapshot, SyncError> {
        let path = self.snapshot_path(dataset_id);
        let body = tokio::fs::read(&path)
            .await
            .map_err(|err| SyncError::SourceUnavailable {
                dataset_id: dataset_id.to_string(),
                reason: format!("reading fixture {}: {err}", path.display()),
            })?;
        let records = parse_record_array(&body).map_err(|err| SyncError::SourceUnavailable {
            dataset_id: dataset_id.to_string(),
            reason: format!("parsing fixture {}: {err}", path.display()),
        })?;
        Ok(RepositorySnapshot::new(
            SnapshotOrigin::Source,
            dataset_id,
            Utc::now(),
            records,
            body,
        ))
    }
}

/// Fixture-backed target for offline runs. Exports come from
/// `fixtures/exports/<owner>__<repo>.json`; submissions succeed immediately
/// without mutating anything.
#[derive(Debug, Clone)]
pub struct FixtureTargetRepository {
    root: PathBuf,
}

impl FixtureTargetRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn export_path(&self, repository: &str) -> PathBuf {
        self.root
            .join("fixtures")
            .join("exports")
            .join(format!("{}.json", repository.replace('/', "__")))
    }
}

#[async_trait]
impl TargetRepository for FixtureTargetRepository {
    async fn list_active_datasets(&self) -> Result<Vec<DatasetRef>, SyncError> {
        let path = self.root.join("fixtures").join("datasets.json");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let body = tokio::fs::read(&path)
            .await
            .map_err(|err| SyncError::Transport {
                stage: "discover",
                reason: format!("reading fixture {}: {err}", path.display()),
            })?;
        serde_json::from_slice(&body).map_err(|err| SyncError::Transport {
            stage: "discover",
            reason: format!("parsing fixture {}: {err}", path.display()),
        })
    }

    async fn fetch_latest_export(
        &self,
        repository: &str,
    ) -> Result<RepositorySnapshot, SyncError> {
        let path = self.export_path(repository);
        let body = tokio::fs::read(&path)
            .await
            .map_err(|_| SyncError::ExportNotReady {
                repository: repository.to_string(),
            })?;
        let records = parse_record_array(&body).map_err(|err| SyncError::Transport {
            stage: "fetch-target-export",
            reason: format!("parsing fixture {}: {err}", path.display()),
        })?;
        Ok(RepositorySnapshot::new(
            SnapshotOrigin::Target,
            repository,
            Utc::now(),
            records,
            body,
        ))
    }

    async fn submit_bulk(
        &self,
        _repository: &str,
        script: &[ChangeOperation],
    ) -> Result<ImportTask, SyncError> {
        Ok(ImportTask {
            task_id: Uuid::new_v4().to_string(),
            status: ImportStatus::Succeeded,
            result_summary: Some(serde_json::json!({ "accepted": script.len() })),
        })
    }

    async fn poll_task(&self, task_id: &str) -> Result<ImportTask, SyncError> {
        Ok(ImportTask {
            task_id: task_id.to_string(),
            status: ImportStatus::Succeeded,
            result_summary: None,
        })
    }

    async fn create_version(
        &self,
        _repository: &str,
        version_id: &str,
        description: &str,
    ) -> Result<RepositoryVersion, SyncError> {
        Ok(RepositoryVersion {
            version_id: version_id.to_string(),
            created_at: Utc::now(),
            description: description.to_string(),
            released: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST),
            RetryDisposition::NonRetryable
        );
    }

    #[tokio::test]
    async fn fixture_source_preserves_raw_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dataset_dir = dir.path().join("fixtures").join("lab-panels");
        std::fs::create_dir_all(&dataset_dir).expect("mkdir");
        let body = serde_json::to_vec(&json!([
            { "code": "HB", "name": "Hemoglobin" }
        ]))
        .expect("serialize");
        std::fs::write(dataset_dir.join("source.json"), &body).expect("write fixture");

        let source = FixtureSourceSystem::new(dir.path());
        let snapshot = source.fetch_snapshot("lab-panels").await.expect("snapshot");
        assert_eq!(snapshot.origin, SnapshotOrigin::Source);
        assert_eq!(snapshot.records.len(), 1);
        assert_eq!(snapshot.raw, body);
    }

    #[tokio::test]
    async fn missing_fixture_export_is_not_ready() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = FixtureTargetRepository::new(dir.path());
        let err = target
            .fetch_latest_export("hq/CoreDictionary")
            .await
            .expect_err("no export fixture");
        assert!(matches!(err, SyncError::ExportNotReady { .. }));
    }

    #[tokio::test]
    async fn fixture_submission_reports_accepted_count() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = FixtureTargetRepository::new(dir.path());
        let task = target
            .submit_bulk("hq/CoreDictionary", &[])
            .await
            .expect("submit");
        assert_eq!(task.status, ImportStatus::Succeeded);
        assert_eq!(
            task.result_summary,
            Some(serde_json::json!({ "accepted": 0 }))
        );
    }
}
