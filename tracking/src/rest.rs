//! REST backend speaking the tracking server's 2.0 HTTP protocol.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    entities::{
        ArtifactEntry, Experiment, LifecycleStage, RegisteredModel, Run, RunData, RunInfo,
        RunStatus,
    },
    store::{ModelRegistry, RecordStore},
};

const API_PREFIX: &str = "api/2.0/mlflow";
const ARTIFACT_PROXY_PREFIX: &str = "api/2.0/mlflow-artifacts/artifacts";
const PAGE_SIZE: u32 = 1000;

/// Errors surfaced by the REST transport.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Connection, TLS, or timeout failure.
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),
    /// The server answered with a structured error payload.
    #[error("server rejected request ({code}): {message}")]
    Api {
        /// Server-side error code, e.g. `RESOURCE_DOES_NOT_EXIST`.
        code: String,
        /// Server-provided message.
        message: String,
    },
    /// The server answered with a shape the client cannot interpret.
    #[error("unexpected response: {0}")]
    Protocol(String),
}

impl StoreError {
    fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { code, .. } if code == "RESOURCE_DOES_NOT_EXIST")
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    message: String,
}

/// Tracking store reached over HTTP.
#[derive(Debug)]
pub struct RestStore {
    base: String,
    client: Client,
}

impl RestStore {
    /// Builds a client for the given `http://` or `https://` base URI.
    pub fn new(base: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent("heartml/0.1")
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{API_PREFIX}/{path}", self.base)
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }
        let body = response.text().await.unwrap_or_default();
        let parsed: ApiErrorBody = serde_json::from_str(&body).unwrap_or(ApiErrorBody {
            error_code: status.as_str().to_string(),
            message: body,
        });
        Err(StoreError::Api {
            code: parsed.error_code,
            message: parsed.message,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, StoreError> {
        let response = self
            .client
            .get(self.endpoint(path))
            .query(query)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<T, StoreError> {
        let response = self
            .client
            .post(self.endpoint(path))
            .json(body)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn artifact_root(&self, run_id: &str) -> Result<String> {
        let response: GetRunResponse = self
            .get_json("runs/get", &[("run_id", run_id)])
            .await
            .with_context(|| format!("fetching run {run_id}"))?;
        response
            .run
            .info
            .artifact_uri
            .ok_or_else(|| anyhow!("run {run_id} has no artifact location"))
    }

    async fn download_tree(&self, run_id: &str, dest: &Path) -> Result<()> {
        // Breadth-first over the artifact tree; directories go back on
        // the worklist, files are fetched one at a time.
        let mut pending = vec![String::new()];
        while let Some(prefix) = pending.pop() {
            for entry in self.list_artifacts(run_id, &prefix).await? {
                if entry.is_dir {
                    pending.push(entry.path);
                    continue;
                }
                let response = self
                    .client
                    .get(format!("{}/get-artifact", self.base))
                    .query(&[("run_id", run_id), ("path", entry.path.as_str())])
                    .send()
                    .await?;
                let status = response.status();
                if status != StatusCode::OK {
                    bail!("artifact download for '{}' failed: {status}", entry.path);
                }
                let bytes = response.bytes().await?;
                let target = dest.join(&entry.path);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&target, &bytes)
                    .with_context(|| format!("writing artifact {}", target.display()))?;
            }
        }
        Ok(())
    }
}

pub(crate) fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct SearchExperimentsRequest<'a> {
    max_results: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    page_token: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct SearchExperimentsResponse {
    #[serde(default)]
    experiments: Vec<ExperimentDto>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GetExperimentResponse {
    experiment: ExperimentDto,
}

#[derive(Debug, Deserialize)]
struct ExperimentDto {
    experiment_id: String,
    name: String,
    #[serde(default)]
    lifecycle_stage: String,
}

impl From<ExperimentDto> for Experiment {
    fn from(dto: ExperimentDto) -> Self {
        Self {
            experiment_id: dto.experiment_id,
            name: dto.name,
            lifecycle_stage: LifecycleStage::parse(&dto.lifecycle_stage),
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateExperimentRequest<'a> {
    name: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateExperimentResponse {
    experiment_id: String,
}

#[derive(Debug, Serialize)]
struct SearchRunsRequest<'a> {
    experiment_ids: [&'a str; 1],
    max_results: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    page_token: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct SearchRunsResponse {
    #[serde(default)]
    runs: Vec<RunDto>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GetRunResponse {
    run: RunDto,
}

#[derive(Debug, Deserialize)]
struct RunDto {
    info: RunInfoDto,
    #[serde(default)]
    data: RunDataDto,
}

#[derive(Debug, Deserialize)]
struct RunInfoDto {
    run_id: String,
    #[serde(default)]
    run_name: Option<String>,
    #[serde(default)]
    status: String,
    #[serde(default)]
    start_time: i64,
    #[serde(default)]
    artifact_uri: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RunDataDto {
    #[serde(default)]
    params: Vec<KeyValueDto>,
    #[serde(default)]
    metrics: Vec<MetricDto>,
    #[serde(default)]
    tags: Vec<KeyValueDto>,
}

#[derive(Debug, Deserialize)]
struct KeyValueDto {
    key: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct MetricDto {
    key: String,
    value: f64,
}

impl From<RunDto> for Run {
    fn from(dto: RunDto) -> Self {
        let mut data = RunData::default();
        for entry in dto.data.params {
            data.params.insert(entry.key, entry.value);
        }
        for metric in dto.data.metrics {
            data.metrics.insert(metric.key, metric.value);
        }
        for entry in dto.data.tags {
            data.tags.insert(entry.key, entry.value);
        }
        Self {
            info: RunInfo {
                run_id: dto.info.run_id,
                run_name: dto.info.run_name.filter(|name| !name.is_empty()),
                status: RunStatus::parse(&dto.info.status),
                start_time: millis_to_datetime(dto.info.start_time),
            },
            data,
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateRunRequest<'a> {
    experiment_id: &'a str,
    run_name: &'a str,
    start_time: i64,
}

#[derive(Debug, Deserialize)]
struct CreateRunResponse {
    run: RunDto,
}

#[derive(Debug, Serialize)]
struct LogParamRequest<'a> {
    run_id: &'a str,
    key: &'a str,
    value: &'a str,
}

#[derive(Debug, Serialize)]
struct LogMetricRequest<'a> {
    run_id: &'a str,
    key: &'a str,
    value: f64,
    timestamp: i64,
    step: i64,
}

#[derive(Debug, Serialize)]
struct SetTagRequest<'a> {
    run_id: &'a str,
    key: &'a str,
    value: &'a str,
}

#[derive(Debug, Serialize)]
struct UpdateRunRequest<'a> {
    run_id: &'a str,
    status: &'a str,
    end_time: i64,
}

#[derive(Debug, Deserialize)]
struct ListArtifactsResponse {
    #[serde(default)]
    files: Vec<FileInfoDto>,
}

#[derive(Debug, Deserialize)]
struct FileInfoDto {
    path: String,
    #[serde(default)]
    is_dir: bool,
}

#[derive(Debug, Serialize)]
struct CreateRegisteredModelRequest<'a> {
    name: &'a str,
}

#[derive(Debug, Deserialize)]
struct GetRegisteredModelResponse {
    registered_model: RegisteredModelDto,
}

#[derive(Debug, Deserialize)]
struct RegisteredModelDto {
    name: String,
    #[serde(default)]
    latest_versions: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct CreateModelVersionRequest<'a> {
    name: &'a str,
    source: &'a str,
    run_id: &'a str,
    description: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateModelVersionResponse {
    model_version: ModelVersionDto,
}

#[derive(Debug, Deserialize)]
struct ModelVersionDto {
    version: String,
}

#[derive(Debug, Serialize)]
struct TransitionStageRequest<'a> {
    name: &'a str,
    version: String,
    stage: &'a str,
    archive_existing_versions: bool,
}

#[async_trait]
impl RecordStore for RestStore {
    async fn search_experiments(&self) -> Result<Vec<Experiment>> {
        let mut experiments = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let request = SearchExperimentsRequest {
                max_results: PAGE_SIZE,
                page_token: token.as_deref(),
            };
            let page: SearchExperimentsResponse = self
                .post_json("experiments/search", &request)
                .await
                .context("searching experiments")?;
            experiments.extend(page.experiments.into_iter().map(Experiment::from));
            match page.next_page_token {
                Some(next) if !next.is_empty() => token = Some(next),
                _ => break,
            }
        }
        Ok(experiments)
    }

    async fn get_experiment_by_name(&self, name: &str) -> Result<Option<Experiment>> {
        let result: Result<GetExperimentResponse, StoreError> = self
            .get_json("experiments/get-by-name", &[("experiment_name", name)])
            .await;
        match result {
            Ok(response) => Ok(Some(response.experiment.into())),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err).with_context(|| format!("looking up experiment '{name}'")),
        }
    }

    async fn create_experiment(&self, name: &str) -> Result<String> {
        let response: CreateExperimentResponse = self
            .post_json("experiments/create", &CreateExperimentRequest { name })
            .await
            .with_context(|| format!("creating experiment '{name}'"))?;
        Ok(response.experiment_id)
    }

    async fn search_runs(&self, experiment_id: &str) -> Result<Vec<Run>> {
        let mut runs = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let request = SearchRunsRequest {
                experiment_ids: [experiment_id],
                max_results: PAGE_SIZE,
                page_token: token.as_deref(),
            };
            let page: SearchRunsResponse = self
                .post_json("runs/search", &request)
                .await
                .with_context(|| format!("searching runs of experiment {experiment_id}"))?;
            runs.extend(page.runs.into_iter().map(Run::from));
            match page.next_page_token {
                Some(next) if !next.is_empty() => token = Some(next),
                _ => break,
            }
        }
        Ok(runs)
    }

    async fn create_run(&self, experiment_id: &str, run_name: &str) -> Result<String> {
        let request = CreateRunRequest {
            experiment_id,
            run_name,
            start_time: Utc::now().timestamp_millis(),
        };
        let response: CreateRunResponse = self
            .post_json("runs/create", &request)
            .await
            .with_context(|| format!("creating run in experiment {experiment_id}"))?;
        Ok(response.run.info.run_id)
    }

    async fn log_param(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        let _: serde_json::Value = self
            .post_json("runs/log-parameter", &LogParamRequest { run_id, key, value })
            .await
            .with_context(|| format!("logging param '{key}' on run {run_id}"))?;
        Ok(())
    }

    async fn log_metric(&self, run_id: &str, key: &str, value: f64) -> Result<()> {
        let request = LogMetricRequest {
            run_id,
            key,
            value,
            timestamp: Utc::now().timestamp_millis(),
            step: 0,
        };
        let _: serde_json::Value = self
            .post_json("runs/log-metric", &request)
            .await
            .with_context(|| format!("logging metric '{key}' on run {run_id}"))?;
        Ok(())
    }

    async fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        let _: serde_json::Value = self
            .post_json("runs/set-tag", &SetTagRequest { run_id, key, value })
            .await
            .with_context(|| format!("setting tag '{key}' on run {run_id}"))?;
        Ok(())
    }

    async fn set_terminated(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let request = UpdateRunRequest {
            run_id,
            status: status.as_str(),
            end_time: Utc::now().timestamp_millis(),
        };
        let _: serde_json::Value = self
            .post_json("runs/update", &request)
            .await
            .with_context(|| format!("terminating run {run_id}"))?;
        Ok(())
    }

    async fn list_artifacts(&self, run_id: &str, path: &str) -> Result<Vec<ArtifactEntry>> {
        let response: ListArtifactsResponse = self
            .get_json("artifacts/list", &[("run_id", run_id), ("path", path)])
            .await
            .with_context(|| format!("listing artifacts of run {run_id}"))?;
        Ok(response
            .files
            .into_iter()
            .map(|file| ArtifactEntry {
                path: file.path,
                is_dir: file.is_dir,
            })
            .collect())
    }

    async fn download_artifacts(&self, run_id: &str, dest: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dest)?;
        self.download_tree(run_id, dest)
            .await
            .with_context(|| format!("downloading artifacts of run {run_id}"))?;
        Ok(dest.to_path_buf())
    }

    async fn log_artifacts(&self, run_id: &str, local_dir: &Path) -> Result<()> {
        let root = self.artifact_root(run_id).await?;
        let Some(proxied) = root.strip_prefix("mlflow-artifacts:/") else {
            bail!(
                "artifact upload needs a server-proxied artifact root, got '{root}'; \
                 start the tracking server with artifact serving enabled"
            );
        };
        let mut files = Vec::new();
        collect_files(local_dir, Path::new(""), &mut files)?;
        for relative in files {
            let bytes = fs::read(local_dir.join(&relative))?;
            let rel = relative.to_string_lossy().replace('\\', "/");
            let url = format!(
                "{}/{ARTIFACT_PROXY_PREFIX}/{}/{rel}",
                self.base,
                proxied.trim_matches('/')
            );
            let response = self.client.put(url).body(bytes).send().await?;
            let status = response.status();
            if !status.is_success() {
                bail!("artifact upload for '{rel}' failed: {status}");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ModelRegistry for RestStore {
    async fn get_registered_model(&self, name: &str) -> Result<Option<RegisteredModel>> {
        let result: Result<GetRegisteredModelResponse, StoreError> = self
            .get_json("registered-models/get", &[("name", name)])
            .await;
        match result {
            Ok(response) => Ok(Some(RegisteredModel {
                name: response.registered_model.name,
                version_count: response.registered_model.latest_versions.len(),
            })),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err).with_context(|| format!("looking up registered model '{name}'")),
        }
    }

    async fn create_registered_model(&self, name: &str) -> Result<()> {
        let _: serde_json::Value = self
            .post_json(
                "registered-models/create",
                &CreateRegisteredModelRequest { name },
            )
            .await
            .with_context(|| format!("registering model name '{name}'"))?;
        Ok(())
    }

    async fn create_model_version(
        &self,
        name: &str,
        source: &str,
        run_id: &str,
        description: &str,
    ) -> Result<u64> {
        let request = CreateModelVersionRequest {
            name,
            source,
            run_id,
            description,
        };
        let response: CreateModelVersionResponse = self
            .post_json("model-versions/create", &request)
            .await
            .with_context(|| format!("creating model version under '{name}'"))?;
        response
            .model_version
            .version
            .parse()
            .map_err(|_| anyhow!(StoreError::Protocol("non-numeric model version".into())))
    }

    async fn transition_model_version_stage(
        &self,
        name: &str,
        version: u64,
        stage: &str,
    ) -> Result<()> {
        let request = TransitionStageRequest {
            name,
            version: version.to_string(),
            stage,
            archive_existing_versions: false,
        };
        let _: serde_json::Value = self
            .post_json("model-versions/transition-stage", &request)
            .await
            .with_context(|| format!("moving '{name}' v{version} to {stage}"))?;
        Ok(())
    }
}

fn collect_files(root: &Path, relative: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let dir = root.join(relative);
    for entry in fs::read_dir(&dir).with_context(|| format!("reading {}", dir.display()))? {
        let entry = entry?;
        let child = relative.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            collect_files(root, &child, out)?;
        } else {
            out.push(child);
        }
    }
    Ok(())
}
