//! In-process store used as a test double across the workspace.

use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::{
    entities::{
        ArtifactEntry, Experiment, LifecycleStage, RegisteredModel, Run, RunData, RunInfo,
        RunStatus,
    },
    store::{ModelRegistry, RecordStore},
};

#[derive(Debug, Default)]
struct Inner {
    experiments: Vec<Experiment>,
    // Insertion-ordered so search_runs reflects store order.
    runs: Vec<(String, Run)>,
    artifacts: BTreeMap<String, Vec<(String, Vec<u8>)>>,
    registered_models: BTreeMap<String, Vec<MemoryModelVersion>>,
    fail_artifact_downloads: bool,
    fail_run_names: HashSet<String>,
    write_calls: usize,
}

/// One model version recorded by the in-memory registry.
#[derive(Debug, Clone)]
pub struct MemoryModelVersion {
    /// Version number.
    pub version: u64,
    /// Artifact source the version points at.
    pub source: String,
    /// Run the version came from.
    pub run_id: String,
    /// Free-form description.
    pub description: String,
    /// Current deployment stage.
    pub stage: String,
}

/// Tracking store held entirely in memory, with failure-injection knobs
/// for exercising the workflows' error paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every artifact download fail.
    pub fn fail_artifact_downloads(&self) {
        self.inner.lock().fail_artifact_downloads = true;
    }

    /// Makes `create_run` fail for runs opened under the given name.
    pub fn fail_runs_named(&self, run_name: &str) {
        self.inner.lock().fail_run_names.insert(run_name.to_string());
    }

    /// Seeds an experiment and returns its id.
    pub fn seed_experiment(&self, name: &str) -> String {
        self.seed_experiment_staged(name, LifecycleStage::Active)
    }

    /// Seeds an experiment in a specific lifecycle stage.
    pub fn seed_experiment_staged(&self, name: &str, stage: LifecycleStage) -> String {
        let experiment_id = Uuid::new_v4().simple().to_string();
        self.inner.lock().experiments.push(Experiment {
            experiment_id: experiment_id.clone(),
            name: name.to_string(),
            lifecycle_stage: stage,
        });
        experiment_id
    }

    /// Seeds a fully formed run into an experiment.
    pub fn seed_run(&self, experiment_id: &str, run: Run) {
        self.inner
            .lock()
            .runs
            .push((experiment_id.to_string(), run));
    }

    /// Attaches an artifact file to a run.
    pub fn seed_artifact(&self, run_id: &str, path: &str, bytes: &[u8]) {
        self.inner
            .lock()
            .artifacts
            .entry(run_id.to_string())
            .or_default()
            .push((path.to_string(), bytes.to_vec()));
    }

    /// Snapshot of every run in an experiment, in store order.
    #[must_use]
    pub fn runs_in(&self, experiment_id: &str) -> Vec<Run> {
        self.inner
            .lock()
            .runs
            .iter()
            .filter(|(owner, _)| owner == experiment_id)
            .map(|(_, run)| run.clone())
            .collect()
    }

    /// Total number of runs across all experiments.
    #[must_use]
    pub fn run_count(&self) -> usize {
        self.inner.lock().runs.len()
    }

    /// Number of experiments in the store.
    #[must_use]
    pub fn experiment_count(&self) -> usize {
        self.inner.lock().experiments.len()
    }

    /// Number of mutating calls the store has served. Zero means the
    /// store was never written to.
    #[must_use]
    pub fn write_calls(&self) -> usize {
        self.inner.lock().write_calls
    }

    /// Artifact paths attached to a run.
    #[must_use]
    pub fn artifact_paths(&self, run_id: &str) -> Vec<String> {
        self.inner
            .lock()
            .artifacts
            .get(run_id)
            .map(|entries| entries.iter().map(|(path, _)| path.clone()).collect())
            .unwrap_or_default()
    }

    /// Versions registered under a model name.
    #[must_use]
    pub fn model_versions(&self, name: &str) -> Vec<MemoryModelVersion> {
        self.inner
            .lock()
            .registered_models
            .get(name)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn search_experiments(&self) -> Result<Vec<Experiment>> {
        Ok(self.inner.lock().experiments.clone())
    }

    async fn get_experiment_by_name(&self, name: &str) -> Result<Option<Experiment>> {
        Ok(self
            .inner
            .lock()
            .experiments
            .iter()
            .find(|exp| exp.name == name)
            .cloned())
    }

    async fn create_experiment(&self, name: &str) -> Result<String> {
        let mut inner = self.inner.lock();
        inner.write_calls += 1;
        if inner.experiments.iter().any(|exp| exp.name == name) {
            bail!("experiment '{name}' already exists");
        }
        let experiment_id = Uuid::new_v4().simple().to_string();
        inner.experiments.push(Experiment {
            experiment_id: experiment_id.clone(),
            name: name.to_string(),
            lifecycle_stage: LifecycleStage::Active,
        });
        Ok(experiment_id)
    }

    async fn search_runs(&self, experiment_id: &str) -> Result<Vec<Run>> {
        Ok(self.runs_in(experiment_id))
    }

    async fn create_run(&self, experiment_id: &str, run_name: &str) -> Result<String> {
        let mut inner = self.inner.lock();
        inner.write_calls += 1;
        if inner.fail_run_names.contains(run_name) {
            bail!("injected failure creating run '{run_name}'");
        }
        if !inner
            .experiments
            .iter()
            .any(|exp| exp.experiment_id == experiment_id)
        {
            bail!("experiment {experiment_id} not found");
        }
        let run_id = Uuid::new_v4().simple().to_string();
        inner.runs.push((
            experiment_id.to_string(),
            Run {
                info: RunInfo {
                    run_id: run_id.clone(),
                    run_name: Some(run_name.to_string()),
                    status: RunStatus::Running,
                    start_time: Utc::now(),
                },
                data: RunData::default(),
            },
        ));
        Ok(run_id)
    }

    async fn log_param(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.write_calls += 1;
        let run = find_run_mut(&mut inner, run_id)?;
        run.data.params.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn log_metric(&self, run_id: &str, key: &str, value: f64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.write_calls += 1;
        let run = find_run_mut(&mut inner, run_id)?;
        run.data.metrics.insert(key.to_string(), value);
        Ok(())
    }

    async fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.write_calls += 1;
        let run = find_run_mut(&mut inner, run_id)?;
        run.data.tags.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_terminated(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.write_calls += 1;
        let run = find_run_mut(&mut inner, run_id)?;
        run.info.status = status;
        Ok(())
    }

    async fn list_artifacts(&self, run_id: &str, path: &str) -> Result<Vec<ArtifactEntry>> {
        let inner = self.inner.lock();
        let Some(entries) = inner.artifacts.get(run_id) else {
            return Ok(Vec::new());
        };
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path.trim_end_matches('/'))
        };
        let mut seen = HashSet::new();
        let mut listing = Vec::new();
        for (file, _) in entries {
            let Some(rest) = file.strip_prefix(&prefix) else {
                continue;
            };
            match rest.split_once('/') {
                Some((dir, _)) => {
                    let full = format!("{prefix}{dir}");
                    if seen.insert(full.clone()) {
                        listing.push(ArtifactEntry {
                            path: full,
                            is_dir: true,
                        });
                    }
                }
                None => listing.push(ArtifactEntry {
                    path: file.clone(),
                    is_dir: false,
                }),
            }
        }
        Ok(listing)
    }

    async fn download_artifacts(&self, run_id: &str, dest: &Path) -> Result<PathBuf> {
        let inner = self.inner.lock();
        if inner.fail_artifact_downloads {
            bail!("injected artifact download failure for run {run_id}");
        }
        let entries = inner.artifacts.get(run_id).cloned().unwrap_or_default();
        drop(inner);
        fs::create_dir_all(dest)?;
        for (path, bytes) in entries {
            let target = dest.join(&path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, bytes)
                .with_context(|| format!("materializing artifact {path}"))?;
        }
        Ok(dest.to_path_buf())
    }

    async fn log_artifacts(&self, run_id: &str, local_dir: &Path) -> Result<()> {
        let mut files = Vec::new();
        collect_files(local_dir, Path::new(""), &mut files)?;
        let mut inner = self.inner.lock();
        inner.write_calls += 1;
        let slot = inner.artifacts.entry(run_id.to_string()).or_default();
        for relative in files {
            let bytes = fs::read(local_dir.join(&relative))?;
            slot.push((relative.to_string_lossy().replace('\\', "/"), bytes));
        }
        Ok(())
    }
}

#[async_trait]
impl ModelRegistry for MemoryStore {
    async fn get_registered_model(&self, name: &str) -> Result<Option<RegisteredModel>> {
        Ok(self
            .inner
            .lock()
            .registered_models
            .get(name)
            .map(|versions| RegisteredModel {
                name: name.to_string(),
                version_count: versions.len(),
            }))
    }

    async fn create_registered_model(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.write_calls += 1;
        if inner.registered_models.contains_key(name) {
            bail!("registered model '{name}' already exists");
        }
        inner.registered_models.insert(name.to_string(), Vec::new());
        Ok(())
    }

    async fn create_model_version(
        &self,
        name: &str,
        source: &str,
        run_id: &str,
        description: &str,
    ) -> Result<u64> {
        let mut inner = self.inner.lock();
        inner.write_calls += 1;
        let Some(versions) = inner.registered_models.get_mut(name) else {
            bail!("registered model '{name}' not found");
        };
        let version = versions.iter().map(|v| v.version).max().unwrap_or(0) + 1;
        versions.push(MemoryModelVersion {
            version,
            source: source.to_string(),
            run_id: run_id.to_string(),
            description: description.to_string(),
            stage: "None".to_string(),
        });
        Ok(version)
    }

    async fn transition_model_version_stage(
        &self,
        name: &str,
        version: u64,
        stage: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.write_calls += 1;
        let slot = inner
            .registered_models
            .get_mut(name)
            .with_context(|| format!("registered model '{name}' not found"))?
            .iter_mut()
            .find(|v| v.version == version)
            .with_context(|| format!("model version '{name}' v{version} not found"))?;
        slot.stage = stage.to_string();
        Ok(())
    }
}

fn find_run_mut<'a>(inner: &'a mut Inner, run_id: &str) -> Result<&'a mut Run> {
    inner
        .runs
        .iter_mut()
        .map(|(_, run)| run)
        .find(|run| run.info.run_id == run_id)
        .with_context(|| format!("run {run_id} not found"))
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

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn create_and_enumerate_runs() {
        let store = MemoryStore::new();
        let experiment_id = store.create_experiment("exp").await.unwrap();
        let run_id = store.create_run(&experiment_id, "r1").await.unwrap();
        store.log_param(&run_id, "x", "1").await.unwrap();
        store
            .set_terminated(&run_id, RunStatus::Finished)
            .await
            .unwrap();
        let runs = store.search_runs(&experiment_id).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].info.status, RunStatus::Finished);
        assert_eq!(runs[0].data.params["x"], "1");
    }

    #[tokio::test]
    async fn injected_run_failure_fires_by_name() {
        let store = MemoryStore::new();
        let experiment_id = store.create_experiment("exp").await.unwrap();
        store.fail_runs_named("doomed");
        assert!(store.create_run(&experiment_id, "doomed").await.is_err());
        assert!(store.create_run(&experiment_id, "fine").await.is_ok());
    }

    #[tokio::test]
    async fn artifact_round_trip_through_local_dir() {
        let store = MemoryStore::new();
        let experiment_id = store.create_experiment("exp").await.unwrap();
        let source = store.create_run(&experiment_id, "src").await.unwrap();
        let target = store.create_run(&experiment_id, "dst").await.unwrap();
        store.seed_artifact(&source, "model/model.pkl", b"weights");

        let scratch = tempdir().unwrap();
        let local = store
            .download_artifacts(&source, scratch.path())
            .await
            .unwrap();
        store.log_artifacts(&target, &local).await.unwrap();
        assert_eq!(store.artifact_paths(&target), vec!["model/model.pkl"]);

        let listing = store.list_artifacts(&target, "").await.unwrap();
        assert_eq!(listing.len(), 1);
        assert!(listing[0].is_dir);
        assert_eq!(listing[0].path, "model");
    }

    #[tokio::test]
    async fn injected_download_failure_surfaces() {
        let store = MemoryStore::new();
        let experiment_id = store.create_experiment("exp").await.unwrap();
        let run_id = store.create_run(&experiment_id, "r").await.unwrap();
        store.fail_artifact_downloads();
        let scratch = tempdir().unwrap();
        assert!(store
            .download_artifacts(&run_id, scratch.path())
            .await
            .is_err());
    }
}
