//! File-backed store over the on-disk `mlruns/` layout.
//!
//! Layout: `<root>/<experiment_id>/meta.yaml` for experiments, then
//! `<root>/<experiment_id>/<run_id>/` per run with its own `meta.yaml`,
//! one file per param/tag, metric history files of
//! `timestamp value step` lines, and an `artifacts/` tree. Registered
//! models live under `<root>/models/<name>/`.

use std::{
    collections::BTreeMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::{
    entities::{
        ArtifactEntry, Experiment, LifecycleStage, RegisteredModel, Run, RunData, RunInfo,
        RunStatus,
    },
    rest::millis_to_datetime,
    store::{ModelRegistry, RecordStore},
};

const META_FILE: &str = "meta.yaml";
const MODELS_DIR: &str = "models";
const TRASH_DIR: &str = ".trash";

/// Tracking store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

fn de_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    // Older writers emit numeric experiment ids unquoted.
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(i64),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(value) => value,
        Raw::Number(value) => value.to_string(),
    })
}

#[derive(Debug, Serialize, Deserialize)]
struct ExperimentMeta {
    #[serde(deserialize_with = "de_id")]
    experiment_id: String,
    name: String,
    #[serde(default)]
    lifecycle_stage: Option<String>,
    #[serde(default)]
    artifact_location: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RunMeta {
    #[serde(alias = "run_uuid")]
    run_id: String,
    #[serde(default)]
    run_name: Option<String>,
    status: u8,
    #[serde(default)]
    start_time: i64,
    #[serde(default)]
    end_time: Option<i64>,
    #[serde(default)]
    lifecycle_stage: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RegisteredModelMeta {
    name: String,
    creation_timestamp: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ModelVersionMeta {
    name: String,
    version: u64,
    run_id: String,
    source: String,
    status: String,
    #[serde(default)]
    current_stage: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

impl FileStore {
    /// Opens (or designates) a store rooted at `root`. The directory is
    /// created lazily on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = serde_yaml::to_string(value)?;
        fs::write(path, raw).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    fn experiment_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(dirs),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", self.root.display()))
            }
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if name == MODELS_DIR || name == TRASH_DIR {
                continue;
            }
            let path = entry.path();
            if path.is_dir() && path.join(META_FILE).is_file() {
                dirs.push(path);
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    fn experiment_dir(&self, experiment_id: &str) -> PathBuf {
        self.root.join(experiment_id)
    }

    fn find_run_dir(&self, run_id: &str) -> Result<PathBuf> {
        for experiment in self.experiment_dirs()? {
            let candidate = experiment.join(run_id);
            if candidate.join(META_FILE).is_file() {
                return Ok(candidate);
            }
        }
        bail!("run {run_id} not found under {}", self.root.display())
    }

    fn read_run(run_dir: &Path) -> Result<Run> {
        let meta: RunMeta = Self::read_yaml(&run_dir.join(META_FILE))?;
        let mut data = RunData::default();
        read_kv_dir(&run_dir.join("params"), &mut data.params)?;
        read_kv_dir(&run_dir.join("tags"), &mut data.tags)?;
        read_metric_dir(&run_dir.join("metrics"), &mut data.metrics)?;
        Ok(Run {
            info: RunInfo {
                run_id: meta.run_id,
                run_name: meta.run_name.filter(|name| !name.is_empty()),
                status: RunStatus::from_code(meta.status),
                start_time: millis_to_datetime(meta.start_time),
            },
            data,
        })
    }

    fn model_dir(&self, name: &str) -> PathBuf {
        self.root.join(MODELS_DIR).join(name)
    }
}

fn read_kv_dir(dir: &Path, out: &mut BTreeMap<String, String>) -> Result<()> {
    collect_kv(dir, Path::new(""), out)
}

fn collect_kv(root: &Path, relative: &Path, out: &mut BTreeMap<String, String>) -> Result<()> {
    let dir = root.join(relative);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err).with_context(|| format!("reading {}", dir.display())),
    };
    for entry in entries {
        let entry = entry?;
        let child = relative.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            // Keys may contain '/' and land in nested directories.
            collect_kv(root, &child, out)?;
        } else {
            let value = fs::read_to_string(entry.path())
                .with_context(|| format!("reading {}", entry.path().display()))?;
            let key = child.to_string_lossy().replace('\\', "/");
            out.insert(key, value.trim_end_matches('\n').to_string());
        }
    }
    Ok(())
}

fn read_metric_dir(dir: &Path, out: &mut BTreeMap<String, f64>) -> Result<()> {
    let mut raw = BTreeMap::new();
    read_kv_dir(dir, &mut raw)?;
    for (key, history) in raw {
        if let Some(value) = latest_metric_value(&history) {
            out.insert(key, value);
        }
    }
    Ok(())
}

/// Picks the latest value from a metric history file: the entry with the
/// greatest (step, timestamp) pair, matching the store's own definition.
fn latest_metric_value(history: &str) -> Option<f64> {
    let mut best: Option<(i64, i64, f64)> = None;
    for line in history.lines() {
        let mut fields = line.split_whitespace();
        let timestamp: i64 = fields.next()?.parse().ok()?;
        let value: f64 = fields.next()?.parse().ok()?;
        let step: i64 = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let candidate = (step, timestamp, value);
        match best {
            Some((s, t, _)) if (s, t) >= (step, timestamp) => {}
            _ => best = Some(candidate),
        }
    }
    best.map(|(_, _, value)| value)
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from).with_context(|| format!("reading {}", from.display()))? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("copying {}", entry.path().display()))?;
        }
    }
    Ok(())
}

fn guard_key(key: &str) -> Result<()> {
    if key.is_empty() || key.starts_with('/') || key.split('/').any(|part| part == "..") {
        bail!("invalid key '{key}'");
    }
    Ok(())
}

#[async_trait]
impl RecordStore for FileStore {
    async fn search_experiments(&self) -> Result<Vec<Experiment>> {
        let mut experiments = Vec::new();
        for dir in self.experiment_dirs()? {
            let meta: ExperimentMeta = Self::read_yaml(&dir.join(META_FILE))?;
            experiments.push(Experiment {
                experiment_id: meta.experiment_id,
                name: meta.name,
                lifecycle_stage: meta
                    .lifecycle_stage
                    .as_deref()
                    .map_or(LifecycleStage::Active, LifecycleStage::parse),
            });
        }
        Ok(experiments)
    }

    async fn get_experiment_by_name(&self, name: &str) -> Result<Option<Experiment>> {
        let experiments = self.search_experiments().await?;
        Ok(experiments.into_iter().find(|exp| exp.name == name))
    }

    async fn create_experiment(&self, name: &str) -> Result<String> {
        if self.get_experiment_by_name(name).await?.is_some() {
            bail!("experiment '{name}' already exists");
        }
        let experiment_id = Uuid::new_v4().simple().to_string();
        let dir = self.experiment_dir(&experiment_id);
        let meta = ExperimentMeta {
            experiment_id: experiment_id.clone(),
            name: name.to_string(),
            lifecycle_stage: Some("active".to_string()),
            artifact_location: Some(dir.to_string_lossy().into_owned()),
        };
        Self::write_yaml(&dir.join(META_FILE), &meta)?;
        Ok(experiment_id)
    }

    async fn search_runs(&self, experiment_id: &str) -> Result<Vec<Run>> {
        let dir = self.experiment_dir(experiment_id);
        if !dir.is_dir() {
            bail!("experiment {experiment_id} not found");
        }
        let mut run_dirs = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() && path.join(META_FILE).is_file() {
                run_dirs.push(path);
            }
        }
        run_dirs.sort();
        run_dirs.iter().map(|dir| Self::read_run(dir)).collect()
    }

    async fn create_run(&self, experiment_id: &str, run_name: &str) -> Result<String> {
        let experiment = self.experiment_dir(experiment_id);
        if !experiment.join(META_FILE).is_file() {
            bail!("experiment {experiment_id} not found");
        }
        let run_id = Uuid::new_v4().simple().to_string();
        let run_dir = experiment.join(&run_id);
        let meta = RunMeta {
            run_id: run_id.clone(),
            run_name: Some(run_name.to_string()),
            status: RunStatus::Running.code(),
            start_time: Utc::now().timestamp_millis(),
            end_time: None,
            lifecycle_stage: Some("active".to_string()),
        };
        Self::write_yaml(&run_dir.join(META_FILE), &meta)?;
        for sub in ["params", "metrics", "tags", "artifacts"] {
            fs::create_dir_all(run_dir.join(sub))?;
        }
        Ok(run_id)
    }

    async fn log_param(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        guard_key(key)?;
        let path = self.find_run_dir(run_id)?.join("params").join(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, value).with_context(|| format!("writing param '{key}'"))?;
        Ok(())
    }

    async fn log_metric(&self, run_id: &str, key: &str, value: f64) -> Result<()> {
        guard_key(key)?;
        let path = self.find_run_dir(run_id)?.join("metrics").join(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut history = match fs::read_to_string(&path) {
            Ok(existing) => existing,
            Err(err) if err.kind() == ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err).with_context(|| format!("reading metric '{key}'")),
        };
        history.push_str(&format!("{} {value} 0\n", Utc::now().timestamp_millis()));
        fs::write(&path, history).with_context(|| format!("writing metric '{key}'"))?;
        Ok(())
    }

    async fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        guard_key(key)?;
        let path = self.find_run_dir(run_id)?.join("tags").join(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, value).with_context(|| format!("writing tag '{key}'"))?;
        Ok(())
    }

    async fn set_terminated(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let meta_path = self.find_run_dir(run_id)?.join(META_FILE);
        let mut meta: RunMeta = Self::read_yaml(&meta_path)?;
        meta.status = status.code();
        meta.end_time = Some(Utc::now().timestamp_millis());
        Self::write_yaml(&meta_path, &meta)
    }

    async fn list_artifacts(&self, run_id: &str, path: &str) -> Result<Vec<ArtifactEntry>> {
        let root = self.find_run_dir(run_id)?.join("artifacts");
        let dir = if path.is_empty() {
            root.clone()
        } else {
            guard_key(path)?;
            root.join(path)
        };
        let mut entries = Vec::new();
        let listing = match fs::read_dir(&dir) {
            Ok(listing) => listing,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(entries),
            Err(err) => return Err(err).with_context(|| format!("reading {}", dir.display())),
        };
        for entry in listing {
            let entry = entry?;
            let relative = entry
                .path()
                .strip_prefix(&root)
                .map_err(|_| anyhow!("artifact path escaped the run root"))?
                .to_string_lossy()
                .replace('\\', "/");
            entries.push(ArtifactEntry {
                path: relative,
                is_dir: entry.file_type()?.is_dir(),
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn download_artifacts(&self, run_id: &str, _dest: &Path) -> Result<PathBuf> {
        // Artifacts are already local; hand back the stored tree in place.
        let artifacts = self.find_run_dir(run_id)?.join("artifacts");
        fs::create_dir_all(&artifacts)?;
        Ok(artifacts)
    }

    async fn log_artifacts(&self, run_id: &str, local_dir: &Path) -> Result<()> {
        let artifacts = self.find_run_dir(run_id)?.join("artifacts");
        copy_tree(local_dir, &artifacts)
            .with_context(|| format!("uploading artifacts into run {run_id}"))
    }
}

#[async_trait]
impl ModelRegistry for FileStore {
    async fn get_registered_model(&self, name: &str) -> Result<Option<RegisteredModel>> {
        let dir = self.model_dir(name);
        if !dir.join(META_FILE).is_file() {
            return Ok(None);
        }
        let meta: RegisteredModelMeta = Self::read_yaml(&dir.join(META_FILE))?;
        let mut version_count = 0;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir()
                && entry.file_name().to_string_lossy().starts_with("version-")
            {
                version_count += 1;
            }
        }
        Ok(Some(RegisteredModel {
            name: meta.name,
            version_count,
        }))
    }

    async fn create_registered_model(&self, name: &str) -> Result<()> {
        guard_key(name)?;
        let dir = self.model_dir(name);
        if dir.join(META_FILE).is_file() {
            bail!("registered model '{name}' already exists");
        }
        let meta = RegisteredModelMeta {
            name: name.to_string(),
            creation_timestamp: Utc::now().timestamp_millis(),
        };
        Self::write_yaml(&dir.join(META_FILE), &meta)
    }

    async fn create_model_version(
        &self,
        name: &str,
        source: &str,
        run_id: &str,
        description: &str,
    ) -> Result<u64> {
        let dir = self.model_dir(name);
        if !dir.join(META_FILE).is_file() {
            bail!("registered model '{name}' not found");
        }
        let mut version = 0;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(number) = entry
                .file_name()
                .to_string_lossy()
                .strip_prefix("version-")
                .and_then(|suffix| suffix.parse::<u64>().ok())
            {
                version = version.max(number);
            }
        }
        let version = version + 1;
        let meta = ModelVersionMeta {
            name: name.to_string(),
            version,
            run_id: run_id.to_string(),
            source: source.to_string(),
            status: "READY".to_string(),
            current_stage: Some("None".to_string()),
            description: Some(description.to_string()),
        };
        Self::write_yaml(&dir.join(format!("version-{version}")).join(META_FILE), &meta)?;
        Ok(version)
    }

    async fn transition_model_version_stage(
        &self,
        name: &str,
        version: u64,
        stage: &str,
    ) -> Result<()> {
        let meta_path = self
            .model_dir(name)
            .join(format!("version-{version}"))
            .join(META_FILE);
        if !meta_path.is_file() {
            bail!("model version '{name}' v{version} not found");
        }
        let mut meta: ModelVersionMeta = Self::read_yaml(&meta_path)?;
        meta.current_stage = Some(stage.to_string());
        Self::write_yaml(&meta_path, &meta)
    }
}
