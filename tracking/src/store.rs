//! Store traits implemented by every tracking backend.

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;

use crate::entities::{ArtifactEntry, Experiment, RegisteredModel, Run, RunStatus};

/// Client surface over a tracking backend. Calls are async in form but the
/// workflows in this workspace await each one before issuing the next, so
/// execution against any backend is strictly sequential.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Enumerates every experiment the store knows about, in store order.
    async fn search_experiments(&self) -> Result<Vec<Experiment>>;

    /// Looks up an experiment by display name.
    async fn get_experiment_by_name(&self, name: &str) -> Result<Option<Experiment>>;

    /// Creates an experiment and returns its id. Fails if the name exists.
    async fn create_experiment(&self, name: &str) -> Result<String>;

    /// Enumerates every run in an experiment, in store order.
    async fn search_runs(&self, experiment_id: &str) -> Result<Vec<Run>>;

    /// Opens a new run in the experiment and returns its id. The run is
    /// left in the running state; callers must pair this with
    /// [`Self::set_terminated`] on every exit path so no orphaned
    /// "running" record is left behind.
    async fn create_run(&self, experiment_id: &str, run_name: &str) -> Result<String>;

    /// Records a parameter on a run. Parameters are write-once per key.
    async fn log_param(&self, run_id: &str, key: &str, value: &str) -> Result<()>;

    /// Records a metric value on a run.
    async fn log_metric(&self, run_id: &str, key: &str, value: f64) -> Result<()>;

    /// Sets (or overwrites) a tag on a run.
    async fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()>;

    /// Closes a run with the given terminal status.
    async fn set_terminated(&self, run_id: &str, status: RunStatus) -> Result<()>;

    /// Lists one level of a run's artifact tree. An empty `path` lists the
    /// artifact root.
    async fn list_artifacts(&self, run_id: &str, path: &str) -> Result<Vec<ArtifactEntry>>;

    /// Materializes the run's full artifact tree under a local directory
    /// and returns the directory holding it. Backends with local storage
    /// may return their own storage path without copying.
    async fn download_artifacts(&self, run_id: &str, dest: &Path) -> Result<PathBuf>;

    /// Uploads every file under `local_dir` into the run's artifact root,
    /// preserving relative paths.
    async fn log_artifacts(&self, run_id: &str, local_dir: &Path) -> Result<()>;
}

/// Registry surface over a tracking backend's model registry.
#[async_trait]
pub trait ModelRegistry: Send + Sync {
    /// Looks up a registered model by name.
    async fn get_registered_model(&self, name: &str) -> Result<Option<RegisteredModel>>;

    /// Registers a model name. Fails if the name exists.
    async fn create_registered_model(&self, name: &str) -> Result<()>;

    /// Creates a new version under a registered name, pointing at a run's
    /// artifact, and returns the assigned version number.
    async fn create_model_version(
        &self,
        name: &str,
        source: &str,
        run_id: &str,
        description: &str,
    ) -> Result<u64>;

    /// Moves a model version to a deployment stage (e.g. "Staging",
    /// "Production"). Existing versions in that stage are left alone.
    async fn transition_model_version_stage(
        &self,
        name: &str,
        version: u64,
        stage: &str,
    ) -> Result<()>;
}

/// A backend that offers both run tracking and the model registry.
pub trait TrackingBackend: RecordStore + ModelRegistry {}

impl<T: RecordStore + ModelRegistry> TrackingBackend for T {}
