//! Materializes an equivalent copy of one run in the target store.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use heartml_logging::JsonLogger;
use heartml_tracking::{RecordStore, Run, RunStatus, SYSTEM_TAG_PREFIX};

/// Provenance tag carrying the originating run's id.
pub const TAG_SOURCE_RUN_ID: &str = "mlflow.migration.source_run_id";
/// Provenance tag carrying the ISO-8601 migration timestamp.
pub const TAG_MIGRATION_TIMESTAMP: &str = "mlflow.migration.timestamp";
/// Provenance tag carrying the source store's address.
pub const TAG_SOURCE_URI: &str = "mlflow.migration.source_uri";

const COMPONENT: &str = "copier";

/// Copies single runs from a source store into a target store.
pub struct RunCopier {
    source: Arc<dyn RecordStore>,
    target: Arc<dyn RecordStore>,
    source_uri: String,
    logger: Arc<JsonLogger>,
}

impl RunCopier {
    /// Builds a copier over the two stores. `source_uri` is stamped onto
    /// every copied run as provenance.
    pub fn new(
        source: Arc<dyn RecordStore>,
        target: Arc<dyn RecordStore>,
        source_uri: impl Into<String>,
        logger: Arc<JsonLogger>,
    ) -> Self {
        Self {
            source,
            target,
            source_uri: source_uri.into(),
            logger,
        }
    }

    /// Copies one run into `target_experiment_id` and returns the new
    /// run's id. The copy is a new entity with its own identity; only the
    /// provenance tags tie it back to the source. Metadata failures
    /// propagate to the caller; artifact-transfer failures are logged as
    /// warnings and do not fail the copy.
    pub async fn copy_run(
        &self,
        source_run: &Run,
        target_experiment_id: &str,
        copy_artifacts: bool,
    ) -> Result<String> {
        let run_name = source_run.display_name();
        let new_run_id = self
            .target
            .create_run(target_experiment_id, &run_name)
            .await?;

        match self
            .copy_payload(source_run, &new_run_id, copy_artifacts)
            .await
        {
            Ok(()) => {
                self.target
                    .set_terminated(&new_run_id, RunStatus::Finished)
                    .await?;
                Ok(new_run_id)
            }
            Err(err) => {
                // Close the handle so no orphaned "running" record stays
                // behind in the target store.
                if let Err(close_err) = self
                    .target
                    .set_terminated(&new_run_id, RunStatus::Failed)
                    .await
                {
                    let _ = self.logger.warn(
                        COMPONENT,
                        format!("could not close run {new_run_id}: {close_err:#}"),
                    );
                }
                Err(err)
            }
        }
    }

    async fn copy_payload(
        &self,
        source_run: &Run,
        new_run_id: &str,
        copy_artifacts: bool,
    ) -> Result<()> {
        for (key, value) in &source_run.data.params {
            self.target.log_param(new_run_id, key, value).await?;
        }
        for (key, value) in &source_run.data.metrics {
            self.target.log_metric(new_run_id, key, *value).await?;
        }
        for (key, value) in &source_run.data.tags {
            // The store's reserved namespace stays behind; copying it
            // verbatim would corrupt target-store bookkeeping.
            if key.starts_with(SYSTEM_TAG_PREFIX) {
                continue;
            }
            self.target.set_tag(new_run_id, key, value).await?;
        }

        self.target
            .set_tag(new_run_id, TAG_SOURCE_RUN_ID, &source_run.info.run_id)
            .await?;
        self.target
            .set_tag(new_run_id, TAG_MIGRATION_TIMESTAMP, &Utc::now().to_rfc3339())
            .await?;
        self.target
            .set_tag(new_run_id, TAG_SOURCE_URI, &self.source_uri)
            .await?;

        if copy_artifacts {
            if let Err(err) = self.copy_artifacts(source_run, new_run_id).await {
                let _ = self.logger.warn(
                    COMPONENT,
                    format!(
                        "could not copy artifacts of run {}: {err:#}",
                        source_run.info.run_id
                    ),
                );
                println!("    warning: could not copy artifacts - {err:#}");
            }
        }
        Ok(())
    }

    async fn copy_artifacts(&self, source_run: &Run, new_run_id: &str) -> Result<()> {
        let scratch = tempfile::tempdir().context("creating artifact scratch directory")?;
        let local = self
            .source
            .download_artifacts(&source_run.info.run_id, scratch.path())
            .await?;
        self.target.log_artifacts(new_run_id, &local).await
    }
}
