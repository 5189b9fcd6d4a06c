#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Registers trained models from tracked runs into the model registry.
//!
//! Scans an experiment's most recent runs, keeps those that logged a
//! model artifact, maps their `model_type` parameter to a registered
//! model name, and creates one model version per run. Versions with a
//! high enough test ROC-AUC move straight to the Production stage,
//! everything else to Staging.

use std::sync::Arc;

use anyhow::Result;
use heartml_logging::JsonLogger;
use heartml_tracking::TrackingBackend;
use serde::Serialize;

const COMPONENT: &str = "registrar";

/// Param naming the trained estimator family.
const PARAM_MODEL_TYPE: &str = "model_type";
/// Metric used to pick the deployment stage.
const METRIC_ROC_AUC: &str = "test_roc_auc";
/// ROC-AUC above which a version goes straight to Production.
const PRODUCTION_THRESHOLD: f64 = 0.95;

/// Options for one registration pass.
#[derive(Debug, Clone)]
pub struct RegistrationOptions {
    /// Experiment whose runs are scanned.
    pub experiment_name: String,
    /// Maximum number of most-recent runs to consider.
    pub max_runs: usize,
}

impl Default for RegistrationOptions {
    fn default() -> Self {
        Self {
            experiment_name: "heart-disease-prediction".to_string(),
            max_runs: 10,
        }
    }
}

/// Counters for one registration pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistrationTally {
    /// Versions created.
    pub registered: usize,
    /// Runs skipped for lacking a model artifact.
    pub skipped: usize,
    /// Runs whose registration raised and was counted.
    pub failed: usize,
}

/// Maps an estimator family to its registered model name.
#[must_use]
pub fn registered_model_name(model_type: &str) -> String {
    match model_type {
        "LogisticRegression" => "heart-disease-logistic-regression".to_string(),
        "RandomForest" => "heart-disease-random-forest".to_string(),
        other => format!("heart-disease-{}", other.to_lowercase()),
    }
}

/// Registers model versions from an experiment's runs.
pub struct ModelRegistrar {
    backend: Arc<dyn TrackingBackend>,
    logger: Arc<JsonLogger>,
}

impl ModelRegistrar {
    /// Builds a registrar over one tracking backend.
    pub fn new(backend: Arc<dyn TrackingBackend>, logger: Arc<JsonLogger>) -> Self {
        Self { backend, logger }
    }

    /// Runs one registration pass. An absent experiment is reported and
    /// yields a zero tally; per-run errors are counted and the pass
    /// continues, matching the migration workflow's discipline.
    pub async fn register_latest(&self, options: &RegistrationOptions) -> Result<RegistrationTally> {
        println!("{}", "=".repeat(80));
        println!("REGISTERING MODELS IN THE MODEL REGISTRY");
        println!("{}", "=".repeat(80));

        let Some(experiment) = self
            .backend
            .get_experiment_by_name(&options.experiment_name)
            .await?
        else {
            println!(
                "experiment '{}' not found; run training first",
                options.experiment_name
            );
            return Ok(RegistrationTally::default());
        };
        println!(
            "Found experiment: {} (ID: {})",
            experiment.name, experiment.experiment_id
        );

        let mut runs = self.backend.search_runs(&experiment.experiment_id).await?;
        runs.sort_by(|a, b| b.info.start_time.cmp(&a.info.start_time));
        runs.truncate(options.max_runs);
        println!("Found {} runs\n", runs.len());

        let mut tally = RegistrationTally::default();
        for run in &runs {
            let run_id = &run.info.run_id;
            let short_id: String = run_id.chars().take(12).collect();
            let model_type = run
                .data
                .params
                .get(PARAM_MODEL_TYPE)
                .map_or("unknown", String::as_str);
            println!("Processing run {short_id}... (Model: {model_type})");

            match self.register_run(run, model_type).await {
                Ok(Some((name, version, stage))) => {
                    println!("  registered '{name}' as version {version} ({stage})");
                    tally.registered += 1;
                }
                Ok(None) => {
                    println!("  no model artifact found, skipping");
                    tally.skipped += 1;
                }
                Err(err) => {
                    println!("  error: {err:#}");
                    let _ = self.logger.error(
                        COMPONENT,
                        format!("registration of run {run_id} failed: {err:#}"),
                    );
                    tally.failed += 1;
                }
            }
        }

        println!("{}", "=".repeat(80));
        println!("REGISTRATION COMPLETE: {} models registered", tally.registered);
        println!("{}", "=".repeat(80));
        Ok(tally)
    }

    /// Registers one run; `Ok(None)` means the run has no model artifact.
    async fn register_run(
        &self,
        run: &heartml_tracking::Run,
        model_type: &str,
    ) -> Result<Option<(String, u64, &'static str)>> {
        let run_id = &run.info.run_id;
        let artifacts = self.backend.list_artifacts(run_id, "").await?;
        if !artifacts.iter().any(|entry| entry.path.contains("model")) {
            return Ok(None);
        }

        let name = registered_model_name(model_type);
        if self.backend.get_registered_model(&name).await?.is_none() {
            self.backend.create_registered_model(&name).await?;
        }

        let roc_auc = run
            .data
            .metrics
            .get(METRIC_ROC_AUC)
            .copied()
            .unwrap_or(0.0);
        let source = format!("runs:/{run_id}/model");
        let description = format!("{model_type} trained run {run_id}, {METRIC_ROC_AUC}={roc_auc:.4}");
        let version = self
            .backend
            .create_model_version(&name, &source, run_id, &description)
            .await?;

        let stage = if roc_auc > PRODUCTION_THRESHOLD {
            "Production"
        } else {
            "Staging"
        };
        self.backend
            .transition_model_version_stage(&name, version, stage)
            .await?;
        Ok(Some((name, version, stage)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use heartml_tracking::{MemoryStore, Run, RunData, RunInfo, RunStatus};

    fn trained_run(run_id: &str, model_type: &str, roc_auc: f64, age_minutes: i64) -> Run {
        let mut data = RunData::default();
        data.params.insert(PARAM_MODEL_TYPE.into(), model_type.into());
        data.metrics.insert(METRIC_ROC_AUC.into(), roc_auc);
        Run {
            info: RunInfo {
                run_id: run_id.into(),
                run_name: Some(format!("train-{run_id}")),
                status: RunStatus::Finished,
                start_time: Utc::now() - Duration::minutes(age_minutes),
            },
            data,
        }
    }

    fn registrar(store: &Arc<MemoryStore>) -> ModelRegistrar {
        ModelRegistrar::new(
            Arc::clone(store) as Arc<dyn TrackingBackend>,
            Arc::new(JsonLogger::discard()),
        )
    }

    #[test]
    fn model_names_follow_the_estimator_family() {
        assert_eq!(
            registered_model_name("LogisticRegression"),
            "heart-disease-logistic-regression"
        );
        assert_eq!(
            registered_model_name("RandomForest"),
            "heart-disease-random-forest"
        );
        assert_eq!(registered_model_name("XGBoost"), "heart-disease-xgboost");
    }

    #[tokio::test]
    async fn registers_runs_with_model_artifacts() {
        let store = Arc::new(MemoryStore::new());
        let experiment_id = store.seed_experiment("heart-disease-prediction");
        store.seed_run(&experiment_id, trained_run("a", "RandomForest", 0.97, 0));
        store.seed_run(&experiment_id, trained_run("b", "LogisticRegression", 0.91, 1));
        store.seed_run(&experiment_id, trained_run("c", "RandomForest", 0.90, 2));
        store.seed_artifact("a", "model/MLmodel", b"spec");
        store.seed_artifact("b", "model/MLmodel", b"spec");
        // run "c" logged no model artifact

        let tally = registrar(&store)
            .register_latest(&RegistrationOptions::default())
            .await
            .unwrap();
        assert_eq!(
            tally,
            RegistrationTally {
                registered: 2,
                skipped: 1,
                failed: 0
            }
        );

        let forest = store.model_versions("heart-disease-random-forest");
        assert_eq!(forest.len(), 1);
        assert_eq!(forest[0].run_id, "a");
        assert_eq!(forest[0].source, "runs:/a/model");
        assert_eq!(forest[0].stage, "Production");

        let logistic = store.model_versions("heart-disease-logistic-regression");
        assert_eq!(logistic.len(), 1);
        assert_eq!(logistic[0].stage, "Staging");
    }

    #[tokio::test]
    async fn absent_experiment_yields_zero_tally() {
        let store = Arc::new(MemoryStore::new());
        let tally = registrar(&store)
            .register_latest(&RegistrationOptions::default())
            .await
            .unwrap();
        assert_eq!(tally, RegistrationTally::default());
        assert_eq!(store.write_calls(), 0);
    }

    #[tokio::test]
    async fn max_runs_caps_the_scan_at_most_recent() {
        let store = Arc::new(MemoryStore::new());
        let experiment_id = store.seed_experiment("heart-disease-prediction");
        for index in 0..5 {
            let run_id = format!("r{index}");
            store.seed_run(
                &experiment_id,
                trained_run(&run_id, "RandomForest", 0.9, i64::from(index)),
            );
            store.seed_artifact(&run_id, "model/MLmodel", b"spec");
        }
        let options = RegistrationOptions {
            experiment_name: "heart-disease-prediction".to_string(),
            max_runs: 2,
        };
        let tally = registrar(&store).register_latest(&options).await.unwrap();
        assert_eq!(tally.registered, 2);
        // Most recent first: r0 and r1 were started last.
        let versions = store.model_versions("heart-disease-random-forest");
        let run_ids: Vec<_> = versions.iter().map(|v| v.run_id.as_str()).collect();
        assert_eq!(run_ids, vec!["r0", "r1"]);
    }

    #[tokio::test]
    async fn repeated_passes_append_versions() {
        let store = Arc::new(MemoryStore::new());
        let experiment_id = store.seed_experiment("heart-disease-prediction");
        store.seed_run(&experiment_id, trained_run("a", "RandomForest", 0.9, 0));
        store.seed_artifact("a", "model/MLmodel", b"spec");

        let r = registrar(&store);
        r.register_latest(&RegistrationOptions::default()).await.unwrap();
        r.register_latest(&RegistrationOptions::default()).await.unwrap();
        let versions = store.model_versions("heart-disease-random-forest");
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[1].version, 2);
    }
}
