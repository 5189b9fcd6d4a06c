//! Top-level migration driver: whole-registry and single-experiment modes.

use std::sync::Arc;

use anyhow::Result;
use heartml_logging::JsonLogger;
use heartml_tracking::{LifecycleStage, RecordStore};

use crate::{
    migrator::{ExperimentMigrator, MigrationOptions},
    outcome::MigrationReport,
};

/// Name of the store's built-in default experiment.
pub const DEFAULT_EXPERIMENT: &str = "Default";

const COMPONENT: &str = "driver";

/// Drives a migration between one source and one target store.
pub struct MigrationDriver {
    source: Arc<dyn RecordStore>,
    source_uri: String,
    target_uri: String,
    migrator: ExperimentMigrator,
    logger: Arc<JsonLogger>,
}

impl MigrationDriver {
    /// Builds a driver. The URIs are display/provenance strings; the
    /// stores themselves are already resolved.
    pub fn new(
        source: Arc<dyn RecordStore>,
        target: Arc<dyn RecordStore>,
        source_uri: impl Into<String>,
        target_uri: impl Into<String>,
        logger: Arc<JsonLogger>,
    ) -> Self {
        let source_uri = source_uri.into();
        let migrator = ExperimentMigrator::new(
            Arc::clone(&source),
            target,
            source_uri.clone(),
            Arc::clone(&logger),
        );
        Self {
            source,
            source_uri,
            target_uri: target_uri.into(),
            migrator,
            logger,
        }
    }

    /// Migrates every experiment the source store knows about, in store
    /// order. The store's built-in default experiment is excluded when it
    /// sits in the deleted lifecycle stage; that is bookkeeping, not user
    /// data.
    pub async fn migrate_all(&self, options: MigrationOptions) -> Result<MigrationReport> {
        self.print_banner();
        let experiments = self.source.search_experiments().await?;
        println!("\nFound {} experiments in source", experiments.len());

        let mut report = MigrationReport::default();
        for experiment in experiments {
            if experiment.name == DEFAULT_EXPERIMENT
                && experiment.lifecycle_stage == LifecycleStage::Deleted
            {
                continue;
            }
            let tally = self
                .migrator
                .migrate_experiment(&experiment.name, options)
                .await?;
            report.absorb(tally);
        }
        self.log_report(&report);
        Ok(report)
    }

    /// Migrates a single caller-named experiment.
    pub async fn migrate_one(
        &self,
        name: &str,
        options: MigrationOptions,
    ) -> Result<MigrationReport> {
        self.print_banner();
        let tally = self.migrator.migrate_experiment(name, options).await?;
        let report = MigrationReport::single(tally);
        self.log_report(&report);
        Ok(report)
    }

    fn print_banner(&self) {
        println!("{}", "=".repeat(80));
        println!("TRACKING-STORE RUN MIGRATION");
        println!("{}", "=".repeat(80));
        println!("Source: {}", self.source_uri);
        println!("Target: {}", self.target_uri);
    }

    fn log_report(&self, report: &MigrationReport) {
        let _ = self.logger.log(
            &heartml_logging::LogRecord::new(
                COMPONENT,
                heartml_logging::LogLevel::Info,
                "migration finished",
            )
            .with_field(
                "report",
                serde_json::to_value(report).unwrap_or(serde_json::Value::Null),
            ),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::RunTally;
    use chrono::Utc;
    use heartml_tracking::{MemoryStore, Run, RunData, RunInfo, RunStatus};

    fn finished_run(run_id: &str) -> Run {
        Run {
            info: RunInfo {
                run_id: run_id.into(),
                run_name: Some(format!("run-{run_id}")),
                status: RunStatus::Finished,
                start_time: Utc::now(),
            },
            data: RunData::default(),
        }
    }

    fn driver(source: &Arc<MemoryStore>, target: &Arc<MemoryStore>) -> MigrationDriver {
        MigrationDriver::new(
            Arc::clone(source) as Arc<dyn RecordStore>,
            Arc::clone(target) as Arc<dyn RecordStore>,
            "file://./mlruns",
            "http://localhost:5001",
            Arc::new(JsonLogger::discard()),
        )
    }

    #[tokio::test]
    async fn aggregates_across_experiments() {
        let source = Arc::new(MemoryStore::new());
        let exp_a = source.seed_experiment("exp-A");
        source.seed_run(&exp_a, finished_run("a1"));
        source.seed_run(&exp_a, finished_run("a2"));
        let exp_b = source.seed_experiment("exp-B");
        source.seed_run(&exp_b, finished_run("b1"));

        let target = Arc::new(MemoryStore::new());
        let options = MigrationOptions {
            copy_artifacts: false,
            skip_failed: true,
        };
        let report = driver(&source, &target).migrate_all(options).await.unwrap();

        assert_eq!(report.experiments, 2);
        assert_eq!(
            report.tally,
            RunTally {
                success: 3,
                failed: 0,
                skipped: 0
            }
        );
        assert_eq!(report.exit_code(), 0);
        assert_eq!(target.run_count(), 3);
    }

    #[tokio::test]
    async fn deleted_default_experiment_is_excluded() {
        let source = Arc::new(MemoryStore::new());
        source.seed_experiment_staged(DEFAULT_EXPERIMENT, LifecycleStage::Deleted);
        let exp = source.seed_experiment("exp-A");
        source.seed_run(&exp, finished_run("a1"));

        let target = Arc::new(MemoryStore::new());
        let options = MigrationOptions {
            copy_artifacts: false,
            skip_failed: true,
        };
        let report = driver(&source, &target).migrate_all(options).await.unwrap();
        assert_eq!(report.experiments, 1);
        assert!(target
            .get_experiment_by_name(DEFAULT_EXPERIMENT)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn active_default_experiment_is_migrated() {
        let source = Arc::new(MemoryStore::new());
        let exp = source.seed_experiment(DEFAULT_EXPERIMENT);
        source.seed_run(&exp, finished_run("d1"));

        let target = Arc::new(MemoryStore::new());
        let options = MigrationOptions {
            copy_artifacts: false,
            skip_failed: true,
        };
        let report = driver(&source, &target).migrate_all(options).await.unwrap();
        assert_eq!(report.experiments, 1);
        assert_eq!(report.tally.success, 1);
    }

    #[tokio::test]
    async fn single_experiment_mode_fixes_experiments_at_one() {
        let source = Arc::new(MemoryStore::new());
        let exp = source.seed_experiment("exp-A");
        source.seed_run(&exp, finished_run("a1"));
        source.seed_experiment("exp-B");

        let target = Arc::new(MemoryStore::new());
        let options = MigrationOptions {
            copy_artifacts: false,
            skip_failed: true,
        };
        let report = driver(&source, &target)
            .migrate_one("exp-A", options)
            .await
            .unwrap();
        assert_eq!(report.experiments, 1);
        assert_eq!(report.tally.success, 1);
        assert!(target.get_experiment_by_name("exp-B").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_runs_flip_the_exit_code() {
        let source = Arc::new(MemoryStore::new());
        let exp = source.seed_experiment("exp-A");
        let mut doomed = finished_run("a1");
        doomed.info.run_name = Some("boom".into());
        source.seed_run(&exp, doomed);

        let target = Arc::new(MemoryStore::new());
        target.fail_runs_named("boom");
        let options = MigrationOptions {
            copy_artifacts: false,
            skip_failed: true,
        };
        let report = driver(&source, &target).migrate_all(options).await.unwrap();
        assert_eq!(report.tally.failed, 1);
        assert_eq!(report.exit_code(), 1);
    }

    #[tokio::test]
    async fn rerunning_duplicates_copied_runs() {
        // Copied runs get fresh identities; there is no dedup by source
        // run id, so a second invocation doubles the target runs.
        let source = Arc::new(MemoryStore::new());
        let exp = source.seed_experiment("exp-A");
        source.seed_run(&exp, finished_run("a1"));

        let target = Arc::new(MemoryStore::new());
        let options = MigrationOptions {
            copy_artifacts: false,
            skip_failed: true,
        };
        let d = driver(&source, &target);
        d.migrate_one("exp-A", options).await.unwrap();
        d.migrate_one("exp-A", options).await.unwrap();
        assert_eq!(target.run_count(), 2);
    }
}
