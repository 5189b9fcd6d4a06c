//! Migrates every run of one experiment into the target store.

use std::sync::Arc;

use anyhow::Result;
use heartml_logging::JsonLogger;
use heartml_tracking::{RecordStore, RunStatus};

use crate::{copier::RunCopier, outcome::RunTally};

const COMPONENT: &str = "migrator";

/// Options shared by the migrator and the driver.
#[derive(Debug, Clone, Copy)]
pub struct MigrationOptions {
    /// Transfer artifact trees alongside metadata.
    pub copy_artifacts: bool,
    /// Skip runs whose status is not finished.
    pub skip_failed: bool,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            copy_artifacts: true,
            skip_failed: true,
        }
    }
}

/// Copies one experiment's runs, tallying per-run outcomes.
pub struct ExperimentMigrator {
    source: Arc<dyn RecordStore>,
    target: Arc<dyn RecordStore>,
    copier: RunCopier,
    logger: Arc<JsonLogger>,
}

impl ExperimentMigrator {
    /// Builds a migrator over the two stores.
    pub fn new(
        source: Arc<dyn RecordStore>,
        target: Arc<dyn RecordStore>,
        source_uri: impl Into<String>,
        logger: Arc<JsonLogger>,
    ) -> Self {
        let copier = RunCopier::new(
            Arc::clone(&source),
            Arc::clone(&target),
            source_uri,
            Arc::clone(&logger),
        );
        Self {
            source,
            target,
            copier,
            logger,
        }
    }

    /// Migrates every run of the named experiment. An absent source
    /// experiment is not an error: it returns an all-zero tally. Each run
    /// is attempted exactly once; one run's failure never aborts the
    /// batch.
    pub async fn migrate_experiment(
        &self,
        name: &str,
        options: MigrationOptions,
    ) -> Result<RunTally> {
        println!("\nMigrating experiment: {name}");

        let Some(source_experiment) = self.source.get_experiment_by_name(name).await? else {
            println!("  experiment '{name}' not found in source");
            let _ = self
                .logger
                .warn(COMPONENT, format!("experiment '{name}' not found in source"));
            return Ok(RunTally::default());
        };

        let target_experiment_id = self.ensure_target_experiment(name).await?;

        let runs = self
            .source
            .search_runs(&source_experiment.experiment_id)
            .await?;
        println!("  found {} runs to migrate", runs.len());

        let mut tally = RunTally::default();
        for (index, run) in runs.iter().enumerate() {
            let short_id: String = run.info.run_id.chars().take(8).collect();
            print!("  [{}/{}] migrating run {short_id}...", index + 1, runs.len());

            if options.skip_failed && run.info.status != RunStatus::Finished {
                println!(" SKIPPED (not finished)");
                tally.skipped += 1;
                continue;
            }

            match self
                .copier
                .copy_run(run, &target_experiment_id, options.copy_artifacts)
                .await
            {
                Ok(new_run_id) => {
                    let new_short: String = new_run_id.chars().take(8).collect();
                    println!(" SUCCESS (new ID: {new_short})");
                    tally.success += 1;
                }
                Err(err) => {
                    println!(" FAILED: {err:#}");
                    let _ = self.logger.error(
                        COMPONENT,
                        format!("run {} failed to migrate: {err:#}", run.info.run_id),
                    );
                    tally.failed += 1;
                }
            }
        }
        Ok(tally)
    }

    /// Looks up the same-named target experiment, creating it when
    /// absent. Lookup-then-create is not atomic; this workflow assumes a
    /// single writer against the target store.
    async fn ensure_target_experiment(&self, name: &str) -> Result<String> {
        if let Some(existing) = self.target.get_experiment_by_name(name).await? {
            println!(
                "  experiment '{name}' already exists (ID: {})",
                existing.experiment_id
            );
            return Ok(existing.experiment_id);
        }
        let experiment_id = self.target.create_experiment(name).await?;
        println!("  created experiment '{name}' (ID: {experiment_id})");
        Ok(experiment_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use heartml_tracking::{MemoryStore, Run, RunData, RunInfo};

    fn run_with(run_id: &str, name: &str, status: RunStatus, x: &str, acc: f64) -> Run {
        let mut data = RunData::default();
        data.params.insert("x".into(), x.into());
        data.metrics.insert("acc".into(), acc);
        Run {
            info: RunInfo {
                run_id: run_id.into(),
                run_name: Some(name.into()),
                status,
                start_time: Utc::now(),
            },
            data,
        }
    }

    fn migrator(
        source: &Arc<MemoryStore>,
        target: &Arc<MemoryStore>,
    ) -> ExperimentMigrator {
        ExperimentMigrator::new(
            Arc::clone(source) as Arc<dyn RecordStore>,
            Arc::clone(target) as Arc<dyn RecordStore>,
            "file://./mlruns",
            Arc::new(JsonLogger::discard()),
        )
    }

    #[tokio::test]
    async fn finished_runs_copy_and_killed_runs_skip() {
        let source = Arc::new(MemoryStore::new());
        let experiment_id = source.seed_experiment("exp-A");
        source.seed_run(
            &experiment_id,
            run_with("run1", "r1", RunStatus::Finished, "1", 0.9),
        );
        source.seed_run(
            &experiment_id,
            run_with("run2", "r2", RunStatus::Finished, "2", 0.8),
        );
        source.seed_run(
            &experiment_id,
            run_with("run3", "r3", RunStatus::Killed, "3", 0.1),
        );

        let target = Arc::new(MemoryStore::new());
        let tally = migrator(&source, &target)
            .migrate_experiment("exp-A", MigrationOptions::default())
            .await
            .unwrap();

        assert_eq!(
            tally,
            RunTally {
                success: 2,
                failed: 0,
                skipped: 1
            }
        );
        let target_experiment = target
            .get_experiment_by_name("exp-A")
            .await
            .unwrap()
            .unwrap();
        let copied = target.runs_in(&target_experiment.experiment_id);
        assert_eq!(copied.len(), 2);
        assert_eq!(copied[0].data.params["x"], "1");
        assert!((copied[0].data.metrics["acc"] - 0.9).abs() < f64::EPSILON);
        assert_eq!(
            copied[0].data.tags["mlflow.migration.source_run_id"],
            "run1"
        );
        assert_eq!(
            copied[1].data.tags["mlflow.migration.source_run_id"],
            "run2"
        );
    }

    #[tokio::test]
    async fn include_failed_copies_every_run() {
        let source = Arc::new(MemoryStore::new());
        let experiment_id = source.seed_experiment("exp-A");
        source.seed_run(
            &experiment_id,
            run_with("run1", "r1", RunStatus::Finished, "1", 0.9),
        );
        source.seed_run(
            &experiment_id,
            run_with("run3", "r3", RunStatus::Failed, "3", 0.1),
        );

        let target = Arc::new(MemoryStore::new());
        let options = MigrationOptions {
            copy_artifacts: false,
            skip_failed: false,
        };
        let tally = migrator(&source, &target)
            .migrate_experiment("exp-A", options)
            .await
            .unwrap();
        assert_eq!(
            tally,
            RunTally {
                success: 2,
                failed: 0,
                skipped: 0
            }
        );
    }

    #[tokio::test]
    async fn absent_experiment_returns_zero_tally_without_target_writes() {
        let source = Arc::new(MemoryStore::new());
        let target = Arc::new(MemoryStore::new());
        let tally = migrator(&source, &target)
            .migrate_experiment("missing", MigrationOptions::default())
            .await
            .unwrap();
        assert_eq!(tally, RunTally::default());
        assert_eq!(target.write_calls(), 0);
        assert_eq!(target.run_count(), 0);
        assert_eq!(target.experiment_count(), 0);
    }

    #[tokio::test]
    async fn one_failing_run_does_not_abort_the_batch() {
        let source = Arc::new(MemoryStore::new());
        let experiment_id = source.seed_experiment("exp-A");
        source.seed_run(
            &experiment_id,
            run_with("run1", "boom", RunStatus::Finished, "1", 0.9),
        );
        source.seed_run(
            &experiment_id,
            run_with("run2", "ok", RunStatus::Finished, "2", 0.8),
        );

        let target = Arc::new(MemoryStore::new());
        target.fail_runs_named("boom");
        let tally = migrator(&source, &target)
            .migrate_experiment("exp-A", MigrationOptions::default())
            .await
            .unwrap();
        assert_eq!(
            tally,
            RunTally {
                success: 1,
                failed: 1,
                skipped: 0
            }
        );
        assert_eq!(tally.total(), 2);
    }

    #[tokio::test]
    async fn existing_target_experiment_is_reused() {
        let source = Arc::new(MemoryStore::new());
        let experiment_id = source.seed_experiment("exp-A");
        source.seed_run(
            &experiment_id,
            run_with("run1", "r1", RunStatus::Finished, "1", 0.9),
        );

        let target = Arc::new(MemoryStore::new());
        let existing_id = target.seed_experiment("exp-A");
        migrator(&source, &target)
            .migrate_experiment("exp-A", MigrationOptions::default())
            .await
            .unwrap();
        assert_eq!(target.experiment_count(), 1);
        assert_eq!(target.runs_in(&existing_id).len(), 1);
    }
}
