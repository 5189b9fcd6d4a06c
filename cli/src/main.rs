//! `heartml` — operational CLI for the tracking stores: run migration,
//! model registration, and configuration inspection.

use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use heartml_logging::JsonLogger;
use heartml_migration::{MigrationDriver, MigrationOptions, TrackingConfig};
use heartml_registry::{ModelRegistrar, RegistrationOptions};
use heartml_tracking::{backend_for_uri, store_for_uri};
use tokio::runtime::Runtime;

#[derive(Parser, Debug)]
#[command(name = "heartml", version, about = "Heart-disease MLOps tracking tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Migrates runs from one tracking store to another.
    Migrate(MigrateArgs),
    /// Registers trained models from runs into the model registry.
    Register(RegisterArgs),
    /// Prints the tracking configuration resolved from the environment.
    Config,
}

#[derive(Parser, Debug)]
struct MigrateArgs {
    /// Source tracking URI.
    #[arg(long, default_value = "file://./mlruns")]
    source: String,
    /// Target tracking URI (e.g. http://localhost:5001).
    #[arg(long)]
    target: Option<String>,
    /// Migrate a single experiment instead of the whole store.
    #[arg(long)]
    experiment: Option<String>,
    /// Skip artifact copying (faster, but incomplete).
    #[arg(long)]
    no_artifacts: bool,
    /// Also copy failed/incomplete runs.
    #[arg(long)]
    include_failed: bool,
    /// Take the target URI from the environment configuration.
    #[arg(long)]
    use_config: bool,
    /// Structured log destination.
    #[arg(long, default_value = "logs/heartml-migrate.jsonl")]
    log_file: PathBuf,
}

#[derive(Parser, Debug)]
struct RegisterArgs {
    /// Tracking URI; defaults to the environment configuration.
    #[arg(long)]
    tracking_uri: Option<String>,
    /// Experiment whose runs are scanned.
    #[arg(long)]
    experiment: Option<String>,
    /// Maximum number of most-recent runs to consider.
    #[arg(long, default_value_t = 10)]
    max_runs: usize,
    /// Structured log destination.
    #[arg(long, default_value = "logs/heartml-register.jsonl")]
    log_file: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = Runtime::new()?;
    match cli.command {
        Commands::Migrate(args) => {
            let exit_code = runtime.block_on(handle_migrate(args))?;
            if exit_code != 0 {
                std::process::exit(exit_code);
            }
            Ok(())
        }
        Commands::Register(args) => runtime.block_on(handle_register(args)),
        Commands::Config => {
            let config = TrackingConfig::from_env()?;
            println!("{}", config.render());
            Ok(())
        }
    }
}

/// Resolves the target URI before any store is touched; a missing target
/// is the one process-fatal configuration error.
fn resolve_target(args: &MigrateArgs) -> Result<String> {
    if args.use_config {
        let config = TrackingConfig::from_env()?;
        println!("Using target from config: {}", config.tracking_uri);
        return Ok(config.tracking_uri);
    }
    match &args.target {
        Some(target) => Ok(target.clone()),
        None => bail!("must specify --target or --use-config"),
    }
}

async fn handle_migrate(args: MigrateArgs) -> Result<i32> {
    let target_uri = resolve_target(&args)?;
    let logger = Arc::new(JsonLogger::create(&args.log_file)?);

    let source = store_for_uri(&args.source)?;
    let target = store_for_uri(&target_uri)?;
    let driver = MigrationDriver::new(
        source,
        target,
        args.source.clone(),
        target_uri,
        Arc::clone(&logger),
    );

    let options = MigrationOptions {
        copy_artifacts: !args.no_artifacts,
        skip_failed: !args.include_failed,
    };
    let report = match &args.experiment {
        Some(name) => driver.migrate_one(name, options).await?,
        None => driver.migrate_all(options).await?,
    };

    println!("\n{report}");
    Ok(report.exit_code())
}

async fn handle_register(args: RegisterArgs) -> Result<()> {
    let config = TrackingConfig::from_env()?;
    let tracking_uri = args.tracking_uri.unwrap_or_else(|| config.tracking_uri.clone());
    let experiment_name = args
        .experiment
        .unwrap_or_else(|| config.experiment_name.clone());
    println!("Tracking URI: {tracking_uri}\n");

    let logger = Arc::new(JsonLogger::create(&args.log_file)?);
    let backend = backend_for_uri(&tracking_uri)?;
    let registrar = ModelRegistrar::new(backend, logger);
    let options = RegistrationOptions {
        experiment_name,
        max_runs: args.max_runs,
    };
    registrar.register_latest(&options).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_migrate_flags() {
        let cli = Cli::parse_from([
            "heartml",
            "migrate",
            "--target",
            "http://localhost:5001",
            "--experiment",
            "exp-A",
            "--no-artifacts",
            "--include-failed",
        ]);
        let Commands::Migrate(args) = cli.command else {
            panic!("expected migrate subcommand");
        };
        assert_eq!(args.source, "file://./mlruns");
        assert_eq!(args.target.as_deref(), Some("http://localhost:5001"));
        assert_eq!(args.experiment.as_deref(), Some("exp-A"));
        assert!(args.no_artifacts);
        assert!(args.include_failed);
    }

    #[test]
    fn migrate_without_target_is_a_config_error() {
        let cli = Cli::parse_from(["heartml", "migrate"]);
        let Commands::Migrate(args) = cli.command else {
            panic!("expected migrate subcommand");
        };
        assert!(resolve_target(&args).is_err());
    }

    #[test]
    fn cli_parses_register_defaults() {
        let cli = Cli::parse_from(["heartml", "register"]);
        let Commands::Register(args) = cli.command else {
            panic!("expected register subcommand");
        };
        assert!(args.tracking_uri.is_none());
        assert_eq!(args.max_runs, 10);
    }
}
