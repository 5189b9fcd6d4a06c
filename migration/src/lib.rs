#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Run-migration workflow between tracking stores.
//!
//! Control flow: [`MigrationDriver`] per invocation →
//! [`ExperimentMigrator`] per experiment → [`RunCopier`] per run → the
//! two stores. Strictly sequential, no retries, no checkpoint/resume;
//! re-running a partially completed migration duplicates already-copied
//! runs because copies always receive fresh identities.

/// Run copier.
pub mod copier;

/// Environment-based tracking configuration.
pub mod config;

/// Migration driver.
pub mod driver;

/// Experiment migrator.
pub mod migrator;

/// Outcome tallies and the process-wide report.
pub mod outcome;

pub use copier::{RunCopier, TAG_MIGRATION_TIMESTAMP, TAG_SOURCE_RUN_ID, TAG_SOURCE_URI};
pub use config::{database_uri, Environment, TrackingConfig};
pub use driver::{MigrationDriver, DEFAULT_EXPERIMENT};
pub use migrator::{ExperimentMigrator, MigrationOptions};
pub use outcome::{MigrationReport, RunTally};
