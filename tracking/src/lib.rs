#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Tracking-store data model and backends for the heartml tooling.
//!
//! The [`RecordStore`] trait is the only surface the migration and
//! registration workflows see; [`RestStore`], [`FileStore`], and
//! [`MemoryStore`] implement it over HTTP, the local `mlruns/` layout,
//! and process memory respectively.

/// Core entities: experiments, runs, statuses, artifacts.
pub mod entities;

/// File-backed store over the `mlruns/` directory layout.
pub mod fs;

/// In-memory store with failure-injection knobs.
pub mod memory;

/// REST store speaking the tracking server's HTTP protocol.
pub mod rest;

/// Store traits.
pub mod store;

/// Tracking URI → backend dispatch.
pub mod uri;

pub use entities::{
    ArtifactEntry, Experiment, LifecycleStage, RegisteredModel, Run, RunData, RunInfo, RunStatus,
    SYSTEM_TAG_PREFIX,
};
pub use fs::FileStore;
pub use memory::MemoryStore;
pub use rest::{RestStore, StoreError};
pub use store::{ModelRegistry, RecordStore, TrackingBackend};
pub use uri::{backend_for_uri, store_for_uri};
