//! Core tracking entities shared by every store backend.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved tag namespace owned by the tracking store itself. Tags under
/// this prefix carry store bookkeeping and must not be copied verbatim
/// between stores.
pub const SYSTEM_TAG_PREFIX: &str = "mlflow.";

/// Terminal and non-terminal run states, mirroring the tracking store's
/// own vocabulary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    /// Queued but not yet started.
    Scheduled,
    /// Currently executing.
    Running,
    /// Completed successfully.
    Finished,
    /// Completed with an error.
    Failed,
    /// Terminated externally.
    Killed,
}

impl RunStatus {
    /// Wire name used by the REST protocol.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "SCHEDULED",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
            Self::Killed => "KILLED",
        }
    }

    /// Parses the wire name; unknown statuses map to [`Self::Failed`]
    /// rather than aborting a listing.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "SCHEDULED" => Self::Scheduled,
            "RUNNING" => Self::Running,
            "FINISHED" => Self::Finished,
            "KILLED" => Self::Killed,
            _ => Self::Failed,
        }
    }

    /// Integer code used by the file-backed store's run metadata.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Running => 1,
            Self::Scheduled => 2,
            Self::Finished => 3,
            Self::Failed => 4,
            Self::Killed => 5,
        }
    }

    /// Inverse of [`Self::code`]; unknown codes map to [`Self::Failed`].
    #[must_use]
    pub const fn from_code(code: u8) -> Self {
        match code {
            1 => Self::Running,
            2 => Self::Scheduled,
            3 => Self::Finished,
            5 => Self::Killed,
            _ => Self::Failed,
        }
    }
}

/// Experiment lifecycle stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleStage {
    /// Visible and writable.
    Active,
    /// Soft-deleted; retained for restore.
    Deleted,
}

impl LifecycleStage {
    /// Parses the store's lowercase stage name; anything unrecognized is
    /// treated as active.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("deleted") {
            Self::Deleted
        } else {
            Self::Active
        }
    }
}

/// A named grouping of runs within one store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    /// Store-assigned opaque identity.
    pub experiment_id: String,
    /// Display name, unique within a store.
    pub name: String,
    /// Lifecycle stage.
    pub lifecycle_stage: LifecycleStage,
}

/// Identity and status portion of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInfo {
    /// Store-assigned opaque identity.
    pub run_id: String,
    /// Optional display name.
    pub run_name: Option<String>,
    /// Current status.
    pub status: RunStatus,
    /// Creation timestamp.
    pub start_time: DateTime<Utc>,
}

/// Recorded payload of a run. Metrics hold only the latest logged value
/// per key; step history stays behind in the source store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunData {
    /// Parameter name → string value, write-once per key.
    pub params: BTreeMap<String, String>,
    /// Metric name → latest numeric value.
    pub metrics: BTreeMap<String, f64>,
    /// Tag name → string value, overwritable.
    pub tags: BTreeMap<String, String>,
}

/// One recorded execution: info plus payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Identity and status.
    pub info: RunInfo,
    /// Params, metrics, and tags.
    pub data: RunData,
}

impl Run {
    /// Display name to use when materializing a copy of this run: the
    /// source name when set, otherwise a deterministic fallback derived
    /// from the first eight characters of the run id.
    #[must_use]
    pub fn display_name(&self) -> String {
        self.info.run_name.clone().unwrap_or_else(|| {
            let prefix: String = self.info.run_id.chars().take(8).collect();
            format!("migrated_{prefix}")
        })
    }
}

/// One entry in a run's artifact tree listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactEntry {
    /// Path relative to the run's artifact root.
    pub path: String,
    /// Whether the entry is a directory.
    pub is_dir: bool,
}

/// A name registered in the model registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredModel {
    /// Registered model name, unique within a registry.
    pub name: String,
    /// Number of versions currently registered under the name.
    pub version_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip() {
        for status in [
            RunStatus::Scheduled,
            RunStatus::Running,
            RunStatus::Finished,
            RunStatus::Failed,
            RunStatus::Killed,
        ] {
            assert_eq!(RunStatus::from_code(status.code()), status);
            assert_eq!(RunStatus::parse(status.as_str()), status);
        }
    }

    #[test]
    fn display_name_falls_back_to_id_prefix() {
        let run = Run {
            info: RunInfo {
                run_id: "0123456789abcdef".into(),
                run_name: None,
                status: RunStatus::Finished,
                start_time: Utc::now(),
            },
            data: RunData::default(),
        };
        assert_eq!(run.display_name(), "migrated_01234567");
    }

    #[test]
    fn display_name_prefers_source_name() {
        let run = Run {
            info: RunInfo {
                run_id: "0123456789abcdef".into(),
                run_name: Some("grid-search-3".into()),
                status: RunStatus::Finished,
                start_time: Utc::now(),
            },
            data: RunData::default(),
        };
        assert_eq!(run.display_name(), "grid-search-3");
    }

    #[test]
    fn short_run_id_does_not_panic() {
        let run = Run {
            info: RunInfo {
                run_id: "ab".into(),
                run_name: None,
                status: RunStatus::Killed,
                start_time: Utc::now(),
            },
            data: RunData::default(),
        };
        assert_eq!(run.display_name(), "migrated_ab");
    }
}
