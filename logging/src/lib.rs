#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Structured JSON logging shared by the heartml tooling crates.

use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Log severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Diagnostic detail.
    Debug,
    /// Normal progress events.
    Info,
    /// Recoverable problems (e.g. a swallowed artifact-copy failure).
    Warn,
    /// Failures that were counted but not retried.
    Error,
}

/// One structured event emitted by a workflow component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Event timestamp.
    pub timestamp: DateTime<Utc>,
    /// Component that emitted the event (e.g. "migrator", "copier").
    pub component: String,
    /// Severity.
    pub level: LogLevel,
    /// Human-readable message.
    pub message: String,
    /// Free-form structured context (run ids, experiment names, errors).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl LogRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(component: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            component: component.into(),
            level,
            message: message.into(),
            fields: serde_json::Map::new(),
        }
    }

    /// Attaches a structured field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

enum Sink {
    File { path: PathBuf, writer: Mutex<File> },
    Discard,
}

/// Append-only JSONL logger with a minimum-level filter and optional
/// stderr echo for interactive runs.
pub struct JsonLogger {
    sink: Sink,
    min_level: LogLevel,
    echo_stderr: bool,
}

impl JsonLogger {
    /// Creates or opens a JSONL log file, creating parent directories.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            sink: Sink::File {
                path,
                writer: Mutex::new(file),
            },
            min_level: LogLevel::Info,
            echo_stderr: false,
        })
    }

    /// Logger that drops every record; used by quiet tests.
    #[must_use]
    pub const fn discard() -> Self {
        Self {
            sink: Sink::Discard,
            min_level: LogLevel::Error,
            echo_stderr: false,
        }
    }

    /// Sets the minimum severity that will be written.
    #[must_use]
    pub const fn with_min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Also prints each written record to stderr in a compact form.
    #[must_use]
    pub const fn with_stderr_echo(mut self, echo: bool) -> Self {
        self.echo_stderr = echo;
        self
    }

    /// Writes a record if it passes the level filter.
    pub fn log(&self, record: &LogRecord) -> Result<()> {
        if record.level < self.min_level {
            return Ok(());
        }
        if self.echo_stderr {
            eprintln!(
                "[{:?}] {}: {}",
                record.level, record.component, record.message
            );
        }
        match &self.sink {
            Sink::File { writer, .. } => {
                let mut writer = writer.lock();
                serde_json::to_writer(&mut *writer, record)?;
                writer.write_all(b"\n")?;
                writer.flush()?;
                Ok(())
            }
            Sink::Discard => Ok(()),
        }
    }

    /// Convenience wrapper for [`LogLevel::Info`].
    pub fn info(&self, component: &str, message: impl Into<String>) -> Result<()> {
        self.log(&LogRecord::new(component, LogLevel::Info, message))
    }

    /// Convenience wrapper for [`LogLevel::Warn`].
    pub fn warn(&self, component: &str, message: impl Into<String>) -> Result<()> {
        self.log(&LogRecord::new(component, LogLevel::Warn, message))
    }

    /// Convenience wrapper for [`LogLevel::Error`].
    pub fn error(&self, component: &str, message: impl Into<String>) -> Result<()> {
        self.log(&LogRecord::new(component, LogLevel::Error, message))
    }

    /// Path of the backing file, if any (useful for tests).
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match &self.sink {
            Sink::File { path, .. } => Some(path),
            Sink::Discard => None,
        }
    }
}

impl std::fmt::Debug for JsonLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonLogger")
            .field("path", &self.path())
            .field("min_level", &self.min_level)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_json_lines() {
        let dir = tempdir().unwrap();
        let logger = JsonLogger::create(dir.path().join("events.jsonl")).unwrap();
        logger
            .log(
                &LogRecord::new("copier", LogLevel::Warn, "artifact copy failed")
                    .with_field("run_id", serde_json::json!("abc123")),
            )
            .unwrap();
        let content = fs::read_to_string(logger.path().unwrap()).unwrap();
        assert!(content.contains("\"artifact copy failed\""));
        assert!(content.contains("\"run_id\":\"abc123\""));
    }

    #[test]
    fn level_filter_drops_quiet_records() {
        let dir = tempdir().unwrap();
        let logger = JsonLogger::create(dir.path().join("events.jsonl"))
            .unwrap()
            .with_min_level(LogLevel::Warn);
        logger.info("driver", "noise").unwrap();
        logger.error("driver", "signal").unwrap();
        let content = fs::read_to_string(logger.path().unwrap()).unwrap();
        assert!(!content.contains("noise"));
        assert!(content.contains("signal"));
    }

    #[test]
    fn discard_logger_accepts_records() {
        let logger = JsonLogger::discard();
        logger.error("migrator", "dropped").unwrap();
        assert!(logger.path().is_none());
    }
}
