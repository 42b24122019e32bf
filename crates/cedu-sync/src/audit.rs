//! Structured run log. Every entry is mirrored to `tracing` and the whole log
//! is persisted with the run result.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Load,
    Validate,
    Import,
    Cleanup,
    Reconcile,
    Commit,
    Verify,
    Complete,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Load => "load",
            Stage::Validate => "validate",
            Stage::Import => "import",
            Stage::Cleanup => "cleanup",
            Stage::Reconcile => "reconcile",
            Stage::Commit => "commit",
            Stage::Verify => "verify",
            Stage::Complete => "complete",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub stage: Stage,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonValue>,
}

/// Log entries plus the error and warning lists of one run.
#[derive(Debug, Clone, Default)]
pub struct AuditLog {
    entries: Vec<LogEntry>,
    errors: Vec<String>,
    warnings: Vec<String>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info(&mut self, stage: Stage, message: impl Into<String>) {
        self.push(LogLevel::Info, stage, message.into(), None);
    }

    pub fn info_with(&mut self, stage: Stage, message: impl Into<String>, details: JsonValue) {
        self.push(LogLevel::Info, stage, message.into(), Some(details));
    }

    /// Record a non-blocking problem; it also lands in the run's warning list.
    pub fn warn(&mut self, stage: Stage, message: impl Into<String>) {
        let message = message.into();
        self.warnings.push(message.clone());
        self.push(LogLevel::Warn, stage, message, None);
    }

    /// Record a failure; it also lands in the run's error list.
    pub fn error(&mut self, stage: Stage, message: impl Into<String>) {
        let message = message.into();
        self.errors.push(message.clone());
        self.push(LogLevel::Error, stage, message, None);
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn into_parts(self) -> (Vec<LogEntry>, Vec<String>, Vec<String>) {
        (self.entries, self.errors, self.warnings)
    }

    fn push(&mut self, level: LogLevel, stage: Stage, message: String, details: Option<JsonValue>) {
        match level {
            LogLevel::Info => info!(%stage, "{message}"),
            LogLevel::Warn => warn!(%stage, "{message}"),
            LogLevel::Error => error!(%stage, "{message}"),
        }
        self.entries.push(LogEntry {
            timestamp: Utc::now(),
            level,
            stage,
            message,
            details,
        });
    }
}

/// `logs/import-2025-01-05T10-00-00-123Z-<run_id>.json` for a run started at
/// that instant. The run id keeps runs started in the same millisecond apart.
pub fn audit_file_path(logs_dir: &Path, started_at: DateTime<Utc>, run_id: Uuid) -> PathBuf {
    let stamp = started_at
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    logs_dir.join(format!("import-{stamp}-{run_id}.json"))
}
