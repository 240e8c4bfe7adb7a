use crate::batch::BatchMode;
use crate::filter::SampleFilter;
use crate::labels::{ExternalLabels, LabelCollisionPolicy};
use crate::telemetry::{noop_event_listener, MigrationEventListener};
use crate::types::Timestamp;

use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Settings of one migration run.
#[derive(Debug, Clone)]
pub struct MigrateConfig {
    /// Root directory holding the blocks.
    pub snapshot_path: PathBuf,
    /// Name half of the series-selection predicate.
    pub label_key: String,
    /// Value half of the series-selection predicate.
    pub label_value: String,
    /// Appended to every emitted series.
    pub external_labels: ExternalLabels,
    /// Inclusive lower bound, in milliseconds.
    pub min_timestamp: Timestamp,
    /// Inclusive upper bound, in milliseconds.
    pub max_timestamp: Timestamp,
    pub batch_mode: BatchMode,
    pub label_collision: LabelCollisionPolicy,
    /// Structured event hook for observability (no-op by default).
    pub event_listener: Arc<dyn MigrationEventListener>,
}

impl Default for MigrateConfig {
    fn default() -> Self {
        MigrateConfig {
            snapshot_path: PathBuf::new(),
            label_key: String::new(),
            label_value: String::new(),
            external_labels: ExternalLabels::default(),
            min_timestamp: 0,
            max_timestamp: Timestamp::MAX,
            batch_mode: BatchMode::default(),
            label_collision: LabelCollisionPolicy::default(),
            event_listener: noop_event_listener(),
        }
    }
}

impl MigrateConfig {
    pub fn new(snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            snapshot_path: snapshot_path.into(),
            ..Self::default()
        }
    }

    pub fn sample_filter(&self) -> SampleFilter {
        SampleFilter::new(self.min_timestamp, self.max_timestamp)
    }
}

/// Verbosity accepted by the `log_level` setting.
///
/// Parsing ignores case, whether the value comes from a flag, a config file or the environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    #[default]
    Debug,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            _ => Err(format!(
                "invalid log level {:?} (expected one of \"error\", \"warn\", \"info\", \"debug\")",
                s
            )),
        }
    }
}

impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
