#![doc = include_str!("../README.md")]
// Declare modules
pub mod batch;
pub mod block;
pub mod config;
pub mod encoding;
pub mod error;
pub mod filter;
pub mod labels;
pub mod pipeline;
pub mod sink;
pub mod storage;
pub mod telemetry;
pub mod types;

/// Settings of one migration run.
pub use crate::config::MigrateConfig;
/// Main entry points: migrate every block under a root, or an explicit list of blocks.
pub use crate::pipeline::{migrate, migrate_blocks, MigrationStats};
/// Error types: fatal run errors, engine errors, and non-fatal sink errors.
pub use crate::error::{MigrateError, SinkError, StorageError};
/// Bundled on-disk block engine.
pub use crate::block::{BlockWriter, DiskEngine};
/// Remote ingestion endpoint and the bundled sinks.
pub use crate::sink::{DiscardSink, JsonLinesSink, Sink};
/// Structured event hook for observability.
pub use crate::telemetry::{MigrationEvent, MigrationEventListener};
/// Core data model.
pub use crate::types::{Label, Labels, Sample, Timestamp, Value};
