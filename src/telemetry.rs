use crate::pipeline::MigrationStats;
use crate::types::{Labels, SeriesRef};

use std::path::PathBuf;
use std::sync::Arc;

use std::time::Duration;

/// Structured, in-process event hook for observability.
///
/// The pipeline never prints. Callers pass an implementation through
/// [`MigrateConfig::event_listener`](crate::config::MigrateConfig::event_listener) and decide where
/// the events go: `tracing`, a test recorder, or nowhere.
pub trait MigrationEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: MigrationEvent);
}

/// Structured events emitted by the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum MigrationEvent {
    RunStarted {
        root: PathBuf,
        blocks: usize,
    },
    BlockOpened {
        path: PathBuf,
    },
    BlockFinished {
        path: PathBuf,
        series: u64,
        batches: u64,
        samples: u64,
    },

    BatchSent {
        series: SeriesRef,
        samples: usize,
        accepted: usize,
    },
    /// Non-fatal: the batch is lost and traversal continues.
    IngestFailed {
        block: PathBuf,
        series: SeriesRef,
        labels: Labels,
        attempted: usize,
        error: String,
    },

    /// A reader could not be released while the run was already failing.
    ReaderReleaseFailed {
        path: PathBuf,
        error: String,
    },

    RunFinished {
        stats: MigrationStats,
    },
    RunAborted {
        error: String,
    },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl MigrationEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: MigrationEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn MigrationEventListener> {
    Arc::new(NoopEventListener)
}

/// Forwards events to `tracing` under the `tsmigrate` target.
///
/// Run and block progress is logged at `info`, every batch at `debug`, ingest and release
/// failures at `warn`. A run abort is logged at `error`.
#[derive(Debug, Default)]
pub struct TracingEventListener;

impl MigrationEventListener for TracingEventListener {
    fn on_event(&self, event: MigrationEvent) {
        match event {
            MigrationEvent::RunStarted { root, blocks } => {
                tracing::info!(target: "tsmigrate", root = %root.display(), blocks, "starting migration");
            }
            MigrationEvent::BlockOpened { path } => {
                tracing::info!(target: "tsmigrate", block = %path.display(), "processing block");
            }
            MigrationEvent::BlockFinished {
                path,
                series,
                batches,
                samples,
            } => {
                tracing::info!(
                    target: "tsmigrate",
                    block = %path.display(),
                    series,
                    batches,
                    samples,
                    "finished block"
                );
            }
            MigrationEvent::BatchSent {
                series,
                samples,
                accepted,
            } => {
                tracing::debug!(target: "tsmigrate", %series, samples, accepted, "batch sent");
            }
            MigrationEvent::IngestFailed {
                block,
                series,
                labels,
                attempted,
                error,
            } => {
                tracing::warn!(
                    target: "tsmigrate",
                    block = %block.display(),
                    %series,
                    %labels,
                    attempted,
                    error = %error,
                    "failed to ingest samples"
                );
            }
            MigrationEvent::ReaderReleaseFailed { path, error } => {
                tracing::warn!(target: "tsmigrate", block = %path.display(), error = %error, "failed to release reader");
            }
            MigrationEvent::RunFinished { stats } => {
                tracing::info!(
                    target: "tsmigrate",
                    blocks = stats.blocks,
                    series = stats.series,
                    batches_sent = stats.batches_sent,
                    samples_sent = stats.samples_sent,
                    samples_dropped = stats.samples_dropped,
                    ingest_failures = stats.ingest_failures,
                    "migration finished"
                );
            }
            MigrationEvent::RunAborted { error } => {
                tracing::error!(target: "tsmigrate", error = %error, "migration aborted");
            }
        }
    }
}

/// Metrics instrumentation for migration runs.
///
/// Emitting is a no-op until a recorder is installed. With the `prometheus` feature the process can
/// install an in-process recorder and render the exposition text itself; no HTTP server is started.
pub mod migrate_metrics {
    use super::*;

    use ::metrics::{describe_counter, describe_histogram, Unit};

    #[cfg(feature = "prometheus")]
    use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

    // Counters are exposed as `<name>_total` by the Prometheus exporter.

    pub const BLOCKS: &str = "tsmigrate_blocks";
    pub const SERIES: &str = "tsmigrate_series";
    pub const BATCHES_SENT: &str = "tsmigrate_batches_sent";
    pub const SAMPLES_SENT: &str = "tsmigrate_samples_sent";
    pub const SAMPLES_DROPPED: &str = "tsmigrate_samples_dropped";
    pub const INGEST_FAILURES: &str = "tsmigrate_ingest_failures";

    pub const BLOCK_DURATION_SECONDS: &str = "tsmigrate_block_duration_seconds";

    /// The process-wide Prometheus recorder. Rendered once when the run ends.
    #[cfg(feature = "prometheus")]
    #[derive(Debug, Clone)]
    pub struct PrometheusRecorder {
        handle: PrometheusHandle,
    }

    #[cfg(feature = "prometheus")]
    impl PrometheusRecorder {
        /// Installs the global recorder. Fails if any recorder is already installed.
        pub fn install() -> Result<Self, MetricsInitError> {
            describe_all();
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(MetricsInitError::from_build_error)?;
            Ok(Self { handle })
        }

        /// Drains histogram buckets, then renders the Prometheus text exposition format.
        pub fn render(&self) -> String {
            self.handle.run_upkeep();
            self.handle.render()
        }
    }

    #[cfg(feature = "prometheus")]
    #[derive(Debug, thiserror::Error)]
    pub enum MetricsInitError {
        #[error("metrics recorder already installed")]
        AlreadyInstalled,
        #[error("failed to install prometheus recorder: {0}")]
        Install(String),
    }

    #[cfg(feature = "prometheus")]
    impl MetricsInitError {
        fn from_build_error(e: BuildError) -> Self {
            match e {
                BuildError::FailedToSetGlobalRecorder(_) => MetricsInitError::AlreadyInstalled,
                other => MetricsInitError::Install(other.to_string()),
            }
        }
    }

    #[inline]
    pub fn record_block(duration: Duration, series: u64) {
        ::metrics::counter!(BLOCKS).increment(1);
        ::metrics::histogram!(BLOCK_DURATION_SECONDS).record(duration.as_secs_f64());
        if series > 0 {
            ::metrics::counter!(SERIES).increment(series);
        }
    }

    #[inline]
    pub fn record_batch_sent(samples: u64) {
        ::metrics::counter!(BATCHES_SENT).increment(1);
        ::metrics::counter!(SAMPLES_SENT).increment(samples);
    }

    #[inline]
    pub fn record_samples_dropped(samples: u64) {
        if samples > 0 {
            ::metrics::counter!(SAMPLES_DROPPED).increment(samples);
        }
    }

    #[inline]
    pub fn record_ingest_failure() {
        ::metrics::counter!(INGEST_FAILURES).increment(1);
    }

    pub fn describe_all() {
        describe_counter!(BLOCKS, Unit::Count, "Blocks fully processed.");
        describe_counter!(
            SERIES,
            Unit::Count,
            "Series matched by the selection predicate across processed blocks."
        );
        describe_counter!(
            BATCHES_SENT,
            Unit::Count,
            "Batches accepted by the sink."
        );
        describe_counter!(
            SAMPLES_SENT,
            Unit::Count,
            "Samples contained in batches accepted by the sink."
        );
        describe_counter!(
            SAMPLES_DROPPED,
            Unit::Count,
            "Decoded samples dropped for a non-finite value or a timestamp outside the window."
        );
        describe_counter!(
            INGEST_FAILURES,
            Unit::Count,
            "Batches the sink failed to ingest."
        );

        describe_histogram!(
            BLOCK_DURATION_SECONDS,
            Unit::Seconds,
            "Wall time spent migrating one block."
        );
    }
}
