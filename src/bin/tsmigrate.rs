//! Command-line front end for migrating TSDB blocks.
//!
//! Loads configuration from (in precedence order): defaults, config file, environment variables
//! (`PROM_TS_*`), and CLI flags. Migrates every block under the snapshot path and writes the
//! batches as JSON lines to stdout or a file.

use std::path::PathBuf;

use clap::Parser;
use config::{Config, Environment, File};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};
use tsmigrate::batch::BatchMode;
use tsmigrate::config::LogLevel;
use tsmigrate::labels::{ExternalLabels, LabelCollisionPolicy};
use tsmigrate::telemetry::TracingEventListener;
use tsmigrate::{migrate, DiscardSink, DiskEngine, JsonLinesSink, MigrateConfig, Sink};

// ---------- CLI ----------

/// Migrates series from on-disk TSDB blocks into a remote store.
#[derive(Parser, Debug)]
#[command(name = "tsmigrate", version, about)]
pub struct Cli {
    /// Path to config file (TOML). If omitted, `tsmigrate.toml` is loaded when it exists.
    #[arg(long, env = "PROM_TS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Do not load any config file; use defaults + env + CLI only.
    #[arg(long, default_value_t = false)]
    pub no_config: bool,

    /// Load and validate config (file + env + CLI), print the effective settings, then exit.
    #[arg(long, default_value_t = false)]
    pub validate_config: bool,

    /// Directory holding the blocks to migrate.
    #[arg(long)]
    pub snapshot_path: Option<PathBuf>,

    /// Label name of the series-selection predicate.
    #[arg(long)]
    pub label_key: Option<String>,

    /// Label value of the series-selection predicate.
    #[arg(long)]
    pub label_value: Option<String>,

    /// Labels added to every migrated series, as a JSON object (e.g. '{"env":"prod"}').
    #[arg(long)]
    pub external_labels: Option<String>,

    /// Inclusive lower timestamp bound, unix time in milliseconds.
    #[arg(long, allow_negative_numbers = true)]
    pub min_timestamp: Option<i64>,

    /// Inclusive upper timestamp bound, unix time in milliseconds.
    #[arg(long, allow_negative_numbers = true)]
    pub max_timestamp: Option<i64>,

    /// One of error, warn, info, debug.
    #[arg(long)]
    pub log_level: Option<LogLevel>,

    /// Where batches are written: `-` for stdout, otherwise a file appended to.
    #[arg(long)]
    pub output: Option<String>,

    /// per-chunk or per-series.
    #[arg(long)]
    pub batch_mode: Option<BatchMode>,

    /// append or external-overrides.
    #[arg(long)]
    pub label_collision: Option<LabelCollisionPolicy>,

    /// Read and filter everything but discard the batches.
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    /// Print Prometheus exposition text to stderr when the run ends (`prometheus` feature).
    #[arg(long, default_value_t = false)]
    pub print_metrics: bool,
}

// ---------- File/env config (all optional for partial config) ----------

/// Settings as read from file + env. Every field optional for layering.
#[derive(Debug, Default, serde::Deserialize)]
pub struct FileConfig {
    pub snapshot_path: Option<String>,
    pub label_key: Option<String>,
    pub label_value: Option<String>,
    /// JSON object, kept as a string so file, env and CLI share one format.
    pub external_labels: Option<String>,
    pub min_timestamp: Option<i64>,
    pub max_timestamp: Option<i64>,
    pub log_level: Option<LogLevel>,
    pub output: Option<String>,
    pub batch_mode: Option<BatchMode>,
    pub label_collision: Option<LabelCollisionPolicy>,
}

/// Effective settings of one invocation.
#[derive(Debug)]
pub struct Settings {
    pub migrate: MigrateConfig,
    pub log_level: LogLevel,
    pub output: String,
}

const DEFAULT_CONFIG_FILE: &str = "tsmigrate.toml";
const STDOUT: &str = "-";

/// Load merged settings. CLI overrides file/env.
fn load_settings(cli: &Cli) -> Result<Settings, String> {
    let mut builder = Config::builder();

    if !cli.no_config {
        if let Some(ref path) = cli.config {
            if !path.exists() {
                return Err(format!("config file not found: {}", path.display()));
            }
            builder = builder.add_source(File::from(path.as_path()).required(false));
        } else {
            let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default_path.exists() {
                builder = builder.add_source(File::from(default_path.as_path()).required(false));
            }
        }
    }

    // Values stay strings; only the timestamp fields are converted, during deserialization.
    builder = builder.add_source(
        Environment::with_prefix("PROM_TS")
            .prefix_separator("_")
            .ignore_empty(true),
    );

    let merged = builder.build().map_err(|e| e.to_string())?;
    let partial: FileConfig = merged.try_deserialize().map_err(|e| e.to_string())?;

    let mut migrate = MigrateConfig::default();
    let mut log_level = LogLevel::default();
    let mut output = STDOUT.to_string();
    merge_into_settings(&mut migrate, &mut log_level, &mut output, &partial)?;

    if let Some(ref p) = cli.snapshot_path {
        migrate.snapshot_path = p.clone();
    }
    if let Some(ref k) = cli.label_key {
        migrate.label_key = k.clone();
    }
    if let Some(ref v) = cli.label_value {
        migrate.label_value = v.clone();
    }
    if let Some(ref json) = cli.external_labels {
        migrate.external_labels = parse_external_labels(json)?;
    }
    if let Some(t) = cli.min_timestamp {
        migrate.min_timestamp = t;
    }
    if let Some(t) = cli.max_timestamp {
        migrate.max_timestamp = t;
    }
    if let Some(l) = cli.log_level {
        log_level = l;
    }
    if let Some(ref o) = cli.output {
        output = o.clone();
    }
    if let Some(m) = cli.batch_mode {
        migrate.batch_mode = m;
    }
    if let Some(p) = cli.label_collision {
        migrate.label_collision = p;
    }

    if migrate.snapshot_path.as_os_str().is_empty() {
        return Err("snapshot_path is required".to_string());
    }

    migrate.event_listener = std::sync::Arc::new(TracingEventListener);
    Ok(Settings {
        migrate,
        log_level,
        output,
    })
}

/// Merge file/env partial config. Only overwrites fields that are `Some`.
fn merge_into_settings(
    base: &mut MigrateConfig,
    log_level: &mut LogLevel,
    output: &mut String,
    partial: &FileConfig,
) -> Result<(), String> {
    if let Some(s) = &partial.snapshot_path {
        base.snapshot_path = PathBuf::from(s);
    }
    if let Some(k) = &partial.label_key {
        base.label_key = k.clone();
    }
    if let Some(v) = &partial.label_value {
        base.label_value = v.clone();
    }
    if let Some(json) = &partial.external_labels {
        base.external_labels = parse_external_labels(json)?;
    }
    if let Some(t) = partial.min_timestamp {
        base.min_timestamp = t;
    }
    if let Some(t) = partial.max_timestamp {
        base.max_timestamp = t;
    }
    if let Some(l) = partial.log_level {
        *log_level = l;
    }
    if let Some(o) = &partial.output {
        *output = o.clone();
    }
    if let Some(m) = partial.batch_mode {
        base.batch_mode = m;
    }
    if let Some(p) = partial.label_collision {
        base.label_collision = p;
    }
    Ok(())
}

fn parse_external_labels(json: &str) -> Result<ExternalLabels, String> {
    ExternalLabels::parse(json).map_err(|e| e.to_string())
}

// ---------- Logging ----------

/// Installs a stderr fmt layer. `RUST_LOG` wins over the configured level when set.
fn init_logging(level: LogLevel) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr);

    Registry::default()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| e.to_string())
}

fn open_sink(cli: &Cli, settings: &Settings) -> Result<Box<dyn Sink>, String> {
    if cli.dry_run {
        return Ok(Box::new(DiscardSink::default()));
    }
    if settings.output == STDOUT {
        return Ok(Box::new(JsonLinesSink::stdout()));
    }
    let sink = JsonLinesSink::append_to_file(&settings.output)
        .map_err(|e| format!("open output {}: {}", settings.output, e))?;
    Ok(Box::new(sink))
}

// ---------- Main ----------

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    let settings = load_settings(&cli).map_err(|e| {
        eprintln!("config error: {}", e);
        e
    })?;

    if cli.validate_config {
        let cfg = &settings.migrate;
        println!("snapshot_path={}", cfg.snapshot_path.display());
        println!("label_key={}", cfg.label_key);
        println!("label_value={}", cfg.label_value);
        println!("external_labels={}", cfg.external_labels.to_json());
        println!("min_timestamp={}", cfg.min_timestamp);
        println!("max_timestamp={}", cfg.max_timestamp);
        println!("log_level={}", settings.log_level.as_str());
        println!("output={}", settings.output);
        println!("batch_mode={}", cfg.batch_mode.as_str());
        println!("label_collision={}", cfg.label_collision.as_str());
        return Ok(());
    }

    init_logging(settings.log_level)?;

    #[cfg(feature = "prometheus")]
    let prometheus = if cli.print_metrics {
        Some(tsmigrate::telemetry::migrate_metrics::PrometheusRecorder::install()?)
    } else {
        None
    };
    #[cfg(not(feature = "prometheus"))]
    if cli.print_metrics {
        tracing::warn!("--print-metrics ignored: built without the `prometheus` feature");
    }

    let mut sink = open_sink(&cli, &settings).map_err(|e| {
        tracing::error!("{}", e);
        e
    })?;
    let result = migrate(&DiskEngine, &mut sink, &settings.migrate);

    #[cfg(feature = "prometheus")]
    if let Some(p) = prometheus {
        eprint!("{}", p.render());
    }

    // Failures are already logged by the event listener.
    result?;
    Ok(())
}
