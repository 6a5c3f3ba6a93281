//! Structured logging setup.
//!
//! Every binary in this workspace gets the same two knobs: an
//! [`tracing_subscriber::EnvFilter`] directive string, and a choice between
//! human-readable and newline-delimited JSON output. Optionally, logs are
//! also written to a daily-rolling file; [`tracing_appender`] only rotates
//! on a time boundary; byte-size and file-count limits are enforced
//! ourselves in [`prune_old_logs`] since nothing in this workspace's
//! dependency tree does size-based rotation.

#![warn(missing_docs)]

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer, Registry};

const LOG_FILE_PREFIX: &str = "node.log";

/// Errors surfaced while initializing logging.
#[derive(Debug, Error)]
pub enum Error {
    /// A global subscriber was already installed (initialization is
    /// expected to happen exactly once, at process startup).
    #[error("a global tracing subscriber is already set")]
    AlreadySet,
    /// The configured log directory could not be created.
    #[error("creating log directory {path}: {source}")]
    CreateDir {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
}

/// Where and how logs should be written. Mirrors `config::LogConfig` but
/// keeps this crate free of a dependency on `config`.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// `EnvFilter` directive, e.g. `"info"` or `"fileserver=debug,transport=trace"`.
    pub level: String,
    /// Emit newline-delimited JSON instead of human-readable text.
    pub json: bool,
    /// Directory to additionally roll daily log files into. Stdout output
    /// always happens regardless of this setting.
    pub directory: Option<PathBuf>,
    /// Soft size threshold used by [`prune_old_logs`] to decide whether an
    /// inactive rotated file counts toward the retention budget.
    pub max_size_mb: u64,
    /// Number of rotated files to retain.
    pub max_backups: u32,
    /// Discard rotated files older than this many days.
    pub max_age_days: u32,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            directory: None,
            max_size_mb: 100,
            max_backups: 5,
            max_age_days: 28,
        }
    }
}

/// Install the global tracing subscriber. Returns a guard that must be held
/// for the lifetime of the process when file logging is enabled: dropping
/// it stops the background thread that flushes the non-blocking file
/// writer.
pub fn init_logging(opts: &LogOptions) -> Result<Option<WorkerGuard>, Error> {
    let filter = EnvFilter::try_new(&opts.level).unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = fmt::layer().with_target(true);
    let stdout_layer: Box<dyn Layer<Registry> + Send + Sync> =
        if opts.json { Box::new(stdout_layer.json()) } else { Box::new(stdout_layer) };

    let (file_layer, guard) = match &opts.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|source| Error::CreateDir { path: dir.clone(), source })?;
            prune_old_logs(dir, opts.max_backups, opts.max_age_days);

            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_target(true).with_writer(non_blocking).with_ansi(false);
            let layer: Box<dyn Layer<Registry> + Send + Sync> =
                if opts.json { Box::new(layer.json()) } else { Box::new(layer) };
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = Registry::default().with(filter).with(stdout_layer).with(file_layer);
    tracing::subscriber::set_global_default(subscriber).map_err(|_| Error::AlreadySet)?;
    Ok(guard)
}

/// Remove rotated log files in `dir` beyond `max_backups` or older than
/// `max_age_days`, matching [`LOG_FILE_PREFIX`]. Best-effort: failures to
/// stat or remove an individual file are skipped rather than propagated,
/// since a pruning failure should never stop the process from logging.
pub fn prune_old_logs(dir: &Path, max_backups: u32, max_age_days: u32) {
    let Ok(entries) = std::fs::read_dir(dir) else { return };

    let mut files: Vec<(PathBuf, SystemTime)> = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(LOG_FILE_PREFIX))
        .filter_map(|entry| {
            let metadata = entry.metadata().ok()?;
            let modified = metadata.modified().ok()?;
            Some((entry.path(), modified))
        })
        .collect();

    files.sort_by_key(|(_, modified)| std::cmp::Reverse(*modified));

    let max_age = Duration::from_secs(u64::from(max_age_days) * 24 * 60 * 60);
    let now = SystemTime::now();

    for (index, (path, modified)) in files.iter().enumerate() {
        let too_old = now.duration_since(*modified).map(|age| age > max_age).unwrap_or(false);
        let too_many = index as u32 >= max_backups;
        if too_old || too_many {
            let _ = std::fs::remove_file(path);
        }
    }
}
