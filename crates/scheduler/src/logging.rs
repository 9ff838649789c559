//! Event log module
//!
//! The scheduler reports job completions, failures, drained queues and
//! resource blocks through an [`EventLog`] it is handed at construction.
//! [`TracingEventLog`] owns its own `tracing` dispatcher, so nothing is
//! installed process-wide unless the caller chooses to.

use crate::config::LoggingConfig;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::Dispatch;
use tracing_subscriber::fmt::writer::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Error type for event log setup and shutdown
#[derive(Debug, Error)]
pub enum LogError {
    #[error("failed to open log file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to flush log file: {0}")]
    Flush(#[from] io::Error),
}

/// Severity of an operator-facing event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLevel {
    Info,
    Warning,
    Error,
}

/// Sink for leveled operator messages.
pub trait EventLog: Send + Sync {
    fn log(&self, level: EventLevel, message: &str);

    fn info(&self, message: &str) {
        self.log(EventLevel::Info, message);
    }

    fn warning(&self, message: &str) {
        self.log(EventLevel::Warning, message);
    }

    fn error(&self, message: &str) {
        self.log(EventLevel::Error, message);
    }
}

/// Name of the per-run log file, e.g. `transcoding_20260101_120000.log`.
pub fn log_file_name(now: chrono::DateTime<chrono::Local>) -> String {
    format!("transcoding_{}.log", now.format("%Y%m%d_%H%M%S"))
}

/// Shared buffered handle to the log file
#[derive(Clone)]
struct LogFile(Arc<Mutex<BufWriter<File>>>);

impl LogFile {
    fn lock(&self) -> MutexGuard<'_, BufWriter<File>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Write for LogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock().flush()
    }
}

impl<'a> MakeWriter<'a> for LogFile {
    type Writer = LogFile;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Event log writing to stderr and, optionally, a timestamped file.
pub struct TracingEventLog {
    dispatch: Dispatch,
    file: Option<LogFile>,
    file_path: Option<PathBuf>,
}

impl TracingEventLog {
    /// Build the log from configuration.
    ///
    /// `RUST_LOG` takes precedence over `cfg.level`.
    pub fn new(cfg: &LoggingConfig) -> Result<Self, LogError> {
        let (file, file_path) = if cfg.log_to_file {
            let path = cfg.log_dir.join(log_file_name(chrono::Local::now()));
            (Some(open_log_file(&path)?), Some(path))
        } else {
            (None, None)
        };

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));
        let stderr_layer = fmt::layer().with_writer(io::stderr);
        let file_layer = file
            .clone()
            .map(|writer| fmt::layer().with_ansi(false).with_writer(writer));

        let subscriber = Registry::default()
            .with(filter)
            .with(stderr_layer)
            .with(file_layer);

        Ok(Self {
            dispatch: Dispatch::new(subscriber),
            file,
            file_path,
        })
    }

    /// Dispatcher carrying this log's subscriber, for scoping library
    /// diagnostics to the same outputs.
    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    /// Flush buffered output. Call once at shutdown.
    pub fn close(self) -> Result<(), LogError> {
        if let Some(file) = &self.file {
            file.lock().flush()?;
        }
        Ok(())
    }
}

impl Drop for TracingEventLog {
    fn drop(&mut self) {
        if let Some(file) = &self.file {
            let _ = file.lock().flush();
        }
    }
}

impl EventLog for TracingEventLog {
    fn log(&self, level: EventLevel, message: &str) {
        tracing::dispatcher::with_default(&self.dispatch, || match level {
            EventLevel::Info => tracing::info!("{}", message),
            EventLevel::Warning => tracing::warn!("{}", message),
            EventLevel::Error => tracing::error!("{}", message),
        });
    }
}

fn open_log_file(path: &Path) -> Result<LogFile, LogError> {
    let open_error = |source| LogError::Open {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(open_error)?;
    }
    let file = File::create(path).map_err(open_error)?;
    Ok(LogFile(Arc::new(Mutex::new(BufWriter::new(file)))))
}

/// Event log that keeps messages in memory.
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    entries: Mutex<Vec<(EventLevel, String)>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(EventLevel, String)> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Messages at `level`, in the order they were logged.
    pub fn messages(&self, level: EventLevel) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, message)| message)
            .collect()
    }
}

impl EventLog for MemoryEventLog {
    fn log(&self, level: EventLevel, message: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((level, message.to_string()));
    }
}
