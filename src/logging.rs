//! Tracing subscriber setup for the `encarch` binary
//!
//! Output always goes to stderr. When a log file is configured, the same
//! events are appended to it without ANSI colouring. `RUST_LOG` takes
//! precedence over the configured level.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::report::EventLevel;

/// Errors for logging initialization
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("cannot open log file {path}: {source}")]
    OpenFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("a global tracing subscriber is already installed: {0}")]
    AlreadyInitialized(#[from] tracing_subscriber::util::TryInitError),
}

/// Where and how verbosely to log
#[derive(Debug, Clone)]
pub struct LogConfig<'a> {
    pub level: EventLevel,
    pub log_file: Option<&'a Path>,
}

fn build_filter(level: EventLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.filter_directive()))
}

fn open_append(path: &Path) -> Result<File, LoggingError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| LoggingError::OpenFile {
            path: path.to_path_buf(),
            source,
        })
}

/// Install the global subscriber.
pub fn init_logging(config: LogConfig<'_>) -> Result<(), LoggingError> {
    let file_layer = match config.log_file {
        Some(path) => {
            let file = open_append(path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_filter(build_filter(config.level)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_filter(build_filter(config.level)),
        )
        .try_init()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_append_creates_and_appends() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("encarch.log");
        std::fs::write(&path, "earlier\n").unwrap();

        {
            use std::io::Write;
            let mut file = open_append(&path).unwrap();
            writeln!(file, "later").unwrap();
        }

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "earlier\nlater\n");
    }

    #[test]
    fn test_open_append_missing_directory() {
        let temp = TempDir::new().unwrap();
        let err = open_append(&temp.path().join("nope/encarch.log")).unwrap_err();
        assert!(matches!(err, LoggingError::OpenFile { .. }));
    }
}
