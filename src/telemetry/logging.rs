//! Tracing setup.
//!
//! Logs go to stderr by default, or to a file when one is configured.
//! `RUST_LOG` overrides the configured level when set.

use std::fmt;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::CallError;

static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            file: None,
        }
    }
}

pub fn init(config: &LogConfig) -> Result<(), CallError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    match &config.file {
        Some(path) => {
            let (directory, file_name) = split_log_path(path)?;
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            FILE_GUARD
                .set(guard)
                .map_err(|_| CallError::setup("logging already initialized"))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .try_init()
                .map_err(|err| CallError::setup(format!("failed to init logging: {err}")))?;
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init()
                .map_err(|err| CallError::setup(format!("failed to init logging: {err}")))?;
        }
    }
    Ok(())
}

fn split_log_path(path: &Path) -> Result<(PathBuf, PathBuf), CallError> {
    let file_name = path
        .file_name()
        .ok_or_else(|| CallError::setup(format!("invalid log file path: {}", path.display())))?;
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((directory, PathBuf::from(file_name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_path_into_directory_and_file() {
        let (dir, file) = split_log_path(Path::new("/var/log/cove.log")).unwrap();
        assert_eq!(dir, PathBuf::from("/var/log"));
        assert_eq!(file, PathBuf::from("cove.log"));
    }

    #[test]
    fn bare_file_name_logs_to_current_directory() {
        let (dir, file) = split_log_path(Path::new("cove.log")).unwrap();
        assert_eq!(dir, PathBuf::from("."));
        assert_eq!(file, PathBuf::from("cove.log"));
    }
}
