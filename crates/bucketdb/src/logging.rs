//! Logging configuration for bucketdb
//!
//! Built on `tracing-subscriber`. File output goes through a daily rolling
//! `tracing-appender` writer whose guard must outlive the program's logging.

use bucketdb_core::{Error, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    /// Daily rolling file
    File(PathBuf),
    /// Stdout and a daily rolling file
    Both(PathBuf),
}

/// Log format style
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    /// Single-line format
    Compact,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,
    pub output: LogOutput,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: LogOutput::Stdout,
            format: LogFormat::Pretty,
        }
    }
}

impl LogConfig {
    pub fn info() -> Self {
        Self::default()
    }

    pub fn debug() -> Self {
        Self::default().with_level("debug")
    }

    pub fn warn() -> Self {
        Self::default().with_level("warn")
    }

    pub fn with_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.output = LogOutput::File(path.into());
        self
    }

    pub fn with_both<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.output = LogOutput::Both(path.into());
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_level<S: Into<String>>(mut self, level: S) -> Self {
        self.level = level.into();
        self
    }

    fn filter(&self) -> Result<EnvFilter> {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.level))
            .map_err(|e| Error::InvalidConfig(format!("log level {:?}: {}", self.level, e)))
    }

    /// Installs the global subscriber.
    ///
    /// Returns the file writer guard when logging to a file; keep it alive
    /// for as long as logs should be written. Fails if the level is invalid
    /// or a global subscriber is already installed.
    ///
    /// ```rust,no_run
    /// use bucketdb::logging::LogConfig;
    ///
    /// let _guard = LogConfig::info().init()?;
    /// # Ok::<(), bucketdb::Error>(())
    /// ```
    pub fn init(self) -> Result<Option<WorkerGuard>> {
        let filter = self.filter()?;
        let registry = tracing_subscriber::registry().with(filter);

        let (installed, guard) = match &self.output {
            LogOutput::Stdout => {
                let installed = match self.format {
                    LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
                    LogFormat::Compact => registry.with(fmt::layer().compact()).try_init(),
                };
                (installed, None)
            }
            LogOutput::File(path) => {
                let (writer, guard) = tracing_appender::non_blocking(rolling_file(path));
                let installed = match self.format {
                    LogFormat::Pretty => registry
                        .with(fmt::layer().with_writer(writer).pretty())
                        .try_init(),
                    LogFormat::Compact => registry
                        .with(fmt::layer().with_writer(writer).compact())
                        .try_init(),
                };
                (installed, Some(guard))
            }
            LogOutput::Both(path) => {
                let (writer, guard) = tracing_appender::non_blocking(rolling_file(path));
                let installed = registry
                    .with(fmt::layer())
                    .with(fmt::layer().with_writer(writer).with_ansi(false))
                    .try_init();
                (installed, Some(guard))
            }
        };

        installed.map_err(|e| Error::InvalidConfig(format!("logging already initialized: {}", e)))?;
        Ok(guard)
    }
}

fn rolling_file(path: &Path) -> tracing_appender::rolling::RollingFileAppender {
    tracing_appender::rolling::daily(
        path.parent().unwrap_or_else(|| Path::new(".")),
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("bucketdb.log"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_defaults() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.output, LogOutput::Stdout);
        assert_eq!(config.format, LogFormat::Pretty);
    }

    #[test]
    fn test_log_config_builders() {
        let config = LogConfig::debug()
            .with_file("/tmp/bucketdb.log")
            .with_format(LogFormat::Compact);
        assert_eq!(config.level, "debug");
        assert!(matches!(config.output, LogOutput::File(_)));
        assert_eq!(config.format, LogFormat::Compact);

        let config = LogConfig::warn().with_both("/tmp/bucketdb.log");
        assert!(matches!(config.output, LogOutput::Both(_)));
    }
}
