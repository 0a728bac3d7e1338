//! Logging configuration and initialization
//!
//! All ETL components log through `tracing`. Pod-scoped events carry `etl`
//! and `node` fields so one pod's history can be filtered out of a cluster
//! log:
//!
//! ```rust,ignore
//! use tracing::{info, warn};
//!
//! info!(etl = %name, node = %node_id, stage = "Running", "Pod is ready");
//! warn!(etl = %name, node = %node_id, misses, "Heartbeat missed");
//! ```
//!
//! # Example
//!
//! ```no_run
//! use etl_common::logging::{init_logging, LogConfig};
//!
//! let config = LogConfig::from_env().unwrap_or_default();
//! init_logging(&config).unwrap();
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Minimum level of emitted events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(anyhow::anyhow!("Invalid log level: {}", s)),
        }
    }
}

/// Where log lines go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
}

impl LogOutput {
    fn console(self) -> bool {
        matches!(self, LogOutput::Console | LogOutput::Both)
    }

    fn file(self) -> bool {
        matches!(self, LogOutput::File | LogOutput::Both)
    }
}

impl FromStr for LogOutput {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "console" | "stdout" => Ok(LogOutput::Console),
            "file" => Ok(LogOutput::File),
            "both" | "all" => Ok(LogOutput::Both),
            _ => Err(anyhow::anyhow!("Invalid log output: {}", s)),
        }
    }
}

/// Line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(anyhow::anyhow!("Invalid log format: {}", s)),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: LogLevel,
    pub output: LogOutput,
    pub format: LogFormat,
    /// Directory for rolling log files (used when output includes file)
    pub log_dir: PathBuf,
    /// File name prefix, e.g. `etl-server` -> `etl-server.2025-01-18`
    pub log_file_prefix: String,
    /// Extra filter directives, e.g. `etl_server=debug,hyper=warn`
    pub filter_directives: Option<String>,
    pub include_location: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            output: LogOutput::Console,
            format: LogFormat::Text,
            log_dir: PathBuf::from("./logs"),
            log_file_prefix: "etl".to_string(),
            filter_directives: None,
            include_location: false,
        }
    }
}

impl LogConfig {
    /// Load configuration from environment variables
    ///
    /// - `LOG_LEVEL`: trace, debug, info, warn, error
    /// - `LOG_OUTPUT`: console, file, both
    /// - `LOG_FORMAT`: text, json
    /// - `LOG_DIR`, `LOG_FILE_PREFIX`, `LOG_FILTER`
    /// - `LOG_INCLUDE_LOCATION`: true/false
    pub fn from_env() -> Result<Self> {
        Self::default().merge_env()
    }

    /// Override fields of `self` with whatever is set in the environment.
    pub fn merge_env(mut self) -> Result<Self> {
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.level = level.parse()?;
        }
        if let Ok(output) = std::env::var("LOG_OUTPUT") {
            self.output = output.parse()?;
        }
        if let Ok(format) = std::env::var("LOG_FORMAT") {
            self.format = format.parse()?;
        }
        if let Ok(dir) = std::env::var("LOG_DIR") {
            self.log_dir = PathBuf::from(dir);
        }
        if let Ok(prefix) = std::env::var("LOG_FILE_PREFIX") {
            self.log_file_prefix = prefix;
        }
        if let Ok(filter) = std::env::var("LOG_FILTER") {
            self.filter_directives = Some(filter);
        }
        if let Ok(val) = std::env::var("LOG_INCLUDE_LOCATION") {
            self.include_location = val.parse().unwrap_or(false);
        }
        Ok(self)
    }

    pub fn builder() -> LogConfigBuilder {
        LogConfigBuilder::default()
    }
}

/// Builder for LogConfig
#[derive(Default)]
pub struct LogConfigBuilder {
    config: LogConfig,
}

impl LogConfigBuilder {
    pub fn level(mut self, level: LogLevel) -> Self {
        self.config.level = level;
        self
    }

    pub fn output(mut self, output: LogOutput) -> Self {
        self.config.output = output;
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.config.format = format;
        self
    }

    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.log_dir = dir.into();
        self
    }

    pub fn log_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.log_file_prefix = prefix.into();
        self
    }

    pub fn filter_directives(mut self, filter: impl Into<String>) -> Self {
        self.config.filter_directives = Some(filter.into());
        self
    }

    pub fn build(self) -> LogConfig {
        self.config
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global tracing subscriber. Call once at startup.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let mut filter =
        EnvFilter::from_default_env().add_directive(config.level.to_tracing_level().into());
    if let Some(ref directives) = config.filter_directives {
        for directive in directives.split(',').filter(|d| !d.trim().is_empty()) {
            filter = filter.add_directive(
                directive
                    .trim()
                    .parse()
                    .context("Failed to parse filter directive")?,
            );
        }
    }

    let mut layers: Vec<BoxedLayer> = Vec::new();

    if config.output.console() {
        layers.push(fmt_layer(config, std::io::stdout, true));
    }

    if config.output.file() {
        std::fs::create_dir_all(&config.log_dir).context("Failed to create log directory")?;
        let appender = tracing_appender::rolling::daily(&config.log_dir, &config.log_file_prefix);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        // The worker guard flushes on drop; the subscriber lives for the whole process.
        std::mem::forget(guard);
        layers.push(fmt_layer(config, writer, false));
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()?;

    Ok(())
}

fn fmt_layer<W>(config: &LogConfig, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_span_events(FmtSpan::CLOSE);

    match config.format {
        LogFormat::Text => layer.boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_from_str() {
        assert_eq!("trace".parse::<LogLevel>().unwrap(), LogLevel::Trace);
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_output_targets() {
        assert!(LogOutput::Both.console() && LogOutput::Both.file());
        assert!(!LogOutput::Console.file());
        assert_eq!("stdout".parse::<LogOutput>().unwrap(), LogOutput::Console);
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
    }

    #[test]
    fn test_config_builder() {
        let config = LogConfig::builder()
            .level(LogLevel::Debug)
            .output(LogOutput::File)
            .log_dir("/var/log/etl")
            .log_file_prefix("etl-server")
            .filter_directives("etl_server=trace")
            .build();

        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.output, LogOutput::File);
        assert_eq!(config.log_dir, PathBuf::from("/var/log/etl"));
        assert_eq!(config.filter_directives.as_deref(), Some("etl_server=trace"));
    }
}
