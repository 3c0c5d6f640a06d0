//! Tracing initialization.
//!
//! Sets up `tracing-subscriber` with an [`EnvFilter`] and one of three output formats.
//! `RUST_LOG`, when set, overrides the configured level.
//!
//! # Example
//! ```no_run
//! use capmon::{config::MonitorConfig, tracing_init};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MonitorConfig::load()?;
//! tracing_init::init_from_config(&config)?;
//!
//! info!(mode = "capacitance", "Monitor starting");
//! # Ok(())
//! # }
//! ```

use crate::config::MonitorConfig;
use crate::error::{MonitorError, MonitorResult};
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Output format for tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, coloured (interactive use)
    Pretty,
    /// Single-line, no colours
    Compact,
    /// One JSON object per event
    Json,
}

impl FromStr for OutputFormat {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            _ => Err(MonitorError::Configuration(format!(
                "Invalid log format '{s}'. Must be one of: pretty, compact, json"
            ))),
        }
    }
}

/// Tracing configuration options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Emit span NEW/CLOSE events
    pub with_span_events: bool,
    /// Include source file and line
    pub with_file_and_line: bool,
    /// Thread names distinguish the acquisition thread from runtime workers
    pub with_thread_names: bool,
    /// Only honoured by the pretty format
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_span_events: false,
            with_file_and_line: false,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Defaults at the given level.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Read level and format from the `[application]` section.
    pub fn from_monitor_config(config: &MonitorConfig) -> MonitorResult<Self> {
        Ok(Self {
            level: parse_log_level(&config.application.log_level)?,
            format: config.application.log_format.parse()?,
            ..Default::default()
        })
    }

    /// Set the output format.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable span NEW/CLOSE events.
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Enable ANSI colours.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Initialize tracing from the `[application]` section.
pub fn init_from_config(config: &MonitorConfig) -> MonitorResult<()> {
    init(TracingConfig::from_monitor_config(config)?)
}

/// Install the global subscriber.
///
/// Idempotent: if a subscriber is already installed this returns `Ok(())`, which keeps
/// it safe to call from tests.
pub fn init(config: TracingConfig) -> MonitorResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = match config.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_ansi(config.with_ansi)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_ansi(false)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_filter(env_filter)
            .boxed(),
    };

    match tracing_subscriber::registry().with(layer).try_init() {
        Ok(()) => Ok(()),
        // Either the dispatcher or the `log` bridge was installed earlier.
        Err(e) if e.to_string().contains("already") => Ok(()),
        Err(e) => Err(MonitorError::Configuration(format!(
            "Failed to initialize tracing: {e}"
        ))),
    }
}

/// Parse a level name, case-insensitively.
pub fn parse_log_level(level: &str) -> MonitorResult<Level> {
    Level::from_str(level.trim()).map_err(|_| {
        MonitorError::Configuration(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("trace").unwrap(), Level::TRACE);
        assert_eq!(parse_log_level("INFO").unwrap(), Level::INFO);
        assert_eq!(parse_log_level("Warn").unwrap(), Level::WARN);
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_config_from_monitor_config() {
        let mut config = MonitorConfig::default();
        config.application.log_level = "debug".into();
        config.application.log_format = "json".into();

        let tracing_config = TracingConfig::from_monitor_config(&config).unwrap();
        assert_eq!(tracing_config.level, Level::DEBUG);
        assert_eq!(tracing_config.format, OutputFormat::Json);

        config.application.log_format = "xml".into();
        assert!(TracingConfig::from_monitor_config(&config).is_err());
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = TracingConfig::new(Level::WARN).with_format(OutputFormat::Compact);
        assert!(init(config.clone()).is_ok());
        assert!(init(config).is_ok());
    }
}
