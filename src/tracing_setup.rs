//! Tracing initialization.
//!
//! Installs a `tracing-subscriber` fmt layer behind an [`EnvFilter`]. The
//! `RUST_LOG` environment variable takes precedence over the configured level.
//!
//! # Example
//! ```no_run
//! use rust_qdaq::tracing_setup::{self, OutputFormat, TracingConfig};
//! use tracing::Level;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! tracing_setup::init(TracingConfig::new(Level::DEBUG).with_format(OutputFormat::Json))?;
//! tracing::info!(instrument = "dac_ch1", "Ready");
//! # Ok(())
//! # }
//! ```

use thiserror::Error;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    registry::Registry,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::app_config::AppConfig;

/// Failure to set up logging.
#[derive(Debug, Error)]
pub enum TracingError {
    /// Unknown level name.
    #[error("invalid log level '{0}', expected one of trace, debug, info, warn, error")]
    InvalidLevel(String),

    /// The subscriber could not be installed.
    #[error("failed to initialize tracing: {0}")]
    Init(String),
}

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line with colors, for interactive sessions
    Pretty,
    /// Single line without colors
    Compact,
    /// One JSON object per event
    Json,
}

/// Tracing configuration options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Emit span NEW/CLOSE events (marks sweep start and end)
    pub with_span_events: bool,
    /// Include file and line numbers
    pub with_file_and_line: bool,
    /// Include thread names
    pub with_thread_names: bool,
    /// ANSI colors (Pretty only)
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_span_events: true,
            with_file_and_line: true,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Defaults at `level`.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Level taken from `[application] log_level`.
    pub fn from_app_config(config: &AppConfig) -> Result<Self, TracingError> {
        Ok(Self::new(parse_log_level(&config.application.log_level)?))
    }

    /// Set output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable span events
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Enable or disable ANSI colors
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }

    fn span_events(&self) -> FmtSpan {
        if self.with_span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

/// Initialize tracing from the application configuration.
pub fn init_from_config(config: &AppConfig) -> Result<(), TracingError> {
    init(TracingConfig::from_app_config(config)?)
}

/// Install the global subscriber.
///
/// Idempotent: returns `Ok(())` when a global subscriber is already set, so
/// tests and embedding applications can call it freely.
pub fn init(config: TracingConfig) -> Result<(), TracingError> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(config.level)));

    match config.format {
        OutputFormat::Pretty => install(
            fmt::layer()
                .pretty()
                .with_span_events(config.span_events())
                .with_file(config.with_file_and_line)
                .with_line_number(config.with_file_and_line)
                .with_thread_names(config.with_thread_names)
                .with_ansi(config.with_ansi)
                .with_filter(filter),
        ),
        OutputFormat::Compact => install(
            fmt::layer()
                .compact()
                .with_span_events(config.span_events())
                .with_file(config.with_file_and_line)
                .with_line_number(config.with_file_and_line)
                .with_thread_names(config.with_thread_names)
                .with_ansi(false)
                .with_filter(filter),
        ),
        OutputFormat::Json => install(
            fmt::layer()
                .json()
                .with_span_events(config.span_events())
                .with_file(config.with_file_and_line)
                .with_line_number(config.with_file_and_line)
                .with_thread_names(config.with_thread_names)
                .with_filter(filter),
        ),
    }
}

fn install<L>(layer: L) -> Result<(), TracingError>
where
    L: Layer<Registry> + Send + Sync + 'static,
{
    match tracing_subscriber::registry().with(layer).try_init() {
        Ok(()) => Ok(()),
        // lost a race against another initializer
        Err(_) if tracing::dispatcher::has_been_set() => Ok(()),
        Err(e) => Err(TracingError::Init(e.to_string())),
    }
}

/// Parse a level name, case-insensitively.
pub fn parse_log_level(level: &str) -> Result<Level, TracingError> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(TracingError::InvalidLevel(level.to_string())),
    }
}

fn level_to_filter_string(level: Level) -> String {
    level.as_str().to_lowercase()
}
