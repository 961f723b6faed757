//! Tracing subscriber setup for the engine process

use crate::error::{CallEngineError, Result};
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

/// How the engine process writes its logs
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default verbosity; `RUST_LOG` directives refine it
    pub level: Level,
    /// One JSON object per line instead of human-readable text
    pub json: bool,
    /// Source file and line on every record
    pub file_info: bool,
    /// Emit span enter/exit records
    pub log_spans: bool,
    /// Attached as the `app` field to the startup records
    pub app_name: String,
}

impl LoggingConfig {
    pub fn new(level: Level, app_name: impl Into<String>) -> Self {
        Self {
            level,
            json: false,
            file_info: false,
            log_spans: false,
            app_name: app_name.into(),
        }
    }

    pub fn with_json(self) -> Self {
        Self { json: true, ..self }
    }

    pub fn with_file_info(self) -> Self {
        Self { file_info: true, ..self }
    }

    pub fn with_spans(self) -> Self {
        Self { log_spans: true, ..self }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self::new(Level::INFO, "voiceconfirm-engine")
    }
}

/// Install the global subscriber.
///
/// Fails with a `Config` error when a subscriber is already installed.
pub fn setup_logging(config: LoggingConfig) -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(config.level.into())
        .from_env_lossy();

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_span_events(if config.log_spans { FmtSpan::ACTIVE } else { FmtSpan::NONE })
        .with_file(config.file_info)
        .with_line_number(config.file_info);

    let installed = match config.json {
        true => builder.with_writer(std::io::stdout).json().try_init(),
        false => builder.try_init(),
    };
    installed.map_err(|e| CallEngineError::config(format!("Failed to install tracing subscriber: {}", e)))?;

    tracing::debug!(
        app = %config.app_name,
        level = %config.level,
        json = config.json,
        "📝 Logging initialised"
    );
    Ok(())
}

pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level.trim()).map_err(|_| CallEngineError::config(format!("Invalid log level: {}", level)))
}

/// Startup banner
pub fn log_welcome(app_name: &str, version: &str) {
    tracing::info!(app = app_name, version, "🚀 Starting {} v{}", app_name, version);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level(" WARN ").unwrap(), Level::WARN);
        assert!(matches!(parse_log_level("loud"), Err(CallEngineError::Config(_))));
    }

    #[test]
    fn test_builder_methods() {
        let config = LoggingConfig::new(Level::DEBUG, "engine-test")
            .with_json()
            .with_file_info()
            .with_spans();
        assert!(config.json && config.file_info && config.log_spans);
        assert_eq!(config.app_name, "engine-test");
        assert_eq!(config.level, Level::DEBUG);
    }

    #[test]
    fn test_default_is_plain_info() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert!(!config.json && !config.file_info && !config.log_spans);
        assert_eq!(config.app_name, "voiceconfirm-engine");
    }

    #[test]
    #[serial]
    fn test_second_setup_returns_error() {
        // The first call may already have failed if another test installed a subscriber.
        let _ = setup_logging(LoggingConfig::default());
        assert!(setup_logging(LoggingConfig::default()).is_err());
    }
}
