//! Logging setup shared by the connection manager binaries.
//!
//! One global `tracing` subscriber: an `EnvFilter` (from `RUST_LOG`, else the
//! configured level plus extra directives), an optional console layer and an
//! optional non-blocking rolling file layer.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::filter::{Directive, ParseError};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

pub use tracing::{debug, error, info, instrument, trace, warn};

/// How often the log file rolls over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rotation {
    #[default]
    Hourly,
    Daily,
    Never,
}

impl From<Rotation> for rolling::Rotation {
    fn from(r: Rotation) -> Self {
        match r {
            Rotation::Hourly => rolling::Rotation::HOURLY,
            Rotation::Daily => rolling::Rotation::DAILY,
            Rotation::Never => rolling::Rotation::NEVER,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default level (trace, debug, info, warn, error).
    #[serde(default = "default_level")]
    pub level: String,

    /// Per-target overrides such as `rdm_cm::dispatcher=trace`.
    #[serde(default)]
    pub directives: Vec<String>,

    /// Directory for log files; no file output when unset.
    pub log_dir: Option<PathBuf>,

    #[serde(default = "default_prefix")]
    pub file_prefix: String,

    #[serde(default)]
    pub rotation: Rotation,

    #[serde(default)]
    pub json_format: bool,

    #[serde(default = "default_true")]
    pub console_output: bool,

    /// Tag console lines with the thread name, so progress loops running on
    /// different threads can be told apart.
    #[serde(default)]
    pub thread_names: bool,
}

fn default_level() -> String {
    "info".into()
}

fn default_prefix() -> String {
    "rdm-cm".into()
}

fn default_true() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_level(),
            directives: Vec::new(),
            log_dir: None,
            file_prefix: default_prefix(),
            rotation: Rotation::default(),
            json_format: false,
            console_output: true,
            thread_names: false,
        }
    }
}

impl LogConfig {
    /// Filter used when `RUST_LOG` is not set.
    pub fn filter(&self) -> Result<EnvFilter, LoggingError> {
        let mut filter = EnvFilter::try_new(&self.level)?;
        for d in &self.directives {
            filter = filter.add_directive(d.parse::<Directive>()?);
        }
        Ok(filter)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] ParseError),
    #[error("failed to create rolling file appender: {0}")]
    Appender(#[from] rolling::InitError),
    #[error("global subscriber already installed: {0}")]
    AlreadyInitialized(#[from] tracing_subscriber::util::TryInitError),
}

type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync>;

fn console_layer<S>(config: &LogConfig) -> Option<BoxedLayer<S>>
where
    S: Subscriber + for<'a> LookupSpan<'a> + 'static,
{
    if !config.console_output {
        return None;
    }
    let layer = fmt::layer().with_thread_names(config.thread_names);
    Some(if config.json_format {
        layer.json().boxed()
    } else {
        layer.boxed()
    })
}

fn file_layer<S>(config: &LogConfig) -> Result<(Option<BoxedLayer<S>>, Option<WorkerGuard>), LoggingError>
where
    S: Subscriber + for<'a> LookupSpan<'a> + 'static,
{
    let Some(log_dir) = &config.log_dir else {
        return Ok((None, None));
    };
    let appender = rolling::RollingFileAppender::builder()
        .rotation(config.rotation.into())
        .filename_prefix(&config.file_prefix)
        .filename_suffix("log")
        .build(log_dir)?;
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer = fmt::layer().with_ansi(false).with_writer(writer);
    let layer = if config.json_format {
        layer.json().boxed()
    } else {
        layer.boxed()
    };
    Ok((Some(layer), Some(guard)))
}

/// Install the global subscriber. Call once at startup and keep the returned
/// guard alive; dropping it stops the file writer.
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>, LoggingError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => config.filter()?,
    };
    let registry = tracing_subscriber::registry().with(filter);
    let console = console_layer(config);
    let (file, guard) = file_layer(config)?;
    registry.with(console).with(file).try_init()?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.file_prefix, "rdm-cm");
        assert_eq!(config.rotation, Rotation::Hourly);
        assert!(config.console_output);
        assert!(config.log_dir.is_none());
        assert!(config.directives.is_empty());
    }

    #[test]
    fn test_config_from_toml() {
        let config: LogConfig = toml::from_str(
            r#"
            level = "debug"
            rotation = "daily"
            json_format = true
            directives = ["rdm_cm::dispatcher=trace"]
            "#,
        )
        .unwrap();
        assert_eq!(config.level, "debug");
        assert!(config.json_format);
        assert_eq!(config.rotation, Rotation::Daily);
        assert_eq!(config.file_prefix, "rdm-cm");
        assert!(config.filter().is_ok());
    }

    #[test]
    fn test_unknown_rotation_rejected() {
        let parsed: Result<LogConfig, _> = toml::from_str(r#"rotation = "weekly""#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_bad_directive() {
        let config = LogConfig {
            directives: vec!["rdm_cm=loud".into()],
            ..Default::default()
        };
        assert!(matches!(config.filter(), Err(LoggingError::Filter(_))));
    }

    #[test]
    fn test_rotation_mapping() {
        assert_eq!(rolling::Rotation::from(Rotation::Never), rolling::Rotation::NEVER);
        assert_eq!(rolling::Rotation::from(Rotation::Hourly), rolling::Rotation::HOURLY);
    }
}
