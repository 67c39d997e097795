//! Log sinks built once at startup from the effective configuration.
//!
//! The console sink sends INFO and more verbose records to stdout and
//! WARN/ERROR records to stderr, both capped by the stdout level. The file
//! sink appends plain text records up to the file level.

use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::filter::{filter_fn, LevelFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use crate::config::TaroConfig;
use crate::error::{Result, TaroError};

#[derive(Debug, Clone, PartialEq)]
pub struct LogSinks {
    pub enabled: bool,
    pub stdout_level: LevelFilter,
    pub file_level: LevelFilter,
    pub file_path: PathBuf,
}

impl LogSinks {
    pub fn from_config(config: &TaroConfig) -> Result<Self> {
        Ok(Self {
            enabled: config.log_enabled(),
            stdout_level: parse_level(config.log_stdout_level())?,
            file_level: parse_level(config.log_file_level())?,
            file_path: config.log_file_path(),
        })
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            stdout_level: LevelFilter::OFF,
            file_level: LevelFilter::OFF,
            file_path: PathBuf::new(),
        }
    }

    fn writes_file(&self) -> bool {
        self.enabled && self.file_level != LevelFilter::OFF
    }
}

/// Parses a level name, accepting the `critical`, `fatal` and `warning` aliases.
pub fn parse_level(name: &str) -> Result<LevelFilter> {
    let level = match name.trim().to_ascii_lowercase().as_str() {
        "critical" | "fatal" | "error" => LevelFilter::ERROR,
        "warn" | "warning" => LevelFilter::WARN,
        "info" => LevelFilter::INFO,
        "debug" => LevelFilter::DEBUG,
        "trace" => LevelFilter::TRACE,
        "off" => LevelFilter::OFF,
        other => return Err(TaroError::Config(format!("unknown log level: {other}"))),
    };
    Ok(level)
}

/// Installs the global subscriber. Disabled sinks install nothing.
pub fn init(sinks: &LogSinks) -> anyhow::Result<()> {
    if !sinks.enabled {
        return Ok(());
    }

    let max = sinks.stdout_level;
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(false)
        .with_filter(filter_fn(move |meta| {
            *meta.level() > Level::WARN && max >= *meta.level()
        }));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter_fn(move |meta| {
            *meta.level() <= Level::WARN && max >= *meta.level()
        }));

    let file_layer = if sinks.writes_file() {
        if let Some(parent) = sinks.file_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&sinks.file_path)?;
        Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .with_thread_names(true)
                .with_filter(sinks.file_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()?;

    tracing::debug!(
        stdout_level = %sinks.stdout_level,
        file_level = %sinks.file_level,
        "logging_initialized"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogOverrides;

    #[test]
    fn level_aliases() {
        assert_eq!(parse_level("critical").unwrap(), LevelFilter::ERROR);
        assert_eq!(parse_level("WARNING").unwrap(), LevelFilter::WARN);
        assert_eq!(parse_level("off").unwrap(), LevelFilter::OFF);
        assert!(matches!(parse_level("loud"), Err(TaroError::Config(_))));
    }

    #[test]
    fn sinks_follow_config() {
        let mut config = TaroConfig::default();
        config
            .apply_overrides(&LogOverrides {
                file_level: Some("debug".into()),
                file_path: Some("/tmp/taro-test.log".into()),
                ..LogOverrides::default()
            })
            .unwrap();
        let sinks = LogSinks::from_config(&config).unwrap();
        assert!(sinks.enabled);
        assert_eq!(sinks.stdout_level, LevelFilter::WARN);
        assert_eq!(sinks.file_level, LevelFilter::DEBUG);
        assert!(sinks.writes_file());
    }

    #[test]
    fn disabled_sinks_install_nothing() {
        let sinks = LogSinks::disabled();
        assert!(!sinks.writes_file());
        init(&sinks).unwrap();
    }
}
