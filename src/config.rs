//! Configuration loaded from `taro.toml`.
//!
//! [`TaroConfig`] holds every configurable parameter. Values missing from
//! the file fall back to defaults, and command line overrides are applied
//! on top with [`TaroConfig::apply_overrides`].

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::paths;

/// Name of the configuration file looked up in the working directory.
pub const CONFIG_FILE: &str = "taro.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaroConfig {
    /// Names of the observer plugins to load for executed jobs.
    #[serde(default)]
    pub plugins: Vec<String>,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Most verbose level written to the console.
    #[serde(default = "default_stdout_level")]
    pub stdout_level: String,

    /// Most verbose level written to the log file, `off` for none.
    #[serde(default = "default_file_level")]
    pub file_level: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Storage backend; only `json` is built in.
    #[serde(rename = "type", default = "default_persistence_type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_stdout_level() -> String {
    "warn".to_string()
}

fn default_file_level() -> String {
    "off".to_string()
}

fn default_persistence_type() -> String {
    "json".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stdout_level: default_stdout_level(),
            file_level: default_file_level(),
            file_path: None,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            kind: default_persistence_type(),
            database: None,
        }
    }
}

impl Default for TaroConfig {
    fn default() -> Self {
        Self {
            plugins: Vec::new(),
            log: LogConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

/// Logging options given on the command line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogOverrides {
    pub enabled: Option<bool>,
    pub stdout_level: Option<String>,
    pub file_level: Option<String>,
    pub file_path: Option<PathBuf>,
}

impl LogOverrides {
    fn sets_options(&self) -> bool {
        self.stdout_level.is_some() || self.file_level.is_some() || self.file_path.is_some()
    }
}

impl TaroConfig {
    /// Loads the configuration.
    ///
    /// An explicit `path` must exist. Without one, `taro.toml` in the working
    /// directory is used when present and defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::read(path),
            None => {
                let local = Path::new(CONFIG_FILE);
                if local.exists() {
                    Self::read(local)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    fn read(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = toml::from_str::<TaroConfig>(&contents)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        tracing::debug!(path = %path.display(), "config_loaded");
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn apply_overrides(&mut self, overrides: &LogOverrides) -> Result<()> {
        if overrides.enabled == Some(false) && overrides.sets_options() {
            bail!("logging cannot be disabled while other log options are overridden");
        }
        if let Some(enabled) = overrides.enabled {
            self.log.enabled = enabled;
        }
        if let Some(level) = &overrides.stdout_level {
            self.log.stdout_level = level.clone();
        }
        if let Some(level) = &overrides.file_level {
            self.log.file_level = level.clone();
        }
        if let Some(path) = &overrides.file_path {
            self.log.file_path = Some(path.clone());
        }
        Ok(())
    }

    pub fn log_enabled(&self) -> bool {
        self.log.enabled
    }

    pub fn log_stdout_level(&self) -> &str {
        &self.log.stdout_level
    }

    pub fn log_file_level(&self) -> &str {
        &self.log.file_level
    }

    pub fn log_file_path(&self) -> PathBuf {
        self.log
            .file_path
            .clone()
            .unwrap_or_else(paths::log_file_path)
    }

    pub fn persistence_enabled(&self) -> bool {
        self.persistence.enabled
    }

    pub fn persistence_type(&self) -> &str {
        &self.persistence.kind
    }

    pub fn persistence_database(&self) -> PathBuf {
        self.persistence
            .database
            .clone()
            .unwrap_or_else(paths::default_database_path)
    }

    pub fn plugins(&self) -> &[String] {
        &self.plugins
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = TaroConfig::default();
        assert!(config.log_enabled());
        assert_eq!(config.log_stdout_level(), "warn");
        assert_eq!(config.log_file_level(), "off");
        assert!(config.persistence_enabled());
        assert_eq!(config.persistence_type(), "json");
        assert!(config.plugins().is_empty());
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            plugins = ["taro_state_log"]

            [log]
            stdout_level = "info"

            [persistence]
            type = "json"
            database = "/var/lib/taro/jobs.jsonl"
        "#;
        let config: TaroConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.plugins(), ["taro_state_log"]);
        assert_eq!(config.log_stdout_level(), "info");
        assert_eq!(config.log_file_level(), "off");
        assert!(config.log_enabled());
        assert_eq!(
            config.persistence_database(),
            PathBuf::from("/var/lib/taro/jobs.jsonl")
        );
    }

    #[test]
    fn explicit_file_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        assert!(TaroConfig::load(Some(&dir.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn explicit_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[persistence]\nenabled = false\n").unwrap();
        let config = TaroConfig::load(Some(&path)).unwrap();
        assert!(!config.persistence_enabled());
    }

    #[test]
    fn overrides_apply_on_top() {
        let mut config = TaroConfig::default();
        config
            .apply_overrides(&LogOverrides {
                stdout_level: Some("debug".into()),
                file_path: Some("/tmp/x.log".into()),
                ..LogOverrides::default()
            })
            .unwrap();
        assert_eq!(config.log_stdout_level(), "debug");
        assert_eq!(config.log_file_path(), PathBuf::from("/tmp/x.log"));
    }

    #[test]
    fn disabling_log_with_other_overrides_is_rejected() {
        let mut config = TaroConfig::default();
        let overrides = LogOverrides {
            enabled: Some(false),
            file_level: Some("info".into()),
            ..LogOverrides::default()
        };
        assert!(config.apply_overrides(&overrides).is_err());
    }

    #[test]
    fn toml_round_trip() {
        let mut config = TaroConfig::default();
        config.plugins.push("taro_state_log".into());
        let text = config.to_toml().unwrap();
        assert!(text.contains("type = \"json\""));
        let parsed: TaroConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
