//! Configuration file parsing and structures.
//!
//! nutd uses TOML for declarative configuration. Each `[entries.<id>]` table
//! becomes one config entry; its `data` and `options` tables are opaque here
//! and validated by the integration that serves the entry's domain.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::filter::Targets;

use crate::engine::ConfigEntry;

/// Top-level configuration structure
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,

    /// HTTP API; disabled when absent
    #[serde(default)]
    pub api: Option<ApiConfig>,

    /// Key = entry_id
    #[serde(default)]
    pub entries: BTreeMap<String, EntryConfig>,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub level: LogLevel,

    /// Per-target levels, e.g. `"nutd::engine" = "debug"`
    #[serde(default)]
    pub overrides: HashMap<String, LogLevel>,
}

impl LoggingConfig {
    /// Filter for the tracing subscriber
    pub fn targets(&self) -> Targets {
        Targets::new()
            .with_default(LevelFilter::from(self.level))
            .with_targets(
                self.overrides
                    .iter()
                    .map(|(target, level)| (target.clone(), LevelFilter::from(*level))),
            )
    }
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_api_port")]
    pub port: u16,
}

fn default_listen() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8565
}

/// One configured integration instance
///
/// `data` and `options` are intentionally opaque (toml::Value); they are
/// converted to JSON objects and parsed by the integration at setup time.
#[derive(Debug, Clone, Deserialize)]
pub struct EntryConfig {
    /// Integration domain, e.g. "nut"
    pub domain: String,

    /// Display title; defaults to the entry id
    #[serde(default)]
    pub title: Option<String>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub data: Option<toml::Value>,

    #[serde(default)]
    pub options: Option<toml::Value>,
}

fn default_enabled() -> bool {
    true
}

/// Convert an opaque TOML table to a JSON object
fn table_to_json(
    entry_id: &str,
    field: &'static str,
    value: Option<&toml::Value>,
) -> Result<Map<String, Value>, ConfigError> {
    let Some(value) = value else {
        return Ok(Map::new());
    };

    match serde_json::to_value(value).map_err(ConfigError::JsonConversion)? {
        Value::Object(map) => Ok(map),
        _ => Err(ConfigError::NotATable {
            entry_id: entry_id.to_string(),
            field,
        }),
    }
}

impl EntryConfig {
    pub fn to_config_entry(&self, entry_id: &str) -> Result<ConfigEntry, ConfigError> {
        let data = table_to_json(entry_id, "data", self.data.as_ref())?;
        let options = table_to_json(entry_id, "options", self.options.as_ref())?;

        let title = self.title.clone().unwrap_or_else(|| entry_id.to_string());
        let mut entry = ConfigEntry::new(entry_id, self.domain.clone(), title)
            .with_data(data)
            .with_options(options);
        entry.disabled = !self.enabled;
        Ok(entry)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;

        toml::from_str(&contents).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }

    /// Load and merge several config files, e.g. a base file plus secrets
    ///
    /// Entries are combined; the same entry id in two files is an error.
    /// `api` comes from the first file that sets it, `logging` from the first
    /// file with non-default logging.
    pub fn from_files(paths: &[PathBuf]) -> Result<Self, ConfigError> {
        let mut merged = Config::default();
        let mut logging_set = false;

        for path in paths {
            let config = Self::from_file(path)?;

            let has_logging =
                config.logging.level != LogLevel::default() || !config.logging.overrides.is_empty();
            if has_logging && !logging_set {
                merged.logging = config.logging;
                logging_set = true;
            }
            if merged.api.is_none() {
                merged.api = config.api;
            }

            for (entry_id, entry) in config.entries {
                if merged.entries.contains_key(&entry_id) {
                    return Err(ConfigError::DuplicateEntry(entry_id, path.clone()));
                }
                merged.entries.insert(entry_id, entry);
            }
        }

        Ok(merged)
    }

    /// Whether any entry is configured for `domain`
    pub fn has_domain(&self, domain: &str) -> bool {
        self.entries.values().any(|e| e.domain == domain)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse {0}: {1}")]
    Parse(PathBuf, #[source] toml::de::Error),

    #[error("Failed to convert config to JSON: {0}")]
    JsonConversion(#[source] serde_json::Error),

    #[error("entries.{entry_id}.{field} must be a table")]
    NotATable {
        entry_id: String,
        field: &'static str,
    },

    #[error("Entry {0} defined again in {1}")]
    DuplicateEntry(String, PathBuf),
}
