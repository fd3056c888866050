use serde::Deserialize;
use serde_json::Map;
use serde_json::Value;

/// Option key removed from NUT entries; old entries may still carry it
pub const DEPRECATED_RESOURCES: &str = "resources";

pub const DEFAULT_PORT: u16 = 3493;

/// Default polling interval in seconds
pub const DEFAULT_SCAN_INTERVAL: u64 = 60;

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_scan_interval() -> u64 {
    DEFAULT_SCAN_INTERVAL
}

/// Connection parameters stored in a NUT config entry's data
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EntryData {
    /// NUT server hostname or IP address
    pub host: String,

    /// NUT server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// UPS name on the server; the first listed UPS is used when absent
    #[serde(default)]
    pub alias: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

/// User-adjustable options of a NUT config entry
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EntryOptions {
    /// Seconds between polls
    #[serde(default = "default_scan_interval")]
    pub scan_interval: u64,
}

impl Default for EntryOptions {
    fn default() -> Self {
        Self {
            scan_interval: DEFAULT_SCAN_INTERVAL,
        }
    }
}

/// Strip stale option keys
///
/// Returns `None` when nothing needs to change, so callers can skip writing the
/// entry back.
pub fn migrate_options(options: &Map<String, Value>) -> Option<Map<String, Value>> {
    if !options.contains_key(DEPRECATED_RESOURCES) {
        return None;
    }

    let migrated = options
        .iter()
        .filter(|(key, _)| key.as_str() != DEPRECATED_RESOURCES)
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    Some(migrated)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected a JSON object"),
        }
    }

    #[test]
    fn test_entry_data_defaults() {
        let data: EntryData = serde_json::from_value(json!({ "host": "10.0.0.5" })).unwrap();
        assert_eq!(data.host, "10.0.0.5");
        assert_eq!(data.port, 3493);
        assert_eq!(data.alias, None);
        assert_eq!(data.username, None);
    }

    #[test]
    fn test_entry_data_requires_host() {
        assert!(serde_json::from_value::<EntryData>(json!({ "port": 3493 })).is_err());
    }

    #[test]
    fn test_options_default_scan_interval() {
        let options: EntryOptions = serde_json::from_value(json!({})).unwrap();
        assert_eq!(options.scan_interval, 60);

        let options: EntryOptions =
            serde_json::from_value(json!({ "scan_interval": 15, "other": true })).unwrap();
        assert_eq!(options.scan_interval, 15);
    }

    #[test]
    fn test_migrate_strips_resources() {
        let options = object(json!({
            "scan_interval": 30,
            "resources": ["battery.charge", "ups.load"],
        }));

        let migrated = migrate_options(&options).unwrap();
        assert_eq!(Value::Object(migrated), json!({ "scan_interval": 30 }));
    }

    #[test]
    fn test_migrate_without_resources_is_noop() {
        let options = object(json!({ "scan_interval": 30 }));
        assert_eq!(migrate_options(&options), None);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let options = object(json!({ "resources": [], "scan_interval": 45 }));

        let once = migrate_options(&options).unwrap_or_else(|| options.clone());
        let twice = migrate_options(&once).unwrap_or_else(|| once.clone());
        assert_eq!(once, twice);
    }
}
