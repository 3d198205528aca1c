//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "fieldlog.toml",
    "./config/fieldlog.toml",
    "/etc/fieldlog/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader pinned to a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment overrides.
    /// The result is NOT yet validated; callers run `AppConfig::validate`.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("FIELDLOG_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Secrets and per-deployment endpoints come from the environment so the
    /// TOML file can be committed without credentials.
    fn apply_env_overrides(&self, config: &mut AppConfig) {
        if let Ok(url) = env::var("FIELDLOG_DB_URL") {
            config.timescale.connection_string = url;
        }
        if let Ok(table) = env::var("FIELDLOG_TABLE_NAME") {
            config.timescale.table_name = table;
        }
        if let Ok(path) = env::var("FIELDLOG_DLQ_PATH") {
            config.timescale.dead_letter_queue_path = path;
        }
        if let Some(mqtt) = config.mqtt.as_mut() {
            if let Ok(host) = env::var("FIELDLOG_MQTT_HOST") {
                mqtt.broker_host = host;
            }
            if let Ok(port) = env::var("FIELDLOG_MQTT_PORT") {
                if let Ok(port) = port.parse() {
                    mqtt.broker_port = port;
                }
            }
            if let Ok(username) = env::var("FIELDLOG_MQTT_USERNAME") {
                mqtt.username = Some(username);
            }
            if let Ok(password) = env::var("FIELDLOG_MQTT_PASSWORD") {
                mqtt.password = Some(password);
            }
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let loader = ConfigLoader::with_path("/nonexistent/fieldlog.toml");
        let config = loader.load().unwrap();
        assert!(config.devices.is_empty());
        assert_eq!(config.timescale.table_name, "device_readings");
    }

    #[test]
    fn explicit_path_is_loaded() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [timescale]
            table_name = "line_counters"
            "#
        )
        .unwrap();

        let loader = ConfigLoader::with_path(file.path());
        let config = loader.load().unwrap();
        assert_eq!(config.timescale.table_name, "line_counters");
    }
}
