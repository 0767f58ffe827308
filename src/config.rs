//! Host-side configuration of the plugin subsystem.
//!
//! Values come from serde (when embedded in a larger host configuration) or
//! from `LOCKBOX_PLUGIN_*` environment variables, with defaults for both.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use snafu::Snafu;

use crate::handshake::VERSION_TABLE;
use crate::handshake::parse_version_list;

/// Default values for configuration
mod defaults {
    use crate::handshake::supported_versions;

    pub fn start_timeout_secs() -> u64 {
        60
    }
    pub fn auto_mtls() -> bool {
        true
    }
    pub fn protocol_versions() -> Vec<u32> {
        supported_versions()
    }
}

pub const ENV_PLUGIN_DIRECTORY: &str = "LOCKBOX_PLUGIN_DIRECTORY";
pub const ENV_START_TIMEOUT_SECS: &str = "LOCKBOX_PLUGIN_START_TIMEOUT_SECS";
pub const ENV_AUTO_MTLS: &str = "LOCKBOX_PLUGIN_AUTO_MTLS";
pub const ENV_MLOCK: &str = "LOCKBOX_PLUGIN_MLOCK";
pub const ENV_PROTOCOL_VERSIONS: &str = "LOCKBOX_PLUGIN_PROTOCOL_VERSIONS";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    #[snafu(display("invalid configuration for {key}: '{value}' ({reason})"))]
    InvalidValue { key: String, value: String, reason: String },
}

/// Settings for spawning and talking to external plugins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginSubsystemConfig {
    /// Directory relative plugin commands resolve in. Commands may not escape it.
    #[serde(default)]
    pub plugin_directory: Option<PathBuf>,
    /// How long a plugin has to print its handshake line.
    #[serde(default = "defaults::start_timeout_secs")]
    pub start_timeout_secs: u64,
    /// Establish mutual TLS with v5 plugins.
    #[serde(default = "defaults::auto_mtls")]
    pub auto_mtls: bool,
    /// Passed through to plugins as `VAULT_PLUGIN_MLOCK_ENABLED`.
    #[serde(default)]
    pub mlock: bool,
    /// Application protocol versions the host accepts.
    #[serde(default = "defaults::protocol_versions")]
    pub protocol_versions: Vec<u32>,
}

impl Default for PluginSubsystemConfig {
    fn default() -> Self {
        Self {
            plugin_directory: None,
            start_timeout_secs: defaults::start_timeout_secs(),
            auto_mtls: defaults::auto_mtls(),
            mlock: false,
            protocol_versions: defaults::protocol_versions(),
        }
    }
}

impl PluginSubsystemConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(dir) = lookup(ENV_PLUGIN_DIRECTORY).filter(|d| !d.is_empty()) {
            config.plugin_directory = Some(PathBuf::from(dir));
        }
        if let Some(raw) = lookup(ENV_START_TIMEOUT_SECS) {
            config.start_timeout_secs = raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
                key: ENV_START_TIMEOUT_SECS.to_string(),
                value: raw.clone(),
                reason: format!("must be a number of seconds: {e}"),
            })?;
        }
        if let Some(raw) = lookup(ENV_AUTO_MTLS) {
            config.auto_mtls = parse_bool(ENV_AUTO_MTLS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_MLOCK) {
            config.mlock = parse_bool(ENV_MLOCK, &raw)?;
        }
        if let Some(raw) = lookup(ENV_PROTOCOL_VERSIONS) {
            config.protocol_versions = parse_version_list(&raw);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.start_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "start_timeout_secs".to_string(),
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        let known = self.protocol_versions.iter().any(|v| VERSION_TABLE.iter().any(|t| t.version == *v));
        if !known {
            return Err(ConfigError::InvalidValue {
                key: "protocol_versions".to_string(),
                value: format!("{:?}", self.protocol_versions),
                reason: "must contain at least one of 3, 4, 5".to_string(),
            });
        }
        Ok(())
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
            reason: "must be a boolean".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = PluginSubsystemConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, PluginSubsystemConfig::default());
        assert_eq!(config.protocol_versions, vec![3, 4, 5]);
        assert_eq!(config.start_timeout(), Duration::from_secs(60));
        assert!(config.auto_mtls);
    }

    #[test]
    fn test_env_overrides() {
        let config = PluginSubsystemConfig::from_lookup(lookup(&[
            (ENV_PLUGIN_DIRECTORY, "/opt/plugins"),
            (ENV_START_TIMEOUT_SECS, "5"),
            (ENV_AUTO_MTLS, "false"),
            (ENV_MLOCK, "1"),
            (ENV_PROTOCOL_VERSIONS, "4,5"),
        ]))
        .unwrap();
        assert_eq!(config.plugin_directory, Some(PathBuf::from("/opt/plugins")));
        assert_eq!(config.start_timeout_secs, 5);
        assert!(!config.auto_mtls);
        assert!(config.mlock);
        assert_eq!(config.protocol_versions, vec![4, 5]);
    }

    #[test]
    fn test_invalid_values() {
        assert!(PluginSubsystemConfig::from_lookup(lookup(&[(ENV_START_TIMEOUT_SECS, "soon")])).is_err());
        assert!(PluginSubsystemConfig::from_lookup(lookup(&[(ENV_START_TIMEOUT_SECS, "0")])).is_err());
        assert!(PluginSubsystemConfig::from_lookup(lookup(&[(ENV_AUTO_MTLS, "maybe")])).is_err());
        assert!(PluginSubsystemConfig::from_lookup(lookup(&[(ENV_PROTOCOL_VERSIONS, "1,2")])).is_err());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: PluginSubsystemConfig = serde_json::from_str(r#"{"mlock": true}"#).unwrap();
        assert!(config.mlock);
        assert_eq!(config.start_timeout_secs, 60);
        assert_eq!(config.protocol_versions, vec![3, 4, 5]);
    }
}
