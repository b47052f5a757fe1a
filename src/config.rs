//! Kit configuration with TOML file support.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Location, Network};

/// Deployed OrderLock class on the networks it is published to.
pub const ORDER_LOCK_LOCATION: &str =
    "d6170025a62248d8df6dc14e3806e68b8df3d804c800c7bfb23b0b4232862505_o1";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Invalid OrderLock location: {0}")]
    OrderLock(String),
}

/// Configuration for a [`TokenKit`](crate::TokenKit).
///
/// Can be loaded from a TOML file via [`KitConfig::from_toml_file`] or
/// built programmatically (e.g. for tests).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KitConfig {
    /// Network the runtime instance is expected to run on.
    #[serde(default = "default_network")]
    pub network: Network,

    /// OrderLock class location by network name.
    #[serde(default = "default_order_locks")]
    pub order_locks: BTreeMap<String, Location>,

    /// Log level filter: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: "human" or "json".
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Directory of the sled state cache. In-memory when unset.
    #[serde(default)]
    pub cache_path: Option<PathBuf>,
}

fn default_network() -> Network {
    Network::Mock
}

fn default_order_locks() -> BTreeMap<String, Location> {
    let mut presets = BTreeMap::new();
    if let Ok(location) = ORDER_LOCK_LOCATION.parse::<Location>() {
        presets.insert(Network::Main.to_string(), location);
        presets.insert(Network::Mock.to_string(), location);
    }
    presets
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "human".to_string()
}

impl KitConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// The OrderLock class location for `network`, if one is published.
    pub fn order_lock(&self, network: Network) -> Option<Location> {
        self.order_locks.get(&network.to_string()).copied()
    }
}

impl Default for KitConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            order_locks: default_order_locks(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            cache_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = KitConfig::default();
        let toml_str = config.to_toml_string().unwrap();
        let parsed = KitConfig::from_toml_str(&toml_str).expect("should parse");
        assert_eq!(parsed, config);
    }

    #[test]
    fn minimal_toml_uses_defaults() {
        let config = KitConfig::from_toml_str("").expect("empty toml should use defaults");
        assert_eq!(config.network, Network::Mock);
        assert_eq!(config.log_format, "human");
        assert_eq!(
            config.order_lock(Network::Main).unwrap().to_string(),
            ORDER_LOCK_LOCATION
        );
        assert!(config.order_lock(Network::Test).is_none());
    }

    #[test]
    fn partial_toml_overrides() {
        let toml = r#"
            network = "test"
            log_level = "debug"
            cache_path = "/tmp/tokenkit"

            [order_locks]
            test = "d6170025a62248d8df6dc14e3806e68b8df3d804c800c7bfb23b0b4232862505_o2"
        "#;
        let config = KitConfig::from_toml_str(toml).expect("should parse");
        assert_eq!(config.network, Network::Test);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.order_lock(Network::Test).unwrap().vout(), Some(2));
        // an explicit table replaces the presets
        assert!(config.order_lock(Network::Main).is_none());
    }

    #[test]
    fn bad_location_is_rejected() {
        let toml = r#"
            [order_locks]
            main = "nope"
        "#;
        assert!(matches!(KitConfig::from_toml_str(toml), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokenkit.toml");
        std::fs::write(&path, "log_format = \"json\"\n").unwrap();
        let config = KitConfig::from_toml_file(&path).unwrap();
        assert_eq!(config.log_format, "json");
    }
}
