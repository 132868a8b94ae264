// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Relay configuration.
//!
//! Loaded from YAML; every section has sensible defaults so a minimal
//! file only needs the collection mappings:
//!
//! ```yaml
//! mqtt:
//!   host: broker.local
//! keen:
//!   project_id: "5563..."
//!   write_key: "a1b2..."
//! collection_mappings:
//!   "home/+/temperature": temperatures
//! ```
//!
//! The `mqtt` and `keen` sections are optional: a relay wired with a
//! custom bus client or sink does not need them.

use crate::topic;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Filter(#[from] topic::InvalidFilter),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// MQTT broker settings. Required unless a bus client is supplied
    /// programmatically.
    #[serde(default)]
    pub mqtt: Option<MqttConfig>,

    /// Keen project settings. Required unless a sink is supplied
    /// programmatically.
    #[serde(default)]
    pub keen: Option<KeenConfig>,

    /// Subscription pattern -> destination collection.
    #[serde(default)]
    pub collection_mappings: BTreeMap<String, String>,

    /// Statistics reporting interval (seconds, 0 to disable).
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            mqtt: None,
            keen: None,
            collection_mappings: BTreeMap::new(),
            stats_interval_secs: default_stats_interval(),
            log_level: default_log_level(),
        }
    }
}

/// MQTT broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker hostname or IP address.
    #[serde(default = "default_mqtt_host")]
    pub host: String,

    /// Broker port.
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Client identifier. Auto-generated when absent.
    #[serde(default)]
    pub client_id: Option<String>,

    /// Username for broker authentication.
    #[serde(default)]
    pub user: Option<String>,

    /// Password for broker authentication.
    #[serde(default)]
    pub pass: Option<String>,

    /// Keepalive interval (seconds).
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u16,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            client_id: None,
            user: None,
            pass: None,
            keepalive_secs: default_keepalive(),
        }
    }
}

/// Keen analytics API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeenConfig {
    /// Keen project identifier.
    pub project_id: String,

    /// Write key authorized to post events.
    pub write_key: String,

    /// API base URL.
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_keepalive() -> u16 {
    60
}

fn default_api_url() -> String {
    "https://api.keen.io".to_string()
}

fn default_stats_interval() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl RelayConfig {
    /// Parse and validate a configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(ref mqtt) = self.mqtt {
            if mqtt.host.is_empty() {
                return Err(ConfigError::Invalid("mqtt.host must not be empty".into()));
            }
            if mqtt.port == 0 {
                return Err(ConfigError::Invalid("mqtt.port must not be 0".into()));
            }
        }

        if let Some(ref keen) = self.keen {
            if keen.project_id.is_empty() {
                return Err(ConfigError::Invalid(
                    "keen.project_id must not be empty".into(),
                ));
            }
            if keen.write_key.is_empty() {
                return Err(ConfigError::Invalid(
                    "keen.write_key must not be empty".into(),
                ));
            }
            if !keen.api_url.starts_with("http://") && !keen.api_url.starts_with("https://") {
                return Err(ConfigError::Invalid(format!(
                    "keen.api_url must be an http(s) URL, got '{}'",
                    keen.api_url
                )));
            }
        }

        for (pattern, collection) in &self.collection_mappings {
            topic::validate_filter(pattern)?;
            if collection.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "collection for pattern '{}' must not be empty",
                    pattern
                )));
            }
        }

        Ok(())
    }

    /// Commented example configuration, written by `keenmqtt gen-config`.
    pub fn example_yaml() -> &'static str {
        EXAMPLE_CONFIG
    }
}

const EXAMPLE_CONFIG: &str = r#"# keenmqtt configuration
# Generated by `keenmqtt gen-config`

mqtt:
  host: localhost
  port: 1883
  # client_id: keenmqtt-relay     # auto-generated when omitted
  # user: mqtt-user
  # pass: secret
  keepalive_secs: 60

keen:
  project_id: "<your Keen project id>"
  write_key: "<your Keen write key>"
  # api_url: https://api.keen.io

# Subscription pattern -> destination collection.
# `+` matches one topic segment, a trailing `#` matches the rest.
collection_mappings:
  "home/+/temperature": temperatures
  "home/+/humidity": humidity
  "devices/#": device_events

stats_interval_secs: 60
log_level: info
"#;

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_YAML: &str = r#"
collection_mappings:
  "home/exact": exact
"#;

    const FULL_YAML: &str = r#"
mqtt:
  host: broker.example.com
  port: 8883
  client_id: relay-1
  user: alice
  pass: secret
  keepalive_secs: 30
keen:
  project_id: "55631amqtt"
  write_key: "wk-123"
  api_url: "https://keen.internal.example.com"
collection_mappings:
  "home/+/temperature": temperatures
  "devices/#": device_events
stats_interval_secs: 5
log_level: debug
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = RelayConfig::from_yaml(MINIMAL_YAML).expect("parse minimal config");
        assert!(config.mqtt.is_none());
        assert!(config.keen.is_none());
        assert_eq!(config.collection_mappings.len(), 1);
        assert_eq!(config.stats_interval_secs, 60);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_full_config_round_trip() {
        let config = RelayConfig::from_yaml(FULL_YAML).expect("parse full config");

        let mqtt = config.mqtt.expect("mqtt section");
        assert_eq!(mqtt.host, "broker.example.com");
        assert_eq!(mqtt.port, 8883);
        assert_eq!(mqtt.client_id.as_deref(), Some("relay-1"));
        assert_eq!(mqtt.user.as_deref(), Some("alice"));
        assert_eq!(mqtt.keepalive_secs, 30);

        let keen = config.keen.expect("keen section");
        assert_eq!(keen.project_id, "55631amqtt");
        assert_eq!(keen.api_url, "https://keen.internal.example.com");

        assert_eq!(
            config.collection_mappings.get("devices/#"),
            Some(&"device_events".to_string())
        );
        assert_eq!(config.stats_interval_secs, 5);
    }

    #[test]
    fn test_mqtt_section_defaults() {
        let config = RelayConfig::from_yaml("mqtt: {}\n").expect("parse");
        let mqtt = config.mqtt.expect("mqtt section");
        assert_eq!(mqtt.host, "localhost");
        assert_eq!(mqtt.port, 1883);
        assert_eq!(mqtt.keepalive_secs, 60);
        assert!(mqtt.client_id.is_none());
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let yaml = r#"
collection_mappings:
  "home/#/temp": broken
"#;
        let err = RelayConfig::from_yaml(yaml).expect_err("should reject");
        assert!(matches!(err, ConfigError::Filter(_)));
    }

    #[test]
    fn test_empty_collection_rejected() {
        let yaml = r#"
collection_mappings:
  "home/temp": ""
"#;
        assert!(RelayConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_bad_api_url_rejected() {
        let yaml = r#"
keen:
  project_id: p
  write_key: w
  api_url: "ftp://api.keen.io"
"#;
        assert!(RelayConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, FULL_YAML).expect("write config");

        let config = RelayConfig::from_file(&path).expect("load config");
        assert_eq!(config.collection_mappings.len(), 2);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = RelayConfig::from_file("/nonexistent/config.yaml").expect_err("should fail");
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_example_config_is_valid() {
        let config = RelayConfig::from_yaml(RelayConfig::example_yaml()).expect("example parses");
        assert!(config.mqtt.is_some());
        assert!(config.keen.is_some());
        assert_eq!(config.collection_mappings.len(), 3);
    }
}
