// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Relay configuration.
//!
//! The live configuration of a relay is a JSON-compatible tree so that the
//! control plane can address and mutate any part of it by path. The typed
//! [`RelaySettings`] view is derived from the tree after every change; a
//! tree that does not produce valid settings is rejected.

use crate::logging::LogLevel;
use crate::mapping::PublishOptions;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_BROKER_URL: &str = "mqtt://localhost:1883";
pub const DEFAULT_API_BASE_TOPIC: &str = "mqtt-relay";
pub const DEFAULT_RELAY_NAME: &str = "UnnamedRelay";
pub const DEFAULT_CONFIG_PATH: &str = "./relay-config.yaml";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Typed view of one relay's configuration tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelaySettings {
    /// Instance name, used in logs and control topics.
    #[serde(default = "default_relay_name")]
    pub name: String,

    #[serde(default = "default_broker_url")]
    pub broker_in_url: String,

    #[serde(default)]
    pub broker_in_options: BrokerOptions,

    #[serde(default = "default_broker_url")]
    pub broker_out_url: String,

    #[serde(default)]
    pub broker_out_options: BrokerOptions,

    /// Defaults for outbound publishes.
    #[serde(default)]
    pub publish_options: PublishOptions,

    /// Mapping rules, compiled by [`crate::mapping::TopicMapper`].
    #[serde(default)]
    pub topic_map: Option<Value>,

    #[serde(default)]
    pub log_options: LogOptions,

    /// Shortcut for debug logging when no explicit level is set.
    #[serde(default)]
    pub debug: bool,

    /// Root of the control and status topic namespace.
    #[serde(default = "default_api_base")]
    pub api_base_topic: String,

    /// Upper bound for connect, unsubscribe and close waits (milliseconds).
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,
}

/// Options for one broker connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerOptions {
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Keep-alive interval (seconds).
    #[serde(default = "default_keepalive")]
    pub keepalive: u64,

    /// Start a clean session.
    #[serde(default = "default_true")]
    pub clean: bool,

    /// Delay between reconnect attempts (milliseconds). Zero disables reconnects.
    #[serde(default = "default_reconnect_period")]
    pub reconnect_period: u64,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            keepalive: default_keepalive(),
            clean: true,
            reconnect_period: default_reconnect_period(),
        }
    }
}

/// Log formatting and verbosity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogOptions {
    #[serde(default)]
    pub log_level: Option<String>,

    #[serde(default = "default_true")]
    pub use_timestamp: bool,

    #[serde(default = "default_true")]
    pub use_brackets: bool,

    /// Log payloads of relayed messages. Defaults to the `debug` flag.
    #[serde(default)]
    pub log_mqtt_messages: Option<bool>,

    /// Suppress per-message relay logs.
    #[serde(default, alias = "supressMqtt")]
    pub suppress_mqtt: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            log_level: None,
            use_timestamp: true,
            use_brackets: true,
            log_mqtt_messages: None,
            suppress_mqtt: false,
        }
    }
}

fn default_relay_name() -> String {
    DEFAULT_RELAY_NAME.to_string()
}

fn default_broker_url() -> String {
    DEFAULT_BROKER_URL.to_string()
}

fn default_api_base() -> String {
    DEFAULT_API_BASE_TOPIC.to_string()
}

fn default_operation_timeout() -> u64 {
    5000
}

fn default_keepalive() -> u64 {
    60
}

fn default_reconnect_period() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

impl RelaySettings {
    /// Derive and validate settings from a configuration tree.
    pub fn from_tree(tree: &Value) -> Result<Self, ConfigError> {
        if !tree.is_object() {
            return Err(ConfigError::Invalid(
                "relay configuration must be a mapping".to_string(),
            ));
        }
        let settings: Self = serde_json::from_value(tree.clone())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate the settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_topic_level("name", &self.name)?;
        if self.api_base_topic.trim_matches('/').is_empty() {
            return Err(ConfigError::Invalid("apiBaseTopic must not be empty".to_string()));
        }
        if self.api_base_topic.contains(['+', '#']) {
            return Err(ConfigError::Invalid(format!(
                "apiBaseTopic '{}' must not contain wildcards",
                self.api_base_topic
            )));
        }
        if self.broker_in_url.trim().is_empty() {
            return Err(ConfigError::Invalid("brokerInUrl must not be empty".to_string()));
        }
        if self.broker_out_url.trim().is_empty() {
            return Err(ConfigError::Invalid("brokerOutUrl must not be empty".to_string()));
        }
        if self.operation_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "operationTimeoutMs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective log threshold, plus the rejected name when the configured
    /// level is unknown.
    pub fn log_threshold(&self) -> (LogLevel, Option<&str>) {
        match self.log_options.log_level.as_deref() {
            Some(name) => match LogLevel::parse(name) {
                Some(level) => (level, None),
                None => (self.implied_level(), Some(name)),
            },
            None => (self.implied_level(), None),
        }
    }

    fn implied_level(&self) -> LogLevel {
        if self.debug {
            LogLevel::Debug
        } else {
            LogLevel::default()
        }
    }

    /// Whether relayed payloads are logged.
    pub fn log_mqtt_messages(&self) -> bool {
        self.log_options.log_mqtt_messages.unwrap_or(self.debug)
    }
}

fn check_topic_level(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::Invalid(format!("{} must not be empty", field)));
    }
    if value.contains(['/', '+', '#']) {
        return Err(ConfigError::Invalid(format!(
            "{} '{}' must be a single topic level without wildcards",
            field, value
        )));
    }
    Ok(())
}

/// Load a configuration document. TOML and JSON are chosen by extension,
/// anything else is read as YAML.
pub fn load_document<P: AsRef<Path>>(path: P) -> Result<Value, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => parse_toml(&content),
        Some("json") => Ok(serde_json::from_str(&content)?),
        _ => parse_yaml(&content),
    }
}

pub fn parse_yaml(content: &str) -> Result<Value, ConfigError> {
    Ok(serde_yaml::from_str(content)?)
}

pub fn parse_toml(content: &str) -> Result<Value, ConfigError> {
    let table: toml::Value = toml::from_str(content)?;
    Ok(serde_json::to_value(table)?)
}

/// Split a document into per-relay trees.
///
/// A document is a sequence of relay mappings, a single relay mapping, or a
/// mapping with a `relays` sequence (the TOML form). Relays without a name
/// are called `relay<index>`.
pub fn relay_entries(document: &Value) -> Result<Vec<(String, Value)>, ConfigError> {
    let items: Vec<Value> = match document {
        Value::Array(items) => items.clone(),
        Value::Object(map) => match map.get("relays") {
            Some(Value::Array(items)) => items.clone(),
            Some(_) => {
                return Err(ConfigError::Invalid("'relays' must be a sequence".to_string()))
            }
            None => vec![document.clone()],
        },
        Value::Null => Vec::new(),
        _ => {
            return Err(ConfigError::Invalid(
                "configuration must be a relay mapping or a sequence of them".to_string(),
            ))
        }
    };

    let mut entries: Vec<(String, Value)> = Vec::with_capacity(items.len());
    for (index, mut item) in items.into_iter().enumerate() {
        let Some(map) = item.as_object_mut() else {
            return Err(ConfigError::Invalid(format!(
                "relay entry #{} must be a mapping",
                index
            )));
        };
        let name = match map.get("name").and_then(Value::as_str) {
            Some(name) => name.to_string(),
            None => {
                let name = format!("relay{}", index);
                map.insert("name".to_string(), Value::String(name.clone()));
                name
            }
        };
        if entries.iter().any(|(existing, _)| *existing == name) {
            return Err(ConfigError::Invalid(format!("duplicate relay name '{}'", name)));
        }
        entries.push((name, item));
    }
    Ok(entries)
}

/// Annotated starter configuration written by `mqtt-relay init`.
pub const SAMPLE_CONFIG: &str = r#"# mqtt-relay configuration
#
# A list of relay instances. Each one bridges brokerInUrl to brokerOutUrl
# and listens for commands on <apiBaseTopic>/<name>/<action>[/<path>].
- name: edge
  brokerInUrl: mqtt://localhost:1883
  brokerInOptions:
    keepalive: 60
    clean: true
    reconnectPeriod: 1000
  brokerOutUrl: mqtt://cloud.example.com:1883
  brokerOutOptions:
    username: relay
    password: change-me
  publishOptions:
    qos: 0
    retain: false
  topicMap:
    - in: device123/sensor/#
      out: home/sensors
    - in: alarms/+
      qos: auto
      retain: auto
  logOptions:
    logLevel: info
    useTimestamp: true
    useBrackets: true
    logMqttMessages: false
  apiBaseTopic: mqtt-relay
  operationTimeoutMs: 5000
"#;
