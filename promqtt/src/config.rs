//! Configuration for the bridge.
//!
//! The configuration is loaded once from a JSON5 file, validated, and then
//! shared read-only. Nothing reloads it behind the caller's back.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use promqtt_common::{LoggingConfig, TopicPattern, load_config, parse_config};
use promqtt_exporter::{MetricDescriptor, MetricType, is_valid_label_name};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::expr::{Expr, Template};
use crate::message::ParserKind;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] promqtt_common::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    /// MQTT broker connection.
    pub mqtt: MqttConfig,

    /// HTTP endpoint settings.
    #[serde(default)]
    pub http: HttpConfig,

    /// Metric store settings.
    #[serde(default)]
    pub exporter: ExporterSettings,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metric declarations by name.
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricConfig>,

    /// Device types: type name to metric name to mapping.
    #[serde(default)]
    pub types: BTreeMap<String, BTreeMap<String, MappingConfig>>,

    /// Message routing, in dispatch order.
    #[serde(default)]
    pub messages: Vec<MessageConfig>,
}

/// MQTT broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MqttConfig {
    /// Broker host name.
    pub broker: String,

    /// Broker port (default: 1883).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Subscription filter (default: "#").
    #[serde(default = "default_topic")]
    pub topic: String,

    /// MQTT client id (default: "promqtt").
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Keep alive interval in seconds (default: 30).
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

fn default_port() -> u16 {
    1883
}

fn default_topic() -> String {
    "#".to_string()
}

fn default_client_id() -> String {
    "promqtt".to_string()
}

fn default_keep_alive() -> u64 {
    30
}

/// HTTP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    /// Address to listen on (default: "0.0.0.0:8086").
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path of the metrics endpoint (default: "/metrics").
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,

    /// Path serving the loaded configuration as JSON (default: "/cfg").
    #[serde(default = "default_config_path")]
    pub config_path: String,

    /// Path serving a JSON snapshot of the metric store (default: "/snapshot").
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,
}

fn default_listen() -> String {
    "0.0.0.0:8086".to_string()
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_config_path() -> String {
    "/cfg".to_string()
}

fn default_snapshot_path() -> String {
    "/snapshot".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            metrics_path: default_metrics_path(),
            config_path: default_config_path(),
            snapshot_path: default_snapshot_path(),
        }
    }
}

/// Metric store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExporterSettings {
    /// Skip HELP/TYPE lines of metrics without instances.
    #[serde(default)]
    pub hide_empty_metrics: bool,

    /// How often to drop stale instances without waiting for a scrape (seconds).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_sweep_interval() -> u64 {
    60
}

impl Default for ExporterSettings {
    fn default() -> Self {
        Self {
            hide_empty_metrics: false,
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl ExporterSettings {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Declaration of one metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricConfig {
    #[serde(rename = "type")]
    pub datatype: MetricType,

    #[serde(default)]
    pub help: String,

    /// Seconds without update before an instance is dropped; 0 never expires.
    #[serde(default)]
    pub timeout: u64,

    /// Also export `{name}_updates` counting every update.
    #[serde(default)]
    pub with_update_counter: bool,
}

impl MetricConfig {
    /// Build the store descriptor for the metric `name`.
    pub fn descriptor(&self, name: &str) -> MetricDescriptor {
        MetricDescriptor::new(name, self.datatype, self.help.clone())
            .with_timeout_secs(self.timeout)
            .with_update_counter(self.with_update_counter)
    }
}

/// How one device type derives one metric from a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MappingConfig {
    /// Value expression.
    pub value: String,

    /// Label name template to label value expression.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Routes messages from a set of topics to device types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessageConfig {
    /// Topic patterns: literal, `+` wildcards or `re:` regular expressions.
    pub topics: Vec<String>,

    /// Payload parser.
    #[serde(default)]
    pub parser: ParserKind,

    /// Names of the types whose mappings receive matching messages.
    pub types: Vec<String>,
}

impl BridgeConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: BridgeConfig = load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = parse_config(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.broker.trim().is_empty() {
            return Err(ConfigError::Validation(
                "mqtt.broker must not be empty".to_string(),
            ));
        }

        if self.http.listen.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::Validation(format!(
                "Invalid listen address: {}",
                self.http.listen
            )));
        }

        for (name, path) in [
            ("metrics_path", &self.http.metrics_path),
            ("config_path", &self.http.config_path),
            ("snapshot_path", &self.http.snapshot_path),
        ] {
            if !path.starts_with('/') {
                return Err(ConfigError::Validation(format!(
                    "http.{} must start with /",
                    name
                )));
            }
        }

        let paths = [
            &self.http.metrics_path,
            &self.http.config_path,
            &self.http.snapshot_path,
        ];
        for (i, path) in paths.iter().enumerate() {
            if RESERVED_PATHS.contains(&path.as_str()) || paths[..i].contains(path) {
                return Err(ConfigError::Validation(format!(
                    "HTTP path {} is used twice",
                    path
                )));
            }
        }

        if self.exporter.sweep_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "sweep_interval_secs must be > 0".to_string(),
            ));
        }

        for name in self.metrics.keys() {
            if !is_valid_metric_name(name) {
                return Err(ConfigError::Validation(format!(
                    "Invalid metric name '{}'",
                    name
                )));
            }
        }

        for (type_name, mappings) in &self.types {
            for (metric, mapping) in mappings {
                if !self.metrics.contains_key(metric) {
                    return Err(ConfigError::Validation(format!(
                        "Metric '{}' not declared. Referenced in type '{}'.",
                        metric, type_name
                    )));
                }

                Expr::parse(&mapping.value).map_err(|e| {
                    ConfigError::Validation(format!(
                        "Invalid value expression for '{}' in type '{}': {}",
                        metric, type_name, e
                    ))
                })?;

                for (label, expr) in &mapping.labels {
                    let template = Template::parse(label).map_err(|e| {
                        ConfigError::Validation(format!(
                            "Invalid label name '{}' for '{}' in type '{}': {}",
                            label, metric, type_name, e
                        ))
                    })?;
                    if template.is_literal() && !is_valid_label_name(template.source()) {
                        return Err(ConfigError::Validation(format!(
                            "Invalid label name '{}' for '{}' in type '{}'",
                            label, metric, type_name
                        )));
                    }
                    Expr::parse(expr).map_err(|e| {
                        ConfigError::Validation(format!(
                            "Invalid expression for label '{}' of '{}' in type '{}': {}",
                            label, metric, type_name, e
                        ))
                    })?;
                }
            }
        }

        for (index, message) in self.messages.iter().enumerate() {
            for type_name in &message.types {
                if !self.types.contains_key(type_name) {
                    return Err(ConfigError::Validation(format!(
                        "Type '{}' not configured. Referenced in message no. {}.",
                        type_name, index
                    )));
                }
            }

            for topic in &message.topics {
                TopicPattern::compile(topic)
                    .map_err(|e| ConfigError::Validation(e.to_string()))?;
            }
        }

        Ok(())
    }
}

/// Paths served regardless of configuration.
const RESERVED_PATHS: [&str; 2] = ["/health", "/ready"];

/// Prometheus metric names: `[a-zA-Z_:][a-zA-Z0-9_:]*`.
fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}
