//! Configuration for the field logger.
//!
//! Loaded from a TOML file (path given as the first CLI argument, default
//! `config.toml`) and validated up front so a bad deployment fails at
//! startup instead of mid-run. Exactly one delivery mode is active per
//! deployment; both sections may be present but only the configured one is
//! used.

use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::sensor::SensorKind;

/// Default sampling interval in seconds
const DEFAULT_INTERVAL_SECS: u64 = 60;

/// Bounds on the sampling interval
const MIN_INTERVAL_SECS: u64 = 1;
const MAX_INTERVAL_SECS: u64 = 3600;

/// Default pull endpoint, a well-known multicast group/port for discovery
const DEFAULT_MULTICAST_GROUP: &str = "224.0.1.187";
const DEFAULT_PULL_PORT: u16 = 5683;

/// Default push broker settings
const DEFAULT_BROKER_PORT: u16 = 1883;
const DEFAULT_ACK_FLUSH_WINDOW: u64 = 100;
const DEFAULT_RECONNECT_DELAY_SECS: u64 = 30;

/// Errors raised while loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// The config file could not be read
    Read { path: String, error: std::io::Error },

    /// The config file is not valid TOML for this schema
    Parse(toml::de::Error),

    /// A field value is out of bounds or inconsistent
    Invalid { field: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, error } => {
                write!(f, "failed to read config file {}: {}", path, error)
            }
            ConfigError::Parse(e) => write!(f, "failed to parse config file: {}", e),
            ConfigError::Invalid { field, message } => {
                write!(f, "invalid configuration for {}: {}", field, message)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { error, .. } => Some(error),
            ConfigError::Parse(e) => Some(e),
            ConfigError::Invalid { .. } => None,
        }
    }
}

/// Which delivery component runs for this deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Remote collector pulls batches and acks via the request cycle
    Pull,

    /// Device pushes records to an MQTT broker one at a time
    Push,
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Device name override; defaults to the OS hostname
    pub device_name: Option<String>,

    #[serde(default)]
    pub sampling: SamplingConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    pub delivery: DeliveryConfig,

    #[serde(default)]
    pub pull: PullConfig,

    #[serde(default)]
    pub push: PushConfig,
}

/// Producer loop settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SamplingConfig {
    /// Seconds between sampling cycles
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Which sensors to sample, resolved against the static registry
    #[serde(default = "default_sensors")]
    pub sensors: Vec<SensorKind>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_INTERVAL_SECS,
            sensors: default_sensors(),
        }
    }
}

impl SamplingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Backing store paths.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_data_path")]
    pub data_path: String,

    #[serde(default = "default_quarantine_path")]
    pub quarantine_path: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            data_path: default_data_path(),
            quarantine_path: default_quarantine_path(),
        }
    }
}

/// Delivery mode selector.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    pub mode: DeliveryMode,
}

/// Pull delivery service settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PullConfig {
    /// Local bind address
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Well-known port the collector targets
    #[serde(default = "default_pull_port")]
    pub port: u16,

    /// Multicast group joined for endpoint discovery
    #[serde(default = "default_multicast_group")]
    pub multicast_group: String,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: DEFAULT_PULL_PORT,
            multicast_group: default_multicast_group(),
        }
    }
}

/// Push delivery agent settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PushConfig {
    /// Broker hostname
    #[serde(default = "default_broker")]
    pub broker: String,

    /// Broker port
    #[serde(default = "default_broker_port")]
    pub port: u16,

    pub username: Option<String>,

    pub password: Option<String>,

    /// Topic prefix; the full data topic is `<prefix>/<hostname>/data`
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    /// MQTT quality of service (0-2); at-least-once delivery needs >= 1
    #[serde(default = "default_qos")]
    pub qos: u8,

    /// Flush the queue cursor every N confirmations
    #[serde(default = "default_ack_flush_window")]
    pub ack_flush_window: u64,

    /// Fixed delay between reconnection attempts
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            broker: default_broker(),
            port: DEFAULT_BROKER_PORT,
            username: None,
            password: None,
            topic_prefix: default_topic_prefix(),
            qos: default_qos(),
            ack_flush_window: DEFAULT_ACK_FLUSH_WINDOW,
            reconnect_delay_secs: DEFAULT_RECONNECT_DELAY_SECS,
        }
    }
}

impl PushConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

fn default_interval_secs() -> u64 {
    DEFAULT_INTERVAL_SECS
}

fn default_sensors() -> Vec<SensorKind> {
    vec![SensorKind::Particle, SensorKind::Climate]
}

fn default_data_path() -> String {
    "data.queue".to_string()
}

fn default_quarantine_path() -> String {
    "quarantine.queue".to_string()
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_pull_port() -> u16 {
    DEFAULT_PULL_PORT
}

fn default_multicast_group() -> String {
    DEFAULT_MULTICAST_GROUP.to_string()
}

fn default_broker() -> String {
    "localhost".to_string()
}

fn default_broker_port() -> u16 {
    DEFAULT_BROKER_PORT
}

fn default_topic_prefix() -> String {
    "sensors".to_string()
}

fn default_qos() -> u8 {
    1
}

fn default_ack_flush_window() -> u64 {
    DEFAULT_ACK_FLUSH_WINDOW
}

fn default_reconnect_delay_secs() -> u64 {
    DEFAULT_RECONNECT_DELAY_SECS
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|error| ConfigError::Read {
            path: path.display().to_string(),
            error,
        })?;
        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the device name: config override, then OS hostname.
    pub fn device_name(&self) -> String {
        if let Some(name) = &self.device_name {
            return name.clone();
        }

        hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_else(|| "field-logger".to_string())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sampling.interval_secs < MIN_INTERVAL_SECS {
            return Err(ConfigError::Invalid {
                field: "sampling.interval_secs".to_string(),
                message: format!("must be at least {}", MIN_INTERVAL_SECS),
            });
        }

        if self.sampling.interval_secs > MAX_INTERVAL_SECS {
            return Err(ConfigError::Invalid {
                field: "sampling.interval_secs".to_string(),
                message: format!("must be at most {}", MAX_INTERVAL_SECS),
            });
        }

        if self.sampling.sensors.is_empty() {
            return Err(ConfigError::Invalid {
                field: "sampling.sensors".to_string(),
                message: "at least one sensor must be configured".to_string(),
            });
        }

        if self.queue.data_path == self.queue.quarantine_path {
            return Err(ConfigError::Invalid {
                field: "queue.quarantine_path".to_string(),
                message: "must differ from queue.data_path".to_string(),
            });
        }

        match self.pull.multicast_group.parse::<Ipv4Addr>() {
            Ok(group) if group.is_multicast() => {}
            Ok(_) => {
                return Err(ConfigError::Invalid {
                    field: "pull.multicast_group".to_string(),
                    message: "address is not a multicast group".to_string(),
                });
            }
            Err(_) => {
                return Err(ConfigError::Invalid {
                    field: "pull.multicast_group".to_string(),
                    message: format!(
                        "'{}' is not a valid IPv4 address",
                        self.pull.multicast_group
                    ),
                });
            }
        }

        if self.push.qos > 2 {
            return Err(ConfigError::Invalid {
                field: "push.qos".to_string(),
                message: "must be 0, 1 or 2".to_string(),
            });
        }

        if self.push.ack_flush_window == 0 {
            return Err(ConfigError::Invalid {
                field: "push.ack_flush_window".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::from_toml("[delivery]\nmode = \"pull\"\n").unwrap();

        assert_eq!(config.delivery.mode, DeliveryMode::Pull);
        assert_eq!(config.sampling.interval_secs, 60);
        assert_eq!(
            config.sampling.sensors,
            vec![SensorKind::Particle, SensorKind::Climate]
        );
        assert_eq!(config.queue.data_path, "data.queue");
        assert_eq!(config.pull.port, 5683);
        assert_eq!(config.pull.multicast_group, "224.0.1.187");
        assert_eq!(config.push.qos, 1);
        assert_eq!(config.push.ack_flush_window, 100);
    }

    #[test]
    fn test_full_config_parses() {
        let toml = r#"
            device_name = "station-7"

            [sampling]
            interval_secs = 30
            sensors = ["particle"]

            [queue]
            data_path = "/var/lib/logger/data.queue"
            quarantine_path = "/var/lib/logger/quarantine.queue"

            [delivery]
            mode = "push"

            [push]
            broker = "broker.example.net"
            port = 8883
            username = "station-7"
            password = "secret"
            topic_prefix = "env"
            qos = 2
            ack_flush_window = 10
            reconnect_delay_secs = 5
        "#;

        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.device_name(), "station-7");
        assert_eq!(config.delivery.mode, DeliveryMode::Push);
        assert_eq!(config.sampling.sensors, vec![SensorKind::Particle]);
        assert_eq!(config.push.broker, "broker.example.net");
        assert_eq!(config.push.qos, 2);
        assert_eq!(config.push.reconnect_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_unknown_sensor_rejected() {
        let toml = r#"
            [sampling]
            sensors = ["particle", "teleporter"]

            [delivery]
            mode = "pull"
        "#;

        assert!(matches!(Config::from_toml(toml), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_unknown_delivery_mode_rejected() {
        let result = Config::from_toml("[delivery]\nmode = \"carrier_pigeon\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_interval_bounds_enforced() {
        let toml = "[sampling]\ninterval_secs = 0\n\n[delivery]\nmode = \"pull\"\n";
        assert!(matches!(
            Config::from_toml(toml),
            Err(ConfigError::Invalid { .. })
        ));

        let toml = "[sampling]\ninterval_secs = 9999\n\n[delivery]\nmode = \"pull\"\n";
        assert!(matches!(
            Config::from_toml(toml),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_empty_sensor_list_rejected() {
        let toml = "[sampling]\nsensors = []\n\n[delivery]\nmode = \"pull\"\n";
        let err = Config::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("sampling.sensors"));
    }

    #[test]
    fn test_qos_bounds_enforced() {
        let toml = "[delivery]\nmode = \"push\"\n\n[push]\nqos = 3\n";
        let err = Config::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("push.qos"));
    }

    #[test]
    fn test_non_multicast_group_rejected() {
        let toml = "[delivery]\nmode = \"pull\"\n\n[pull]\nmulticast_group = \"10.0.0.1\"\n";
        let err = Config::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("pull.multicast_group"));
    }

    #[test]
    fn test_colliding_store_paths_rejected() {
        let toml = r#"
            [queue]
            data_path = "same.queue"
            quarantine_path = "same.queue"

            [delivery]
            mode = "pull"
        "#;
        let err = Config::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("quarantine_path"));
    }

    #[test]
    fn test_zero_flush_window_rejected() {
        let toml = "[delivery]\nmode = \"push\"\n\n[push]\nack_flush_window = 0\n";
        let err = Config::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("ack_flush_window"));
    }
}
