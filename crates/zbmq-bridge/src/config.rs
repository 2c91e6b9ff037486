//! Configuration types for the bridge
//!
//! Keys are camelCase so an existing JSON configuration file can be used as
//! is. Durations are humantime strings (`"60s"`, `"1m 30s"`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BridgeError, Result};
use crate::interface::mqtt::BrokerEndpoint;

/// Default root topic
pub const DEFAULT_ROOT_TOPIC: &str = "zbmq";

/// Default broker URL
pub const DEFAULT_BROKER: &str = "mqtt://test.mosquitto.org";

/// Default coordinator serial port
pub const DEFAULT_SERIAL_PORT: &str = "/dev/ttyUSB1";

/// Default baud rate for the coordinator link
pub const DEFAULT_BAUD_RATE: u32 = 57600;

/// Default device directory file
pub const DEFAULT_DEVICE_DB: &str = "devices.json";

/// Default log level
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default MQTT keep-alive
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Default delay between MQTT reconnect attempts
pub const DEFAULT_RECONNECT_PERIOD: Duration = Duration::from_secs(15);

/// Default timeout for a coordinator request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Main configuration for the bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    /// Prefix of every topic; the local extended id is appended to it
    #[serde(default = "default_root_topic")]
    pub root_topic: String,

    /// Broker URL (`mqtt://`, `tcp://`, `mqtts://` or `ssl://`)
    #[serde(default = "default_broker")]
    pub broker: String,

    /// Broker username
    #[serde(default)]
    pub username: Option<String>,

    /// Broker password
    #[serde(default)]
    pub password: Option<String>,

    /// Coordinator serial port
    #[serde(default = "default_port")]
    pub port: String,

    /// Coordinator baud rate
    #[serde(default = "default_baud")]
    pub baud: u32,

    /// Device directory file
    #[serde(default = "default_device_db")]
    pub device_db: PathBuf,

    /// Log filter directive
    #[serde(default = "default_loglevel")]
    pub loglevel: String,

    /// Also publish every frame on the sender's own response topic
    #[serde(default = "default_expand", alias = "expandReplyTopics")]
    pub expand_response_topics: bool,

    /// Start with an empty directory instead of failing on a corrupt one
    #[serde(default)]
    pub reset_corrupt_device_db: bool,

    /// MQTT keep-alive interval
    #[serde(with = "humantime_serde", default = "default_keep_alive")]
    pub keep_alive: Duration,

    /// Delay between MQTT reconnect attempts
    #[serde(with = "humantime_serde", default = "default_reconnect_period")]
    pub reconnect_period: Duration,

    /// Timeout for a single coordinator request
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
}

fn default_root_topic() -> String {
    DEFAULT_ROOT_TOPIC.to_string()
}

fn default_broker() -> String {
    DEFAULT_BROKER.to_string()
}

fn default_port() -> String {
    DEFAULT_SERIAL_PORT.to_string()
}

fn default_baud() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_device_db() -> PathBuf {
    PathBuf::from(DEFAULT_DEVICE_DB)
}

fn default_loglevel() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_expand() -> bool {
    true
}

fn default_keep_alive() -> Duration {
    DEFAULT_KEEP_ALIVE
}

fn default_reconnect_period() -> Duration {
    DEFAULT_RECONNECT_PERIOD
}

fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            root_topic: default_root_topic(),
            broker: default_broker(),
            username: None,
            password: None,
            port: default_port(),
            baud: DEFAULT_BAUD_RATE,
            device_db: default_device_db(),
            loglevel: default_loglevel(),
            expand_response_topics: true,
            reset_corrupt_device_db: false,
            keep_alive: DEFAULT_KEEP_ALIVE,
            reconnect_period: DEFAULT_RECONNECT_PERIOD,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl BridgeConfig {
    /// Parse a JSON configuration document
    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| BridgeError::ConfigInvalid(e.to_string()))
    }

    /// Read a JSON configuration file
    pub async fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            BridgeError::ConfigInvalid(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    /// Check that the configuration can be used to start a bridge
    pub fn validate(&self) -> Result<()> {
        if self.root_topic.is_empty() {
            return Err(BridgeError::ConfigInvalid("rootTopic is empty".to_string()));
        }
        if self.root_topic.contains(['+', '#']) {
            return Err(BridgeError::ConfigInvalid(format!(
                "rootTopic `{}` contains a wildcard",
                self.root_topic
            )));
        }
        if self.port.is_empty() {
            return Err(BridgeError::ConfigInvalid("port is empty".to_string()));
        }
        if self.baud == 0 {
            return Err(BridgeError::ConfigInvalid("baud must be positive".to_string()));
        }
        if !self.keep_alive.is_zero() && self.keep_alive < Duration::from_secs(1) {
            return Err(BridgeError::ConfigInvalid(
                "keepAlive must be zero or at least one second".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(BridgeError::ConfigInvalid(
                "requestTimeout must be positive".to_string(),
            ));
        }
        BrokerEndpoint::parse(&self.broker)?;
        Ok(())
    }

    /// Username and password, only when both are set
    pub fn credentials(&self) -> Option<(String, String)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        }
    }

    /// Settings handed to the mesh stack at startup
    pub fn serial_settings(&self) -> SerialSettings {
        SerialSettings {
            port: self.port.clone(),
            baud_rate: self.baud,
            request_timeout: self.request_timeout,
        }
    }
}

/// Coordinator link settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    /// Serial port path
    pub port: String,
    /// Baud rate; framing is always 8N1 with XON/XOFF
    pub baud_rate: u32,
    /// Timeout for a single request
    pub request_timeout: Duration,
}

impl Default for SerialSettings {
    fn default() -> Self {
        BridgeConfig::default().serial_settings()
    }
}

/// Builder for BridgeConfig
#[derive(Debug, Default)]
pub struct BridgeConfigBuilder {
    config: BridgeConfig,
}

impl BridgeConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration
    pub fn from_config(config: BridgeConfig) -> Self {
        Self { config }
    }

    /// Set root topic
    pub fn root_topic(mut self, topic: impl Into<String>) -> Self {
        self.config.root_topic = topic.into();
        self
    }

    /// Set broker URL
    pub fn broker(mut self, url: impl Into<String>) -> Self {
        self.config.broker = url.into();
        self
    }

    /// Set broker credentials
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.username = Some(username.into());
        self.config.password = Some(password.into());
        self
    }

    /// Set serial port path
    pub fn serial_port(mut self, port: impl Into<String>) -> Self {
        self.config.port = port.into();
        self
    }

    /// Set serial port with baud rate
    pub fn serial_port_with_baud(mut self, port: impl Into<String>, baud: u32) -> Self {
        self.config.port = port.into();
        self.config.baud = baud;
        self
    }

    /// Set device directory file
    pub fn device_db(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.device_db = path.into();
        self
    }

    /// Set log level
    pub fn loglevel(mut self, level: impl Into<String>) -> Self {
        self.config.loglevel = level.into();
        self
    }

    /// Enable or disable per-device response topics
    pub fn expand_response_topics(mut self, enabled: bool) -> Self {
        self.config.expand_response_topics = enabled;
        self
    }

    /// Enable or disable resetting a corrupt directory
    pub fn reset_corrupt_device_db(mut self, enabled: bool) -> Self {
        self.config.reset_corrupt_device_db = enabled;
        self
    }

    /// Set MQTT keep-alive
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.config.keep_alive = keep_alive;
        self
    }

    /// Set MQTT reconnect period
    pub fn reconnect_period(mut self, period: Duration) -> Self {
        self.config.reconnect_period = period;
        self
    }

    /// Set coordinator request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Build the configuration
    pub fn build(self) -> BridgeConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
