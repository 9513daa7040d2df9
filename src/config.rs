//! Configuration for the STOMP pub/sub bridge
//!
//! Loaded from TOML. Credentials are referenced by environment variable name
//! and resolved when a connection is dialled, never stored in the file.

use crate::marshal::{DefaultMarshaler, DEFAULT_MESSAGE_UUID_HEADER_KEY};
use crate::naming::QueueNaming;
use crate::transport::ConnectOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeConfig {
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub queue: QueueNaming,
    #[serde(default)]
    pub marshaler: MarshalerConfig,
    #[serde(default)]
    pub subscriber: SubscriberConfig,
}

/// Broker connection parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    /// Network kind: tcp, tcp4 or tcp6
    #[serde(default = "default_network")]
    pub network: String,
    /// Broker address as `host:port`
    pub addr: String,
    /// STOMP virtual host (defaults to the address host)
    pub host: Option<String>,
    /// Environment variable containing the login
    pub login_env: Option<String>,
    /// Environment variable containing the passcode
    pub passcode_env: Option<String>,
    /// Dial and receipt timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// Marshaler settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarshalerConfig {
    #[serde(default = "default_uuid_header_key")]
    pub message_uuid_header_key: String,
}

/// Subscription engine settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriberConfig {
    /// Delay between consumption attempts after a failure
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
}

fn default_network() -> String {
    "tcp".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_uuid_header_key() -> String {
    DEFAULT_MESSAGE_UUID_HEADER_KEY.to_string()
}

fn default_reconnect_backoff_ms() -> u64 {
    100
}

impl Default for MarshalerConfig {
    fn default() -> Self {
        Self {
            message_uuid_header_key: default_uuid_header_key(),
        }
    }
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ConnectionConfig {
    pub fn new(network: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            addr: addr.into(),
            host: None,
            login_env: None,
            passcode_env: None,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }

    /// Only emptiness is checked here; the connector rejects unknown networks
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "connection.network must not be empty".to_string(),
            ));
        }
        if self.addr.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "connection.addr must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Build dial options, resolving credentials from the environment.
    /// A configured but unset variable is an error.
    pub fn connect_options(&self) -> Result<ConnectOptions, ConfigError> {
        Ok(ConnectOptions {
            network: self.network.clone(),
            addr: self.addr.clone(),
            host: self.host.clone(),
            login: get_env_var(self.login_env.as_deref())?,
            passcode: get_env_var(self.passcode_env.as_deref())?,
            timeout: self.connect_timeout(),
        })
    }
}

fn get_env_var(name: Option<&str>) -> Result<Option<String>, ConfigError> {
    name.map(|name| {
        std::env::var(name).map_err(|_| ConfigError::EnvVarNotFound(name.to_string()))
    })
    .transpose()
}

impl SubscriberConfig {
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
}

impl MarshalerConfig {
    pub fn build(&self) -> DefaultMarshaler {
        DefaultMarshaler::new(self.message_uuid_header_key.clone())
    }
}

impl BridgeConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: BridgeConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.connection.validate()
    }

    pub fn validate_publisher(&self) -> Result<(), ConfigError> {
        self.validate()
    }

    pub fn validate_subscriber(&self) -> Result<(), ConfigError> {
        self.validate()?;
        if self.subscriber.reconnect_backoff_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "subscriber.reconnect_backoff_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[connection]
addr = "localhost:61613"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[connection]
network = "tcp4"
addr = "broker:61613"
host = "/vhost"
login_env = "STOMP_LOGIN"
passcode_env = "STOMP_PASSCODE"
connect_timeout_ms = 2500

[queue]
strategy = "topic_name_with_suffix"
suffix = "q"
separator = "."

[marshaler]
message_uuid_header_key = "x-uuid"

[subscriber]
reconnect_backoff_ms = 250
"#;

        let config: BridgeConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.connection.network, "tcp4");
        assert_eq!(config.connection.addr, "broker:61613");
        assert_eq!(config.connection.host.as_deref(), Some("/vhost"));
        assert_eq!(config.connection.connect_timeout(), Duration::from_millis(2500));
        assert_eq!(
            config.queue,
            QueueNaming::TopicNameWithSuffix {
                suffix: "q".to_string(),
                separator: ".".to_string()
            }
        );
        assert_eq!(config.marshaler.message_uuid_header_key, "x-uuid");
        assert_eq!(config.subscriber.reconnect_backoff(), Duration::from_millis(250));
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = BridgeConfig::test_config();
        assert_eq!(config.connection.network, "tcp");
        assert_eq!(config.connection.connect_timeout_ms, 10_000);
        assert_eq!(config.queue, QueueNaming::TopicName);
        assert_eq!(
            config.marshaler.message_uuid_header_key,
            DEFAULT_MESSAGE_UUID_HEADER_KEY
        );
        assert_eq!(config.subscriber.reconnect_backoff_ms, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_addr_rejected() {
        let mut config = BridgeConfig::test_config();
        config.connection.addr = "  ".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_empty_network_rejected() {
        let config = ConnectionConfig::new("", "localhost:61613");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_backoff_rejected_for_subscriber() {
        let mut config = BridgeConfig::test_config();
        config.subscriber.reconnect_backoff_ms = 0;
        assert!(config.validate_publisher().is_ok());
        assert!(config.validate_subscriber().is_err());
    }

    #[test]
    fn test_connect_options_without_credentials() {
        let options = ConnectionConfig::new("tcp", "localhost:61613")
            .connect_options()
            .unwrap();
        assert_eq!(options.login, None);
        assert_eq!(options.passcode, None);
        assert_eq!(options.timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_connect_options_missing_env_var() {
        let mut config = ConnectionConfig::new("tcp", "localhost:61613");
        config.login_env = Some("STOMP_PUBSUB_TEST_SURELY_UNSET_VAR".to_string());
        assert!(matches!(
            config.connect_options(),
            Err(ConfigError::EnvVarNotFound(_))
        ));
    }
}
