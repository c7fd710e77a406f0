//! Configuration management for the image bridge.
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults
//! 2. Optional config files (`config/bridge`, `/etc/image-bridge/bridge`)
//! 3. Environment variables prefixed with `BRIDGE__` (e.g. `BRIDGE__MQTT__TOPIC`)
//! 4. The flat variables used by existing deployments (`MQTT_BROKER`, `PG_HOST`, ...)

use config::{ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Flat environment variables and the keys they override.
const LEGACY_ENV: &[(&str, &str)] = &[
    ("MQTT_BROKER", "mqtt.broker"),
    ("MQTT_PORT", "mqtt.port"),
    ("MQTT_TOPIC", "mqtt.topic"),
    ("PG_HOST", "database.host"),
    ("PG_PORT", "database.port"),
    ("PG_DB", "database.name"),
    ("PG_USER", "database.user"),
    ("PG_PASS", "database.password"),
];

/// Main configuration for the bridge service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Prometheus exporter port; the exporter is disabled when unset
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// MQTT broker and subscription configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    /// Broker hostname
    #[serde(default = "default_broker")]
    pub broker: String,
    /// Broker TLS port
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Topic carrying image messages
    #[serde(default = "default_topic")]
    pub topic: String,
    /// MQTT client identifier
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Subscription QoS (0, 1 or 2)
    #[serde(default)]
    pub qos: u8,
    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Largest MQTT packet accepted or sent, in bytes
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    /// Capacity of the channel between the subscriber and the pipeline
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Consecutive failed sessions tolerated before giving up
    #[serde(default = "default_attempts")]
    pub reconnect_attempts: u32,
    /// Fixed delay between reconnection attempts in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub reconnect_delay_ms: u64,
}

/// Client identity and trust root for the mutual TLS handshake.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    /// Trusted root CA (PEM)
    #[serde(default = "default_ca_path")]
    pub ca_path: PathBuf,
    /// Client certificate (PEM)
    #[serde(default = "default_cert_path")]
    pub cert_path: PathBuf,
    /// Client private key (PEM)
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,
    /// PKCS#12 archive holding the client certificate and key.
    /// Takes precedence over `cert_path`/`key_path` when set.
    #[serde(default)]
    pub pkcs12_path: Option<PathBuf>,
    /// Passphrase unlocking the PKCS#12 archive
    #[serde(default)]
    pub pkcs12_password: Option<String>,
}

/// PostgreSQL configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    /// Database name
    #[serde(default = "default_db_name")]
    pub name: String,
    #[serde(default = "default_db_user")]
    pub user: String,
    #[serde(default = "default_db_password")]
    pub password: String,
    /// Maximum number of pooled connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Connection attempts before startup fails
    #[serde(default = "default_attempts")]
    pub connect_attempts: u32,
    /// Fixed delay between connection attempts in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Timeout for a single connection attempt in seconds
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

// Default value functions
fn default_service_name() -> String {
    "image-bridge".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_broker() -> String {
    "mosquitto".to_string()
}
fn default_mqtt_port() -> u16 {
    8883
}
fn default_topic() -> String {
    "test/topic/image".to_string()
}
fn default_client_id() -> String {
    format!("image-bridge-{}", std::process::id())
}
fn default_keep_alive_secs() -> u64 {
    60
}
fn default_max_packet_size() -> usize {
    16 * 1024 * 1024
}
fn default_channel_capacity() -> usize {
    256
}
fn default_attempts() -> u32 {
    10
}
fn default_retry_delay_ms() -> u64 {
    3000
}
fn default_ca_path() -> PathBuf {
    PathBuf::from("/app/certs/ca.crt")
}
fn default_cert_path() -> PathBuf {
    PathBuf::from("/app/certs/client.crt")
}
fn default_key_path() -> PathBuf {
    PathBuf::from("/app/certs/client.key")
}
fn default_db_host() -> String {
    "postgres".to_string()
}
fn default_db_port() -> u16 {
    5432
}
fn default_db_name() -> String {
    "mqttdb".to_string()
}
fn default_db_user() -> String {
    "mqttuser".to_string()
}
fn default_db_password() -> String {
    "mqttpass".to_string()
}
fn default_max_connections() -> u32 {
    1
}
fn default_acquire_timeout_secs() -> u64 {
    10
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            metrics_port: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: default_broker(),
            port: default_mqtt_port(),
            topic: default_topic(),
            client_id: default_client_id(),
            qos: 0,
            keep_alive_secs: default_keep_alive_secs(),
            max_packet_size: default_max_packet_size(),
            channel_capacity: default_channel_capacity(),
            reconnect_attempts: default_attempts(),
            reconnect_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            ca_path: default_ca_path(),
            cert_path: default_cert_path(),
            key_path: default_key_path(),
            pkcs12_path: None,
            pkcs12_password: None,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_db_host(),
            port: default_db_port(),
            name: default_db_name(),
            user: default_db_user(),
            password: default_db_password(),
            max_connections: default_max_connections(),
            connect_attempts: default_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

impl Config {
    /// Load configuration from files and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(|name| std::env::var(name).ok())
    }

    /// Load configuration, resolving the flat legacy variables through `lookup`.
    pub fn load_with<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = config::Config::builder()
            .add_source(File::with_name("config/bridge").required(false))
            .add_source(File::with_name("/etc/image-bridge/bridge").required(false))
            // BRIDGE__DATABASE__HOST -> database.host
            .add_source(
                Environment::with_prefix("BRIDGE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        for (var, key) in LEGACY_ENV {
            builder = builder.set_override_option(*key, lookup(var))?;
        }

        builder.build()?.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.mqtt.broker.is_empty() {
            return Err(ConfigValidationError::MissingField("mqtt.broker".to_string()));
        }
        if self.mqtt.topic.is_empty() {
            return Err(ConfigValidationError::MissingField("mqtt.topic".to_string()));
        }
        if self.mqtt.port == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "mqtt.port".to_string(),
                message: "Port must be greater than 0".to_string(),
            });
        }
        if self.mqtt.qos > 2 {
            return Err(ConfigValidationError::InvalidValue {
                field: "mqtt.qos".to_string(),
                message: format!("QoS must be 0, 1 or 2, got {}", self.mqtt.qos),
            });
        }
        if self.mqtt.max_packet_size == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "mqtt.max_packet_size".to_string(),
                message: "Packet size limit must be greater than 0".to_string(),
            });
        }
        if self.mqtt.channel_capacity == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "mqtt.channel_capacity".to_string(),
                message: "Capacity must be greater than 0".to_string(),
            });
        }
        if self.mqtt.reconnect_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "mqtt.reconnect_attempts".to_string(),
                message: "At least one attempt is required".to_string(),
            });
        }
        if self.tls.pkcs12_path.is_some() && self.tls.pkcs12_password.is_none() {
            return Err(ConfigValidationError::MissingField(
                "tls.pkcs12_password".to_string(),
            ));
        }
        if self.database.host.is_empty() {
            return Err(ConfigValidationError::MissingField("database.host".to_string()));
        }
        if self.database.name.is_empty() {
            return Err(ConfigValidationError::MissingField("database.name".to_string()));
        }
        if self.database.port == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "database.port".to_string(),
                message: "Port must be greater than 0".to_string(),
            });
        }
        if self.database.connect_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "database.connect_attempts".to_string(),
                message: "At least one attempt is required".to_string(),
            });
        }

        Ok(())
    }
}

impl MqttConfig {
    /// Get keep-alive interval as Duration.
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    /// Get reconnection delay as Duration.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl DatabaseConfig {
    /// Get delay between connection attempts as Duration.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Get single-attempt timeout as Duration.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::load_with(|name| vars.get(name).cloned()).unwrap()
    }

    #[test]
    fn test_default_values() {
        let config = load(&[]);
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.mqtt.topic, "test/topic/image");
        assert_eq!(config.mqtt.keep_alive(), Duration::from_secs(60));
        assert_eq!(config.mqtt.max_packet_size, 16 * 1024 * 1024);
        assert_eq!(config.database.name, "mqttdb");
        assert_eq!(config.database.connect_attempts, 10);
        assert_eq!(config.database.retry_delay(), Duration::from_secs(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_legacy_env_overrides() {
        let config = load(&[
            ("MQTT_BROKER", "broker.local"),
            ("PG_HOST", "db.local"),
            ("PG_PORT", "6543"),
            ("PG_PASS", "secret"),
        ]);
        assert_eq!(config.mqtt.broker, "broker.local");
        assert_eq!(config.database.host, "db.local");
        assert_eq!(config.database.port, 6543);
        assert_eq!(config.database.password, "secret");
        assert_eq!(config.database.user, "mqttuser");
    }

    #[test]
    fn test_invalid_qos() {
        let mut config = Config::default();
        config.mqtt.qos = 3;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_zero_max_packet_size() {
        let mut config = Config::default();
        config.mqtt.max_packet_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { field, .. }) if field == "mqtt.max_packet_size"
        ));
    }

    #[test]
    fn test_empty_topic() {
        let mut config = Config::default();
        config.mqtt.topic = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));
    }

    #[test]
    fn test_pkcs12_requires_password() {
        let mut config = Config::default();
        config.tls.pkcs12_path = Some(PathBuf::from("/app/certs/client.p12"));
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(field)) if field == "tls.pkcs12_password"
        ));
    }

    #[test]
    fn test_zero_connect_attempts() {
        let mut config = Config::default();
        config.database.connect_attempts = 0;
        assert!(config.validate().is_err());
    }
}
