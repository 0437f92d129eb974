//! Configuration for the IoT middleware daemon
//!
//! Supports loading configuration from a TOML file, with CLI flags applied
//! as per-field overrides afterward (see [`Config::apply_overrides`]).
//!
//! # Example
//! ```ignore
//! let mut config = Config::load("config.toml")?;
//! config.apply_overrides(&args);
//! let pool_size = config.database.pool.max;
//! ```

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::common::cli::DaemonArgs;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Top-level configuration: broker, database, storage, cache, logging, debug.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub debug: DebugConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply CLI flag overrides on top of file-loaded values, field-by-field.
    pub fn apply_overrides(&mut self, args: &DaemonArgs) {
        if let Some(ref url) = args.mqtt_url {
            self.mqtt.broker_url = url.clone();
        }
        if let Some(ref client_id) = args.mqtt_client_id {
            self.mqtt.options.client_id = client_id.clone();
        }
        if let Some(ref db_url) = args.db_url {
            self.database.connection = db_url.clone();
        }
        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }
        if let Some(port) = args.status_port {
            self.logging.status_port = port;
        }
    }
}

// =============================================================================
// MQTT configuration
// =============================================================================

/// `mqtt.*` — broker endpoint, client options, topic patterns
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    /// Broker URL, e.g. "mqtt://broker.local:1883"
    pub broker_url: String,

    #[serde(default)]
    pub options: MqttOptions,

    #[serde(default)]
    pub topics: MqttTopics,

    /// Prefix for outbound command topics: `<downloadTopicPrefix>/<deviceId>`
    #[serde(default = "default_download_topic_prefix")]
    pub download_topic_prefix: String,
}

fn default_download_topic_prefix() -> String {
    "download".to_string()
}

/// `mqtt.options.*`
#[derive(Debug, Clone, Deserialize)]
pub struct MqttOptions {
    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Keepalive interval in seconds
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// Stable MQTT client id for the Ingress connection. The Command
    /// Service derives its own id from this one and must stay distinct
    /// from it.
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

impl Default for MqttOptions {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            keepalive_secs: default_keepalive_secs(),
            client_id: default_client_id(),
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_keepalive_secs() -> u64 {
    30
}
fn default_client_id() -> String {
    "iot-middleware-ingress".to_string()
}

/// `mqtt.topics.*` — subscription patterns per protocol family
#[derive(Debug, Clone, Deserialize)]
pub struct MqttTopics {
    #[serde(default = "default_v5008_topic")]
    pub v5008: String,
    #[serde(default = "default_v6800_topic")]
    pub v6800: String,
}

impl Default for MqttTopics {
    fn default() -> Self {
        Self {
            v5008: default_v5008_topic(),
            v6800: default_v6800_topic(),
        }
    }
}

fn default_v5008_topic() -> String {
    "V5008Upload/+/+".to_string()
}
fn default_v6800_topic() -> String {
    "V6800Upload/+/+".to_string()
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_url: "mqtt://localhost:1883".to_string(),
            options: MqttOptions::default(),
            topics: MqttTopics::default(),
            download_topic_prefix: default_download_topic_prefix(),
        }
    }
}

// =============================================================================
// Database configuration
// =============================================================================

/// `database.*`
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Client family, informational only (this crate speaks Postgres via sqlx)
    #[serde(default = "default_db_client")]
    pub client: String,

    /// Postgres connection URL
    #[serde(default = "default_db_connection")]
    pub connection: String,

    #[serde(default)]
    pub pool: PoolConfig,
}

fn default_db_client() -> String {
    "postgres".to_string()
}
fn default_db_connection() -> String {
    "postgres://localhost/iot_middleware".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            client: default_db_client(),
            connection: default_db_connection(),
            pool: PoolConfig::default(),
        }
    }
}

/// `database.pool.*`
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_min")]
    pub min: u32,
    #[serde(default = "default_pool_max")]
    pub max: u32,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_millis: u64,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_millis: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: default_pool_min(),
            max: default_pool_max(),
            acquire_timeout_millis: default_acquire_timeout_ms(),
            idle_timeout_millis: default_idle_timeout_ms(),
        }
    }
}

fn default_pool_min() -> u32 {
    2
}
fn default_pool_max() -> u32 {
    10
}
fn default_acquire_timeout_ms() -> u64 {
    30_000
}
fn default_idle_timeout_ms() -> u64 {
    10 * 60 * 1000
}

// =============================================================================
// Storage configuration
// =============================================================================

/// `storage.*`
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Per-table batch size that triggers an eager flush
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Shared flush interval in milliseconds
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Allow-list of SUO message types to route; empty means "allow all"
    #[serde(default)]
    pub filters: Vec<String>,

    /// Cap on rows retained per table while a flush is failing
    #[serde(default = "default_max_buffered_per_table")]
    pub max_buffered_per_table: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            filters: Vec::new(),
            max_buffered_per_table: default_max_buffered_per_table(),
        }
    }
}

fn default_batch_size() -> usize {
    100
}
fn default_flush_interval_ms() -> u64 {
    1_000
}
fn default_max_buffered_per_table() -> usize {
    10_000
}

// =============================================================================
// Cache configuration
// =============================================================================

/// `cache.*`
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Seconds of heartbeat silence before a device is flipped offline
    #[serde(default = "default_offline_threshold_secs")]
    pub offline_threshold_secs: u64,

    /// Watchdog scan interval in seconds
    #[serde(default = "default_watchdog_interval_secs")]
    pub watchdog_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            offline_threshold_secs: default_offline_threshold_secs(),
            watchdog_interval_secs: default_watchdog_interval_secs(),
        }
    }
}

fn default_offline_threshold_secs() -> u64 {
    60
}
fn default_watchdog_interval_secs() -> u64 {
    10
}

// =============================================================================
// Logging configuration
// =============================================================================

/// `logging.*`
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive, e.g. "info"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for rolling log files; only used when `file` is true
    #[serde(default = "default_log_dir")]
    pub dir: String,

    #[serde(default = "default_true")]
    pub console: bool,

    #[serde(default)]
    pub file: bool,

    /// Max size per log file in MB before rolling (best-effort)
    #[serde(default = "default_max_size_mb")]
    pub max_size: u64,

    /// Max number of rotated log files to retain
    #[serde(default = "default_max_files")]
    pub max_files: u32,

    /// Bind port for the ambient status/health HTTP surface
    #[serde(default = "default_status_port")]
    pub status_port: u16,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: default_log_dir(),
            console: true,
            file: false,
            max_size: default_max_size_mb(),
            max_files: default_max_files(),
            status_port: default_status_port(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_dir() -> String {
    "./logs".to_string()
}
fn default_true() -> bool {
    true
}
fn default_max_size_mb() -> u64 {
    100
}
fn default_max_files() -> u32 {
    10
}
fn default_status_port() -> u16 {
    8080
}

// =============================================================================
// Debug configuration
// =============================================================================

/// `debug.*`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DebugConfig {
    /// Log the raw bytes/text of every ingested message at trace level
    #[serde(default)]
    pub log_raw_message: bool,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn parse_minimal_config() {
        let toml = r#"
[mqtt]
broker_url = "mqtt://localhost:1883"
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.mqtt.broker_url, "mqtt://localhost:1883");
        assert_eq!(config.mqtt.topics.v5008, "V5008Upload/+/+");
        assert_eq!(config.database.pool.min, 2);
        assert_eq!(config.database.pool.max, 10);
        assert_eq!(config.storage.batch_size, 100);
        assert_eq!(config.cache.offline_threshold_secs, 60);
        assert!(config.storage.filters.is_empty());
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[mqtt]
broker_url = "mqtt://broker:1883"
download_topic_prefix = "download"

[mqtt.options]
connect_timeout_ms = 3000
keepalive_secs = 15
client_id = "ingress-01"

[mqtt.topics]
v5008 = "V5008Upload/+/+"
v6800 = "V6800Upload/+/+"

[database]
connection = "postgres://db/iot"

[database.pool]
min = 4
max = 20
acquire_timeout_millis = 5000

[storage]
batch_size = 200
flush_interval_ms = 500
filters = ["HEARTBEAT", "DEVICE_METADATA"]
max_buffered_per_table = 5000

[cache]
offline_threshold_secs = 120
watchdog_interval_secs = 5

[logging]
level = "debug"
file = true
dir = "/var/log/iot"

[debug]
log_raw_message = true
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.mqtt.options.client_id, "ingress-01");
        assert_eq!(config.database.pool.max, 20);
        assert_eq!(config.storage.filters, vec!["HEARTBEAT", "DEVICE_METADATA"]);
        assert_eq!(config.cache.watchdog_interval_secs, 5);
        assert!(config.logging.file);
        assert!(config.debug.log_raw_message);
    }

    #[test]
    fn cli_overrides_apply_over_file() {
        let toml = r#"
[mqtt]
broker_url = "mqtt://localhost:1883"
"#;
        let mut config = Config::from_toml(toml).unwrap();
        let args = DaemonArgs::try_parse_from([
            "middleworker",
            "--mqtt-url",
            "mqtt://override:1883",
            "--log-level",
            "trace",
        ])
        .unwrap();
        config.apply_overrides(&args);
        assert_eq!(config.mqtt.broker_url, "mqtt://override:1883");
        assert_eq!(config.logging.level, "trace");
        // Fields with no matching flag stay as loaded
        assert_eq!(config.database.connection, default_db_connection());
    }

    #[test]
    fn missing_broker_url_fails_to_parse() {
        let toml = r#"
[database]
connection = "postgres://db/iot"
"#;
        assert!(Config::from_toml(toml).is_err());
    }
}
