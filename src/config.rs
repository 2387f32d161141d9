//! Configuration for the MQTT/SQL bridge process

use crate::error::{BridgeError, BridgeResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Unified configuration for the bridge
///
/// Broker, database and worker settings live in a single TOML file. Routing
/// and publishing rules are not part of it: those come from the
/// configuration store selected in `[config_store]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub mqtt: MqttConfig,

    pub database: DatabaseConfig,

    #[serde(default)]
    pub receiver: ReceiverConfig,

    #[serde(default)]
    pub publisher: PublisherConfig,

    #[serde(default)]
    pub config_store: ConfigStoreConfig,

    #[serde(default)]
    pub audit: AuditConfig,
}

impl BridgeConfig {
    /// Load configuration from TOML file
    ///
    /// The config file path must be specified via BRIDGE_CONFIG_PATH environment variable.
    /// Environment variables can override secrets (username, password) and connection URLs.
    ///
    /// # Example
    ///
    /// ```toml
    /// [mqtt]
    /// broker_host = "mosquitto"
    /// client_id = "mqtt-bridge"
    ///
    /// [database]
    /// connection_string = "host=postgres user=bridge dbname=telemetry"
    ///
    /// [publisher]
    /// scheduling = "Parallel"
    /// ```
    pub fn load() -> BridgeResult<Self> {
        let config_path = env::var("BRIDGE_CONFIG_PATH").map_err(|_| {
            BridgeError::config(
                "BRIDGE_CONFIG_PATH environment variable must be set to the path of the TOML configuration file",
            )
        })?;

        let mut config = Self::from_file(&config_path)?;

        // Apply environment variable overrides for secrets and connection details
        config.apply_env_overrides();

        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> BridgeResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::config(format!("Failed to read config file {}: {}", path, e))
        })?;

        Self::from_toml(&content)
            .map_err(|e| BridgeError::config(format!("Failed to parse config file {}: {}", path, e)))
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply environment variable overrides for secrets and connection details
    ///
    /// Only overrides data that shouldn't be in config files:
    /// - Credentials (username, password, database URL)
    /// - Broker endpoint and client id (for different deployments)
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = env::var("MQTT_BROKER_HOST") {
            self.mqtt.broker_host = host;
        }

        if let Ok(port) = env::var("MQTT_BROKER_PORT") {
            if let Ok(p) = port.parse() {
                self.mqtt.broker_port = p;
            }
        }

        if let Ok(client_id) = env::var("MQTT_CLIENT_ID") {
            self.mqtt.client_id = client_id;
        }

        // Override credentials (secrets should not be in config files)
        if let Ok(username) = env::var("MQTT_USERNAME") {
            self.mqtt.username = Some(username);
        }

        if let Ok(password) = env::var("MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }

        if let Ok(url) = env::var("DATABASE_URL") {
            self.database.connection_string = url;
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> BridgeResult<()> {
        self.mqtt.validate()?;
        self.database.validate()?;
        self.publisher.validate()?;
        self.config_store.validate()?;

        if !self.receiver.enabled && !self.publisher.enabled {
            return Err(BridgeError::config(
                "At least one of receiver or publisher must be enabled",
            ));
        }

        Ok(())
    }
}

/// MQTT broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// MQTT broker host
    pub broker_host: String,

    /// MQTT broker port
    #[serde(default = "default_port")]
    pub broker_port: u16,

    /// Base client ID; each worker appends its role and the process id
    pub client_id: String,

    /// Username for authentication (optional)
    pub username: Option<String>,

    /// Password for authentication (optional)
    pub password: Option<String>,

    /// Keep alive interval in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Delay before the event loop reconnects after a connection error
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,

    /// Maximum message size in bytes
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,

    /// Clean session on connect
    #[serde(default = "default_true")]
    pub clean_session: bool,

    /// Enable TCP_NODELAY for reduced latency (disables Nagle's algorithm)
    #[serde(default = "default_true")]
    pub tcp_nodelay: bool,

    /// Capacity of the client request queue
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,

    /// Capacity of the channel between the event loop and the dispatcher
    #[serde(default = "default_inbound_capacity")]
    pub inbound_capacity: usize,
}

fn default_port() -> u16 {
    1883
}

fn default_keep_alive() -> u64 {
    60
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_reconnect_delay() -> u64 {
    5
}

fn default_max_packet_size() -> usize {
    10 * 1024 * 1024 // 10MB
}

fn default_true() -> bool {
    true
}

fn default_request_capacity() -> usize {
    100
}

fn default_inbound_capacity() -> usize {
    1000
}

impl MqttConfig {
    /// Validate the configuration
    pub fn validate(&self) -> BridgeResult<()> {
        if self.broker_host.is_empty() {
            return Err(BridgeError::config("broker_host cannot be empty"));
        }

        if self.client_id.is_empty() {
            return Err(BridgeError::config("client_id cannot be empty"));
        }

        if self.inbound_capacity == 0 || self.request_capacity == 0 {
            return Err(BridgeError::config("MQTT channel capacities must be non-zero"));
        }

        Ok(())
    }

    /// Client id for one worker role, unique per process
    pub fn client_id_for(&self, role: &str) -> String {
        format!("{}-{}-{}", self.client_id, role, std::process::id())
    }

    /// Get MQTT connection options for a given client id
    pub fn mqtt_options(&self, client_id: &str) -> rumqttc::MqttOptions {
        let mut options =
            rumqttc::MqttOptions::new(client_id, &self.broker_host, self.broker_port);

        options.set_keep_alive(Duration::from_secs(self.keep_alive_secs));
        options.set_clean_session(self.clean_session);
        options.set_max_packet_size(self.max_packet_size, self.max_packet_size);

        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            options.set_credentials(username, password);
        }

        options
    }

    /// Get network options for the MQTT connection
    pub fn network_options(&self) -> rumqttc::NetworkOptions {
        let mut options = rumqttc::NetworkOptions::new();
        options.set_tcp_nodelay(self.tcp_nodelay);
        options.set_connection_timeout(self.connection_timeout_secs);
        options
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs.max(1))
    }
}

/// Relational database settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// libpq-style connection string or postgres:// URL
    pub connection_string: String,

    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,

    /// Per-statement timeout in seconds
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,
}

fn default_max_pool_size() -> usize {
    16
}

fn default_query_timeout() -> u64 {
    30
}

impl DatabaseConfig {
    pub fn validate(&self) -> BridgeResult<()> {
        if self.connection_string.trim().is_empty() {
            return Err(BridgeError::config("database connection_string cannot be empty"));
        }
        if self.max_pool_size == 0 {
            return Err(BridgeError::config("max_pool_size must be greater than zero"));
        }
        Ok(())
    }
}

fn default_reload_interval() -> u64 {
    30
}

fn default_shutdown_grace() -> u64 {
    5
}

/// Inbound worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Interval of the enabled-config count check
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,

    /// Time to let the in-flight message finish before a reload proceeds
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reload_interval_secs: default_reload_interval(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl ReceiverConfig {
    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_secs.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// How source poll loops are scheduled
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum SchedulingMode {
    /// One task per source, each on its own interval
    #[default]
    Parallel,
    /// One loop visiting every source per cycle
    Sequential,
}

/// Outbound worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub scheduling: SchedulingMode,

    /// Publish attempts per row within one tick
    #[serde(default = "default_publish_attempts")]
    pub publish_attempts: u32,

    /// Base delay of the exponential backoff between attempts
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Bound on a single publish attempt
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_secs: u64,

    /// Failed ticks after which a row is no longer polled
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,

    /// Time in-flight polls get to finish before a reload proceeds
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_publish_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_publish_timeout() -> u64 {
    10
}

fn default_max_retry_attempts() -> u32 {
    3
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scheduling: SchedulingMode::default(),
            publish_attempts: default_publish_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            publish_timeout_secs: default_publish_timeout(),
            max_retry_attempts: default_max_retry_attempts(),
            reload_interval_secs: default_reload_interval(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl PublisherConfig {
    pub fn validate(&self) -> BridgeResult<()> {
        if self.publish_attempts == 0 {
            return Err(BridgeError::config("publish_attempts must be at least 1"));
        }
        if self.max_retry_attempts == 0 {
            return Err(BridgeError::config("max_retry_attempts must be at least 1"));
        }
        Ok(())
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs.max(1))
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_secs.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Where routing and publishing rules are read from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ConfigStoreKind {
    /// `receiver_config` / `source_config` tables in the bridge database
    #[default]
    Sql,
    /// A TOML file with `[[routes]]` and `[[sources]]`
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigStoreConfig {
    #[serde(default)]
    pub kind: ConfigStoreKind,

    /// Rules file, required for the `File` store
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Schema holding the configuration, tracking and audit tables
    #[serde(default = "default_bridge_schema")]
    pub schema: String,
}

fn default_bridge_schema() -> String {
    "mqtt".to_string()
}

impl Default for ConfigStoreConfig {
    fn default() -> Self {
        Self {
            kind: ConfigStoreKind::default(),
            path: None,
            schema: default_bridge_schema(),
        }
    }
}

impl ConfigStoreConfig {
    pub fn validate(&self) -> BridgeResult<()> {
        crate::storage::identifier(&self.schema)?;
        if self.kind == ConfigStoreKind::File && self.path.is_none() {
            return Err(BridgeError::config(
                "config_store.path is required for the File store",
            ));
        }
        Ok(())
    }
}

/// Destination of routing and publish audit events
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum AuditSinkKind {
    /// Structured log lines only
    #[default]
    Log,
    /// Rows in the `received_messages` / `published_messages` tables
    Storage,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default)]
    pub sink: AuditSinkKind,
}
