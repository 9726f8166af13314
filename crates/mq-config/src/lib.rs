//! Broker Configuration System
//!
//! TOML-based configuration with environment variable override support.
//! Describes the node itself plus the resources applied at startup:
//! addresses, queues, address settings, security roles, diverts, bridges.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use mq_common::{AddressSettings, BridgeConfig, DivertConfig, RoutingType, SecurityRole, WildcardConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub addresses: Vec<AddressConfig>,
    pub queues: Vec<QueueConfig>,
    /// Keyed by wildcard address pattern
    pub address_settings: BTreeMap<String, AddressSettings>,
    /// Keyed by wildcard address pattern
    pub security_settings: BTreeMap<String, Vec<SecurityRole>>,
    pub diverts: Vec<DivertConfig>,
    pub bridges: Vec<BridgeConfig>,
    pub scale_down: ScaleDownConfig,
}

/// Node-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub name: String,
    pub wildcard: WildcardConfig,
    /// Upper bound for address memory usage; -1 disables the limit
    pub global_max_size: i64,
    /// Duplicate ids remembered per address
    pub id_cache_size: usize,
    pub message_counter_enabled: bool,
    pub message_counter_sample_period_ms: u64,
    pub message_counter_max_day_count: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            name: "mq-broker".to_string(),
            wildcard: WildcardConfig::default(),
            global_max_size: -1,
            id_cache_size: 20_000,
            message_counter_enabled: false,
            message_counter_sample_period_ms: 10_000,
            message_counter_max_day_count: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressConfig {
    pub name: String,
    /// Comma-separated, e.g. "ANYCAST,MULTICAST"
    #[serde(default = "default_routing_types")]
    pub routing_types: String,
}

fn default_routing_types() -> String {
    "MULTICAST".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    pub address: String,
    #[serde(default = "default_queue_routing_type")]
    pub routing_type: String,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default = "default_true")]
    pub durable: bool,
    #[serde(default = "default_max_consumers")]
    pub max_consumers: i32,
    #[serde(default)]
    pub purge_on_no_consumers: bool,
}

fn default_queue_routing_type() -> String {
    "ANYCAST".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_consumers() -> i32 {
    -1
}

/// Peers considered when scale-down is invoked without an explicit target
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleDownConfig {
    pub connectors: Vec<String>,
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    /// Structural checks that do not need a running node.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.message_counter_sample_period_ms == 0 {
            return Err(ConfigError::ValidationError(
                "broker.message_counter_sample_period_ms must be positive".to_string(),
            ));
        }
        if self.broker.message_counter_max_day_count == 0 {
            return Err(ConfigError::ValidationError(
                "broker.message_counter_max_day_count must be positive".to_string(),
            ));
        }
        if self.broker.id_cache_size == 0 {
            return Err(ConfigError::ValidationError(
                "broker.id_cache_size must be positive".to_string(),
            ));
        }

        for address in &self.addresses {
            RoutingType::parse_set(&address.routing_types)
                .map_err(|e| ConfigError::ValidationError(format!("address {}: {}", address.name, e)))?;
        }

        let mut queue_names = HashSet::new();
        for queue in &self.queues {
            if queue.name.is_empty() || queue.address.is_empty() {
                return Err(ConfigError::ValidationError(
                    "queues need both a name and an address".to_string(),
                ));
            }
            if !queue_names.insert(queue.name.as_str()) {
                return Err(ConfigError::ValidationError(format!("duplicate queue: {}", queue.name)));
            }
            queue
                .routing_type
                .parse::<RoutingType>()
                .map_err(|e| ConfigError::ValidationError(format!("queue {}: {}", queue.name, e)))?;
        }

        let mut divert_names = HashSet::new();
        for divert in &self.diverts {
            if !divert_names.insert(divert.name.as_str()) {
                return Err(ConfigError::ValidationError(format!("duplicate divert: {}", divert.name)));
            }
        }

        let mut bridge_names = HashSet::new();
        for bridge in &self.bridges {
            if !bridge_names.insert(bridge.name.as_str()) {
                return Err(ConfigError::ValidationError(format!("duplicate bridge: {}", bridge.name)));
            }
            if bridge.static_connectors.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "bridge {} needs at least one connector",
                    bridge.name
                )));
            }
        }

        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r##"# Broker Configuration
# Environment variables (MQ_*) override these settings

[broker]
name = "mq-broker"
global_max_size = -1
id_cache_size = 20000
message_counter_enabled = true
message_counter_sample_period_ms = 10000
message_counter_max_day_count = 10

[broker.wildcard]
delimiter = "."
singleWord = "*"
anyWords = "#"

[[addresses]]
name = "orders"
routing_types = "ANYCAST,MULTICAST"

[[queues]]
name = "orders.priority"
address = "orders"
routing_type = "ANYCAST"
filter = "priority = 'high'"
durable = true
max_consumers = -1

[address_settings."orders.#"]
DLA = "DLQ"
expiryAddress = "ExpiryQueue"
maxDeliveryAttempts = 5
maxSizeBytes = 104857600
pageSizeBytes = 10485760
redeliveryDelay = 1000
redeliveryMultiplier = 2.0
maxRedeliveryDelay = 10000
addressFullMessagePolicy = "PAGE"

[[security_settings."orders.#"]]
name = "producer"
send = true
createAddress = true

[[security_settings."orders.#"]]
name = "consumer"
consume = true
browse = true

[[diverts]]
name = "orders-audit"
address = "orders"
forwardingAddress = "audit"
exclusive = false

[scale_down]
connectors = []
"##
        .to_string()
    }
}
