use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod logging;

/// Property carrying the idempotency key checked by duplicate detection.
pub const DUPLICATE_ID_PROPERTY: &str = "_MQ_DUPL_ID";
/// Property set on diverted and bridged messages with the address they left.
pub const ORIGINAL_ADDRESS_PROPERTY: &str = "_MQ_ORIG_ADDRESS";
/// Property set on bridged and migrated messages with the queue they left.
pub const ORIGINAL_QUEUE_PROPERTY: &str = "_MQ_ORIG_QUEUE";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid routing type: {0}")]
    RoutingType(String),

    #[error("Invalid policy value for {field}: {value}")]
    Policy { field: &'static str, value: String },
}

// ============================================================================
// Routing
// ============================================================================

/// Delivery semantics of an address or queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoutingType {
    /// Point-to-point: each message goes to exactly one bound queue.
    Anycast,
    /// Fan-out: each message goes to every bound queue.
    Multicast,
}

impl RoutingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingType::Anycast => "ANYCAST",
            RoutingType::Multicast => "MULTICAST",
        }
    }

    /// Parse a comma-separated list such as `"ANYCAST,MULTICAST"`.
    pub fn parse_set(value: &str) -> Result<BTreeSet<RoutingType>, ParseError> {
        value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(RoutingType::from_str)
            .collect()
    }

    pub fn format_set(types: &BTreeSet<RoutingType>) -> String {
        types.iter().map(RoutingType::as_str).collect::<Vec<_>>().join(",")
    }
}

impl fmt::Display for RoutingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoutingType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ANYCAST" => Ok(RoutingType::Anycast),
            "MULTICAST" => Ok(RoutingType::Multicast),
            _ => Err(ParseError::RoutingType(s.to_string())),
        }
    }
}

/// Characters used to split and match hierarchical address names.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct WildcardConfig {
    pub delimiter: char,
    pub single_word: char,
    pub any_words: char,
}

impl Default for WildcardConfig {
    fn default() -> Self {
        Self {
            delimiter: '.',
            single_word: '*',
            any_words: '#',
        }
    }
}

// ============================================================================
// Core Message Type
// ============================================================================

/// A message as seen by the control plane.
///
/// Bodies are opaque; properties are string-valued and are what selectors,
/// duplicate detection and forwarding metadata operate on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    /// Address the message was last routed to
    #[serde(default)]
    pub address: Option<String>,
    /// Restricts delivery to queues of one routing type when set
    #[serde(default)]
    pub routing_type: Option<RoutingType>,
    pub durable: bool,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            address: None,
            routing_type: None,
            durable: true,
            properties: BTreeMap::new(),
            body: body.into(),
            created_at: Utc::now(),
        }
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_routing_type(mut self, routing_type: RoutingType) -> Self {
        self.routing_type = Some(routing_type);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_duplicate_id(self, id: impl Into<String>) -> Self {
        self.with_property(DUPLICATE_ID_PROPERTY, id)
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn duplicate_id(&self) -> Option<&str> {
        self.property(DUPLICATE_ID_PROPERTY)
    }

    /// Rough in-memory footprint used for address memory accounting.
    pub fn encode_size(&self) -> usize {
        const HEADER_OVERHEAD: usize = 64;
        let props: usize = self.properties.iter().map(|(k, v)| k.len() + v.len()).sum();
        HEADER_OVERHEAD + self.id.len() + self.body.len() + props
    }
}

// ============================================================================
// Policy Records
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AddressFullPolicy {
    #[default]
    Page,
    Drop,
    Block,
    Fail,
}

impl FromStr for AddressFullPolicy {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PAGE" => Ok(AddressFullPolicy::Page),
            "DROP" => Ok(AddressFullPolicy::Drop),
            "BLOCK" => Ok(AddressFullPolicy::Block),
            "FAIL" => Ok(AddressFullPolicy::Fail),
            _ => Err(ParseError::Policy { field: "addressFullMessagePolicy", value: s.to_string() }),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlowConsumerPolicy {
    #[default]
    Notify,
    Kill,
}

impl FromStr for SlowConsumerPolicy {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NOTIFY" => Ok(SlowConsumerPolicy::Notify),
            "KILL" => Ok(SlowConsumerPolicy::Kill),
            _ => Err(ParseError::Policy { field: "slowConsumerPolicy", value: s.to_string() }),
        }
    }
}

/// Per-address configuration resolved through the policy repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AddressSettings {
    #[serde(rename = "DLA")]
    pub dead_letter_address: Option<String>,
    pub expiry_address: Option<String>,
    /// Milliseconds; -1 keeps the message's own expiry
    pub expiry_delay: i64,
    pub last_value_queue: bool,
    pub max_delivery_attempts: i32,
    /// -1 means unlimited
    pub max_size_bytes: i64,
    pub page_size_bytes: i64,
    pub page_max_cache_size: i32,
    pub redelivery_delay: i64,
    pub redelivery_multiplier: f64,
    pub max_redelivery_delay: i64,
    pub redistribution_delay: i64,
    pub send_to_dla_on_no_route: bool,
    pub address_full_message_policy: AddressFullPolicy,
    pub slow_consumer_threshold: i64,
    pub slow_consumer_check_period: i64,
    pub slow_consumer_policy: SlowConsumerPolicy,
    pub auto_create_queues: bool,
    pub auto_delete_queues: bool,
    pub auto_create_addresses: bool,
    pub auto_delete_addresses: bool,
}

impl Default for AddressSettings {
    fn default() -> Self {
        Self {
            dead_letter_address: None,
            expiry_address: None,
            expiry_delay: -1,
            last_value_queue: false,
            max_delivery_attempts: 10,
            max_size_bytes: -1,
            page_size_bytes: 10 * 1024 * 1024,
            page_max_cache_size: 5,
            redelivery_delay: 0,
            redelivery_multiplier: 1.0,
            max_redelivery_delay: 0,
            redistribution_delay: -1,
            send_to_dla_on_no_route: false,
            address_full_message_policy: AddressFullPolicy::Page,
            slow_consumer_threshold: -1,
            slow_consumer_check_period: 5,
            slow_consumer_policy: SlowConsumerPolicy::Notify,
            auto_create_queues: true,
            auto_delete_queues: true,
            auto_create_addresses: true,
            auto_delete_addresses: true,
        }
    }
}

/// A named role and the operations it is allowed to perform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SecurityRole {
    pub name: String,
    pub send: bool,
    pub consume: bool,
    pub create_durable_queue: bool,
    pub delete_durable_queue: bool,
    pub create_non_durable_queue: bool,
    pub delete_non_durable_queue: bool,
    pub manage: bool,
    pub browse: bool,
    pub create_address: bool,
    pub delete_address: bool,
}

impl SecurityRole {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    /// A role granted every permission.
    pub fn all(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            send: true,
            consume: true,
            create_durable_queue: true,
            delete_durable_queue: true,
            create_non_durable_queue: true,
            delete_non_durable_queue: true,
            manage: true,
            browse: true,
            create_address: true,
            delete_address: true,
        }
    }
}

// ============================================================================
// Forwarder Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DivertConfig {
    pub name: String,
    #[serde(default)]
    pub routing_name: Option<String>,
    pub address: String,
    pub forwarding_address: String,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub filter: Option<String>,
    /// Name of a registered transformer
    #[serde(default)]
    pub transformer: Option<String>,
}

impl DivertConfig {
    pub fn new(name: &str, address: &str, forwarding_address: &str) -> Self {
        Self {
            name: name.to_string(),
            routing_name: None,
            address: address.to_string(),
            forwarding_address: forwarding_address.to_string(),
            exclusive: false,
            filter: None,
            transformer: None,
        }
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeConfig {
    pub name: String,
    pub queue_name: String,
    pub forwarding_address: Option<String>,
    pub filter: Option<String>,
    pub transformer: Option<String>,
    pub retry_interval_ms: u64,
    pub retry_interval_multiplier: f64,
    pub max_retry_interval_ms: u64,
    /// Connect attempts before giving up, including the first. -1 means
    /// retry forever
    pub initial_connect_attempts: i32,
    /// -1 means retry forever
    pub reconnect_attempts: i32,
    pub use_duplicate_detection: bool,
    /// Maximum messages taken from the source queue and not yet confirmed
    pub confirmation_window_size: i32,
    /// -1 means no additional producer-side cap
    pub producer_window_size: i32,
    pub static_connectors: Vec<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            queue_name: String::new(),
            forwarding_address: None,
            filter: None,
            transformer: None,
            retry_interval_ms: 2000,
            retry_interval_multiplier: 1.0,
            max_retry_interval_ms: 2000,
            initial_connect_attempts: -1,
            reconnect_attempts: -1,
            use_duplicate_detection: true,
            confirmation_window_size: 1024,
            producer_window_size: -1,
            static_connectors: Vec::new(),
        }
    }
}

impl BridgeConfig {
    pub fn new(name: &str, queue_name: &str, connector: &str) -> Self {
        Self {
            name: name.to_string(),
            queue_name: queue_name.to_string(),
            static_connectors: vec![connector.to_string()],
            ..Default::default()
        }
    }

    /// Effective in-flight cap: the smaller of the positive window sizes.
    pub fn in_flight_window(&self) -> usize {
        let windows = [self.confirmation_window_size, self.producer_window_size];
        windows
            .iter()
            .filter(|w| **w > 0)
            .min()
            .map(|w| *w as usize)
            .unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_type_set_parsing() {
        let set = RoutingType::parse_set("anycast, MULTICAST").unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(RoutingType::format_set(&set), "ANYCAST,MULTICAST");
        assert!(RoutingType::parse_set("BROADCAST").is_err());
        assert!(RoutingType::parse_set("").unwrap().is_empty());
    }

    #[test]
    fn test_message_properties() {
        let msg = Message::new("hello")
            .with_property("color", "green")
            .with_duplicate_id("abc");
        assert_eq!(msg.property("color"), Some("green"));
        assert_eq!(msg.duplicate_id(), Some("abc"));
        assert!(msg.durable);
        assert!(msg.encode_size() > msg.body.len());
    }

    #[test]
    fn test_address_settings_json_uses_dla_key() {
        let settings = AddressSettings {
            dead_letter_address: Some("DLQ".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_value(&settings).unwrap();
        assert_eq!(json["DLA"], "DLQ");
        assert_eq!(json["maxSizeBytes"], -1);
        assert_eq!(json["addressFullMessagePolicy"], "PAGE");
    }

    #[test]
    fn test_bridge_window() {
        let mut config = BridgeConfig::new("b", "q", "c");
        assert_eq!(config.in_flight_window(), 1024);
        config.producer_window_size = 10;
        assert_eq!(config.in_flight_window(), 10);
        config.confirmation_window_size = -1;
        config.producer_window_size = -1;
        assert_eq!(config.in_flight_window(), 1);
    }
}
