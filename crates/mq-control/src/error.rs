use thiserror::Error;

use crate::connector::ConnectorError;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("{kind} already exists: {name}")]
    DuplicateName { kind: &'static str, name: String },

    #[error("Address not found: {0}")]
    UnknownAddress(String),

    #[error("Queue not found: {0}")]
    UnknownQueue(String),

    #[error("Divert not found: {0}")]
    UnknownDivert(String),

    #[error("Bridge not found: {0}")]
    UnknownBridge(String),

    #[error("Connector not found: {0}")]
    UnknownConnector(String),

    #[error("Connector service not found: {0}")]
    UnknownConnectorService(String),

    #[error("Address {address} has {queue_count} bound queue(s)")]
    AddressInUse { address: String, queue_count: usize },

    #[error("Queue {queue} has {consumer_count} consumer(s)")]
    QueueInUse { queue: String, consumer_count: usize },

    #[error("Address {address} supports {existing}, requested {requested}")]
    RoutingTypeConflict {
        address: String,
        existing: String,
        requested: String,
    },

    #[error("Queue {queue} already has the maximum of {max} consumer(s)")]
    MaxConsumersReached { queue: String, max: i32 },

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Broker is shutting down")]
    ShuttingDown,

    #[error("Connector error: {0}")]
    Connector(#[from] ConnectorError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ControlError {
    pub(crate) fn duplicate(kind: &'static str, name: &str) -> Self {
        ControlError::DuplicateName {
            kind,
            name: name.to_string(),
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        ControlError::InvalidArgument(message.into())
    }
}
