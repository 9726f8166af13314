//! Connectors
//!
//! A connector is the producer side of a bridge or scale-down: it knows how
//! to reach another broker node and hand it messages. The trait is the seam
//! where a network transport would plug in; `InVmConnector` reaches a node
//! in the same process.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use mq_common::{Message, RoutingType};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::directory::ResourceDirectory;
use crate::error::ControlError;
use crate::queue::QueueSpec;
use crate::Result;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    #[error("Target unreachable: {0}")]
    Unreachable(String),

    #[error("Target rejected the request: {0}")]
    Rejected(String),

    #[error("Connection closed: {0}")]
    Closed(String),
}

/// Producer-side access to another broker node.
#[async_trait]
pub trait Connector: Send + Sync {
    fn name(&self) -> &str;

    /// Implementation name reported in connector listings
    fn factory_class_name(&self) -> &str;

    fn params(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Establish (or verify) the connection.
    async fn connect(&self) -> std::result::Result<(), ConnectorError>;

    /// Send to an address on the target; `Ok` means the target confirmed it.
    async fn send(&self, address: &str, message: Message) -> std::result::Result<(), ConnectorError>;

    /// Send straight to a named queue on the target.
    async fn send_to_queue(&self, queue: &str, message: Message) -> std::result::Result<(), ConnectorError>;

    /// Create an address on the target; existing compatible addresses are fine.
    async fn create_address(
        &self,
        name: &str,
        routing_types: &BTreeSet<RoutingType>,
    ) -> std::result::Result<(), ConnectorError>;

    /// Create a queue on the target; an existing queue of that name is fine.
    async fn create_queue(&self, spec: &QueueSpec) -> std::result::Result<(), ConnectorError>;
}

/// Connector to a broker node in the same process.
pub struct InVmConnector {
    name: String,
    target: Weak<ResourceDirectory>,
}

impl InVmConnector {
    pub fn new(name: &str, target: &Arc<ResourceDirectory>) -> Self {
        Self {
            name: name.to_string(),
            target: Arc::downgrade(target),
        }
    }

    fn target(&self) -> std::result::Result<Arc<ResourceDirectory>, ConnectorError> {
        let target = self
            .target
            .upgrade()
            .ok_or_else(|| ConnectorError::Unreachable(self.name.clone()))?;
        if !target.is_active() {
            return Err(ConnectorError::Closed(self.name.clone()));
        }
        Ok(target)
    }
}

fn rejected(e: ControlError) -> ConnectorError {
    match e {
        ControlError::ShuttingDown => ConnectorError::Closed(e.to_string()),
        other => ConnectorError::Rejected(other.to_string()),
    }
}

#[async_trait]
impl Connector for InVmConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn factory_class_name(&self) -> &str {
        "in-vm"
    }

    async fn connect(&self) -> std::result::Result<(), ConnectorError> {
        self.target().map(|_| ())
    }

    async fn send(&self, address: &str, message: Message) -> std::result::Result<(), ConnectorError> {
        let target = self.target()?;
        target.route(address, message).await.map(|_| ()).map_err(rejected)
    }

    async fn send_to_queue(&self, queue: &str, message: Message) -> std::result::Result<(), ConnectorError> {
        let target = self.target()?;
        // A duplicate means the target already holds the message.
        target.deliver_to_queue(queue, message).map(|_| ()).map_err(rejected)
    }

    async fn create_address(
        &self,
        name: &str,
        routing_types: &BTreeSet<RoutingType>,
    ) -> std::result::Result<(), ConnectorError> {
        let target = self.target()?;
        target
            .create_address(name, routing_types.clone())
            .map(|_| ())
            .map_err(rejected)
    }

    async fn create_queue(&self, spec: &QueueSpec) -> std::result::Result<(), ConnectorError> {
        let target = self.target()?;
        match target.create_queue(spec.clone()) {
            Ok(_) | Err(ControlError::DuplicateName { .. }) => Ok(()),
            Err(e) => Err(rejected(e)),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectorView {
    name: String,
    factory_class_name: String,
    params: BTreeMap<String, String>,
}

/// Named connectors available to bridges and scale-down.
#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: DashMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connector, replacing any previous one of the same name.
    pub fn register(&self, connector: Arc<dyn Connector>) {
        let name = connector.name().to_string();
        info!(connector = %name, factory = %connector.factory_class_name(), "Connector registered");
        self.connectors.insert(name, connector);
    }

    pub fn unregister(&self, name: &str) -> Result<()> {
        self.connectors
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ControlError::UnknownConnector(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Connector>> {
        self.connectors
            .get(name)
            .map(|c| c.value().clone())
            .ok_or_else(|| ControlError::UnknownConnector(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connectors.iter().map(|c| c.key().clone()).collect();
        names.sort();
        names
    }

    pub fn connectors_as_json(&self) -> Result<String> {
        let views: Vec<ConnectorView> = self
            .names()
            .into_iter()
            .filter_map(|name| self.connectors.get(&name).map(|c| c.value().clone()))
            .map(|c| ConnectorView {
                name: c.name().to_string(),
                factory_class_name: c.factory_class_name().to_string(),
                params: c.params(),
            })
            .collect();
        Ok(serde_json::to_string(&views)?)
    }
}
