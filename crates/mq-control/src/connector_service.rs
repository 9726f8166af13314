//! Connector services
//!
//! Pluggable long-running integrations created by name from a registered
//! factory and started immediately.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::ControlError;
use crate::Result;

#[async_trait]
pub trait ConnectorService: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    fn is_started(&self) -> bool;
}

pub trait ConnectorServiceFactory: Send + Sync {
    fn create(&self, name: &str, params: &BTreeMap<String, String>) -> Result<Arc<dyn ConnectorService>>;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorServiceInfo {
    pub name: String,
    pub factory_name: String,
    pub params: BTreeMap<String, String>,
    pub started: bool,
}

struct ServiceEntry {
    factory_name: String,
    params: BTreeMap<String, String>,
    service: Arc<dyn ConnectorService>,
}

#[derive(Default)]
pub struct ConnectorServiceRegistry {
    factories: DashMap<String, Arc<dyn ConnectorServiceFactory>>,
    services: DashMap<String, ServiceEntry>,
}

impl ConnectorServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_factory(&self, name: &str, factory: Arc<dyn ConnectorServiceFactory>) {
        self.factories.insert(name.to_string(), factory);
    }

    pub async fn create_service(
        &self,
        name: &str,
        factory_name: &str,
        params: BTreeMap<String, String>,
    ) -> Result<()> {
        if name.is_empty() {
            return Err(ControlError::invalid("connector service name must not be empty"));
        }
        let factory = self
            .factories
            .get(factory_name)
            .map(|f| f.value().clone())
            .ok_or_else(|| ControlError::invalid(format!("unknown connector service factory: {}", factory_name)))?;

        let service = match self.services.entry(name.to_string()) {
            Entry::Occupied(_) => return Err(ControlError::duplicate("Connector service", name)),
            Entry::Vacant(vacant) => {
                let service = factory.create(name, &params)?;
                vacant.insert(ServiceEntry {
                    factory_name: factory_name.to_string(),
                    params,
                    service: service.clone(),
                });
                service
            }
        };

        if let Err(e) = service.start().await {
            self.services.remove(name);
            return Err(e);
        }
        info!(service = %name, factory = %factory_name, "Connector service started");
        Ok(())
    }

    pub async fn destroy_service(&self, name: &str) -> Result<()> {
        let (_, entry) = self
            .services
            .remove(name)
            .ok_or_else(|| ControlError::UnknownConnectorService(name.to_string()))?;
        entry.service.stop().await?;
        info!(service = %name, "Connector service destroyed");
        Ok(())
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|s| s.key().clone()).collect();
        names.sort();
        names
    }

    pub fn service_info(&self, name: &str) -> Result<ConnectorServiceInfo> {
        self.services
            .get(name)
            .map(|entry| ConnectorServiceInfo {
                name: name.to_string(),
                factory_name: entry.factory_name.clone(),
                params: entry.params.clone(),
                started: entry.service.is_started(),
            })
            .ok_or_else(|| ControlError::UnknownConnectorService(name.to_string()))
    }

    pub async fn stop_all(&self) {
        let services: Vec<Arc<dyn ConnectorService>> =
            self.services.iter().map(|s| s.service.clone()).collect();
        for service in services {
            if let Err(e) = service.stop().await {
                warn!(service = %service.name(), error = %e, "Connector service failed to stop");
            }
        }
    }
}
