//! Broker node
//!
//! Owns every control-plane component of one node, plus the thin data-plane
//! surface (connections, sessions, consumers, sends, prepared transactions)
//! needed to drive them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mq_common::{AddressSettings, BridgeConfig, Message, RoutingType, SecurityRole, WildcardConfig};
use mq_config::AppConfig;
use tracing::{info, warn};

use crate::bridge::BridgeManager;
use crate::connector::{Connector, ConnectorRegistry, InVmConnector};
use crate::connector_service::ConnectorServiceRegistry;
use crate::control::ServerControl;
use crate::directory::{ResourceDirectory, RouteOutcome};
use crate::divert::DivertManager;
use crate::error::ControlError;
use crate::message_counter::MessageCounterManager;
use crate::policy::PolicyRepository;
use crate::query::QueryEngine;
use crate::queue::{ConsumerHandle, QueueSpec};
use crate::scale_down;
use crate::session::{ConnectionInfo, InMemorySessionRegistry, SessionInfo};
use crate::transaction::{ResourceManager, TransactionOperation, Xid};
use crate::transformer::TransformerRegistry;
use crate::Result;

/// Node-level settings.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub name: String,
    pub wildcard: WildcardConfig,
    /// Settings of the catch-all `#` pattern
    pub default_settings: AddressSettings,
    /// Roles of the catch-all `#` pattern
    pub default_roles: Vec<SecurityRole>,
    /// -1 means unlimited
    pub global_max_size: i64,
    pub id_cache_size: usize,
    pub message_counter_enabled: bool,
    pub message_counter_sample_period_ms: i64,
    pub message_counter_max_day_count: i64,
    /// Peers tried in order when scale-down names no target
    pub scale_down_connectors: Vec<String>,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            name: "mq-broker".to_string(),
            wildcard: WildcardConfig::default(),
            default_settings: AddressSettings::default(),
            default_roles: vec![SecurityRole::all("guest")],
            global_max_size: -1,
            id_cache_size: 20_000,
            message_counter_enabled: false,
            message_counter_sample_period_ms: 10_000,
            message_counter_max_day_count: 10,
            scale_down_connectors: Vec::new(),
        }
    }
}

impl BrokerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let broker = &config.broker;
        Self {
            name: broker.name.clone(),
            wildcard: broker.wildcard,
            global_max_size: broker.global_max_size,
            id_cache_size: broker.id_cache_size,
            message_counter_enabled: broker.message_counter_enabled,
            message_counter_sample_period_ms: i64::try_from(broker.message_counter_sample_period_ms)
                .unwrap_or(i64::MAX),
            message_counter_max_day_count: i64::from(broker.message_counter_max_day_count),
            scale_down_connectors: config.scale_down.connectors.clone(),
            ..Default::default()
        }
    }
}

pub struct Broker {
    name: String,
    policy: Arc<PolicyRepository>,
    directory: Arc<ResourceDirectory>,
    sessions: Arc<InMemorySessionRegistry>,
    transformers: Arc<TransformerRegistry>,
    connectors: Arc<ConnectorRegistry>,
    diverts: DivertManager,
    bridges: BridgeManager,
    transactions: ResourceManager,
    counters: MessageCounterManager,
    connector_services: ConnectorServiceRegistry,
    query: QueryEngine,
    scale_down_connectors: Vec<String>,
    stopped: AtomicBool,
}

impl Broker {
    /// Build a node. Must be called within a Tokio runtime when message
    /// counters are enabled.
    pub fn new(settings: BrokerSettings) -> Result<Arc<Self>> {
        let policy = Arc::new(PolicyRepository::new(
            settings.wildcard,
            settings.default_settings,
            settings.default_roles,
        ));
        let directory = Arc::new(ResourceDirectory::new(
            policy.clone(),
            settings.id_cache_size,
            settings.global_max_size,
        ));
        let sessions = Arc::new(InMemorySessionRegistry::new());
        let transformers = Arc::new(TransformerRegistry::new());
        let connectors = Arc::new(ConnectorRegistry::new());

        let counters = MessageCounterManager::new(
            directory.clone(),
            settings.message_counter_sample_period_ms,
            settings.message_counter_max_day_count,
        )?;
        if settings.message_counter_enabled {
            counters.enable();
        }

        let broker = Arc::new(Self {
            name: settings.name,
            diverts: DivertManager::new(directory.clone(), transformers.clone()),
            bridges: BridgeManager::new(directory.clone(), connectors.clone(), transformers.clone()),
            transactions: ResourceManager::new(directory.clone()),
            counters,
            connector_services: ConnectorServiceRegistry::new(),
            query: QueryEngine::new(directory.clone(), sessions.clone()),
            scale_down_connectors: settings.scale_down_connectors,
            stopped: AtomicBool::new(false),
            policy,
            directory,
            sessions,
            transformers,
            connectors,
        });
        info!(broker = %broker.name, "Broker started");
        Ok(broker)
    }

    /// Build a node and apply the configured policy, addresses, queues and
    /// diverts. Bridges need connectors, so they are applied separately
    /// with [`Broker::apply_bridges`].
    pub async fn from_config(config: &AppConfig) -> Result<Arc<Self>> {
        let broker = Self::new(BrokerSettings::from_config(config))?;

        for (pattern, settings) in &config.address_settings {
            broker.policy.add_address_settings(pattern, settings.clone())?;
        }
        for (pattern, roles) in &config.security_settings {
            broker.policy.add_security_settings(pattern, roles.clone())?;
        }
        for address in &config.addresses {
            let routing_types = RoutingType::parse_set(&address.routing_types)
                .map_err(|e| ControlError::invalid(e.to_string()))?;
            broker.directory.create_address(&address.name, routing_types)?;
        }
        for queue in &config.queues {
            let routing_type: RoutingType = queue
                .routing_type
                .parse()
                .map_err(|e: mq_common::ParseError| ControlError::invalid(e.to_string()))?;
            let mut spec = QueueSpec::new(&queue.address, &queue.name, routing_type)
                .durable(queue.durable)
                .max_consumers(queue.max_consumers)
                .purge_on_no_consumers(queue.purge_on_no_consumers)
                .auto_create_address(true);
            if let Some(filter) = &queue.filter {
                spec = spec.filter(filter);
            }
            broker.directory.create_queue(spec)?;
        }
        for divert in &config.diverts {
            broker.diverts.create_divert(divert.clone()).await?;
        }

        info!(
            broker = %broker.name,
            addresses = config.addresses.len(),
            queues = config.queues.len(),
            diverts = config.diverts.len(),
            "Configuration applied"
        );
        Ok(broker)
    }

    pub async fn apply_bridges(&self, bridges: &[BridgeConfig]) -> Result<()> {
        for bridge in bridges {
            self.bridges.create_bridge(bridge.clone()).await?;
        }
        Ok(())
    }

    pub fn control(self: &Arc<Self>) -> ServerControl {
        ServerControl::new(self.clone())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_active(&self) -> bool {
        self.directory.is_active()
    }

    pub fn policy(&self) -> &Arc<PolicyRepository> {
        &self.policy
    }

    pub fn directory(&self) -> &Arc<ResourceDirectory> {
        &self.directory
    }

    pub fn sessions(&self) -> &Arc<InMemorySessionRegistry> {
        &self.sessions
    }

    pub fn transformers(&self) -> &Arc<TransformerRegistry> {
        &self.transformers
    }

    pub fn connectors(&self) -> &Arc<ConnectorRegistry> {
        &self.connectors
    }

    pub fn diverts(&self) -> &DivertManager {
        &self.diverts
    }

    pub fn bridges(&self) -> &BridgeManager {
        &self.bridges
    }

    pub fn transactions(&self) -> &ResourceManager {
        &self.transactions
    }

    pub fn message_counters(&self) -> &MessageCounterManager {
        &self.counters
    }

    pub fn connector_services(&self) -> &ConnectorServiceRegistry {
        &self.connector_services
    }

    pub fn query(&self) -> &QueryEngine {
        &self.query
    }

    /// Connector that reaches this node from inside the same process.
    pub fn in_vm_connector(&self, name: &str) -> Arc<dyn Connector> {
        Arc::new(InVmConnector::new(name, &self.directory))
    }

    // ------------------------------------------------------------------
    // Data plane
    // ------------------------------------------------------------------

    pub fn open_connection(&self, remote_address: &str, user: Option<&str>, client_id: Option<&str>) -> ConnectionInfo {
        self.sessions.open_connection(remote_address, user, client_id)
    }

    pub fn create_session(&self, connection_id: &str) -> Result<SessionInfo> {
        self.sessions.create_session(connection_id)
    }

    pub fn create_consumer(
        &self,
        session_id: &str,
        queue: &str,
        filter: Option<&str>,
        browse_only: bool,
    ) -> Result<ConsumerHandle> {
        let session = self.sessions.session_context(session_id)?;
        self.directory.create_consumer(queue, session, filter, browse_only)
    }

    pub async fn send(&self, address: &str, message: Message) -> Result<RouteOutcome> {
        self.directory.route(address, message).await
    }

    pub fn prepare(&self, xid: Xid, operations: Vec<TransactionOperation>) -> Result<()> {
        self.transactions.prepare(xid, operations)
    }

    /// Close a connection, its sessions and their consumers. Returns the
    /// number of consumers closed.
    pub fn close_connection(&self, connection_id: &str) -> usize {
        let closed = self.directory.close_consumers_for_connection(connection_id);
        self.sessions.close_connection(connection_id);
        closed
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Migrate this node to a peer and stop it. Without a target the first
    /// registered connector from the configured scale-down list is used.
    /// Once migration begins the node stops whatever the outcome.
    pub async fn scale_down(&self, target: Option<&str>) -> Result<u64> {
        let connector = match target {
            Some(name) => self.connectors.get(name)?,
            None => self
                .scale_down_connectors
                .iter()
                .find_map(|name| self.connectors.get(name).ok())
                .ok_or_else(|| ControlError::invalid("no scale-down target connector is registered"))?,
        };
        if !self.directory.is_accepting() {
            return Err(ControlError::ShuttingDown);
        }

        info!(broker = %self.name, target_connector = %connector.name(), "Scale-down started");
        self.directory.stop_accepting();
        self.bridges.stop_all().await;
        self.diverts.shutdown().await;
        let closed = self.directory.close_all_consumers();
        if closed > 0 {
            warn!(consumers = closed, "Closed consumers for scale-down");
        }

        let result = scale_down::migrate(&self.directory, connector).await;
        self.stop().await;
        result
    }

    /// Stop forwarders, the counter sampler and connector services, close
    /// every consumer and mark the node inactive.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(broker = %self.name, "Stopping broker");
        self.directory.stop_accepting();
        self.bridges.stop_all().await;
        self.diverts.shutdown().await;
        self.counters.stop().await;
        self.connector_services.stop_all().await;
        self.directory.stop();
        info!(broker = %self.name, "Broker stopped");
    }
}
