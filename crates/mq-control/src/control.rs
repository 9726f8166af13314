//! Administrative facade
//!
//! `ServerControl` is the method-call surface operators use to manage one
//! broker node. It validates and translates arguments, then delegates to
//! the owning component.

use std::collections::BTreeMap;
use std::sync::Arc;

use mq_common::{AddressSettings, BridgeConfig, DivertConfig, RoutingType, SecurityRole};
use tracing::info;

use crate::bridge::BridgeInfo;
use crate::broker::Broker;
use crate::connector_service::ConnectorServiceInfo;
use crate::directory::AddressInfo;
use crate::divert::DivertInfo;
use crate::error::ControlError;
use crate::policy::RoleGrants;
use crate::query::{AddressView, ConnectionView, ConsumerView, Page, QueueView};
use crate::queue::QueueSpec;
use crate::session::SessionRegistry;
use crate::transaction::PreparedTransaction;
use crate::Result;

#[derive(Clone)]
pub struct ServerControl {
    broker: Arc<Broker>,
}

impl ServerControl {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }

    pub fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    pub fn name(&self) -> &str {
        self.broker.name()
    }

    pub fn is_active(&self) -> bool {
        self.broker.is_active()
    }

    // ------------------------------------------------------------------
    // Addresses and queues
    // ------------------------------------------------------------------

    /// Create an address with a comma-separated routing type list. Returns
    /// false when an address already supporting those types exists.
    pub fn create_address(&self, name: &str, routing_types: &str) -> Result<bool> {
        let routing_types =
            RoutingType::parse_set(routing_types).map_err(|e| ControlError::invalid(e.to_string()))?;
        self.broker.directory().create_address(name, routing_types)
    }

    pub fn delete_address(&self, name: &str, force: bool) -> Result<()> {
        self.broker.directory().delete_address(name, force)
    }

    pub fn address_info(&self, name: &str) -> Result<AddressInfo> {
        self.broker
            .directory()
            .address_info(name)
            .ok_or_else(|| ControlError::UnknownAddress(name.to_string()))
    }

    pub fn get_address_names(&self) -> Vec<String> {
        self.broker.directory().get_address_names()
    }

    pub fn create_queue(&self, spec: QueueSpec) -> Result<()> {
        self.broker.directory().create_queue(spec)?;
        Ok(())
    }

    pub fn destroy_queue(&self, name: &str) -> Result<()> {
        self.destroy_queue_with(name, false, false)
    }

    pub fn destroy_queue_removing_consumers(&self, name: &str, remove_consumers: bool) -> Result<()> {
        self.destroy_queue_with(name, remove_consumers, false)
    }

    pub fn destroy_queue_with(&self, name: &str, remove_consumers: bool, auto_delete_address: bool) -> Result<()> {
        self.broker
            .directory()
            .destroy_queue(name, remove_consumers, auto_delete_address)
    }

    /// Queue names, optionally restricted to one routing type. A blank
    /// routing type means all.
    pub fn get_queue_names(&self, routing_type: Option<&str>) -> Result<Vec<String>> {
        let routing_type = match routing_type.map(str::trim).filter(|s| !s.is_empty()) {
            Some(text) => Some(
                text.parse::<RoutingType>()
                    .map_err(|e| ControlError::invalid(e.to_string()))?,
            ),
            None => None,
        };
        Ok(self.broker.directory().get_queue_names(routing_type))
    }

    // ------------------------------------------------------------------
    // Aggregates
    // ------------------------------------------------------------------

    pub fn get_message_count(&self) -> u64 {
        self.broker.directory().total_message_count()
    }

    pub fn get_total_messages_added(&self) -> u64 {
        self.broker.directory().total_messages_added()
    }

    pub fn get_total_messages_acknowledged(&self) -> u64 {
        self.broker.directory().total_messages_acknowledged()
    }

    pub fn get_total_consumer_count(&self) -> u64 {
        self.broker.directory().total_consumer_count()
    }

    pub fn get_connection_count(&self) -> usize {
        self.broker.sessions().connections().len()
    }

    pub fn get_total_connection_count(&self) -> u64 {
        self.broker.sessions().total_connection_count()
    }

    pub fn get_address_memory_usage(&self) -> i64 {
        self.broker.directory().address_memory_usage()
    }

    pub fn get_address_memory_usage_percentage(&self) -> i32 {
        self.broker.directory().address_memory_usage_percentage()
    }

    pub fn get_address_size(&self, address: &str) -> Result<i64> {
        self.broker.directory().address_size(address)
    }

    // ------------------------------------------------------------------
    // Policy
    // ------------------------------------------------------------------

    pub fn add_address_settings(&self, pattern: &str, settings: AddressSettings) -> Result<()> {
        self.broker.policy().add_address_settings(pattern, settings)
    }

    pub fn remove_address_settings(&self, pattern: &str) -> Result<()> {
        self.broker.policy().remove_address_settings(pattern)
    }

    pub fn get_address_settings(&self, address: &str) -> AddressSettings {
        self.broker.policy().resolve_settings(address)
    }

    pub fn get_address_settings_as_json(&self, address: &str) -> Result<String> {
        self.broker.policy().address_settings_as_json(address)
    }

    pub fn add_security_settings(&self, pattern: &str, grants: RoleGrants) -> Result<()> {
        self.broker.policy().add_security_settings(pattern, grants.into_roles())
    }

    pub fn remove_security_settings(&self, pattern: &str) -> Result<()> {
        self.broker.policy().remove_security_settings(pattern)
    }

    pub fn get_roles(&self, address: &str) -> Vec<SecurityRole> {
        self.broker.policy().resolve_roles(address)
    }

    pub fn get_roles_as_json(&self, address: &str) -> Result<String> {
        self.broker.policy().roles_as_json(address)
    }

    // ------------------------------------------------------------------
    // Diverts and bridges
    // ------------------------------------------------------------------

    pub async fn create_divert(&self, config: DivertConfig) -> Result<()> {
        self.broker.diverts().create_divert(config).await
    }

    pub async fn destroy_divert(&self, name: &str) -> Result<()> {
        self.broker.diverts().destroy_divert(name).await
    }

    pub fn get_divert_names(&self) -> Vec<String> {
        self.broker.diverts().divert_names()
    }

    pub fn divert_info(&self, name: &str) -> Result<DivertInfo> {
        self.broker.diverts().divert_info(name)
    }

    pub async fn create_bridge(&self, config: BridgeConfig) -> Result<()> {
        self.broker.bridges().create_bridge(config).await
    }

    pub async fn destroy_bridge(&self, name: &str) -> Result<()> {
        self.broker.bridges().destroy_bridge(name).await
    }

    pub async fn start_bridge(&self, name: &str) -> Result<()> {
        self.broker.bridges().start_bridge(name).await
    }

    pub async fn stop_bridge(&self, name: &str) -> Result<()> {
        self.broker.bridges().stop_bridge(name).await
    }

    pub fn get_bridge_names(&self) -> Vec<String> {
        self.broker.bridges().bridge_names()
    }

    pub fn bridge_info(&self, name: &str) -> Result<BridgeInfo> {
        self.broker.bridges().bridge_info(name)
    }

    pub fn get_connectors_as_json(&self) -> Result<String> {
        self.broker.connectors().connectors_as_json()
    }

    // ------------------------------------------------------------------
    // Listings
    // ------------------------------------------------------------------

    pub fn list_queues(&self, filter: &str, page: i64, page_size: i64) -> Result<Page<QueueView>> {
        self.broker.query().query_queues(filter, page, page_size)
    }

    pub fn list_queues_as_json(&self, filter: &str, page: i64, page_size: i64) -> Result<String> {
        Ok(serde_json::to_string(&self.list_queues(filter, page, page_size)?)?)
    }

    pub fn list_addresses(&self, filter: &str, page: i64, page_size: i64) -> Result<Page<AddressView>> {
        self.broker.query().query_addresses(filter, page, page_size)
    }

    pub fn list_addresses_as_json(&self, filter: &str, page: i64, page_size: i64) -> Result<String> {
        Ok(serde_json::to_string(&self.list_addresses(filter, page, page_size)?)?)
    }

    pub fn list_consumers(&self, filter: &str, page: i64, page_size: i64) -> Result<Page<ConsumerView>> {
        self.broker.query().query_consumers(filter, page, page_size)
    }

    pub fn list_consumers_as_json(&self, filter: &str, page: i64, page_size: i64) -> Result<String> {
        Ok(serde_json::to_string(&self.list_consumers(filter, page, page_size)?)?)
    }

    pub fn list_connections(&self, filter: &str, page: i64, page_size: i64) -> Result<Page<ConnectionView>> {
        self.broker.query().query_connections(filter, page, page_size)
    }

    pub fn list_connections_page_as_json(&self, filter: &str, page: i64, page_size: i64) -> Result<String> {
        Ok(serde_json::to_string(&self.list_connections(filter, page, page_size)?)?)
    }

    pub fn list_connections_as_json(&self) -> Result<String> {
        self.broker.query().list_connections_as_json()
    }

    pub fn list_sessions_as_json(&self, connection_id: &str) -> Result<String> {
        self.broker.query().list_sessions_as_json(connection_id)
    }

    pub fn list_connection_consumers_as_json(&self, connection_id: &str) -> Result<String> {
        self.broker.query().list_consumers_as_json(connection_id)
    }

    pub fn list_all_consumers_as_json(&self) -> Result<String> {
        self.broker.query().list_all_consumers_as_json()
    }

    // ------------------------------------------------------------------
    // Prepared transactions
    // ------------------------------------------------------------------

    pub fn list_prepared_transactions(&self) -> Vec<PreparedTransaction> {
        self.broker.transactions().list_prepared()
    }

    pub fn list_prepared_transaction_details_as_json(&self) -> Result<String> {
        self.broker.transactions().list_prepared_details_as_json()
    }

    pub async fn commit_prepared_transaction(&self, xid: &str) -> Result<bool> {
        self.broker.transactions().commit(xid).await
    }

    pub async fn rollback_prepared_transaction(&self, xid: &str) -> Result<bool> {
        self.broker.transactions().rollback(xid).await
    }

    pub fn list_heuristic_committed_transactions(&self) -> Vec<String> {
        self.broker.transactions().list_heuristic_committed()
    }

    pub fn list_heuristic_rolled_back_transactions(&self) -> Vec<String> {
        self.broker.transactions().list_heuristic_rolled_back()
    }

    // ------------------------------------------------------------------
    // Connector services
    // ------------------------------------------------------------------

    pub async fn create_connector_service(
        &self,
        name: &str,
        factory_name: &str,
        params: BTreeMap<String, String>,
    ) -> Result<()> {
        self.broker
            .connector_services()
            .create_service(name, factory_name, params)
            .await
    }

    pub async fn destroy_connector_service(&self, name: &str) -> Result<()> {
        self.broker.connector_services().destroy_service(name).await
    }

    pub fn get_connector_services(&self) -> Vec<String> {
        self.broker.connector_services().service_names()
    }

    pub fn connector_service_info(&self, name: &str) -> Result<ConnectorServiceInfo> {
        self.broker.connector_services().service_info(name)
    }

    // ------------------------------------------------------------------
    // Message counters
    // ------------------------------------------------------------------

    pub fn is_message_counter_enabled(&self) -> bool {
        self.broker.message_counters().is_enabled()
    }

    pub fn enable_message_counters(&self) {
        self.broker.message_counters().enable();
    }

    pub async fn disable_message_counters(&self) {
        self.broker.message_counters().disable().await;
    }

    pub fn get_message_counter_sample_period(&self) -> i64 {
        self.broker.message_counters().sample_period_ms()
    }

    pub async fn set_message_counter_sample_period(&self, period_ms: i64) -> Result<()> {
        self.broker.message_counters().set_sample_period(period_ms).await
    }

    pub fn get_message_counter_max_day_count(&self) -> i64 {
        self.broker.message_counters().max_day_count()
    }

    pub fn set_message_counter_max_day_count(&self, count: i64) -> Result<()> {
        self.broker.message_counters().set_max_day_count(count)
    }

    pub fn list_message_counter(&self, queue: &str) -> Result<String> {
        self.broker.message_counters().list_message_counter(queue)
    }

    pub fn list_message_counter_history(&self, queue: &str) -> Result<String> {
        self.broker.message_counters().list_message_counter_history(queue)
    }

    pub fn reset_all_message_counters(&self) {
        self.broker.message_counters().reset_all();
    }

    pub fn reset_all_message_counter_histories(&self) {
        self.broker.message_counters().reset_all_histories();
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Migrate this node to a peer and stop it. Returns the number of
    /// messages migrated.
    pub async fn scale_down(&self, target_connector: Option<&str>) -> Result<u64> {
        info!(broker = %self.broker.name(), target_connector = ?target_connector, "Scale-down requested");
        self.broker.scale_down(target_connector).await
    }
}
