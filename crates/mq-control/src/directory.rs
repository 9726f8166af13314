//! Resource Directory
//!
//! Authoritative registry of addresses and queues. Creation and destruction
//! race per name: the map entry is the lock, so exactly one of two
//! concurrent creates (or destroys) of the same name wins.
//!
//! Lock order is addresses before queues; nothing holds a queue-map guard
//! while taking an address-map guard.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mq_common::{Message, RoutingType};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::broker_metrics;
use crate::divert::DivertBinding;
use crate::error::ControlError;
use crate::filter::{self, Filter};
use crate::policy::PolicyRepository;
use crate::queue::{ConsumerHandle, ConsumerState, Queue, QueueSpec, SessionContext};
use crate::Result;

/// Bounded memory of duplicate ids seen on one address.
struct DuplicateIdCache {
    capacity: usize,
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl DuplicateIdCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ids: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns false if the id was already present.
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.ids.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }
}

struct AddressEntry {
    id: u64,
    routing_types: BTreeSet<RoutingType>,
    queues: BTreeSet<String>,
    auto_created: bool,
    created_at: DateTime<Utc>,
    anycast_cursor: AtomicUsize,
    duplicate_ids: Mutex<DuplicateIdCache>,
}

/// Point-in-time view of an address.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressInfo {
    pub id: u64,
    pub name: String,
    pub routing_types: BTreeSet<RoutingType>,
    pub queue_names: Vec<String>,
    pub auto_created: bool,
    pub created_at: DateTime<Utc>,
}

/// What happened to a routed message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteOutcome {
    /// Queues the message was enqueued on
    pub queues: Vec<String>,
    /// Diverts that accepted a copy
    pub diverted: usize,
    /// Dropped by duplicate detection
    pub duplicate: bool,
}

impl RouteOutcome {
    pub fn is_routed(&self) -> bool {
        !self.queues.is_empty() || self.diverted > 0
    }
}

pub struct ResourceDirectory {
    policy: Arc<PolicyRepository>,
    addresses: DashMap<String, AddressEntry>,
    queues: DashMap<String, Arc<Queue>>,
    divert_bindings: DashMap<String, Vec<Arc<DivertBinding>>>,
    id_cache_size: usize,
    global_max_size: i64,
    accepting: AtomicBool,
    active: AtomicBool,
    next_id: AtomicU64,
}

impl ResourceDirectory {
    pub fn new(policy: Arc<PolicyRepository>, id_cache_size: usize, global_max_size: i64) -> Self {
        Self {
            policy,
            addresses: DashMap::new(),
            queues: DashMap::new(),
            divert_bindings: DashMap::new(),
            id_cache_size,
            global_max_size,
            accepting: AtomicBool::new(true),
            active: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn policy(&self) -> &Arc<PolicyRepository> {
        &self.policy
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// False once scale-down or stop has begun.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst) && self.is_active()
    }

    pub(crate) fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.is_accepting() {
            Ok(())
        } else {
            Err(ControlError::ShuttingDown)
        }
    }

    // ------------------------------------------------------------------
    // Addresses
    // ------------------------------------------------------------------

    /// Create an address. Idempotent when the requested routing types are a
    /// subset of the existing ones. Returns true if the address was created.
    pub fn create_address(&self, name: &str, routing_types: BTreeSet<RoutingType>) -> Result<bool> {
        self.create_address_internal(name, routing_types, false)
    }

    fn create_address_internal(
        &self,
        name: &str,
        routing_types: BTreeSet<RoutingType>,
        auto_created: bool,
    ) -> Result<bool> {
        self.ensure_accepting()?;
        if name.is_empty() {
            return Err(ControlError::invalid("address name must not be empty"));
        }
        if routing_types.is_empty() {
            return Err(ControlError::invalid(format!("address {} needs a routing type", name)));
        }

        match self.addresses.entry(name.to_string()) {
            Entry::Occupied(existing) => {
                let existing = existing.get();
                if routing_types.is_subset(&existing.routing_types) {
                    Ok(false)
                } else {
                    Err(ControlError::RoutingTypeConflict {
                        address: name.to_string(),
                        existing: RoutingType::format_set(&existing.routing_types),
                        requested: RoutingType::format_set(&routing_types),
                    })
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(self.new_address_entry(routing_types.clone(), auto_created));
                info!(
                    address = %name,
                    routing_types = %RoutingType::format_set(&routing_types),
                    auto_created,
                    "Address created"
                );
                Ok(true)
            }
        }
    }

    fn new_address_entry(&self, routing_types: BTreeSet<RoutingType>, auto_created: bool) -> AddressEntry {
        AddressEntry {
            id: self.next_id(),
            routing_types,
            queues: BTreeSet::new(),
            auto_created,
            created_at: Utc::now(),
            anycast_cursor: AtomicUsize::new(0),
            duplicate_ids: Mutex::new(DuplicateIdCache::new(self.id_cache_size)),
        }
    }

    /// Delete an address. With `force`, bound queues are destroyed first;
    /// the cascade is not rolled back if a later queue fails.
    pub fn delete_address(&self, name: &str, force: bool) -> Result<()> {
        let queue_names: Vec<String> = match self.addresses.get(name) {
            Some(entry) => entry.queues.iter().cloned().collect(),
            None => return Err(ControlError::UnknownAddress(name.to_string())),
        };

        if !queue_names.is_empty() {
            if !force {
                return Err(ControlError::AddressInUse {
                    address: name.to_string(),
                    queue_count: queue_names.len(),
                });
            }
            for queue in &queue_names {
                match self.destroy_queue(queue, true, false) {
                    Ok(()) | Err(ControlError::UnknownQueue(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        match self.addresses.remove_if(name, |_, entry| entry.queues.is_empty()) {
            Some(_) => {
                self.policy.forget_address(name);
                info!(address = %name, force, "Address deleted");
                Ok(())
            }
            None => match self.addresses.get(name) {
                Some(entry) => Err(ControlError::AddressInUse {
                    address: name.to_string(),
                    queue_count: entry.queues.len(),
                }),
                None => Err(ControlError::UnknownAddress(name.to_string())),
            },
        }
    }

    pub fn address_info(&self, name: &str) -> Option<AddressInfo> {
        self.addresses.get(name).map(|entry| AddressInfo {
            id: entry.id,
            name: name.to_string(),
            routing_types: entry.routing_types.clone(),
            queue_names: entry.queues.iter().cloned().collect(),
            auto_created: entry.auto_created,
            created_at: entry.created_at,
        })
    }

    /// Snapshot of every address, ordered by name.
    pub fn addresses(&self) -> Vec<AddressInfo> {
        let mut addresses: Vec<AddressInfo> = self
            .addresses
            .iter()
            .map(|entry| AddressInfo {
                id: entry.id,
                name: entry.key().clone(),
                routing_types: entry.routing_types.clone(),
                queue_names: entry.queues.iter().cloned().collect(),
                auto_created: entry.auto_created,
                created_at: entry.created_at,
            })
            .collect();
        addresses.sort_by(|a, b| a.name.cmp(&b.name));
        addresses
    }

    pub fn get_address_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.addresses.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    // ------------------------------------------------------------------
    // Queues
    // ------------------------------------------------------------------

    pub fn create_queue(&self, spec: QueueSpec) -> Result<Arc<Queue>> {
        self.ensure_accepting()?;
        if spec.name.is_empty() {
            return Err(ControlError::invalid("queue name must not be empty"));
        }
        if spec.max_consumers < -1 {
            return Err(ControlError::invalid(format!(
                "maxConsumers must be -1 or greater, got {}",
                spec.max_consumers
            )));
        }
        let filter = Filter::parse(spec.filter.as_deref())?;

        if self.queues.contains_key(&spec.name) {
            return Err(ControlError::duplicate("Queue", &spec.name));
        }

        let mut created_address = false;
        let mut address = match self.addresses.entry(spec.address.clone()) {
            Entry::Occupied(entry) => entry.into_ref(),
            Entry::Vacant(entry) => {
                if !spec.auto_create_address {
                    return Err(ControlError::UnknownAddress(spec.address.clone()));
                }
                created_address = true;
                let routing_types = BTreeSet::from([spec.routing_type]);
                entry.insert(self.new_address_entry(routing_types, spec.auto_created))
            }
        };

        if !address.routing_types.contains(&spec.routing_type) {
            return Err(ControlError::RoutingTypeConflict {
                address: spec.address.clone(),
                existing: RoutingType::format_set(&address.routing_types),
                requested: spec.routing_type.to_string(),
            });
        }

        let queue = match self.queues.entry(spec.name.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(entry) => {
                let queue = Arc::new(Queue::new(self.next_id(), &spec, filter));
                entry.insert(queue.clone());
                address.queues.insert(spec.name.clone());
                Some(queue)
            }
        };
        drop(address);

        let Some(queue) = queue else {
            if created_address {
                self.addresses.remove_if(&spec.address, |_, a| a.queues.is_empty());
            }
            return Err(ControlError::duplicate("Queue", &spec.name));
        };

        if created_address {
            info!(address = %spec.address, "Address auto-created for queue");
        }
        info!(
            queue = %spec.name,
            address = %spec.address,
            routing_type = %spec.routing_type,
            durable = spec.durable,
            filter = ?spec.filter,
            "Queue created"
        );
        broker_metrics::record_queue_lifecycle("created", self.queues.len());
        Ok(queue)
    }

    /// Destroy a queue. Attached consumers make this fail unless
    /// `remove_consumers` is set, in which case they are closed on a
    /// background task and the call returns once that is scheduled.
    pub fn destroy_queue(&self, name: &str, remove_consumers: bool, auto_delete_address: bool) -> Result<()> {
        let queue = self
            .queues
            .get(name)
            .map(|q| q.value().clone())
            .ok_or_else(|| ControlError::UnknownQueue(name.to_string()))?;

        let consumers = queue.begin_removal(remove_consumers)?;
        self.queues.remove_if(name, |_, q| Arc::ptr_eq(q, &queue));
        let purged = queue.purge();

        let address_empty = match self.addresses.get_mut(queue.address()) {
            Some(mut address) => {
                address.queues.remove(name);
                address.queues.is_empty()
            }
            None => false,
        };

        if !consumers.is_empty() {
            close_consumers(queue.clone(), consumers);
        }

        info!(queue = %name, purged, remove_consumers, "Queue destroyed");
        broker_metrics::record_queue_lifecycle("destroyed", self.queues.len());

        if auto_delete_address && address_empty {
            let address = queue.address();
            if self.addresses.remove_if(address, |_, a| a.queues.is_empty()).is_some() {
                info!(address = %address, "Address deleted with its last queue");
            }
        }
        Ok(())
    }

    pub fn queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.get(name).map(|q| q.value().clone())
    }

    /// Snapshot of every queue, ordered by name.
    pub fn queues(&self) -> Vec<Arc<Queue>> {
        let mut queues: Vec<Arc<Queue>> = self.queues.iter().map(|q| q.value().clone()).collect();
        queues.sort_by(|a, b| a.name().cmp(b.name()));
        queues
    }

    pub fn get_queue_names(&self, routing_type: Option<RoutingType>) -> Vec<String> {
        let mut names: Vec<String> = self
            .queues
            .iter()
            .filter(|q| routing_type.map_or(true, |rt| q.routing_type() == rt))
            .map(|q| q.key().clone())
            .collect();
        names.sort();
        names
    }

    // ------------------------------------------------------------------
    // Consumers
    // ------------------------------------------------------------------

    /// Attach a consumer, auto-creating the queue when policy allows.
    pub fn create_consumer(
        self: &Arc<Self>,
        queue_name: &str,
        session: SessionContext,
        filter: Option<&str>,
        browse_only: bool,
    ) -> Result<ConsumerHandle> {
        if !self.is_active() {
            return Err(ControlError::ShuttingDown);
        }
        let filter = Filter::parse(filter)?;

        let queue = match self.queue(queue_name) {
            Some(queue) => queue,
            None => self.auto_create_queue(queue_name)?,
        };

        let state = ConsumerHandle::build_state(self.next_id(), session, &queue, filter, browse_only);
        queue.add_consumer(state.clone())?;
        debug!(queue = %queue_name, consumer_id = state.id, browse_only, "Consumer attached");
        Ok(ConsumerHandle::new(queue, state, Arc::downgrade(self)))
    }

    fn auto_create_queue(&self, name: &str) -> Result<Arc<Queue>> {
        let settings = self.policy.resolve_settings(name);
        if !settings.auto_create_queues {
            return Err(ControlError::UnknownQueue(name.to_string()));
        }
        if !self.addresses.contains_key(name) && !settings.auto_create_addresses {
            return Err(ControlError::UnknownAddress(name.to_string()));
        }

        let mut spec = QueueSpec::new(name, name, RoutingType::Anycast).auto_create_address(true);
        spec.auto_created = true;
        match self.create_queue(spec) {
            Ok(queue) => Ok(queue),
            Err(ControlError::DuplicateName { .. }) => self
                .queue(name)
                .ok_or_else(|| ControlError::UnknownQueue(name.to_string())),
            Err(e) => Err(e),
        }
    }

    /// Every live consumer across all queues.
    pub fn consumers(&self) -> Vec<Arc<ConsumerState>> {
        let mut consumers: Vec<Arc<ConsumerState>> = self
            .queues
            .iter()
            .flat_map(|q| q.consumers())
            .collect();
        consumers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        consumers
    }

    /// Force-close consumers belonging to a connection.
    pub fn close_consumers_for_connection(&self, connection_id: &str) -> usize {
        let mut closed = 0;
        for queue in self.queues() {
            for consumer in queue.consumers() {
                if consumer.session.connection_id == connection_id {
                    queue.close_consumer(&consumer);
                    closed += 1;
                }
            }
            if queue.consumer_count() == 0 {
                self.on_last_consumer_closed(&queue);
            }
        }
        closed
    }

    pub(crate) fn on_last_consumer_closed(&self, queue: &Arc<Queue>) {
        if !queue.is_auto_created() || queue.is_removed() || queue.message_count() > 0 {
            return;
        }
        let settings = self.policy.resolve_settings(queue.address());
        if !settings.auto_delete_queues {
            return;
        }
        let delete_address = settings.auto_delete_addresses
            && self
                .addresses
                .get(queue.address())
                .map_or(false, |a| a.auto_created);
        match self.destroy_queue(queue.name(), false, delete_address) {
            Ok(()) => debug!(queue = %queue.name(), "Auto-deleted queue"),
            Err(e) => debug!(queue = %queue.name(), error = %e, "Auto-delete skipped"),
        }
    }

    // ------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------

    pub(crate) fn bind_divert(&self, address: &str, binding: Arc<DivertBinding>) {
        self.divert_bindings
            .entry(address.to_string())
            .or_default()
            .push(binding);
    }

    pub(crate) fn unbind_divert(&self, address: &str, divert_name: &str) {
        if let Some(mut bindings) = self.divert_bindings.get_mut(address) {
            bindings.retain(|b| b.name() != divert_name);
        }
        self.divert_bindings.remove_if(address, |_, b| b.is_empty());
    }

    /// Route a message to an address: diverts first, then bound queues.
    pub async fn route(&self, address: &str, mut message: Message) -> Result<RouteOutcome> {
        if !self.is_active() {
            return Err(ControlError::ShuttingDown);
        }
        message.address = Some(address.to_string());

        let bindings: Vec<Arc<DivertBinding>> = self
            .divert_bindings
            .get(address)
            .map(|b| b.value().clone())
            .unwrap_or_default();

        let mut diverted = 0;
        let mut exclusive = false;
        for binding in bindings {
            if !binding.is_started() || !filter::accepts(binding.filter(), &message) {
                continue;
            }
            if binding.forward(message.clone()).await {
                diverted += 1;
                exclusive |= binding.is_exclusive();
            }
        }

        if exclusive {
            broker_metrics::record_message_diverted(address);
            return Ok(RouteOutcome {
                queues: Vec::new(),
                diverted,
                duplicate: false,
            });
        }

        let mut outcome = self.deliver(address, message, true);
        outcome.diverted = diverted;
        Ok(outcome)
    }

    /// Enqueue on bound queues. Diverts are not consulted.
    fn deliver(&self, address: &str, message: Message, allow_dead_letter: bool) -> RouteOutcome {
        if !self.addresses.contains_key(address) {
            self.auto_create_for_send(address, &message);
        }

        let (queue_names, cursor) = {
            let Some(entry) = self.addresses.get(address) else {
                return self.no_route(address, message, allow_dead_letter);
            };
            if let Some(dup) = message.duplicate_id() {
                if !entry.duplicate_ids.lock().insert(dup) {
                    debug!(address = %address, duplicate_id = %dup, "Duplicate message dropped");
                    broker_metrics::record_message_dropped(address, "duplicate");
                    return RouteOutcome {
                        duplicate: true,
                        ..Default::default()
                    };
                }
            }
            (
                entry.queues.iter().cloned().collect::<Vec<_>>(),
                entry.anycast_cursor.fetch_add(1, Ordering::Relaxed),
            )
        };

        let candidates: Vec<Arc<Queue>> = queue_names
            .iter()
            .filter_map(|name| self.queue(name))
            .filter(|q| filter::accepts(q.filter(), &message))
            .filter(|q| message.routing_type.map_or(true, |rt| rt == q.routing_type()))
            .collect();

        let mut targets: Vec<Arc<Queue>> = candidates
            .iter()
            .filter(|q| q.routing_type() == RoutingType::Multicast)
            .cloned()
            .collect();
        let anycast: Vec<&Arc<Queue>> = candidates
            .iter()
            .filter(|q| q.routing_type() == RoutingType::Anycast)
            .collect();
        if !anycast.is_empty() {
            targets.push(anycast[cursor % anycast.len()].clone());
        }

        if targets.is_empty() {
            return self.no_route(address, message, allow_dead_letter);
        }

        for queue in &targets {
            queue.enqueue(message.clone());
        }
        broker_metrics::record_message_routed(address, targets.len());

        RouteOutcome {
            queues: targets.iter().map(|q| q.name().to_string()).collect(),
            diverted: 0,
            duplicate: false,
        }
    }

    fn auto_create_for_send(&self, address: &str, message: &Message) {
        let settings = self.policy.resolve_settings(address);
        if !settings.auto_create_addresses || !self.is_accepting() {
            return;
        }
        let routing_type = message.routing_type.unwrap_or(RoutingType::Anycast);
        if let Err(e) = self.create_address_internal(address, BTreeSet::from([routing_type]), true) {
            debug!(address = %address, error = %e, "Address auto-create skipped");
            return;
        }
        if settings.auto_create_queues && routing_type == RoutingType::Anycast {
            let mut spec = QueueSpec::new(address, address, RoutingType::Anycast);
            spec.auto_created = true;
            if let Err(e) = self.create_queue(spec) {
                debug!(queue = %address, error = %e, "Queue auto-create skipped");
            }
        }
    }

    fn no_route(&self, address: &str, message: Message, allow_dead_letter: bool) -> RouteOutcome {
        let settings = self.policy.resolve_settings(address);
        if allow_dead_letter && settings.send_to_dla_on_no_route {
            if let Some(dla) = settings.dead_letter_address.as_deref().filter(|d| *d != address) {
                debug!(address = %address, dead_letter_address = %dla, "No route, sending to dead-letter address");
                return self.deliver(dla, message, false);
            }
        }
        debug!(address = %address, message_id = %message.id, "No route for message");
        broker_metrics::record_message_routed(address, 0);
        RouteOutcome::default()
    }

    /// Enqueue directly on a named queue. Duplicate ids are tracked per
    /// target queue so fanned-out copies sharing one id all arrive. Returns
    /// false for a duplicate.
    pub fn deliver_to_queue(&self, queue_name: &str, message: Message) -> Result<bool> {
        if !self.is_active() {
            return Err(ControlError::ShuttingDown);
        }
        let queue = self
            .queue(queue_name)
            .ok_or_else(|| ControlError::UnknownQueue(queue_name.to_string()))?;

        if let Some(dup) = message.duplicate_id() {
            if let Some(entry) = self.addresses.get(queue.address()) {
                let key = format!("{}/{}", queue_name, dup);
                if !entry.duplicate_ids.lock().insert(&key) {
                    broker_metrics::record_message_dropped(queue.address(), "duplicate");
                    return Ok(false);
                }
            }
        }
        queue.enqueue(message);
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Aggregates
    // ------------------------------------------------------------------

    pub fn total_message_count(&self) -> u64 {
        self.queues.iter().map(|q| q.message_count() as u64).sum()
    }

    pub fn total_messages_added(&self) -> u64 {
        self.queues.iter().map(|q| q.messages_added()).sum()
    }

    pub fn total_messages_acknowledged(&self) -> u64 {
        self.queues.iter().map(|q| q.messages_acknowledged()).sum()
    }

    pub fn total_consumer_count(&self) -> u64 {
        self.queues.iter().map(|q| q.consumer_count() as u64).sum()
    }

    /// Sum of the in-memory estimate of queues bound to `address`.
    pub fn address_size(&self, address: &str) -> Result<i64> {
        let names: Vec<String> = self
            .addresses
            .get(address)
            .map(|a| a.queues.iter().cloned().collect())
            .ok_or_else(|| ControlError::UnknownAddress(address.to_string()))?;
        Ok(names.iter().filter_map(|n| self.queue(n)).map(|q| q.memory_bytes()).sum())
    }

    pub fn address_memory_usage(&self) -> i64 {
        self.queues.iter().map(|q| q.memory_bytes()).sum()
    }

    /// Usage as a percentage of the global limit; 0 when unlimited.
    pub fn address_memory_usage_percentage(&self) -> i32 {
        if self.global_max_size <= 0 {
            return 0;
        }
        ((self.address_memory_usage() as f64 / self.global_max_size as f64) * 100.0) as i32
    }

    /// Force-close every consumer; their unacknowledged messages return to
    /// the queues. Auto-deletion does not run.
    pub(crate) fn close_all_consumers(&self) -> usize {
        let mut closed = 0;
        for queue in self.queues() {
            for consumer in queue.consumers() {
                queue.close_consumer(&consumer);
                closed += 1;
            }
        }
        closed
    }

    /// Close every consumer and refuse further work.
    pub(crate) fn stop(&self) {
        self.stop_accepting();
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let closed = self.close_all_consumers();
        if closed > 0 {
            warn!(consumers = closed, "Closed consumers on stop");
        }
    }
}

fn close_consumers(queue: Arc<Queue>, consumers: Vec<Arc<ConsumerState>>) {
    let close = move || {
        for consumer in &consumers {
            queue.close_consumer(consumer);
        }
        debug!(queue = %queue.name(), count = consumers.len(), "Consumers force-closed");
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { close() });
        }
        Err(_) => close(),
    }
}
