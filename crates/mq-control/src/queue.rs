//! In-memory queues and their consumers
//!
//! The delivery engine proper lives outside the control plane; this is the
//! minimal live state the control plane needs to count, route to, browse,
//! migrate and destroy queues.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mq_common::{Message, RoutingType};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::directory::ResourceDirectory;
use crate::error::ControlError;
use crate::filter::{self, Filter};
use crate::Result;

/// Everything needed to create a queue.
#[derive(Debug, Clone)]
pub struct QueueSpec {
    pub name: String,
    pub address: String,
    pub routing_type: RoutingType,
    pub filter: Option<String>,
    pub durable: bool,
    /// -1 means unlimited
    pub max_consumers: i32,
    pub purge_on_no_consumers: bool,
    pub temporary: bool,
    pub auto_create_address: bool,
    pub(crate) auto_created: bool,
}

impl QueueSpec {
    pub fn new(address: &str, name: &str, routing_type: RoutingType) -> Self {
        Self {
            name: name.to_string(),
            address: address.to_string(),
            routing_type,
            filter: None,
            durable: true,
            max_consumers: -1,
            purge_on_no_consumers: false,
            temporary: false,
            auto_create_address: false,
            auto_created: false,
        }
    }

    pub fn filter(mut self, filter: &str) -> Self {
        self.filter = Some(filter.to_string());
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn max_consumers(mut self, max_consumers: i32) -> Self {
        self.max_consumers = max_consumers;
        self
    }

    pub fn purge_on_no_consumers(mut self, purge: bool) -> Self {
        self.purge_on_no_consumers = purge;
        self
    }

    pub fn temporary(mut self, temporary: bool) -> Self {
        self.temporary = temporary;
        self
    }

    pub fn auto_create_address(mut self, auto_create: bool) -> Self {
        self.auto_create_address = auto_create;
        self
    }
}

struct Delivery {
    seq: u64,
    consumer_id: u64,
    message: Message,
}

#[derive(Default)]
struct QueueState {
    next_seq: u64,
    backlog: VecDeque<(u64, Message)>,
    delivering: HashMap<String, Delivery>,
    removed: bool,
}

impl QueueState {
    /// Put a message back at its original position.
    fn restore(&mut self, seq: u64, message: Message) {
        let idx = self.backlog.partition_point(|(s, _)| *s < seq);
        self.backlog.insert(idx, (seq, message));
    }
}

/// Identity of the session a consumer belongs to.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: String,
    pub connection_id: String,
    pub user: Option<String>,
    pub protocol: String,
}

impl SessionContext {
    /// Context for consumers owned by the broker itself (bridges).
    pub fn internal(owner: &str) -> Self {
        Self {
            session_id: format!("internal:{}", owner),
            connection_id: "internal".to_string(),
            user: None,
            protocol: "CORE".to_string(),
        }
    }
}

/// Server-side record of one consumer.
pub struct ConsumerState {
    pub id: u64,
    pub session: SessionContext,
    pub queue: String,
    pub address: String,
    pub routing_type: RoutingType,
    pub filter: Option<Filter>,
    pub browse_only: bool,
    pub created_at: DateTime<Utc>,
    closed: AtomicBool,
    delivering: AtomicI64,
    browse_cursor: AtomicU64,
}

impl ConsumerState {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn delivering_count(&self) -> i64 {
        self.delivering.load(Ordering::SeqCst)
    }

    fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }
}

pub struct Queue {
    id: u64,
    name: String,
    address: String,
    routing_type: RoutingType,
    durable: bool,
    temporary: bool,
    auto_created: bool,
    filter: Option<Filter>,
    max_consumers: i32,
    purge_on_no_consumers: bool,
    created_at: DateTime<Utc>,
    state: Mutex<QueueState>,
    consumers: DashMap<u64, Arc<ConsumerState>>,
    messages_added: AtomicU64,
    messages_acknowledged: AtomicU64,
    messages_killed: AtomicU64,
    memory_bytes: AtomicI64,
    notify: Notify,
}

impl Queue {
    pub(crate) fn new(id: u64, spec: &QueueSpec, filter: Option<Filter>) -> Self {
        Self {
            id,
            name: spec.name.clone(),
            address: spec.address.clone(),
            routing_type: spec.routing_type,
            durable: spec.durable,
            temporary: spec.temporary,
            auto_created: spec.auto_created,
            filter,
            max_consumers: spec.max_consumers,
            purge_on_no_consumers: spec.purge_on_no_consumers,
            created_at: Utc::now(),
            state: Mutex::new(QueueState::default()),
            consumers: DashMap::new(),
            messages_added: AtomicU64::new(0),
            messages_acknowledged: AtomicU64::new(0),
            messages_killed: AtomicU64::new(0),
            memory_bytes: AtomicI64::new(0),
            notify: Notify::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn routing_type(&self) -> RoutingType {
        self.routing_type
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    pub fn is_auto_created(&self) -> bool {
        self.auto_created
    }

    pub fn filter(&self) -> Option<&Filter> {
        self.filter.as_ref()
    }

    pub fn max_consumers(&self) -> i32 {
        self.max_consumers
    }

    pub fn is_purge_on_no_consumers(&self) -> bool {
        self.purge_on_no_consumers
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn messages_added(&self) -> u64 {
        self.messages_added.load(Ordering::SeqCst)
    }

    pub fn messages_acknowledged(&self) -> u64 {
        self.messages_acknowledged.load(Ordering::SeqCst)
    }

    pub fn messages_killed(&self) -> u64 {
        self.messages_killed.load(Ordering::SeqCst)
    }

    pub fn memory_bytes(&self) -> i64 {
        self.memory_bytes.load(Ordering::SeqCst)
    }

    /// Backlog plus messages out for delivery.
    pub fn message_count(&self) -> usize {
        let state = self.state.lock();
        state.backlog.len() + state.delivering.len()
    }

    pub fn delivering_count(&self) -> usize {
        self.state.lock().delivering.len()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    pub fn consumers(&self) -> Vec<Arc<ConsumerState>> {
        let mut consumers: Vec<_> = self.consumers.iter().map(|c| c.value().clone()).collect();
        consumers.sort_by_key(|c| c.id);
        consumers
    }

    pub fn is_removed(&self) -> bool {
        self.state.lock().removed
    }

    pub fn enqueue(&self, message: Message) {
        let size = message.encode_size() as i64;
        {
            let mut state = self.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.backlog.push_back((seq, message));
        }
        self.messages_added.fetch_add(1, Ordering::SeqCst);
        self.memory_bytes.fetch_add(size, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Copies of the undelivered backlog, oldest first.
    pub fn browse(&self) -> Vec<Message> {
        self.state.lock().backlog.iter().map(|(_, m)| m.clone()).collect()
    }

    /// Remove one message by id without counting it as acknowledged.
    pub fn remove_message(&self, message_id: &str) -> bool {
        let removed = {
            let mut state = self.state.lock();
            match state.backlog.iter().position(|(_, m)| m.id == message_id) {
                Some(idx) => state.backlog.remove(idx).map(|(_, m)| m),
                None => None,
            }
        };
        match removed {
            Some(message) => {
                self.memory_bytes.fetch_sub(message.encode_size() as i64, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Remove every undelivered message accepted by `filter`; counted as killed.
    pub fn remove_messages(&self, filter: Option<&Filter>) -> usize {
        let removed: Vec<Message> = {
            let mut state = self.state.lock();
            let (matched, keep): (Vec<_>, Vec<_>) = state
                .backlog
                .drain(..)
                .partition(|(_, m)| filter::accepts(filter, m));
            state.backlog = keep.into();
            matched.into_iter().map(|(_, m)| m).collect()
        };
        let bytes: i64 = removed.iter().map(|m| m.encode_size() as i64).sum();
        self.memory_bytes.fetch_sub(bytes, Ordering::SeqCst);
        self.messages_killed.fetch_add(removed.len() as u64, Ordering::SeqCst);
        removed.len()
    }

    /// Drop the undelivered backlog.
    pub fn purge(&self) -> usize {
        let removed: Vec<Message> = {
            let mut state = self.state.lock();
            state.backlog.drain(..).map(|(_, m)| m).collect()
        };
        let bytes: i64 = removed.iter().map(|m| m.encode_size() as i64).sum();
        self.memory_bytes.fetch_sub(bytes, Ordering::SeqCst);
        removed.len()
    }

    pub fn acknowledge(&self, message_id: &str) -> bool {
        let delivery = self.state.lock().delivering.remove(message_id);
        match delivery {
            Some(delivery) => {
                if let Some(consumer) = self.consumers.get(&delivery.consumer_id) {
                    consumer.delivering.fetch_sub(1, Ordering::SeqCst);
                }
                self.memory_bytes
                    .fetch_sub(delivery.message.encode_size() as i64, Ordering::SeqCst);
                self.messages_acknowledged.fetch_add(1, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Return an unacknowledged message to its original position.
    pub fn cancel(&self, message_id: &str) -> bool {
        let consumer_id = {
            let mut state = self.state.lock();
            match state.delivering.remove(message_id) {
                Some(delivery) => {
                    state.restore(delivery.seq, delivery.message);
                    delivery.consumer_id
                }
                None => return false,
            }
        };
        if let Some(consumer) = self.consumers.get(&consumer_id) {
            consumer.delivering.fetch_sub(1, Ordering::SeqCst);
        }
        self.notify.notify_waiters();
        true
    }

    /// Take the oldest undelivered message so it can be moved elsewhere.
    pub(crate) fn take_for_migration(&self) -> Option<(u64, Message)> {
        self.state.lock().backlog.pop_front()
    }

    /// The target holds the message; drop it here and count it acknowledged.
    pub(crate) fn confirm_migrated(&self, message: &Message) {
        self.memory_bytes
            .fetch_sub(message.encode_size() as i64, Ordering::SeqCst);
        self.messages_acknowledged.fetch_add(1, Ordering::SeqCst);
    }

    /// The target did not confirm; put the message back where it was.
    pub(crate) fn restore_migration(&self, seq: u64, message: Message) {
        self.state.lock().restore(seq, message);
        self.notify.notify_waiters();
    }

    pub(crate) fn add_consumer(&self, consumer: Arc<ConsumerState>) -> Result<()> {
        let state = self.state.lock();
        if state.removed {
            return Err(ControlError::UnknownQueue(self.name.clone()));
        }
        if self.max_consumers >= 0 && self.consumers.len() >= self.max_consumers as usize {
            return Err(ControlError::MaxConsumersReached {
                queue: self.name.clone(),
                max: self.max_consumers,
            });
        }
        consumer.browse_cursor.store(0, Ordering::SeqCst);
        self.consumers.insert(consumer.id, consumer);
        drop(state);
        Ok(())
    }

    /// Detach a consumer, returning its unacknowledged messages. Returns the
    /// number of consumers left.
    pub(crate) fn remove_consumer(&self, consumer_id: u64) -> usize {
        let removed = self.consumers.remove(&consumer_id);
        if removed.is_some() {
            let mut state = self.state.lock();
            let ids: Vec<String> = state
                .delivering
                .iter()
                .filter(|(_, d)| d.consumer_id == consumer_id)
                .map(|(id, _)| id.clone())
                .collect();
            for id in ids {
                if let Some(delivery) = state.delivering.remove(&id) {
                    state.restore(delivery.seq, delivery.message);
                }
            }
        }

        let remaining = self.consumers.len();
        if removed.is_some() && remaining == 0 && self.purge_on_no_consumers {
            let purged = self.purge();
            debug!(queue = %self.name, purged, "Purged queue after last consumer left");
        }
        self.notify.notify_waiters();
        remaining
    }

    /// Mark the queue removed. Fails if consumers are attached and `force`
    /// is not set; otherwise returns the consumers to close.
    pub(crate) fn begin_removal(&self, force: bool) -> Result<Vec<Arc<ConsumerState>>> {
        let mut state = self.state.lock();
        if state.removed {
            return Err(ControlError::UnknownQueue(self.name.clone()));
        }
        let consumer_count = self.consumers.len();
        if consumer_count > 0 && !force {
            return Err(ControlError::QueueInUse {
                queue: self.name.clone(),
                consumer_count,
            });
        }
        state.removed = true;
        Ok(self.consumers.iter().map(|c| c.value().clone()).collect())
    }

    pub(crate) fn close_consumer(&self, consumer: &ConsumerState) {
        if consumer.mark_closed() {
            self.remove_consumer(consumer.id);
        }
    }

    fn poll(&self, consumer: &ConsumerState) -> Option<Message> {
        let mut state = self.state.lock();

        if consumer.browse_only {
            let cursor = consumer.browse_cursor.load(Ordering::SeqCst);
            let (seq, message) = state
                .backlog
                .iter()
                .find(|(seq, m)| *seq >= cursor && filter::accepts(consumer.filter.as_ref(), m))?;
            consumer.browse_cursor.store(seq + 1, Ordering::SeqCst);
            return Some(message.clone());
        }

        let idx = state
            .backlog
            .iter()
            .position(|(_, m)| filter::accepts(consumer.filter.as_ref(), m))?;
        let (seq, message) = state.backlog.remove(idx)?;
        state.delivering.insert(
            message.id.clone(),
            Delivery {
                seq,
                consumer_id: consumer.id,
                message: message.clone(),
            },
        );
        consumer.delivering.fetch_add(1, Ordering::SeqCst);
        Some(message)
    }
}

/// Client-side handle of a consumer. Dropping it closes the consumer.
pub struct ConsumerHandle {
    queue: Arc<Queue>,
    state: Arc<ConsumerState>,
    directory: Weak<ResourceDirectory>,
}

impl ConsumerHandle {
    pub(crate) fn new(queue: Arc<Queue>, state: Arc<ConsumerState>, directory: Weak<ResourceDirectory>) -> Self {
        Self { queue, state, directory }
    }

    pub(crate) fn build_state(
        id: u64,
        session: SessionContext,
        queue: &Queue,
        filter: Option<Filter>,
        browse_only: bool,
    ) -> Arc<ConsumerState> {
        Arc::new(ConsumerState {
            id,
            session,
            queue: queue.name.clone(),
            address: queue.address.clone(),
            routing_type: queue.routing_type,
            filter,
            browse_only,
            created_at: Utc::now(),
            closed: AtomicBool::new(false),
            delivering: AtomicI64::new(0),
            browse_cursor: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> u64 {
        self.state.id
    }

    pub fn queue_name(&self) -> &str {
        self.queue.name()
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Wait up to `timeout` for a message. Returns `None` on timeout or once
    /// the consumer has been closed.
    pub async fn receive(&self, timeout: Duration) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.queue.notify.notified();
            if self.is_closed() {
                return None;
            }
            if let Some(message) = self.queue.poll(&self.state) {
                return Some(message);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    pub fn receive_immediate(&self) -> Option<Message> {
        if self.is_closed() {
            return None;
        }
        self.queue.poll(&self.state)
    }

    /// Wait for at least one message, then take up to `max` without waiting.
    pub async fn receive_batch(&self, max: usize, timeout: Duration) -> Vec<Message> {
        let Some(first) = self.receive(timeout).await else {
            return Vec::new();
        };
        let mut batch = vec![first];
        while batch.len() < max {
            match self.receive_immediate() {
                Some(message) => batch.push(message),
                None => break,
            }
        }
        batch
    }

    pub fn acknowledge(&self, message: &Message) -> bool {
        self.queue.acknowledge(&message.id)
    }

    pub fn cancel(&self, message: &Message) -> bool {
        self.queue.cancel(&message.id)
    }

    /// Resolves once the consumer has been closed, locally or by the broker.
    pub async fn closed(&self) {
        loop {
            let notified = self.queue.notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    pub fn close(&self) {
        if !self.state.mark_closed() {
            return;
        }
        let remaining = self.queue.remove_consumer(self.state.id);
        if remaining == 0 {
            if let Some(directory) = self.directory.upgrade() {
                directory.on_last_consumer_closed(&self.queue);
            }
        }
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        self.close();
    }
}
