//! Bridges
//!
//! A bridge drains a local queue through an internal consumer and produces
//! every message to a target reached through a named connector. Each bridge
//! runs on its own task. At most `in_flight_window` messages are taken from
//! the queue and left unconfirmed at once; a message is acknowledged locally
//! only after the target confirms it. When a bridge stops, anything still
//! unconfirmed goes back to its original place in the source queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mq_common::{BridgeConfig, Message, DUPLICATE_ID_PROPERTY};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker_metrics;
use crate::connector::{Connector, ConnectorRegistry};
use crate::directory::ResourceDirectory;
use crate::error::ControlError;
use crate::filter::Filter;
use crate::queue::{ConsumerHandle, SessionContext};
use crate::transformer::{Transformer, TransformerRegistry};
use crate::Result;

const RECEIVE_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BridgeState {
    Created,
    Connecting,
    Connected,
    Stopped,
    Destroyed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeInfo {
    pub name: String,
    pub queue_name: String,
    pub forwarding_address: Option<String>,
    pub filter: Option<String>,
    pub transformer: Option<String>,
    pub connector: String,
    pub use_duplicate_detection: bool,
    pub state: BridgeState,
    pub forwarded_count: u64,
    pub retry_count: u64,
    pub last_error: Option<String>,
}

struct BridgeStatus {
    state: Mutex<BridgeState>,
    forwarded: AtomicU64,
    retries: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl BridgeStatus {
    fn new() -> Self {
        Self {
            state: Mutex::new(BridgeState::Created),
            forwarded: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    fn state(&self) -> BridgeState {
        *self.state.lock()
    }

    fn set_state(&self, next: BridgeState) {
        let mut state = self.state.lock();
        if *state != BridgeState::Destroyed {
            *state = next;
        }
    }

    fn record_error(&self, message: String) {
        *self.last_error.lock() = Some(message);
    }
}

/// Delay before retry number `attempt` (1-based).
pub fn retry_delay(config: &BridgeConfig, attempt: u32) -> Duration {
    let multiplier = config.retry_interval_multiplier.max(1.0);
    let exponent = attempt.saturating_sub(1).min(64) as i32;
    let mut delay_ms = config.retry_interval_ms as f64 * multiplier.powi(exponent);
    if config.max_retry_interval_ms > 0 {
        delay_ms = delay_ms.min(config.max_retry_interval_ms as f64);
    }
    Duration::from_millis(delay_ms as u64)
}

/// -1 means unlimited retries.
fn retries_exhausted(limit: i32, attempt: u32) -> bool {
    limit >= 0 && attempt > limit as u32
}

/// `limit` counts attempts, including the first. -1 means unlimited.
fn attempts_exhausted(limit: i32, attempts: u32) -> bool {
    limit >= 0 && attempts >= limit as u32
}

struct WorkerHandle {
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

struct Bridge {
    config: BridgeConfig,
    connector: Arc<dyn Connector>,
    transformer: Option<Arc<dyn Transformer>>,
    status: Arc<BridgeStatus>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl Bridge {
    fn info(&self) -> BridgeInfo {
        BridgeInfo {
            name: self.config.name.clone(),
            queue_name: self.config.queue_name.clone(),
            forwarding_address: self.config.forwarding_address.clone(),
            filter: self.config.filter.clone(),
            transformer: self.config.transformer.clone(),
            connector: self.connector.name().to_string(),
            use_duplicate_detection: self.config.use_duplicate_detection,
            state: self.status.state(),
            forwarded_count: self.status.forwarded.load(Ordering::SeqCst),
            retry_count: self.status.retries.load(Ordering::SeqCst),
            last_error: self.status.last_error.lock().clone(),
        }
    }

    fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .map_or(false, |w| !w.task.is_finished())
    }

    async fn stop(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.shutdown_tx.send(());
            if let Err(e) = worker.task.await {
                warn!(bridge = %self.config.name, error = %e, "Bridge task ended abnormally");
            }
        }
        self.status.set_state(BridgeState::Stopped);
    }
}

pub struct BridgeManager {
    directory: Arc<ResourceDirectory>,
    connectors: Arc<ConnectorRegistry>,
    transformers: Arc<TransformerRegistry>,
    bridges: DashMap<String, Arc<Bridge>>,
}

impl BridgeManager {
    pub fn new(
        directory: Arc<ResourceDirectory>,
        connectors: Arc<ConnectorRegistry>,
        transformers: Arc<TransformerRegistry>,
    ) -> Self {
        Self {
            directory,
            connectors,
            transformers,
            bridges: DashMap::new(),
        }
    }

    /// Create a bridge and start it. Forwarding failures after this point are
    /// recorded on the bridge, never returned here.
    pub async fn create_bridge(&self, config: BridgeConfig) -> Result<()> {
        if !self.directory.is_accepting() {
            return Err(ControlError::ShuttingDown);
        }
        if config.name.is_empty() {
            return Err(ControlError::invalid("bridge name must not be empty"));
        }
        if self.directory.queue(&config.queue_name).is_none() {
            return Err(ControlError::UnknownQueue(config.queue_name.clone()));
        }
        let connector_name = config
            .static_connectors
            .first()
            .ok_or_else(|| ControlError::invalid(format!("bridge {} has no connector", config.name)))?;
        let connector = self.connectors.get(connector_name)?;
        Filter::parse(config.filter.as_deref())?;
        let transformer = self.transformers.resolve(config.transformer.as_deref())?;

        let bridge = match self.bridges.entry(config.name.clone()) {
            Entry::Occupied(_) => return Err(ControlError::duplicate("Bridge", &config.name)),
            Entry::Vacant(vacant) => {
                let bridge = Arc::new(Bridge {
                    config,
                    connector,
                    transformer,
                    status: Arc::new(BridgeStatus::new()),
                    worker: Mutex::new(None),
                });
                vacant.insert(bridge.clone());
                bridge
            }
        };

        if let Err(e) = self.start(&bridge) {
            self.bridges.remove(&bridge.config.name);
            return Err(e);
        }

        info!(
            bridge = %bridge.config.name,
            queue = %bridge.config.queue_name,
            connector = %bridge.connector.name(),
            "Bridge created"
        );
        Ok(())
    }

    pub async fn destroy_bridge(&self, name: &str) -> Result<()> {
        let (_, bridge) = self
            .bridges
            .remove(name)
            .ok_or_else(|| ControlError::UnknownBridge(name.to_string()))?;
        bridge.stop().await;
        bridge.status.set_state(BridgeState::Destroyed);
        info!(bridge = %name, "Bridge destroyed");
        Ok(())
    }

    pub async fn start_bridge(&self, name: &str) -> Result<()> {
        let bridge = self.get(name)?;
        if !self.directory.is_accepting() {
            return Err(ControlError::ShuttingDown);
        }
        self.start(&bridge)
    }

    pub async fn stop_bridge(&self, name: &str) -> Result<()> {
        let bridge = self.get(name)?;
        bridge.stop().await;
        info!(bridge = %name, "Bridge stopped");
        Ok(())
    }

    pub fn bridge_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.bridges.iter().map(|b| b.key().clone()).collect();
        names.sort();
        names
    }

    pub fn bridge_info(&self, name: &str) -> Result<BridgeInfo> {
        Ok(self.get(name)?.info())
    }

    /// Stop every bridge, returning unconfirmed messages to their queues.
    pub async fn stop_all(&self) {
        let bridges: Vec<Arc<Bridge>> = self.bridges.iter().map(|b| b.value().clone()).collect();
        for bridge in bridges {
            bridge.stop().await;
        }
    }

    fn get(&self, name: &str) -> Result<Arc<Bridge>> {
        self.bridges
            .get(name)
            .map(|b| b.value().clone())
            .ok_or_else(|| ControlError::UnknownBridge(name.to_string()))
    }

    fn start(&self, bridge: &Arc<Bridge>) -> Result<()> {
        if bridge.is_running() {
            return Ok(());
        }
        let source_address = self
            .directory
            .queue(&bridge.config.queue_name)
            .map(|q| q.address().to_string())
            .ok_or_else(|| ControlError::UnknownQueue(bridge.config.queue_name.clone()))?;
        let consumer = self.directory.create_consumer(
            &bridge.config.queue_name,
            SessionContext::internal(&format!("bridge.{}", bridge.config.name)),
            bridge.config.filter.as_deref(),
            false,
        )?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let worker = BridgeWorker {
            config: bridge.config.clone(),
            connector: bridge.connector.clone(),
            transformer: bridge.transformer.clone(),
            status: bridge.status.clone(),
            source_address,
            consumer,
            shutdown_rx,
        };
        bridge.status.set_state(BridgeState::Connecting);
        let task = tokio::spawn(worker.run());
        *bridge.worker.lock() = Some(WorkerHandle { shutdown_tx, task });
        Ok(())
    }
}

enum BatchOutcome {
    Forwarded,
    Failed,
    Interrupted,
}

struct BridgeWorker {
    config: BridgeConfig,
    connector: Arc<dyn Connector>,
    transformer: Option<Arc<dyn Transformer>>,
    status: Arc<BridgeStatus>,
    source_address: String,
    consumer: ConsumerHandle,
    shutdown_rx: broadcast::Receiver<()>,
}

impl BridgeWorker {
    async fn run(mut self) {
        let name = self.config.name.clone();

        if !self.connect().await {
            // Dropping the consumer returns anything taken to the queue.
            return;
        }
        self.status.set_state(BridgeState::Connected);
        info!(bridge = %name, connector = %self.connector.name(), "Bridge connected");

        let window = self.config.in_flight_window();
        loop {
            let batch = tokio::select! {
                _ = self.shutdown_rx.recv() => break,
                batch = self.consumer.receive_batch(window, RECEIVE_POLL_INTERVAL) => batch,
            };

            if batch.is_empty() {
                if self.consumer.is_closed() {
                    warn!(bridge = %name, queue = %self.config.queue_name, "Bridge source consumer closed");
                    self.status
                        .record_error(format!("source queue {} consumer closed", self.config.queue_name));
                    self.status.set_state(BridgeState::Stopped);
                    break;
                }
                continue;
            }

            match self.forward_batch(batch).await {
                BatchOutcome::Forwarded => {}
                BatchOutcome::Interrupted => break,
                BatchOutcome::Failed => {
                    self.status.set_state(BridgeState::Stopped);
                    break;
                }
            }
        }

        self.consumer.close();
        debug!(bridge = %name, "Bridge task stopped");
    }

    async fn connect(&mut self) -> bool {
        let mut attempt: u32 = 0;
        loop {
            match self.connector.connect().await {
                Ok(()) => return true,
                Err(e) => {
                    attempt += 1;
                    broker_metrics::record_bridge_failure(&self.config.name);
                    self.status.record_error(e.to_string());
                    if attempts_exhausted(self.config.initial_connect_attempts, attempt) {
                        error!(
                            bridge = %self.config.name,
                            attempts = attempt,
                            error = %e,
                            "Bridge could not connect, giving up"
                        );
                        self.status.set_state(BridgeState::Stopped);
                        return false;
                    }
                    self.status.retries.fetch_add(1, Ordering::SeqCst);
                    let delay = retry_delay(&self.config, attempt);
                    warn!(
                        bridge = %self.config.name,
                        attempt = attempt,
                        error = %e,
                        retry_delay_ms = delay.as_millis() as u64,
                        "Bridge connect failed, retrying..."
                    );
                    if !self.sleep_or_shutdown(delay).await {
                        self.status.set_state(BridgeState::Stopped);
                        return false;
                    }
                }
            }
        }
    }

    /// Forward in order. Stops at the first message that cannot be delivered
    /// within the retry budget; the caller closes the consumer, which returns
    /// that message and the rest of the batch to the queue.
    async fn forward_batch(&mut self, batch: Vec<Message>) -> BatchOutcome {
        for original in batch {
            let address = self
                .config
                .forwarding_address
                .clone()
                .or_else(|| original.address.clone())
                .unwrap_or_else(|| self.source_address.clone());
            let outgoing = self.prepare(original.clone());

            let mut attempt: u32 = 0;
            loop {
                match self.connector.send(&address, outgoing.clone()).await {
                    Ok(()) => {
                        self.consumer.acknowledge(&original);
                        self.status.forwarded.fetch_add(1, Ordering::SeqCst);
                        broker_metrics::record_bridge_forwarded(&self.config.name);
                        if attempt > 0 {
                            info!(bridge = %self.config.name, attempt = attempt, "Bridge reconnected");
                            self.status.set_state(BridgeState::Connected);
                        }
                        break;
                    }
                    Err(e) => {
                        attempt += 1;
                        broker_metrics::record_bridge_failure(&self.config.name);
                        self.status.record_error(e.to_string());
                        if retries_exhausted(self.config.reconnect_attempts, attempt) {
                            error!(
                                bridge = %self.config.name,
                                attempts = attempt,
                                error = %e,
                                "Bridge exhausted reconnect attempts, stopping"
                            );
                            return BatchOutcome::Failed;
                        }
                        self.status.retries.fetch_add(1, Ordering::SeqCst);
                        self.status.set_state(BridgeState::Connecting);
                        let delay = retry_delay(&self.config, attempt);
                        warn!(
                            bridge = %self.config.name,
                            attempt = attempt,
                            error = %e,
                            retry_delay_ms = delay.as_millis() as u64,
                            "Bridge send failed, retrying..."
                        );
                        if !self.sleep_or_shutdown(delay).await {
                            return BatchOutcome::Interrupted;
                        }
                    }
                }
            }
        }
        BatchOutcome::Forwarded
    }

    fn prepare(&self, mut message: Message) -> Message {
        if self.config.use_duplicate_detection && message.duplicate_id().is_none() {
            let id = format!("bridge.{}.{}", self.config.name, message.id);
            message.set_property(DUPLICATE_ID_PROPERTY, id);
        }
        match &self.transformer {
            Some(transformer) => transformer.transform(message),
            None => message,
        }
    }

    /// False if shutdown was requested while waiting.
    async fn sleep_or_shutdown(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.shutdown_rx.recv() => false,
        }
    }
}
