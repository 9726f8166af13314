//! Diverts
//!
//! A divert binds to a source address and re-routes matching messages to a
//! forwarding address. Each divert owns one forwarding task fed by a
//! bounded channel; routing on the source address only enqueues onto that
//! channel, so a slow forwarding address never blocks other diverts.
//! An exclusive divert keeps the message away from the source address's
//! own queues.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mq_common::{DivertConfig, Message, ORIGINAL_ADDRESS_PROPERTY};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker_metrics;
use crate::directory::ResourceDirectory;
use crate::error::ControlError;
use crate::filter::Filter;
use crate::transformer::{Transformer, TransformerRegistry};
use crate::Result;

const DIVERT_CHANNEL_CAPACITY: usize = 1024;
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DivertState {
    Created,
    Started,
    Stopped,
    Destroyed,
}

/// The divert's presence on its source address.
pub struct DivertBinding {
    name: String,
    exclusive: bool,
    filter: Option<Filter>,
    started: AtomicBool,
    in_flight: AtomicUsize,
    tx: mpsc::Sender<Message>,
}

impl DivertBinding {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn filter(&self) -> Option<&Filter> {
        self.filter.as_ref()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Hand a copy to the forwarding task. False if the divert is not
    /// started. The in-flight count is raised before the started check so
    /// a concurrent shutdown either sees this call or refuses it.
    pub(crate) async fn forward(&self, message: Message) -> bool {
        let _guard = InFlightGuard::enter(&self.in_flight);
        self.is_started() && self.tx.send(message).await.is_ok()
    }

    /// Wait until no `forward` call is between its started check and the
    /// channel send.
    async fn wait_idle(&self) {
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
        }
    }
}

/// Holds one in-flight slot; released on drop so a cancelled send is not
/// counted forever.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl<'a> InFlightGuard<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DivertInfo {
    pub name: String,
    pub routing_name: String,
    pub address: String,
    pub forwarding_address: String,
    pub exclusive: bool,
    pub filter: Option<String>,
    pub transformer: Option<String>,
    pub state: DivertState,
    pub forwarded_count: u64,
    pub failed_count: u64,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct DivertStats {
    forwarded: AtomicU64,
    failed: AtomicU64,
    last_error: Mutex<Option<String>>,
}

struct Divert {
    config: DivertConfig,
    routing_name: String,
    binding: Arc<DivertBinding>,
    state: Mutex<DivertState>,
    stats: Arc<DivertStats>,
    shutdown_tx: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Divert {
    fn info(&self) -> DivertInfo {
        DivertInfo {
            name: self.config.name.clone(),
            routing_name: self.routing_name.clone(),
            address: self.config.address.clone(),
            forwarding_address: self.config.forwarding_address.clone(),
            exclusive: self.config.exclusive,
            filter: self.binding.filter.as_ref().map(|f| f.expression().to_string()),
            transformer: self.config.transformer.clone(),
            state: *self.state.lock(),
            forwarded_count: self.stats.forwarded.load(Ordering::SeqCst),
            failed_count: self.stats.failed.load(Ordering::SeqCst),
            last_error: self.stats.last_error.lock().clone(),
        }
    }

    fn set_started(&self, started: bool) {
        let mut state = self.state.lock();
        if *state == DivertState::Destroyed {
            return;
        }
        self.binding.started.store(started, Ordering::SeqCst);
        *state = if started {
            DivertState::Started
        } else {
            DivertState::Stopped
        };
    }

    /// Stop accepting, let in-flight sends land, drain what is queued, then
    /// wait for the task.
    async fn shutdown(&self) {
        self.set_started(false);
        self.binding.wait_idle().await;
        let _ = self.shutdown_tx.send(());
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(divert = %self.config.name, error = %e, "Divert task ended abnormally");
            }
        }
        *self.state.lock() = DivertState::Destroyed;
    }
}

pub struct DivertManager {
    directory: Arc<ResourceDirectory>,
    transformers: Arc<TransformerRegistry>,
    diverts: DashMap<String, Arc<Divert>>,
}

impl DivertManager {
    pub fn new(directory: Arc<ResourceDirectory>, transformers: Arc<TransformerRegistry>) -> Self {
        Self {
            directory,
            transformers,
            diverts: DashMap::new(),
        }
    }

    /// Create and start a divert. Must be called within a Tokio runtime.
    pub async fn create_divert(&self, config: DivertConfig) -> Result<()> {
        if !self.directory.is_accepting() {
            return Err(ControlError::ShuttingDown);
        }
        if config.name.is_empty() {
            return Err(ControlError::invalid("divert name must not be empty"));
        }
        if config.address == config.forwarding_address {
            return Err(ControlError::invalid(format!(
                "divert {} forwards {} to itself",
                config.name, config.address
            )));
        }
        let filter = Filter::parse(config.filter.as_deref())?;
        let transformer = self.transformers.resolve(config.transformer.as_deref())?;

        let divert = match self.diverts.entry(config.name.clone()) {
            Entry::Occupied(_) => return Err(ControlError::duplicate("Divert", &config.name)),
            Entry::Vacant(vacant) => {
                let routing_name = config
                    .routing_name
                    .clone()
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                let (tx, rx) = mpsc::channel(DIVERT_CHANNEL_CAPACITY);
                let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
                let stats = Arc::new(DivertStats::default());

                let task = tokio::spawn(run_divert(
                    config.name.clone(),
                    config.address.clone(),
                    config.forwarding_address.clone(),
                    transformer,
                    self.directory.clone(),
                    stats.clone(),
                    rx,
                    shutdown_rx,
                ));

                let divert = Arc::new(Divert {
                    binding: Arc::new(DivertBinding {
                        name: config.name.clone(),
                        exclusive: config.exclusive,
                        filter,
                        started: AtomicBool::new(false),
                        in_flight: AtomicUsize::new(0),
                        tx,
                    }),
                    config,
                    routing_name,
                    state: Mutex::new(DivertState::Created),
                    stats,
                    shutdown_tx,
                    task: Mutex::new(Some(task)),
                });
                vacant.insert(divert.clone());
                divert
            }
        };

        self.directory
            .bind_divert(&divert.config.address, divert.binding.clone());
        divert.set_started(true);

        info!(
            divert = %divert.config.name,
            address = %divert.config.address,
            forwarding_address = %divert.config.forwarding_address,
            exclusive = divert.config.exclusive,
            "Divert created"
        );
        Ok(())
    }

    pub async fn destroy_divert(&self, name: &str) -> Result<()> {
        let (_, divert) = self
            .diverts
            .remove(name)
            .ok_or_else(|| ControlError::UnknownDivert(name.to_string()))?;

        self.directory.unbind_divert(&divert.config.address, name);
        divert.shutdown().await;
        info!(divert = %name, "Divert destroyed");
        Ok(())
    }

    pub fn start_divert(&self, name: &str) -> Result<()> {
        let divert = self.get(name)?;
        divert.set_started(true);
        Ok(())
    }

    pub fn stop_divert(&self, name: &str) -> Result<()> {
        let divert = self.get(name)?;
        divert.set_started(false);
        Ok(())
    }

    pub fn divert_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.diverts.iter().map(|d| d.key().clone()).collect();
        names.sort();
        names
    }

    pub fn divert_info(&self, name: &str) -> Result<DivertInfo> {
        Ok(self.get(name)?.info())
    }

    /// Stop every divert without removing it.
    pub fn stop_all(&self) {
        for divert in self.diverts.iter() {
            divert.set_started(false);
        }
    }

    /// Destroy every divert, draining their channels.
    pub async fn shutdown(&self) {
        let names = self.divert_names();
        for name in names {
            if let Err(e) = self.destroy_divert(&name).await {
                debug!(divert = %name, error = %e, "Divert already gone");
            }
        }
    }

    fn get(&self, name: &str) -> Result<Arc<Divert>> {
        self.diverts
            .get(name)
            .map(|d| d.value().clone())
            .ok_or_else(|| ControlError::UnknownDivert(name.to_string()))
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_divert(
    name: String,
    source_address: String,
    forwarding_address: String,
    transformer: Option<Arc<dyn Transformer>>,
    directory: Arc<ResourceDirectory>,
    stats: Arc<DivertStats>,
    mut rx: mpsc::Receiver<Message>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let forward = |mut message: Message| {
        message.set_property(ORIGINAL_ADDRESS_PROPERTY, source_address.clone());
        if let Some(transformer) = &transformer {
            message = transformer.transform(message);
        }
        message
    };

    loop {
        tokio::select! {
            received = rx.recv() => {
                let Some(message) = received else { break };
                forward_one(&name, &forwarding_address, &directory, &stats, forward(message)).await;
            }
            _ = shutdown_rx.recv() => {
                while let Ok(message) = rx.try_recv() {
                    forward_one(&name, &forwarding_address, &directory, &stats, forward(message)).await;
                }
                break;
            }
        }
    }
    debug!(divert = %name, "Divert task stopped");
}

async fn forward_one(
    name: &str,
    forwarding_address: &str,
    directory: &ResourceDirectory,
    stats: &DivertStats,
    message: Message,
) {
    match directory.route(forwarding_address, message).await {
        Ok(outcome) => {
            stats.forwarded.fetch_add(1, Ordering::SeqCst);
            broker_metrics::record_divert_forwarded(name);
            if !outcome.is_routed() && !outcome.duplicate {
                debug!(divert = %name, forwarding_address = %forwarding_address, "Diverted message had no route");
            }
        }
        Err(e) => {
            stats.failed.fetch_add(1, Ordering::SeqCst);
            *stats.last_error.lock() = Some(e.to_string());
            warn!(divert = %name, forwarding_address = %forwarding_address, error = %e, "Divert forwarding failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(tx: mpsc::Sender<Message>) -> Arc<DivertBinding> {
        Arc::new(DivertBinding {
            name: "d".to_string(),
            exclusive: true,
            filter: None,
            started: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            tx,
        })
    }

    #[tokio::test]
    async fn test_wait_idle_covers_blocked_forward() {
        let (tx, mut rx) = mpsc::channel(1);
        let binding = binding(tx);
        assert!(binding.forward(Message::new("first")).await);

        // Channel is full, so this send parks
        let blocked = tokio::spawn({
            let binding = binding.clone();
            async move { binding.forward(Message::new("second")).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        binding.started.store(false, Ordering::SeqCst);

        let waited = tokio::time::timeout(Duration::from_millis(50), binding.wait_idle()).await;
        assert!(waited.is_err(), "wait_idle must not return while a send is parked");

        assert_eq!(rx.recv().await.unwrap().body, b"first".to_vec());
        assert!(blocked.await.unwrap());
        binding.wait_idle().await;
        assert_eq!(rx.recv().await.unwrap().body, b"second".to_vec());
    }

    #[tokio::test]
    async fn test_stopped_binding_refuses_forward() {
        let (tx, mut rx) = mpsc::channel(4);
        let binding = binding(tx);
        binding.started.store(false, Ordering::SeqCst);

        assert!(!binding.forward(Message::new("late")).await);
        assert!(rx.try_recv().is_err());
        binding.wait_idle().await;
    }

    #[tokio::test]
    async fn test_cancelled_forward_releases_slot() {
        let (tx, _rx) = mpsc::channel(1);
        let binding = binding(tx);
        assert!(binding.forward(Message::new("fill")).await);

        let parked = tokio::time::timeout(
            Duration::from_millis(20),
            binding.forward(Message::new("parked")),
        )
        .await;
        assert!(parked.is_err());
        assert_eq!(binding.in_flight.load(Ordering::SeqCst), 0);
    }
}
