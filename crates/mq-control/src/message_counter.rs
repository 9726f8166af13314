//! Message counters
//!
//! Periodic per-queue samples of how many messages arrived and how the depth
//! changed, with an hourly history kept for a bounded number of days.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Timelike, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::directory::ResourceDirectory;
use crate::error::ControlError;
use crate::queue::Queue;
use crate::Result;

/// Sample periods below this are accepted but costly.
pub const MIN_RECOMMENDED_SAMPLE_PERIOD_MS: i64 = 1000;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DayCounter {
    pub date: NaiveDate,
    /// Messages added per hour of the day
    pub counts: [u64; 24],
}

impl DayCounter {
    fn new(date: NaiveDate) -> Self {
        Self { date, counts: [0; 24] }
    }
}

/// Counter state of one queue.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageCounter {
    pub destination_name: String,
    pub destination_address: String,
    pub destination_durable: bool,
    /// Messages added since the last reset
    pub count: u64,
    /// Messages added since the previous sample
    pub count_delta: u64,
    pub message_count: usize,
    pub message_count_delta: i64,
    pub last_add_timestamp: Option<i64>,
    pub update_timestamp: i64,
    #[serde(skip)]
    baseline: u64,
    #[serde(skip)]
    history: VecDeque<DayCounter>,
}

impl MessageCounter {
    fn new(queue: &Queue, now: DateTime<Utc>) -> Self {
        Self {
            destination_name: queue.name().to_string(),
            destination_address: queue.address().to_string(),
            destination_durable: queue.is_durable(),
            count: 0,
            count_delta: 0,
            message_count: queue.message_count(),
            message_count_delta: 0,
            last_add_timestamp: None,
            update_timestamp: now.timestamp_millis(),
            baseline: queue.messages_added(),
            history: VecDeque::new(),
        }
    }

    fn sample(&mut self, queue: &Queue, now: DateTime<Utc>, max_days: usize) {
        let count = queue.messages_added().saturating_sub(self.baseline);
        let depth = queue.message_count();

        self.count_delta = count.saturating_sub(self.count);
        self.count = count;
        self.message_count_delta = depth as i64 - self.message_count as i64;
        self.message_count = depth;
        self.update_timestamp = now.timestamp_millis();
        if self.count_delta > 0 {
            self.last_add_timestamp = Some(now.timestamp_millis());
        }

        let today = now.date_naive();
        if self.history.back().map_or(true, |d| d.date != today) {
            self.history.push_back(DayCounter::new(today));
        }
        if let Some(day) = self.history.back_mut() {
            day.counts[now.hour() as usize] += self.count_delta;
        }
        self.trim(max_days);
    }

    fn reset(&mut self, queue: &Queue, now: DateTime<Utc>) {
        self.baseline = queue.messages_added();
        self.count = 0;
        self.count_delta = 0;
        self.message_count = queue.message_count();
        self.message_count_delta = 0;
        self.last_add_timestamp = None;
        self.update_timestamp = now.timestamp_millis();
    }

    fn trim(&mut self, max_days: usize) {
        while self.history.len() > max_days {
            self.history.pop_front();
        }
    }

    pub fn history(&self) -> Vec<DayCounter> {
        self.history.iter().cloned().collect()
    }
}

struct CounterState {
    directory: Arc<ResourceDirectory>,
    counters: DashMap<String, MessageCounter>,
    sample_period_ms: AtomicI64,
    max_day_count: AtomicI64,
}

impl CounterState {
    fn max_days(&self) -> usize {
        self.max_day_count.load(Ordering::SeqCst).max(1) as usize
    }

    fn sample_all(&self) {
        let now = Utc::now();
        let max_days = self.max_days();
        let queues = self.directory.queues();

        for queue in &queues {
            self.counters
                .entry(queue.name().to_string())
                .or_insert_with(|| MessageCounter::new(queue, now))
                .sample(queue, now, max_days);
        }
        self.counters
            .retain(|name, _| queues.iter().any(|q| q.name() == name.as_str()));
        debug!(queues = queues.len(), "Message counters sampled");
    }
}

struct SamplerHandle {
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

pub struct MessageCounterManager {
    state: Arc<CounterState>,
    enabled: AtomicBool,
    sampler: Mutex<Option<SamplerHandle>>,
}

impl MessageCounterManager {
    pub fn new(directory: Arc<ResourceDirectory>, sample_period_ms: i64, max_day_count: i64) -> Result<Self> {
        validate_sample_period(sample_period_ms)?;
        validate_max_day_count(max_day_count)?;
        Ok(Self {
            state: Arc::new(CounterState {
                directory,
                counters: DashMap::new(),
                sample_period_ms: AtomicI64::new(sample_period_ms),
                max_day_count: AtomicI64::new(max_day_count),
            }),
            enabled: AtomicBool::new(false),
            sampler: Mutex::new(None),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Start periodic sampling. Must be called within a Tokio runtime.
    pub fn enable(&self) {
        if self.enabled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.spawn_sampler();
        info!(
            sample_period_ms = self.sample_period_ms(),
            max_day_count = self.max_day_count(),
            "Message counters enabled"
        );
    }

    pub async fn disable(&self) {
        if !self.enabled.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stop_sampler().await;
        self.state.counters.clear();
        info!("Message counters disabled");
    }

    pub fn sample_period_ms(&self) -> i64 {
        self.state.sample_period_ms.load(Ordering::SeqCst)
    }

    /// Change the sample period, restarting the sampler when running.
    pub async fn set_sample_period(&self, period_ms: i64) -> Result<()> {
        validate_sample_period(period_ms)?;
        self.state.sample_period_ms.store(period_ms, Ordering::SeqCst);
        if self.is_enabled() {
            self.stop_sampler().await;
            self.spawn_sampler();
        }
        Ok(())
    }

    pub fn max_day_count(&self) -> i64 {
        self.state.max_day_count.load(Ordering::SeqCst)
    }

    pub fn set_max_day_count(&self, count: i64) -> Result<()> {
        validate_max_day_count(count)?;
        self.state.max_day_count.store(count, Ordering::SeqCst);
        let max_days = self.state.max_days();
        for mut counter in self.state.counters.iter_mut() {
            counter.trim(max_days);
        }
        Ok(())
    }

    /// Take a sample of every queue now.
    pub fn sample_now(&self) {
        self.state.sample_all();
    }

    pub fn counter(&self, queue_name: &str) -> Result<MessageCounter> {
        let queue = self
            .state
            .directory
            .queue(queue_name)
            .ok_or_else(|| ControlError::UnknownQueue(queue_name.to_string()))?;
        let counter = self
            .state
            .counters
            .entry(queue_name.to_string())
            .or_insert_with(|| MessageCounter::new(&queue, Utc::now()))
            .clone();
        Ok(counter)
    }

    pub fn list_message_counter(&self, queue_name: &str) -> Result<String> {
        Ok(serde_json::to_string(&self.counter(queue_name)?)?)
    }

    pub fn list_message_counter_history(&self, queue_name: &str) -> Result<String> {
        Ok(serde_json::to_string(&self.counter(queue_name)?.history())?)
    }

    pub fn reset_all(&self) {
        let now = Utc::now();
        for mut counter in self.state.counters.iter_mut() {
            if let Some(queue) = self.state.directory.queue(counter.key()) {
                counter.reset(&queue, now);
            }
        }
        info!("Message counters reset");
    }

    pub fn reset_all_histories(&self) {
        for mut counter in self.state.counters.iter_mut() {
            counter.history.clear();
        }
    }

    pub async fn stop(&self) {
        self.stop_sampler().await;
    }

    fn spawn_sampler(&self) {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let state = self.state.clone();
        let period = Duration::from_millis(state.sample_period_ms.load(Ordering::SeqCst).max(1) as u64);

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => state.sample_all(),
                    _ = shutdown_rx.recv() => {
                        debug!("Message counter sampler shutting down");
                        break;
                    }
                }
            }
        });
        *self.sampler.lock() = Some(SamplerHandle { shutdown_tx, task });
    }

    async fn stop_sampler(&self) {
        let handle = self.sampler.lock().take();
        if let Some(handle) = handle {
            let _ = handle.shutdown_tx.send(());
            if let Err(e) = handle.task.await {
                warn!(error = %e, "Message counter sampler ended abnormally");
            }
        }
    }
}

fn validate_sample_period(period_ms: i64) -> Result<()> {
    if period_ms <= 0 {
        return Err(ControlError::invalid(format!(
            "message counter sample period must be positive, got {}",
            period_ms
        )));
    }
    if period_ms < MIN_RECOMMENDED_SAMPLE_PERIOD_MS {
        warn!(
            sample_period_ms = period_ms,
            minimum_recommended_ms = MIN_RECOMMENDED_SAMPLE_PERIOD_MS,
            "Message counter sample period is very short"
        );
    }
    Ok(())
}

fn validate_max_day_count(count: i64) -> Result<()> {
    if count <= 0 {
        return Err(ControlError::invalid(format!(
            "message counter max day count must be positive, got {}",
            count
        )));
    }
    Ok(())
}
