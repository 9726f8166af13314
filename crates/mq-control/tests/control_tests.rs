//! Server Control Tests
//!
//! Tests for:
//! - Bootstrapping a node from a TOML configuration file
//! - Connector service lifecycle through registered factories
//! - Message counter sampling, reset and validation
//! - Node-wide aggregates

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use mq_common::{Message, RoutingType};
use mq_config::{AppConfig, ConfigLoader};
use mq_control::{
    Broker, BrokerSettings, ConnectorService, ConnectorServiceFactory, ControlError, QueueSpec,
};
use parking_lot::Mutex;
use tokio_test::{assert_err, assert_ok};

struct RecordingService {
    name: String,
    started: AtomicBool,
    stops: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ConnectorService for RecordingService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> mq_control::Result<()> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> mq_control::Result<()> {
        self.started.store(false, Ordering::SeqCst);
        self.stops.lock().push(self.name.clone());
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct RecordingFactory {
    stops: Arc<Mutex<Vec<String>>>,
}

impl ConnectorServiceFactory for RecordingFactory {
    fn create(
        &self,
        name: &str,
        params: &BTreeMap<String, String>,
    ) -> mq_control::Result<Arc<dyn ConnectorService>> {
        if params.contains_key("fail") {
            return Err(ControlError::InvalidArgument("fail requested".to_string()));
        }
        Ok(Arc::new(RecordingService {
            name: name.to_string(),
            started: AtomicBool::new(false),
            stops: self.stops.clone(),
        }))
    }
}

fn broker() -> Arc<Broker> {
    mq_common::logging::init_test_logging();
    Broker::new(BrokerSettings::default()).unwrap()
}

#[tokio::test]
async fn test_broker_from_config_file() {
    mq_common::logging::init_test_logging();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(AppConfig::example_toml().as_bytes()).unwrap();

    let config = ConfigLoader::with_path(file.path())
        .without_search_paths()
        .load()
        .unwrap();
    let broker = Broker::from_config(&config).await.unwrap();
    let control = broker.control();

    assert_eq!(control.name(), "mq-broker");
    assert!(control.is_active());
    assert!(!control.version().is_empty());
    assert_eq!(control.get_address_names(), vec!["orders".to_string()]);
    assert_eq!(control.get_queue_names(None).unwrap(), vec!["orders.priority".to_string()]);
    assert_eq!(control.get_divert_names(), vec!["orders-audit".to_string()]);
    assert!(control.is_message_counter_enabled());

    let settings = control.get_address_settings("orders.eu");
    assert_eq!(settings.dead_letter_address.as_deref(), Some("DLQ"));
    assert_eq!(settings.max_delivery_attempts, 5);

    let roles = control.get_roles("orders.eu");
    let names: Vec<&str> = roles.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["consumer", "producer"]);

    broker.stop().await;
    assert!(!control.is_active());
}

#[tokio::test]
async fn test_connector_service_lifecycle() {
    let broker = broker();
    let factory = Arc::new(RecordingFactory::default());
    let stops = factory.stops.clone();
    broker.connector_services().register_factory("recording", factory);
    let control = broker.control();

    let params = BTreeMap::from([("endpoint".to_string(), "tcp://peer:61616".to_string())]);
    assert_ok!(control.create_connector_service("svc", "recording", params).await);

    let info = control.connector_service_info("svc").unwrap();
    assert!(info.started);
    assert_eq!(info.factory_name, "recording");
    assert_eq!(info.params["endpoint"], "tcp://peer:61616");
    assert_eq!(control.get_connector_services(), vec!["svc".to_string()]);

    assert!(matches!(
        control
            .create_connector_service("svc", "recording", BTreeMap::new())
            .await,
        Err(ControlError::DuplicateName { .. })
    ));
    assert!(matches!(
        control
            .create_connector_service("other", "no-such-factory", BTreeMap::new())
            .await,
        Err(ControlError::InvalidArgument(_))
    ));

    let failing = BTreeMap::from([("fail".to_string(), "yes".to_string())]);
    assert_err!(control.create_connector_service("bad", "recording", failing).await);
    assert_eq!(control.get_connector_services(), vec!["svc".to_string()]);

    assert_ok!(control.destroy_connector_service("svc").await);
    assert_eq!(*stops.lock(), vec!["svc".to_string()]);
    assert!(control.get_connector_services().is_empty());

    assert!(matches!(
        control.destroy_connector_service("svc").await,
        Err(ControlError::UnknownConnectorService(_))
    ));
}

#[tokio::test]
async fn test_connector_services_stop_with_broker() {
    let broker = broker();
    let factory = Arc::new(RecordingFactory::default());
    let stops = factory.stops.clone();
    broker.connector_services().register_factory("recording", factory);

    let control = broker.control();
    assert_ok!(control.create_connector_service("a", "recording", BTreeMap::new()).await);
    assert_ok!(control.create_connector_service("b", "recording", BTreeMap::new()).await);

    broker.stop().await;
    let mut stopped = stops.lock().clone();
    stopped.sort();
    assert_eq!(stopped, vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test]
async fn test_message_counter_settings_validation() {
    let broker = broker();
    let control = broker.control();

    assert_eq!(control.get_message_counter_sample_period(), 10_000);
    assert_eq!(control.get_message_counter_max_day_count(), 10);

    assert!(matches!(
        control.set_message_counter_sample_period(0).await,
        Err(ControlError::InvalidArgument(_))
    ));
    assert!(matches!(
        control.set_message_counter_max_day_count(0),
        Err(ControlError::InvalidArgument(_))
    ));
    assert_eq!(control.get_message_counter_sample_period(), 10_000);

    // Short periods are accepted with a warning
    assert_ok!(control.set_message_counter_sample_period(500).await);
    assert_eq!(control.get_message_counter_sample_period(), 500);
    assert_ok!(control.set_message_counter_max_day_count(3));
    assert_eq!(control.get_message_counter_max_day_count(), 3);

    control.enable_message_counters();
    assert!(control.is_message_counter_enabled());
    assert_ok!(control.set_message_counter_sample_period(1_000).await);
    control.disable_message_counters().await;
    assert!(!control.is_message_counter_enabled());
}

#[tokio::test]
async fn test_message_counter_sampling() {
    let broker = broker();
    let control = broker.control();
    control.create_address("jobs", "ANYCAST").unwrap();
    control
        .create_queue(QueueSpec::new("jobs", "jobs", RoutingType::Anycast))
        .unwrap();

    broker.message_counters().sample_now();
    for i in 0..3 {
        broker.send("jobs", Message::new(format!("job-{}", i))).await.unwrap();
    }
    broker.message_counters().sample_now();

    let counter: serde_json::Value =
        serde_json::from_str(&control.list_message_counter("jobs").unwrap()).unwrap();
    assert_eq!(counter["destinationName"], "jobs");
    assert_eq!(counter["count"], 3);
    assert_eq!(counter["countDelta"], 3);
    assert_eq!(counter["messageCount"], 3);
    assert_eq!(counter["messageCountDelta"], 3);

    let history: serde_json::Value =
        serde_json::from_str(&control.list_message_counter_history("jobs").unwrap()).unwrap();
    let days = history.as_array().unwrap();
    assert_eq!(days.len(), 1);
    let total: u64 = days[0]["counts"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c.as_u64().unwrap())
        .sum();
    assert_eq!(total, 3);

    control.reset_all_message_counters();
    let counter = broker.message_counters().counter("jobs").unwrap();
    assert_eq!(counter.count, 0);
    assert_eq!(counter.message_count, 3);

    control.reset_all_message_counter_histories();
    assert!(broker.message_counters().counter("jobs").unwrap().history().is_empty());

    assert!(matches!(
        control.list_message_counter("missing"),
        Err(ControlError::UnknownQueue(_))
    ));
}

#[tokio::test]
async fn test_aggregates() {
    let broker = broker();
    let control = broker.control();
    control.create_address("a", "MULTICAST").unwrap();
    control.create_queue(QueueSpec::new("a", "a.1", RoutingType::Multicast)).unwrap();
    control.create_queue(QueueSpec::new("a", "a.2", RoutingType::Multicast)).unwrap();

    broker.send("a", Message::new(vec![0u8; 256])).await.unwrap();

    assert_eq!(control.get_message_count(), 2);
    assert_eq!(control.get_total_messages_added(), 2);
    assert_eq!(control.get_total_messages_acknowledged(), 0);
    assert_eq!(control.get_total_consumer_count(), 0);

    let size = control.get_address_size("a").unwrap();
    assert!(size > 512);
    assert_eq!(control.get_address_memory_usage(), size);
    // No global limit configured
    assert_eq!(control.get_address_memory_usage_percentage(), 0);

    assert!(matches!(
        control.get_address_size("missing"),
        Err(ControlError::UnknownAddress(_))
    ));
}
