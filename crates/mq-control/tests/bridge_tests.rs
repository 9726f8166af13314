//! Bridge Tests
//!
//! Tests for:
//! - Forwarding a queue to another in-process node
//! - Retrying transient send failures in order
//! - Returning unconfirmed messages when retries run out
//! - Bounding the initial connect by its attempt count
//! - Stop/start and lifecycle validation

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mq_common::{BridgeConfig, Message, RoutingType, DUPLICATE_ID_PROPERTY};
use mq_control::{
    BridgeState, Broker, BrokerSettings, Connector, ConnectorError, ControlError, QueueSpec,
};
use parking_lot::Mutex;

/// Connector that records sends and fails the first `failures` of them.
struct MockConnector {
    name: String,
    failures: AtomicU32,
    refuse_connect: AtomicBool,
    connect_calls: AtomicU32,
    sent: Mutex<Vec<(String, Message)>>,
}

impl MockConnector {
    fn new(name: &str, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            failures: AtomicU32::new(failures),
            refuse_connect: AtomicBool::new(false),
            connect_calls: AtomicU32::new(0),
            sent: Mutex::new(Vec::new()),
        })
    }

    fn refusing(name: &str) -> Arc<Self> {
        let connector = Self::new(name, 0);
        connector.refuse_connect.store(true, Ordering::SeqCst);
        connector
    }

    fn sent_bodies(&self) -> Vec<Vec<u8>> {
        self.sent.lock().iter().map(|(_, m)| m.body.clone()).collect()
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn factory_class_name(&self) -> &str {
        "mock"
    }

    async fn connect(&self) -> Result<(), ConnectorError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.refuse_connect.load(Ordering::SeqCst) {
            return Err(ConnectorError::Unreachable(self.name.clone()));
        }
        Ok(())
    }

    async fn send(&self, address: &str, message: Message) -> Result<(), ConnectorError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ConnectorError::Unreachable(self.name.clone()));
        }
        self.sent.lock().push((address.to_string(), message));
        Ok(())
    }

    async fn send_to_queue(&self, queue: &str, message: Message) -> Result<(), ConnectorError> {
        self.send(queue, message).await
    }

    async fn create_address(&self, _name: &str, _routing_types: &BTreeSet<RoutingType>) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn create_queue(&self, _spec: &QueueSpec) -> Result<(), ConnectorError> {
        Ok(())
    }
}

/// Poll `condition` until it holds or five seconds pass.
async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn source_with_queue(queue: &str) -> Arc<Broker> {
    let broker = Broker::new(BrokerSettings::default()).unwrap();
    let control = broker.control();
    control.create_address(queue, "ANYCAST").unwrap();
    control
        .create_queue(QueueSpec::new(queue, queue, RoutingType::Anycast))
        .unwrap();
    broker
}

fn fast_retries(name: &str, queue: &str, connector: &str) -> BridgeConfig {
    BridgeConfig {
        retry_interval_ms: 10,
        max_retry_interval_ms: 10,
        ..BridgeConfig::new(name, queue, connector)
    }
}

#[tokio::test]
async fn test_bridge_to_in_vm_node() {
    let source = source_with_queue("outbound");
    let target = source_with_queue("inbound");
    source.connectors().register(target.in_vm_connector("peer"));

    let mut config = BridgeConfig::new("b", "outbound", "peer");
    config.forwarding_address = Some("inbound".to_string());
    source.control().create_bridge(config).await.unwrap();

    for i in 0..10 {
        source
            .send("outbound", Message::new(format!("m-{}", i)))
            .await
            .unwrap();
    }

    let target_queue = target.directory().queue("inbound").unwrap();
    let source_queue = source.directory().queue("outbound").unwrap();
    assert!(
        eventually(|| {
            let done = target_queue.message_count() == 10 && source_queue.message_count() == 0;
            async move { done }
        })
        .await,
        "bridge should move all messages"
    );

    let forwarded = target_queue.browse();
    for (i, message) in forwarded.iter().enumerate() {
        assert_eq!(message.body, format!("m-{}", i).into_bytes());
        assert!(message
            .property(DUPLICATE_ID_PROPERTY)
            .is_some_and(|id| id.starts_with("bridge.b.")));
    }

    let info = source.control().bridge_info("b").unwrap();
    assert_eq!(info.state, BridgeState::Connected);
    assert_eq!(info.forwarded_count, 10);
    assert_eq!(info.connector, "peer");
}

#[tokio::test]
async fn test_bridge_retries_transient_failures() {
    let source = source_with_queue("outbound");
    let connector = MockConnector::new("flaky", 2);
    source.connectors().register(connector.clone());
    source
        .control()
        .create_bridge(fast_retries("b", "outbound", "flaky"))
        .await
        .unwrap();

    for body in ["a", "b", "c"] {
        source.send("outbound", Message::new(body)).await.unwrap();
    }

    assert!(
        eventually(|| {
            let done = connector.sent.lock().len() == 3;
            async move { done }
        })
        .await
    );
    assert_eq!(
        connector.sent_bodies(),
        vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
    );
    // Without a forwarding address messages keep their original address
    assert!(connector.sent.lock().iter().all(|(address, _)| address == "outbound"));

    let info = source.control().bridge_info("b").unwrap();
    assert_eq!(info.retry_count, 2);
    assert!(info.last_error.is_some());
    assert!(
        eventually(|| {
            let done = source.directory().queue("outbound").unwrap().message_count() == 0;
            async move { done }
        })
        .await
    );
}

#[tokio::test]
async fn test_bridge_gives_up_and_returns_messages() {
    let source = source_with_queue("outbound");
    source.connectors().register(MockConnector::new("down", u32::MAX));

    let mut config = fast_retries("b", "outbound", "down");
    config.reconnect_attempts = 1;
    source.control().create_bridge(config).await.unwrap();
    source.send("outbound", Message::new("stuck")).await.unwrap();

    let queue = source.directory().queue("outbound").unwrap();
    let control = source.control();
    assert!(
        eventually(|| {
            let done = control.bridge_info("b").unwrap().state == BridgeState::Stopped
                && queue.consumer_count() == 0;
            async move { done }
        })
        .await,
        "bridge should stop after exhausting retries"
    );

    assert_eq!(queue.message_count(), 1);
    assert_eq!(queue.delivering_count(), 0);
    assert_eq!(control.bridge_info("b").unwrap().retry_count, 1);
}

#[tokio::test]
async fn test_bridge_initial_connect_attempts() {
    let source = source_with_queue("outbound");
    let connector = MockConnector::refusing("offline");
    source.connectors().register(connector.clone());

    let mut config = fast_retries("b", "outbound", "offline");
    config.initial_connect_attempts = 1;
    source.control().create_bridge(config).await.unwrap();

    let control = source.control();
    assert!(
        eventually(|| {
            let done = control.bridge_info("b").unwrap().state == BridgeState::Stopped;
            async move { done }
        })
        .await
    );
    // Longer than several retry intervals
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(connector.connect_calls.load(Ordering::SeqCst), 1);
    assert_eq!(control.bridge_info("b").unwrap().retry_count, 0);
    assert!(control.bridge_info("b").unwrap().last_error.is_some());
}

#[tokio::test]
async fn test_bridge_stop_and_start() {
    let source = source_with_queue("outbound");
    let connector = MockConnector::new("mock", 0);
    source.connectors().register(connector.clone());
    let control = source.control();
    control
        .create_bridge(BridgeConfig::new("b", "outbound", "mock"))
        .await
        .unwrap();

    control.stop_bridge("b").await.unwrap();
    assert_eq!(control.bridge_info("b").unwrap().state, BridgeState::Stopped);

    source.send("outbound", Message::new("held")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(connector.sent.lock().is_empty());
    assert_eq!(source.directory().queue("outbound").unwrap().message_count(), 1);

    control.start_bridge("b").await.unwrap();
    assert!(
        eventually(|| {
            let done = connector.sent.lock().len() == 1;
            async move { done }
        })
        .await
    );

    control.destroy_bridge("b").await.unwrap();
    assert!(control.get_bridge_names().is_empty());
    assert_eq!(source.directory().queue("outbound").unwrap().consumer_count(), 0);
}

#[tokio::test]
async fn test_bridge_validation() {
    let source = source_with_queue("outbound");
    source.connectors().register(MockConnector::new("mock", 0));
    let control = source.control();

    assert!(matches!(
        control
            .create_bridge(BridgeConfig::new("b", "outbound", "nowhere"))
            .await,
        Err(ControlError::UnknownConnector(_))
    ));
    assert!(matches!(
        control
            .create_bridge(BridgeConfig::new("b", "missing", "mock"))
            .await,
        Err(ControlError::UnknownQueue(_))
    ));

    control
        .create_bridge(BridgeConfig::new("b", "outbound", "mock"))
        .await
        .unwrap();
    assert!(matches!(
        control
            .create_bridge(BridgeConfig::new("b", "outbound", "mock"))
            .await,
        Err(ControlError::DuplicateName { kind: "Bridge", .. })
    ));
    assert_eq!(control.get_bridge_names(), vec!["b".to_string()]);

    assert!(matches!(
        control.destroy_bridge("other").await,
        Err(ControlError::UnknownBridge(_))
    ));

    let connectors: serde_json::Value = serde_json::from_str(&control.get_connectors_as_json().unwrap()).unwrap();
    assert_eq!(connectors[0]["name"], "mock");
    assert_eq!(connectors[0]["factoryClassName"], "mock");
}
