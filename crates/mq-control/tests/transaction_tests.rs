//! Prepared Transaction Tests
//!
//! Tests for:
//! - Commit routes enlisted sends and completes acknowledgements
//! - A second resolution of the same id returns false
//! - Rollback returns acknowledged messages to their queue
//! - Heuristic outcome lists and malformed ids

use std::sync::Arc;
use std::time::Duration;

use mq_common::{Message, RoutingType};
use mq_control::{Broker, BrokerSettings, ConsumerHandle, ControlError, QueueSpec, TransactionOperation, Xid};

const RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

fn setup() -> (Arc<Broker>, ConsumerHandle) {
    let broker = Broker::new(BrokerSettings::default()).unwrap();
    let control = broker.control();
    control.create_address("payments", "ANYCAST").unwrap();
    control
        .create_queue(QueueSpec::new("payments", "payments", RoutingType::Anycast))
        .unwrap();

    let connection = broker.open_connection("127.0.0.1:7000", None, None);
    let session = broker.create_session(&connection.connection_id).unwrap();
    let consumer = broker
        .create_consumer(&session.session_id, "payments", None, false)
        .unwrap();
    (broker, consumer)
}

fn xid(gtrid: &str) -> Xid {
    Xid::new(1, gtrid.as_bytes().to_vec(), b"branch-1".to_vec()).unwrap()
}

#[tokio::test]
async fn test_commit_twice() {
    let (broker, consumer) = setup();
    let control = broker.control();

    let id = xid("tx-commit");
    broker
        .prepare(
            id.clone(),
            vec![TransactionOperation::Send {
                address: "payments".to_string(),
                message: Message::new("charge"),
            }],
        )
        .unwrap();

    let prepared = control.list_prepared_transactions();
    assert_eq!(prepared.len(), 1);
    assert_eq!(prepared[0].xid, id);
    // Nothing is routed before commit
    assert_eq!(control.get_message_count(), 0);

    assert!(control.commit_prepared_transaction(&id.encode()).await.unwrap());
    assert!(!control.commit_prepared_transaction(&id.encode()).await.unwrap());
    assert!(!control.rollback_prepared_transaction(&id.encode()).await.unwrap());

    let received = consumer.receive(RECEIVE_TIMEOUT).await.expect("committed send");
    assert_eq!(received.body, b"charge".to_vec());
    assert!(control.list_prepared_transactions().is_empty());
    assert_eq!(control.list_heuristic_committed_transactions(), vec![id.encode()]);
    assert!(control.list_heuristic_rolled_back_transactions().is_empty());
}

#[tokio::test]
async fn test_commit_completes_acknowledgement() {
    let (broker, consumer) = setup();
    let control = broker.control();
    broker.send("payments", Message::new("refund")).await.unwrap();

    let delivered = consumer.receive(RECEIVE_TIMEOUT).await.unwrap();
    let id = xid("tx-ack");
    broker
        .prepare(
            id.clone(),
            vec![TransactionOperation::Acknowledge {
                queue: "payments".to_string(),
                message_id: delivered.id.clone(),
            }],
        )
        .unwrap();

    assert!(control.commit_prepared_transaction(&id.encode()).await.unwrap());
    assert_eq!(control.get_message_count(), 0);
    assert_eq!(control.get_total_messages_acknowledged(), 1);
}

#[tokio::test]
async fn test_rollback_restores_acknowledged_message() {
    let (broker, consumer) = setup();
    let control = broker.control();
    broker.send("payments", Message::new("refund")).await.unwrap();

    let delivered = consumer.receive(RECEIVE_TIMEOUT).await.unwrap();
    let id = xid("tx-rollback");
    broker
        .prepare(
            id.clone(),
            vec![
                TransactionOperation::Acknowledge {
                    queue: "payments".to_string(),
                    message_id: delivered.id.clone(),
                },
                TransactionOperation::Send {
                    address: "payments".to_string(),
                    message: Message::new("discarded"),
                },
            ],
        )
        .unwrap();

    assert!(control.rollback_prepared_transaction(&id.encode()).await.unwrap());
    assert!(!control.rollback_prepared_transaction(&id.encode()).await.unwrap());

    let redelivered = consumer.receive(RECEIVE_TIMEOUT).await.expect("message back on queue");
    assert_eq!(redelivered.id, delivered.id);
    assert!(consumer.receive(Duration::from_millis(100)).await.is_none());
    assert_eq!(control.get_message_count(), 1);
    assert_eq!(control.list_heuristic_rolled_back_transactions(), vec![id.encode()]);
}

#[tokio::test]
async fn test_malformed_and_unknown_ids() {
    let (broker, _consumer) = setup();
    let control = broker.control();

    assert!(matches!(
        control.commit_prepared_transaction("not base64!").await,
        Err(ControlError::InvalidArgument(_))
    ));
    assert!(matches!(
        control.rollback_prepared_transaction("AAAA").await,
        Err(ControlError::InvalidArgument(_))
    ));

    // Well formed but never prepared
    assert!(!control.commit_prepared_transaction(&xid("unknown").encode()).await.unwrap());
}

#[tokio::test]
async fn test_duplicate_prepare_and_details() {
    let (broker, _consumer) = setup();
    let control = broker.control();
    let id = xid("tx-details");
    let message = Message::new("x").with_property("kind", "charge");

    broker
        .prepare(
            id.clone(),
            vec![TransactionOperation::Send {
                address: "payments".to_string(),
                message,
            }],
        )
        .unwrap();
    assert!(matches!(
        broker.prepare(id.clone(), Vec::new()),
        Err(ControlError::DuplicateName { .. })
    ));

    let details: serde_json::Value =
        serde_json::from_str(&control.list_prepared_transaction_details_as_json().unwrap()).unwrap();
    let details = details.as_array().unwrap();
    assert_eq!(details.len(), 1);
    assert_eq!(details[0]["xid"], id.encode());
    assert_eq!(details[0]["formatId"], 1);
    assert_eq!(details[0]["operations"][0]["type"], "SEND");
    assert_eq!(details[0]["operations"][0]["address"], "payments");
    assert_eq!(details[0]["operations"][0]["properties"]["kind"], "charge");
}
