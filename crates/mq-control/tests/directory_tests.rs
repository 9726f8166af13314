//! Resource Directory Tests
//!
//! Tests for:
//! - Queue create/destroy round trips leave the directory unchanged
//! - Auto-created and auto-deleted addresses
//! - Address in use, queue in use and routing type conflicts
//! - ANYCAST/MULTICAST delivery and duplicate detection
//! - Refusing new resources once the node stops
//! - Concurrent create/destroy of one name has a single winner

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use mq_common::{Message, RoutingType};
use mq_control::{Broker, BrokerSettings, ControlError, QueueSpec};

fn broker() -> Arc<Broker> {
    Broker::new(BrokerSettings::default()).unwrap()
}

fn types(list: &[RoutingType]) -> BTreeSet<RoutingType> {
    list.iter().copied().collect()
}

#[tokio::test]
async fn test_create_destroy_queue_round_trip() {
    let broker = broker();
    let control = broker.control();
    control.create_address("orders", "ANYCAST,MULTICAST").unwrap();

    let queues_before = control.get_queue_names(None).unwrap();
    let addresses_before = control.get_address_names();

    for routing_type in [RoutingType::Anycast, RoutingType::Multicast] {
        control
            .create_queue(QueueSpec::new("orders", "orders.q", routing_type))
            .unwrap();
        assert_eq!(control.get_queue_names(None).unwrap(), vec!["orders.q".to_string()]);

        control.destroy_queue("orders.q").unwrap();
        assert_eq!(control.get_queue_names(None).unwrap(), queues_before);
        assert_eq!(control.get_address_names(), addresses_before);
    }
}

#[tokio::test]
async fn test_destroying_last_queue_can_delete_address() {
    let broker = broker();
    let control = broker.control();

    control
        .create_queue(QueueSpec::new("events", "events.q", RoutingType::Multicast).auto_create_address(true))
        .unwrap();
    assert_eq!(control.get_address_names(), vec!["events".to_string()]);

    control.destroy_queue_with("events.q", false, true).unwrap();
    assert!(control.get_address_names().is_empty());
    assert!(control.get_queue_names(None).unwrap().is_empty());
}

#[tokio::test]
async fn test_create_queue_requires_address_unless_auto_created() {
    let broker = broker();
    let control = broker.control();

    let err = control
        .create_queue(QueueSpec::new("missing", "q", RoutingType::Anycast))
        .unwrap_err();
    assert!(matches!(err, ControlError::UnknownAddress(ref a) if a == "missing"));
    assert!(control.get_address_names().is_empty());
}

#[tokio::test]
async fn test_duplicate_queue_rejected() {
    let broker = broker();
    let control = broker.control();
    control.create_address("a", "ANYCAST").unwrap();
    control.create_queue(QueueSpec::new("a", "q", RoutingType::Anycast)).unwrap();

    let err = control
        .create_queue(QueueSpec::new("a", "q", RoutingType::Anycast))
        .unwrap_err();
    assert!(matches!(err, ControlError::DuplicateName { kind: "Queue", .. }));
}

#[tokio::test]
async fn test_create_address_is_idempotent_for_subsets() {
    let broker = broker();
    let directory = broker.directory();

    assert!(directory
        .create_address("a", types(&[RoutingType::Anycast, RoutingType::Multicast]))
        .unwrap());
    assert!(!directory.create_address("a", types(&[RoutingType::Anycast])).unwrap());

    directory.create_address("b", types(&[RoutingType::Anycast])).unwrap();
    let err = directory
        .create_address("b", types(&[RoutingType::Multicast]))
        .unwrap_err();
    assert!(matches!(err, ControlError::RoutingTypeConflict { .. }));
}

#[tokio::test]
async fn test_queue_routing_type_must_be_enabled_on_address() {
    let broker = broker();
    let control = broker.control();
    control.create_address("a", "MULTICAST").unwrap();

    let err = control
        .create_queue(QueueSpec::new("a", "q", RoutingType::Anycast))
        .unwrap_err();
    assert!(matches!(err, ControlError::RoutingTypeConflict { .. }));
}

#[tokio::test]
async fn test_delete_address_in_use_needs_force() {
    let broker = broker();
    let control = broker.control();
    control.create_address("a", "MULTICAST").unwrap();
    control.create_queue(QueueSpec::new("a", "q1", RoutingType::Multicast)).unwrap();
    control.create_queue(QueueSpec::new("a", "q2", RoutingType::Multicast)).unwrap();

    let err = control.delete_address("a", false).unwrap_err();
    assert!(matches!(err, ControlError::AddressInUse { queue_count: 2, .. }));

    control.delete_address("a", true).unwrap();
    assert!(control.get_address_names().is_empty());
    assert!(control.get_queue_names(None).unwrap().is_empty());

    assert!(matches!(
        control.delete_address("a", false),
        Err(ControlError::UnknownAddress(_))
    ));
}

#[tokio::test]
async fn test_destroy_queue_with_consumers() {
    let broker = broker();
    let control = broker.control();
    control.create_address("a", "ANYCAST").unwrap();
    control.create_queue(QueueSpec::new("a", "q", RoutingType::Anycast)).unwrap();

    let connection = broker.open_connection("127.0.0.1:5000", Some("alice"), None);
    let session = broker.create_session(&connection.connection_id).unwrap();
    let consumer = broker.create_consumer(&session.session_id, "q", None, false).unwrap();

    let err = control.destroy_queue("q").unwrap_err();
    assert!(matches!(err, ControlError::QueueInUse { consumer_count: 1, .. }));

    control.destroy_queue_removing_consumers("q", true).unwrap();
    assert!(control.get_queue_names(None).unwrap().is_empty());

    tokio::time::timeout(Duration::from_secs(2), consumer.closed())
        .await
        .expect("consumer should be closed by the broker");
    assert!(consumer.is_closed());

    assert!(matches!(control.destroy_queue("q"), Err(ControlError::UnknownQueue(_))));
}

#[tokio::test]
async fn test_get_queue_names_by_routing_type() {
    let broker = broker();
    let control = broker.control();
    control.create_address("a", "ANYCAST,MULTICAST").unwrap();
    control.create_queue(QueueSpec::new("a", "any", RoutingType::Anycast)).unwrap();
    control.create_queue(QueueSpec::new("a", "multi", RoutingType::Multicast)).unwrap();

    assert_eq!(control.get_queue_names(Some("ANYCAST")).unwrap(), vec!["any".to_string()]);
    assert_eq!(control.get_queue_names(Some("multicast")).unwrap(), vec!["multi".to_string()]);
    assert_eq!(control.get_queue_names(Some("")).unwrap().len(), 2);
    assert!(matches!(
        control.get_queue_names(Some("BROADCAST")),
        Err(ControlError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_multicast_fans_out_and_anycast_picks_one() {
    let broker = broker();
    let control = broker.control();
    control.create_address("fan", "MULTICAST").unwrap();
    control.create_queue(QueueSpec::new("fan", "fan.1", RoutingType::Multicast)).unwrap();
    control.create_queue(QueueSpec::new("fan", "fan.2", RoutingType::Multicast)).unwrap();
    control.create_address("work", "ANYCAST").unwrap();
    control.create_queue(QueueSpec::new("work", "work.1", RoutingType::Anycast)).unwrap();
    control.create_queue(QueueSpec::new("work", "work.2", RoutingType::Anycast)).unwrap();

    let outcome = broker.send("fan", Message::new("hello")).await.unwrap();
    assert_eq!(outcome.queues.len(), 2);

    for i in 0..4 {
        let outcome = broker.send("work", Message::new(format!("job-{}", i))).await.unwrap();
        assert_eq!(outcome.queues.len(), 1);
    }
    let work1 = broker.directory().queue("work.1").unwrap().message_count();
    let work2 = broker.directory().queue("work.2").unwrap().message_count();
    assert_eq!(work1 + work2, 4);
    assert_eq!(work1, 2);
    assert_eq!(control.get_message_count(), 6);
}

#[tokio::test]
async fn test_duplicate_detection_drops_repeats() {
    let broker = broker();
    let control = broker.control();
    control.create_address("a", "ANYCAST").unwrap();
    control.create_queue(QueueSpec::new("a", "q", RoutingType::Anycast)).unwrap();

    let first = broker
        .send("a", Message::new("x").with_duplicate_id("order-1"))
        .await
        .unwrap();
    assert!(first.is_routed());

    let second = broker
        .send("a", Message::new("x").with_duplicate_id("order-1"))
        .await
        .unwrap();
    assert!(second.duplicate);
    assert_eq!(broker.directory().queue("q").unwrap().message_count(), 1);
}

#[tokio::test]
async fn test_send_auto_creates_address_and_queue() {
    let broker = broker();
    let outcome = broker.send("fresh", Message::new("x")).await.unwrap();
    assert_eq!(outcome.queues, vec!["fresh".to_string()]);

    let info = broker.control().address_info("fresh").unwrap();
    assert!(info.auto_created);
    assert!(broker.directory().queue("fresh").unwrap().is_auto_created());
}

#[tokio::test]
async fn test_stopped_broker_refuses_new_resources() {
    let broker = broker();
    broker.stop().await;
    assert!(!broker.is_active());

    let control = broker.control();
    assert!(matches!(
        control.create_address("a", "ANYCAST"),
        Err(ControlError::ShuttingDown)
    ));
    assert!(matches!(
        broker.send("a", Message::new("x")).await,
        Err(ControlError::ShuttingDown)
    ));
}

#[tokio::test]
async fn test_queue_addressed_duplicates_are_tracked_per_queue() {
    let broker = broker();
    let control = broker.control();
    control.create_address("news", "MULTICAST").unwrap();
    for name in ["sub-a", "sub-b"] {
        control
            .create_queue(QueueSpec::new("news", name, RoutingType::Multicast))
            .unwrap();
    }
    let directory = broker.directory();
    let message = Message::new("story").with_duplicate_id("story-1");

    assert!(directory.deliver_to_queue("sub-a", message.clone()).unwrap());
    assert!(directory.deliver_to_queue("sub-b", message.clone()).unwrap());
    // A resend to the same queue is still recognised
    assert!(!directory.deliver_to_queue("sub-a", message).unwrap());

    assert_eq!(directory.queue("sub-a").unwrap().message_count(), 1);
    assert_eq!(directory.queue("sub-b").unwrap().message_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_queue_create_and_destroy() {
    let broker = broker();
    broker.control().create_address("race", "ANYCAST").unwrap();

    for round in 0..200 {
        let name = format!("race.{}", round);
        let creates: Vec<_> = (0..8)
            .map(|_| {
                let broker = broker.clone();
                let name = name.clone();
                tokio::spawn(async move {
                    broker
                        .control()
                        .create_queue(QueueSpec::new("race", &name, RoutingType::Anycast))
                })
            })
            .collect();
        let mut created = 0;
        for create in futures::future::join_all(creates).await {
            match create.unwrap() {
                Ok(()) => created += 1,
                Err(e) => assert!(matches!(e, ControlError::DuplicateName { .. }), "{:?}", e),
            }
        }
        assert_eq!(created, 1, "round {}", round);

        let destroys: Vec<_> = (0..8)
            .map(|_| {
                let broker = broker.clone();
                let name = name.clone();
                tokio::spawn(async move { broker.control().destroy_queue(&name) })
            })
            .collect();
        let mut destroyed = 0;
        for destroy in futures::future::join_all(destroys).await {
            match destroy.unwrap() {
                Ok(()) => destroyed += 1,
                Err(e) => assert!(matches!(e, ControlError::UnknownQueue(_)), "{:?}", e),
            }
        }
        assert_eq!(destroyed, 1, "round {}", round);
    }
    assert!(broker.control().get_queue_names(None).unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_address_create_and_delete() {
    let broker = broker();

    for round in 0..200 {
        let name = format!("addr.{}", round);
        let creates: Vec<_> = (0..8)
            .map(|_| {
                let broker = broker.clone();
                let name = name.clone();
                tokio::spawn(async move {
                    broker
                        .directory()
                        .create_address(&name, types(&[RoutingType::Anycast]))
                })
            })
            .collect();
        // Creating an existing address is idempotent; only one call creates it
        let mut created = 0;
        for create in futures::future::join_all(creates).await {
            if create.unwrap().unwrap() {
                created += 1;
            }
        }
        assert_eq!(created, 1, "round {}", round);

        let deletes: Vec<_> = (0..8)
            .map(|_| {
                let broker = broker.clone();
                let name = name.clone();
                tokio::spawn(async move { broker.control().delete_address(&name, true) })
            })
            .collect();
        let mut deleted = 0;
        for delete in futures::future::join_all(deletes).await {
            match delete.unwrap() {
                Ok(()) => deleted += 1,
                Err(e) => assert!(matches!(e, ControlError::UnknownAddress(_)), "{:?}", e),
            }
        }
        assert_eq!(deleted, 1, "round {}", round);
    }
    assert!(broker.control().get_address_names().is_empty());
}
