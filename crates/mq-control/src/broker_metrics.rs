//! Metrics for the broker control plane
//!
//! Recorded through the `metrics` facade; an exporter is installed by
//! the embedding process if it wants them.

use metrics::{counter, gauge};

/// Record a message routed to an address
pub fn record_message_routed(address: &str, queues: usize) {
    counter!(
        "mq_messages_routed_total",
        "address" => address.to_string()
    )
    .increment(1);
    if queues == 0 {
        record_message_dropped(address, "no_route");
    }
}

/// Record a message consumed by an exclusive divert on its source address
pub fn record_message_diverted(address: &str) {
    counter!(
        "mq_messages_diverted_total",
        "address" => address.to_string()
    )
    .increment(1);
}

/// Record a message dropped before reaching any queue
pub fn record_message_dropped(address: &str, reason: &str) {
    counter!(
        "mq_messages_dropped_total",
        "address" => address.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record a message forwarded by a divert
pub fn record_divert_forwarded(divert: &str) {
    counter!(
        "mq_divert_forwarded_total",
        "divert" => divert.to_string()
    )
    .increment(1);
}

/// Record a message confirmed by a bridge target
pub fn record_bridge_forwarded(bridge: &str) {
    counter!(
        "mq_bridge_forwarded_total",
        "bridge" => bridge.to_string()
    )
    .increment(1);
}

/// Record a failed bridge send or connect attempt
pub fn record_bridge_failure(bridge: &str) {
    counter!(
        "mq_bridge_failures_total",
        "bridge" => bridge.to_string()
    )
    .increment(1);
}

/// Record queue creation or destruction and update the live count
pub fn record_queue_lifecycle(event: &str, live_queues: usize) {
    counter!(
        "mq_queue_lifecycle_total",
        "event" => event.to_string()
    )
    .increment(1);
    gauge!("mq_queues").set(live_queues as f64);
}

/// Record messages moved to a peer during scale-down
pub fn record_messages_migrated(queue: &str, count: u64) {
    counter!(
        "mq_scale_down_migrated_total",
        "queue" => queue.to_string()
    )
    .increment(count);
}
