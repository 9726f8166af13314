//! Scale-down
//!
//! Moves every address, durable queue and queued message of a retiring node
//! to a peer. Queues migrate concurrently; within a queue messages are sent
//! one at a time in order and removed locally only after the peer confirms,
//! so delivery is at-least-once and a retried send is dropped by the peer's
//! duplicate detection. A failing queue stops further migration but leaves
//! queues already moved on the peer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mq_common::DUPLICATE_ID_PROPERTY;
use tracing::{debug, error, info};

use crate::broker_metrics;
use crate::connector::Connector;
use crate::directory::ResourceDirectory;
use crate::error::ControlError;
use crate::queue::{Queue, QueueSpec};
use crate::Result;

/// Outcome of migrating one queue.
#[derive(Debug, Default)]
struct QueueMigration {
    migrated: u64,
    error: Option<String>,
}

/// Migrate the directory's contents through `connector`. The caller must
/// already have stopped new resources, forwarders and consumers.
pub(crate) async fn migrate(directory: &ResourceDirectory, connector: Arc<dyn Connector>) -> Result<u64> {
    connector
        .connect()
        .await
        .map_err(|e| ControlError::MigrationFailed(format!("connect to {}: {}", connector.name(), e)))?;

    for address in directory.addresses() {
        connector
            .create_address(&address.name, &address.routing_types)
            .await
            .map_err(|e| ControlError::MigrationFailed(format!("address {}: {}", address.name, e)))?;
    }

    let queues: Vec<Arc<Queue>> = directory
        .queues()
        .into_iter()
        .filter(|q| q.is_durable() && !q.is_temporary())
        .collect();
    info!(
        target_connector = %connector.name(),
        queues = queues.len(),
        "Scale-down migrating queues"
    );

    let abort = Arc::new(AtomicBool::new(false));
    let migrations: Vec<_> = queues
        .iter()
        .map(|queue| {
            let queue = queue.clone();
            let connector = connector.clone();
            let abort = abort.clone();
            async move { migrate_queue(&queue, connector.as_ref(), &abort).await }
        })
        .collect();
    let results = futures::future::join_all(migrations).await;

    let mut migrated = 0;
    let mut errors = Vec::new();
    for result in results {
        migrated += result.migrated;
        if let Some(e) = result.error {
            errors.push(e);
        }
    }

    if !errors.is_empty() {
        error!(migrated, errors = ?errors, "Scale-down migration failed");
        return Err(ControlError::MigrationFailed(errors.join("; ")));
    }
    info!(migrated, "Scale-down migration complete");
    Ok(migrated)
}

async fn migrate_queue(queue: &Queue, connector: &dyn Connector, abort: &AtomicBool) -> QueueMigration {
    let mut outcome = QueueMigration::default();

    let mut spec = QueueSpec::new(queue.address(), queue.name(), queue.routing_type())
        .durable(queue.is_durable())
        .max_consumers(queue.max_consumers())
        .purge_on_no_consumers(queue.is_purge_on_no_consumers())
        .auto_create_address(true);
    if let Some(filter) = queue.filter() {
        spec = spec.filter(filter.expression());
    }
    if let Err(e) = connector.create_queue(&spec).await {
        abort.store(true, Ordering::SeqCst);
        outcome.error = Some(format!("queue {}: {}", queue.name(), e));
        return outcome;
    }

    while !abort.load(Ordering::SeqCst) {
        let Some((seq, message)) = queue.take_for_migration() else {
            break;
        };

        let mut outgoing = message.clone();
        if outgoing.duplicate_id().is_none() {
            outgoing.set_property(
                DUPLICATE_ID_PROPERTY,
                format!("scale-down.{}.{}", queue.name(), message.id),
            );
        }

        match connector.send_to_queue(queue.name(), outgoing).await {
            Ok(()) => {
                queue.confirm_migrated(&message);
                outcome.migrated += 1;
            }
            Err(e) => {
                queue.restore_migration(seq, message);
                abort.store(true, Ordering::SeqCst);
                outcome.error = Some(format!("queue {}: {}", queue.name(), e));
                break;
            }
        }
    }

    broker_metrics::record_messages_migrated(queue.name(), outcome.migrated);
    debug!(queue = %queue.name(), migrated = outcome.migrated, "Queue migrated");
    outcome
}
