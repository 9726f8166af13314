//! Prepared transactions
//!
//! Two-phase-commit transactions that finished phase one wait here until an
//! operator (or the transaction manager) commits or rolls them back. Commit
//! and rollback of an id that is no longer prepared return `false`, so the
//! resolution can be retried safely. Operator resolutions are remembered as
//! heuristic outcomes.

use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mq_common::Message;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::directory::ResourceDirectory;
use crate::error::ControlError;
use crate::Result;

/// Upper bound on the global id and branch qualifier lengths.
pub const MAX_XID_PART_LEN: usize = 64;

/// Transaction branch identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Xid {
    pub format_id: i32,
    pub global_transaction_id: Vec<u8>,
    pub branch_qualifier: Vec<u8>,
}

impl Xid {
    pub fn new(
        format_id: i32,
        global_transaction_id: impl Into<Vec<u8>>,
        branch_qualifier: impl Into<Vec<u8>>,
    ) -> Result<Self> {
        let xid = Self {
            format_id,
            global_transaction_id: global_transaction_id.into(),
            branch_qualifier: branch_qualifier.into(),
        };
        if xid.global_transaction_id.len() > MAX_XID_PART_LEN || xid.branch_qualifier.len() > MAX_XID_PART_LEN {
            return Err(ControlError::invalid(format!(
                "xid parts are limited to {} bytes",
                MAX_XID_PART_LEN
            )));
        }
        Ok(xid)
    }

    /// Base64 of `format_id (BE) | gtrid len | gtrid | bqual len | bqual`.
    pub fn encode(&self) -> String {
        let mut bytes =
            Vec::with_capacity(6 + self.global_transaction_id.len() + self.branch_qualifier.len());
        bytes.extend_from_slice(&self.format_id.to_be_bytes());
        bytes.push(self.global_transaction_id.len() as u8);
        bytes.extend_from_slice(&self.global_transaction_id);
        bytes.push(self.branch_qualifier.len() as u8);
        bytes.extend_from_slice(&self.branch_qualifier);
        STANDARD.encode(bytes)
    }

    pub fn decode(text: &str) -> Result<Self> {
        let malformed = || ControlError::invalid(format!("malformed transaction id: {}", text));
        let bytes = STANDARD.decode(text.trim()).map_err(|_| malformed())?;

        let (format_id, rest) = bytes.split_first_chunk::<4>().ok_or_else(malformed)?;
        let (gtrid_len, rest) = rest.split_first().ok_or_else(malformed)?;
        let (gtrid, rest) = split_at_checked(rest, *gtrid_len as usize).ok_or_else(malformed)?;
        let (bqual_len, rest) = rest.split_first().ok_or_else(malformed)?;
        let (bqual, rest) = split_at_checked(rest, *bqual_len as usize).ok_or_else(malformed)?;
        if !rest.is_empty() {
            return Err(malformed());
        }
        Self::new(i32::from_be_bytes(*format_id), gtrid, bqual)
    }
}

fn split_at_checked(bytes: &[u8], mid: usize) -> Option<(&[u8], &[u8])> {
    (mid <= bytes.len()).then(|| bytes.split_at(mid))
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Work enlisted in a transaction branch.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionOperation {
    /// Route `message` to `address` on commit
    Send { address: String, message: Message },
    /// Acknowledge a delivered message on commit
    #[serde(rename_all = "camelCase")]
    Acknowledge { queue: String, message_id: String },
}

#[derive(Debug, Clone)]
pub struct PreparedTransaction {
    pub xid: Xid,
    pub operations: Vec<TransactionOperation>,
    pub prepared_at: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OperationDetail<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    address: Option<&'a str>,
    queue: Option<&'a str>,
    message_id: &'a str,
    durable: Option<bool>,
    properties: Option<&'a std::collections::BTreeMap<String, String>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TransactionDetail<'a> {
    xid: String,
    format_id: i32,
    creation_time: i64,
    operations: Vec<OperationDetail<'a>>,
}

impl PreparedTransaction {
    fn detail(&self) -> TransactionDetail<'_> {
        let operations = self
            .operations
            .iter()
            .map(|op| match op {
                TransactionOperation::Send { address, message } => OperationDetail {
                    kind: "SEND",
                    address: Some(address.as_str()),
                    queue: None,
                    message_id: message.id.as_str(),
                    durable: Some(message.durable),
                    properties: Some(&message.properties),
                },
                TransactionOperation::Acknowledge { queue, message_id } => OperationDetail {
                    kind: "ACKNOWLEDGE",
                    address: None,
                    queue: Some(queue.as_str()),
                    message_id: message_id.as_str(),
                    durable: None,
                    properties: None,
                },
            })
            .collect();
        TransactionDetail {
            xid: self.xid.encode(),
            format_id: self.xid.format_id,
            creation_time: self.prepared_at.timestamp_millis(),
            operations,
        }
    }
}

/// Holds prepared branches and resolves them against the directory.
pub struct ResourceManager {
    directory: Arc<ResourceDirectory>,
    prepared: DashMap<Xid, PreparedTransaction>,
    heuristic_committed: Mutex<Vec<Xid>>,
    heuristic_rolled_back: Mutex<Vec<Xid>>,
}

impl ResourceManager {
    pub fn new(directory: Arc<ResourceDirectory>) -> Self {
        Self {
            directory,
            prepared: DashMap::new(),
            heuristic_committed: Mutex::new(Vec::new()),
            heuristic_rolled_back: Mutex::new(Vec::new()),
        }
    }

    /// Record the outcome of phase one.
    pub fn prepare(&self, xid: Xid, operations: Vec<TransactionOperation>) -> Result<()> {
        match self.prepared.entry(xid.clone()) {
            Entry::Occupied(_) => Err(ControlError::duplicate("Transaction", &xid.encode())),
            Entry::Vacant(vacant) => {
                debug!(xid = %xid, operations = operations.len(), "Transaction prepared");
                vacant.insert(PreparedTransaction {
                    xid,
                    operations,
                    prepared_at: Utc::now(),
                });
                Ok(())
            }
        }
    }

    /// Prepared transactions, oldest first.
    pub fn list_prepared(&self) -> Vec<PreparedTransaction> {
        let mut prepared: Vec<PreparedTransaction> = self.prepared.iter().map(|t| t.value().clone()).collect();
        prepared.sort_by(|a, b| {
            a.prepared_at
                .cmp(&b.prepared_at)
                .then_with(|| a.xid.encode().cmp(&b.xid.encode()))
        });
        prepared
    }

    pub fn list_prepared_details_as_json(&self) -> Result<String> {
        let prepared = self.list_prepared();
        let details: Vec<TransactionDetail<'_>> = prepared.iter().map(|t| t.detail()).collect();
        Ok(serde_json::to_string(&details)?)
    }

    /// Commit a prepared transaction by its encoded id. Returns false when
    /// no transaction with that id is prepared.
    pub async fn commit(&self, xid: &str) -> Result<bool> {
        let xid = Xid::decode(xid)?;
        if !self.directory.is_active() {
            return Err(ControlError::ShuttingDown);
        }
        let Some((_, transaction)) = self.prepared.remove(&xid) else {
            return Ok(false);
        };

        for operation in transaction.operations {
            match operation {
                TransactionOperation::Send { address, message } => {
                    if let Err(e) = self.directory.route(&address, message).await {
                        warn!(xid = %xid, address = %address, error = %e, "Committed send could not be routed");
                    }
                }
                TransactionOperation::Acknowledge { queue, message_id } => {
                    self.acknowledge(&queue, &message_id);
                }
            }
        }

        self.heuristic_committed.lock().push(xid.clone());
        info!(xid = %xid, "Prepared transaction committed");
        Ok(true)
    }

    /// Roll back a prepared transaction by its encoded id. Sends are
    /// discarded and acknowledged messages return to their queues.
    pub async fn rollback(&self, xid: &str) -> Result<bool> {
        let xid = Xid::decode(xid)?;
        let Some((_, transaction)) = self.prepared.remove(&xid) else {
            return Ok(false);
        };

        for operation in transaction.operations {
            if let TransactionOperation::Acknowledge { queue, message_id } = operation {
                if let Some(queue) = self.directory.queue(&queue) {
                    queue.cancel(&message_id);
                }
            }
        }

        self.heuristic_rolled_back.lock().push(xid.clone());
        info!(xid = %xid, "Prepared transaction rolled back");
        Ok(true)
    }

    pub fn list_heuristic_committed(&self) -> Vec<String> {
        self.heuristic_committed.lock().iter().map(Xid::encode).collect()
    }

    pub fn list_heuristic_rolled_back(&self) -> Vec<String> {
        self.heuristic_rolled_back.lock().iter().map(Xid::encode).collect()
    }

    fn acknowledge(&self, queue_name: &str, message_id: &str) {
        let Some(queue) = self.directory.queue(queue_name) else {
            debug!(queue = %queue_name, message_id = %message_id, "Acknowledged message's queue is gone");
            return;
        };
        // The consumer may have closed since prepare, putting the message back.
        if !queue.acknowledge(message_id) && !queue.remove_message(message_id) {
            debug!(queue = %queue_name, message_id = %message_id, "Acknowledged message already gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xid_text_form() {
        let xid = Xid::new(1, b"global".to_vec(), b"branch".to_vec()).unwrap();
        let text = xid.encode();
        assert_eq!(Xid::decode(&text).unwrap(), xid);

        // 4 bytes format id, 1 + 6 gtrid, 1 + 6 bqual
        let raw = STANDARD.decode(&text).unwrap();
        assert_eq!(raw.len(), 18);
        assert_eq!(&raw[..4], &1i32.to_be_bytes());
    }

    #[test]
    fn test_xid_decode_rejects_malformed() {
        assert!(Xid::decode("not base64!").is_err());
        assert!(Xid::decode(&STANDARD.encode([0u8, 0, 0])).is_err());
        // gtrid length runs past the end
        assert!(Xid::decode(&STANDARD.encode([0u8, 0, 0, 1, 9, 1])).is_err());
        // trailing bytes
        let mut bytes = STANDARD.decode(Xid::new(1, "g", "b").unwrap().encode()).unwrap();
        bytes.push(0);
        assert!(Xid::decode(&STANDARD.encode(bytes)).is_err());
    }

    #[test]
    fn test_xid_part_limit() {
        assert!(Xid::new(1, vec![0u8; MAX_XID_PART_LEN + 1], "b").is_err());
    }
}
