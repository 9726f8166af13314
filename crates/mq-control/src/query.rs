//! Query Engine
//!
//! Filtered, paginated listings over point-in-time snapshots of queues,
//! addresses, consumers and connections. Filters never fail on content:
//! a field/operation type mismatch, an unknown field or operation, or a
//! value that does not parse as a number simply matches no rows. Only
//! malformed filter JSON and invalid paging arguments are errors.

use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::directory::{AddressInfo, ResourceDirectory};
use crate::error::ControlError;
use crate::queue::{ConsumerState, Queue};
use crate::session::{ConnectionInfo, SessionRegistry};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Queue,
    Address,
    Consumer,
    Connection,
}

impl FromStr for ResourceKind {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "QUEUE" | "QUEUES" => Ok(ResourceKind::Queue),
            "ADDRESS" | "ADDRESSES" => Ok(ResourceKind::Address),
            "CONSUMER" | "CONSUMERS" => Ok(ResourceKind::Consumer),
            "CONNECTION" | "CONNECTIONS" => Ok(ResourceKind::Connection),
            other => Err(ControlError::invalid(format!("unknown resource kind: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOperation {
    Equals,
    Contains,
    LessThan,
    GreaterThan,
}

impl FilterOperation {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "EQUALS" => Some(FilterOperation::Equals),
            "CONTAINS" => Some(FilterOperation::Contains),
            "LESS_THAN" => Some(FilterOperation::LessThan),
            "GREATER_THAN" => Some(FilterOperation::GreaterThan),
            _ => None,
        }
    }
}

/// A typed field value of a queryable row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    Number(i64),
}

impl FieldValue {
    fn text(value: impl ToString) -> Option<Self> {
        Some(FieldValue::Text(value.to_string()))
    }

    fn number(value: impl TryInto<i64>) -> Option<Self> {
        Some(FieldValue::Number(value.try_into().unwrap_or(i64::MAX)))
    }
}

/// A row the query engine can filter on.
pub trait Queryable: Serialize {
    /// Look up a field by its upper-case name.
    fn field(&self, name: &str) -> Option<FieldValue>;
}

/// `{field, operation, value}` filter. An empty field or operation means
/// no filtering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryFilter {
    pub field: String,
    pub operation: String,
    pub value: String,
}

impl QueryFilter {
    pub fn new(field: &str, operation: &str, value: &str) -> Self {
        Self {
            field: field.to_string(),
            operation: operation.to_string(),
            value: value.to_string(),
        }
    }

    /// Parse the JSON filter object. Blank input is an empty filter.
    pub fn from_json(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ControlError::invalid(format!("malformed filter: {}", e)))?;
        let Value::Object(object) = value else {
            return Err(ControlError::invalid("filter must be a JSON object"));
        };

        let member = |key: &str| -> String {
            match object.get(key) {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
            }
        };
        Ok(Self {
            field: member("field"),
            operation: member("operation"),
            value: member("value"),
        })
    }

    pub fn is_unfiltered(&self) -> bool {
        self.field.trim().is_empty() || self.operation.trim().is_empty()
    }

    pub fn matches<R: Queryable>(&self, row: &R) -> bool {
        if self.is_unfiltered() {
            return true;
        }
        let Some(operation) = FilterOperation::parse(&self.operation) else {
            return false;
        };
        let Some(field) = row.field(&self.field.trim().to_ascii_uppercase()) else {
            return false;
        };

        match field {
            FieldValue::Text(text) => match operation {
                FilterOperation::Equals => text == self.value,
                FilterOperation::Contains => text.contains(&self.value),
                FilterOperation::LessThan | FilterOperation::GreaterThan => false,
            },
            FieldValue::Number(number) => {
                let Some(value) = parse_number(&self.value) else {
                    return false;
                };
                match operation {
                    FilterOperation::Equals => number == value,
                    FilterOperation::LessThan => number < value,
                    FilterOperation::GreaterThan => number > value,
                    FilterOperation::Contains => false,
                }
            }
        }
    }
}

/// Whole numbers only; surrounding whitespace makes the value unparsable.
fn parse_number(value: &str) -> Option<i64> {
    if value.is_empty() || value.trim() != value {
        return None;
    }
    value.parse().ok()
}

/// One page of results plus the full match count.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: usize,
}

/// Slice out a 1-based page.
pub fn paginate<T>(rows: Vec<T>, page: i64, page_size: i64) -> Result<Page<T>> {
    if page < 1 {
        return Err(ControlError::invalid(format!("page must be 1 or greater, got {}", page)));
    }
    if page_size < 1 {
        return Err(ControlError::invalid(format!(
            "page size must be 1 or greater, got {}",
            page_size
        )));
    }
    let total = rows.len();
    let size = usize::try_from(page_size).unwrap_or(usize::MAX);
    let offset = usize::try_from(page - 1).unwrap_or(usize::MAX).saturating_mul(size);
    let data = rows.into_iter().skip(offset).take(size).collect();
    Ok(Page { data, total })
}

// ----------------------------------------------------------------------
// Row views
// ----------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueView {
    pub id: u64,
    pub name: String,
    pub address: String,
    pub filter: Option<String>,
    pub routing_type: String,
    pub durable: bool,
    pub temporary: bool,
    pub auto_created: bool,
    pub purge_on_no_consumers: bool,
    pub max_consumers: i32,
    pub consumer_count: usize,
    pub message_count: usize,
    pub messages_added: u64,
    pub delivering_count: usize,
    pub messages_acked: u64,
    pub messages_killed: u64,
}

impl From<&Queue> for QueueView {
    fn from(queue: &Queue) -> Self {
        Self {
            id: queue.id(),
            name: queue.name().to_string(),
            address: queue.address().to_string(),
            filter: queue.filter().map(|f| f.expression().to_string()),
            routing_type: queue.routing_type().to_string(),
            durable: queue.is_durable(),
            temporary: queue.is_temporary(),
            auto_created: queue.is_auto_created(),
            purge_on_no_consumers: queue.is_purge_on_no_consumers(),
            max_consumers: queue.max_consumers(),
            consumer_count: queue.consumer_count(),
            message_count: queue.message_count(),
            messages_added: queue.messages_added(),
            delivering_count: queue.delivering_count(),
            messages_acked: queue.messages_acknowledged(),
            messages_killed: queue.messages_killed(),
        }
    }
}

impl Queryable for QueueView {
    fn field(&self, name: &str) -> Option<FieldValue> {
        match name {
            "ID" => FieldValue::number(self.id),
            "NAME" => FieldValue::text(&self.name),
            "ADDRESS" => FieldValue::text(&self.address),
            "FILTER" => FieldValue::text(self.filter.as_deref().unwrap_or_default()),
            "ROUTING_TYPE" => FieldValue::text(&self.routing_type),
            "DURABLE" => FieldValue::text(self.durable),
            "TEMPORARY" => FieldValue::text(self.temporary),
            "AUTO_CREATED" => FieldValue::text(self.auto_created),
            "PURGE_ON_NO_CONSUMERS" => FieldValue::text(self.purge_on_no_consumers),
            "MAX_CONSUMERS" => FieldValue::number(self.max_consumers),
            "CONSUMER_COUNT" => FieldValue::number(self.consumer_count),
            "MESSAGE_COUNT" => FieldValue::number(self.message_count),
            "MESSAGES_ADDED" => FieldValue::number(self.messages_added),
            "DELIVERING_COUNT" => FieldValue::number(self.delivering_count),
            "MESSAGES_ACKED" => FieldValue::number(self.messages_acked),
            "MESSAGES_KILLED" => FieldValue::number(self.messages_killed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressView {
    pub id: u64,
    pub name: String,
    pub routing_types: String,
    pub queue_count: usize,
    pub auto_created: bool,
}

impl From<&AddressInfo> for AddressView {
    fn from(address: &AddressInfo) -> Self {
        Self {
            id: address.id,
            name: address.name.clone(),
            routing_types: mq_common::RoutingType::format_set(&address.routing_types),
            queue_count: address.queue_names.len(),
            auto_created: address.auto_created,
        }
    }
}

impl Queryable for AddressView {
    fn field(&self, name: &str) -> Option<FieldValue> {
        match name {
            "ID" => FieldValue::number(self.id),
            "NAME" => FieldValue::text(&self.name),
            "ROUTING_TYPES" => FieldValue::text(&self.routing_types),
            "QUEUE_COUNT" => FieldValue::number(self.queue_count),
            "AUTO_CREATED" => FieldValue::text(self.auto_created),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumerView {
    #[serde(rename = "consumerID")]
    pub id: u64,
    #[serde(rename = "connectionID")]
    pub connection_id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(rename = "queueName")]
    pub queue_name: String,
    pub address: String,
    pub filter: Option<String>,
    pub user: Option<String>,
    pub protocol: String,
    #[serde(rename = "queueType")]
    pub queue_type: String,
    #[serde(rename = "browseOnly")]
    pub browse_only: bool,
    #[serde(rename = "deliveringCount")]
    pub delivering_count: i64,
    #[serde(rename = "creationTime")]
    pub creation_time: i64,
}

impl From<&ConsumerState> for ConsumerView {
    fn from(consumer: &ConsumerState) -> Self {
        Self {
            id: consumer.id,
            connection_id: consumer.session.connection_id.clone(),
            session_id: consumer.session.session_id.clone(),
            queue_name: consumer.queue.clone(),
            address: consumer.address.clone(),
            filter: consumer.filter.as_ref().map(|f| f.expression().to_string()),
            user: consumer.session.user.clone(),
            protocol: consumer.session.protocol.clone(),
            queue_type: consumer.routing_type.to_string(),
            browse_only: consumer.browse_only,
            delivering_count: consumer.delivering_count(),
            creation_time: consumer.created_at.timestamp_millis(),
        }
    }
}

impl Queryable for ConsumerView {
    fn field(&self, name: &str) -> Option<FieldValue> {
        match name {
            "ID" => FieldValue::number(self.id),
            "SESSION_ID" => FieldValue::text(&self.session_id),
            "CONNECTION_ID" => FieldValue::text(&self.connection_id),
            "QUEUE" => FieldValue::text(&self.queue_name),
            "ADDRESS" => FieldValue::text(&self.address),
            "FILTER" => FieldValue::text(self.filter.as_deref().unwrap_or_default()),
            "USER" => FieldValue::text(self.user.as_deref().unwrap_or_default()),
            "PROTOCOL" => FieldValue::text(&self.protocol),
            "QUEUE_TYPE" => FieldValue::text(&self.queue_type),
            "BROWSE_ONLY" => FieldValue::text(self.browse_only),
            "DELIVERING_COUNT" => FieldValue::number(self.delivering_count),
            "CREATION_TIME" => FieldValue::number(self.creation_time),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionView {
    #[serde(rename = "connectionID")]
    pub connection_id: String,
    #[serde(rename = "remoteAddress")]
    pub remote_address: String,
    pub user: Option<String>,
    pub protocol: String,
    #[serde(rename = "clientID")]
    pub client_id: Option<String>,
    #[serde(rename = "sessionCount")]
    pub session_count: usize,
    #[serde(rename = "creationTime")]
    pub creation_time: i64,
}

impl ConnectionView {
    fn new(connection: &ConnectionInfo, session_count: usize) -> Self {
        Self {
            connection_id: connection.connection_id.clone(),
            remote_address: connection.remote_address.clone(),
            user: connection.user.clone(),
            protocol: connection.protocol.clone(),
            client_id: connection.client_id.clone(),
            session_count,
            creation_time: connection.created_at.timestamp_millis(),
        }
    }
}

impl Queryable for ConnectionView {
    fn field(&self, name: &str) -> Option<FieldValue> {
        match name {
            "CONNECTION_ID" => FieldValue::text(&self.connection_id),
            "REMOTE_ADDRESS" => FieldValue::text(&self.remote_address),
            "USER" => FieldValue::text(self.user.as_deref().unwrap_or_default()),
            "PROTOCOL" => FieldValue::text(&self.protocol),
            "CLIENT_ID" => FieldValue::text(self.client_id.as_deref().unwrap_or_default()),
            "SESSION_COUNT" => FieldValue::number(self.session_count),
            "CREATION_TIME" => FieldValue::number(self.creation_time),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------
// Engine
// ----------------------------------------------------------------------

/// Read-only query surface over the directory and session registry.
pub struct QueryEngine {
    directory: Arc<ResourceDirectory>,
    sessions: Arc<dyn SessionRegistry>,
}

impl QueryEngine {
    pub fn new(directory: Arc<ResourceDirectory>, sessions: Arc<dyn SessionRegistry>) -> Self {
        Self { directory, sessions }
    }

    pub fn query_queues(&self, filter: &str, page: i64, page_size: i64) -> Result<Page<QueueView>> {
        let filter = QueryFilter::from_json(filter)?;
        let rows = self
            .directory
            .queues()
            .iter()
            .map(|q| QueueView::from(q.as_ref()))
            .filter(|row| filter.matches(row))
            .collect();
        paginate(rows, page, page_size)
    }

    pub fn query_addresses(&self, filter: &str, page: i64, page_size: i64) -> Result<Page<AddressView>> {
        let filter = QueryFilter::from_json(filter)?;
        let rows = self
            .directory
            .addresses()
            .iter()
            .map(AddressView::from)
            .filter(|row| filter.matches(row))
            .collect();
        paginate(rows, page, page_size)
    }

    pub fn query_consumers(&self, filter: &str, page: i64, page_size: i64) -> Result<Page<ConsumerView>> {
        let filter = QueryFilter::from_json(filter)?;
        let rows = self
            .directory
            .consumers()
            .iter()
            .map(|c| ConsumerView::from(c.as_ref()))
            .filter(|row| filter.matches(row))
            .collect();
        paginate(rows, page, page_size)
    }

    pub fn query_connections(&self, filter: &str, page: i64, page_size: i64) -> Result<Page<ConnectionView>> {
        let filter = QueryFilter::from_json(filter)?;
        let rows = self
            .sessions
            .connections()
            .iter()
            .map(|c| ConnectionView::new(c, self.sessions.sessions(&c.connection_id).len()))
            .filter(|row| filter.matches(row))
            .collect();
        paginate(rows, page, page_size)
    }

    /// Run a query and render the page as `{"data": [...], "total": n}`.
    pub fn query(&self, kind: ResourceKind, filter: &str, page: i64, page_size: i64) -> Result<String> {
        let json = match kind {
            ResourceKind::Queue => serde_json::to_string(&self.query_queues(filter, page, page_size)?)?,
            ResourceKind::Address => serde_json::to_string(&self.query_addresses(filter, page, page_size)?)?,
            ResourceKind::Consumer => serde_json::to_string(&self.query_consumers(filter, page, page_size)?)?,
            ResourceKind::Connection => {
                serde_json::to_string(&self.query_connections(filter, page, page_size)?)?
            }
        };
        Ok(json)
    }

    pub fn list_connections_as_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.sessions.connections())?)
    }

    pub fn list_sessions_as_json(&self, connection_id: &str) -> Result<String> {
        Ok(serde_json::to_string(&self.sessions.sessions(connection_id))?)
    }

    pub fn list_consumers_as_json(&self, connection_id: &str) -> Result<String> {
        let consumers: Vec<ConsumerView> = self
            .directory
            .consumers()
            .iter()
            .filter(|c| c.session.connection_id == connection_id)
            .map(|c| ConsumerView::from(c.as_ref()))
            .collect();
        Ok(serde_json::to_string(&consumers)?)
    }

    pub fn list_all_consumers_as_json(&self) -> Result<String> {
        let consumers: Vec<ConsumerView> = self
            .directory
            .consumers()
            .iter()
            .map(|c| ConsumerView::from(c.as_ref()))
            .collect();
        Ok(serde_json::to_string(&consumers)?)
    }
}
