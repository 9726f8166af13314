//! Message Broker Control Plane
//!
//! This crate provides the administrative control plane of a broker node:
//! - PolicyRepository: Wildcard-keyed address settings and security roles
//! - ResourceDirectory: Addresses, queues and routing with cascading deletion
//! - DivertManager / BridgeManager: Stateful one-way message forwarders
//! - Connector: Producer-side link to a peer node (in-VM implementation)
//! - QueryEngine: Typed, paginated filters over live resources and connections
//! - ResourceManager: Prepared two-phase-commit transactions
//! - Scale-down: Migration of bindings and backlogs to a peer node
//! - MessageCounterManager: Sampled per-queue message statistics
//! - ConnectorServiceRegistry: Pluggable long-running integrations
//! - ServerControl: Administrative facade over one `Broker` node

pub mod bridge;
pub mod broker;
pub mod broker_metrics;
pub mod connector;
pub mod connector_service;
pub mod control;
pub mod directory;
pub mod divert;
pub mod error;
pub mod filter;
pub mod message_counter;
pub mod policy;
pub mod query;
pub mod queue;
mod scale_down;
pub mod session;
pub mod transaction;
pub mod transformer;

pub use bridge::{BridgeInfo, BridgeManager, BridgeState};
pub use broker::{Broker, BrokerSettings};
pub use connector::{Connector, ConnectorError, ConnectorRegistry, InVmConnector};
pub use connector_service::{
    ConnectorService, ConnectorServiceFactory, ConnectorServiceInfo, ConnectorServiceRegistry,
};
pub use control::ServerControl;
pub use directory::{AddressInfo, ResourceDirectory, RouteOutcome};
pub use divert::{DivertInfo, DivertManager, DivertState};
pub use error::ControlError;
pub use filter::Filter;
pub use message_counter::{DayCounter, MessageCounter, MessageCounterManager};
pub use policy::{PolicyRepository, RoleGrants};
pub use query::{
    AddressView, ConnectionView, ConsumerView, FilterOperation, Page, QueryEngine, QueryFilter,
    QueueView, ResourceKind,
};
pub use queue::{ConsumerHandle, ConsumerState, Queue, QueueSpec, SessionContext};
pub use session::{ConnectionInfo, InMemorySessionRegistry, SessionInfo, SessionRegistry};
pub use transaction::{PreparedTransaction, ResourceManager, TransactionOperation, Xid};
pub use transformer::{Transformer, TransformerRegistry};

pub type Result<T> = std::result::Result<T, ControlError>;
