//! Connection and session registry
//!
//! The transport owns connections and sessions; the control plane only
//! needs read-only snapshots of them. `InMemorySessionRegistry` is the
//! in-process implementation used by the broker node.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::ControlError;
use crate::queue::SessionContext;
use crate::Result;

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    #[serde(rename = "connectionID")]
    pub connection_id: String,
    #[serde(rename = "clientAddress")]
    pub remote_address: String,
    pub protocol: String,
    pub user: Option<String>,
    #[serde(rename = "clientID")]
    pub client_id: Option<String>,
    #[serde(rename = "creationTime", with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(rename = "connectionID")]
    pub connection_id: String,
    pub principal: Option<String>,
    #[serde(rename = "creationTime", with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

/// Read-only view over live connections and sessions.
pub trait SessionRegistry: Send + Sync {
    /// Live connections, oldest first.
    fn connections(&self) -> Vec<ConnectionInfo>;

    fn connection(&self, connection_id: &str) -> Option<ConnectionInfo>;

    /// Sessions of one connection, oldest first.
    fn sessions(&self, connection_id: &str) -> Vec<SessionInfo>;

    fn session(&self, session_id: &str) -> Option<SessionInfo>;

    /// Connections ever opened, including closed ones.
    fn total_connection_count(&self) -> u64;
}

pub struct InMemorySessionRegistry {
    connections: DashMap<String, ConnectionInfo>,
    sessions: DashMap<String, SessionInfo>,
    total_connections: AtomicU64,
}

impl InMemorySessionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            sessions: DashMap::new(),
            total_connections: AtomicU64::new(0),
        }
    }

    pub fn open_connection(
        &self,
        remote_address: &str,
        user: Option<&str>,
        client_id: Option<&str>,
    ) -> ConnectionInfo {
        let info = ConnectionInfo {
            connection_id: uuid::Uuid::new_v4().to_string(),
            remote_address: remote_address.to_string(),
            protocol: "CORE".to_string(),
            user: user.map(str::to_string),
            client_id: client_id.map(str::to_string),
            created_at: Utc::now(),
        };
        self.connections.insert(info.connection_id.clone(), info.clone());
        self.total_connections.fetch_add(1, Ordering::SeqCst);
        info!(connection_id = %info.connection_id, remote_address = %remote_address, "Connection opened");
        info
    }

    pub fn create_session(&self, connection_id: &str) -> Result<SessionInfo> {
        let connection = self
            .connections
            .get(connection_id)
            .map(|c| c.value().clone())
            .ok_or_else(|| ControlError::invalid(format!("unknown connection: {}", connection_id)))?;

        let session = SessionInfo {
            session_id: uuid::Uuid::new_v4().to_string(),
            connection_id: connection_id.to_string(),
            principal: connection.user,
            created_at: Utc::now(),
        };
        self.sessions.insert(session.session_id.clone(), session.clone());
        debug!(connection_id = %connection_id, session_id = %session.session_id, "Session created");
        Ok(session)
    }

    /// Remove a connection and its sessions; returns the removed session ids.
    pub fn close_connection(&self, connection_id: &str) -> Vec<String> {
        if self.connections.remove(connection_id).is_none() {
            return Vec::new();
        }
        let session_ids: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.connection_id == connection_id)
            .map(|s| s.key().clone())
            .collect();
        for id in &session_ids {
            self.sessions.remove(id);
        }
        info!(connection_id = %connection_id, sessions = session_ids.len(), "Connection closed");
        session_ids
    }

    /// Identity handed to consumers created on a session.
    pub fn session_context(&self, session_id: &str) -> Result<SessionContext> {
        let session = self
            .session(session_id)
            .ok_or_else(|| ControlError::invalid(format!("unknown session: {}", session_id)))?;
        let protocol = self
            .connection(&session.connection_id)
            .map(|c| c.protocol)
            .unwrap_or_else(|| "CORE".to_string());
        Ok(SessionContext {
            session_id: session.session_id,
            connection_id: session.connection_id,
            user: session.principal,
            protocol,
        })
    }
}

impl Default for InMemorySessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry for InMemorySessionRegistry {
    fn connections(&self) -> Vec<ConnectionInfo> {
        let mut connections: Vec<ConnectionInfo> = self.connections.iter().map(|c| c.value().clone()).collect();
        connections.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.connection_id.cmp(&b.connection_id))
        });
        connections
    }

    fn connection(&self, connection_id: &str) -> Option<ConnectionInfo> {
        self.connections.get(connection_id).map(|c| c.value().clone())
    }

    fn sessions(&self, connection_id: &str) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .filter(|s| s.connection_id == connection_id)
            .map(|s| s.value().clone())
            .collect();
        sessions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        sessions
    }

    fn session(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions.get(session_id).map(|s| s.value().clone())
    }

    fn total_connection_count(&self) -> u64 {
        self.total_connections.load(Ordering::SeqCst)
    }
}
