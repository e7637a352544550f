//! Live connection registry shared by the listeners

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::trace;

/// How a connection entered the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Not classified yet
    Pending,
    Legacy,
    WebSocket { multiplexing: bool },
    /// Plain HTTP request answered with the fallback page
    Http,
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub conn_id: String,
    pub peer_addr: SocketAddr,
    pub secure: bool,
    pub kind: ConnectionKind,
    pub connected_at: DateTime<Utc>,
}

/// Connections keyed by connection id. Entries live exactly as long as the
/// [`RegistrationGuard`] returned by [`ConnectionRegistry::register`].
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<String, ConnectionInfo>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, conn_id: &str, peer_addr: SocketAddr, secure: bool) -> RegistrationGuard {
        trace!("[{}] Registering connection from {}", conn_id, peer_addr);
        self.connections.insert(
            conn_id.to_string(),
            ConnectionInfo {
                conn_id: conn_id.to_string(),
                peer_addr,
                secure,
                kind: ConnectionKind::Pending,
                connected_at: Utc::now(),
            },
        );

        RegistrationGuard {
            registry: self.clone(),
            conn_id: conn_id.to_string(),
        }
    }

    pub fn get(&self, conn_id: &str) -> Option<ConnectionInfo> {
        self.connections.get(conn_id).map(|entry| entry.clone())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Snapshot of every live connection
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn set_kind(&self, conn_id: &str, kind: ConnectionKind) {
        if let Some(mut entry) = self.connections.get_mut(conn_id) {
            entry.kind = kind;
        }
    }

    fn remove(&self, conn_id: &str) {
        if self.connections.remove(conn_id).is_some() {
            trace!("[{}] Connection unregistered", conn_id);
        }
    }
}

/// Removes its connection from the registry when dropped
#[derive(Debug)]
pub struct RegistrationGuard {
    registry: ConnectionRegistry,
    conn_id: String,
}

impl RegistrationGuard {
    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn set_kind(&self, kind: ConnectionKind) {
        self.registry.set_kind(&self.conn_id, kind);
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.conn_id);
    }
}
