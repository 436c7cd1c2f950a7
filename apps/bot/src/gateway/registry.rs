//! Authoritative table of live connections.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::error::RegistryError;

use super::session::ConnectionRecord;

/// Shared registry of all live connections, keyed by connection id.
///
/// Records are inserted fully built and shared as `Arc`s, so a lookup never
/// observes a half-constructed entry. The mutable bits of a record (heartbeat,
/// login id) sit behind its own lock.
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<ConnectionRecord>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Register a connection after its socket opened.
    ///
    /// Fails if the id is taken or the socket is already closed; the caller
    /// still owns the socket in that case and must close it.
    pub fn register(&self, record: ConnectionRecord) -> Result<Arc<ConnectionRecord>, RegistryError> {
        if record.socket.is_closed() {
            return Err(RegistryError::SocketClosed(record.connection_id));
        }
        match self.connections.entry(record.connection_id.clone()) {
            Entry::Occupied(_) => Err(RegistryError::Duplicate(record.connection_id)),
            Entry::Vacant(slot) => {
                let record = Arc::new(record);
                slot.insert(record.clone());
                tracing::debug!(
                    connection_id = %record.connection_id,
                    service_id = %record.service_id,
                    "connection registered"
                );
                Ok(record)
            }
        }
    }

    pub fn lookup(&self, connection_id: &str) -> Option<Arc<ConnectionRecord>> {
        self.connections.get(connection_id).map(|entry| entry.value().clone())
    }

    /// Returns `false` if the connection is unknown.
    pub fn update_heartbeat(&self, connection_id: &str, now: Instant) -> bool {
        match self.connections.get(connection_id) {
            Some(entry) => {
                entry.touch_heartbeat(now);
                true
            }
            None => false,
        }
    }

    /// Returns `false` if the connection is unknown.
    pub fn update_login_id(&self, connection_id: &str, login_id: i64) -> bool {
        match self.connections.get(connection_id) {
            Some(entry) => {
                entry.set_login_id(login_id);
                true
            }
            None => false,
        }
    }

    /// Remove a connection and signal its socket to close.
    ///
    /// Idempotent: closing an absent id returns `None` and does nothing.
    pub fn close(&self, connection_id: &str) -> Option<Arc<ConnectionRecord>> {
        let (_, record) = self.connections.remove(connection_id)?;
        record.socket.close("connection closed");
        tracing::debug!(
            connection_id = %record.connection_id,
            service_id = %record.service_id,
            "connection closed"
        );
        Some(record)
    }

    /// Every connection of `service_id` whose last heartbeat is older than `timeout`.
    pub fn all_stale(&self, service_id: &str, now: Instant, timeout: Duration) -> Vec<Arc<ConnectionRecord>> {
        self.connections
            .iter()
            .filter(|entry| entry.service_id == service_id)
            .filter(|entry| entry.heartbeat_overrun(now, timeout).is_some())
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn connections_for(&self, service_id: &str) -> Vec<Arc<ConnectionRecord>> {
        self.connections
            .iter()
            .filter(|entry| entry.service_id == service_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
