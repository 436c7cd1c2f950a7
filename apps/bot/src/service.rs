//! Logical bot services and their per-service policy.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::Config;

/// Feature switches for one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceFlags {
    /// Route chat messages through the command router.
    pub command_routing: bool,
    /// Acknowledge every inbound message with `mark_msg_as_read`.
    pub auto_mark_read: bool,
    /// Log every frame at debug level.
    pub socket_log: bool,
}

impl Default for ServiceFlags {
    fn default() -> Self {
        Self {
            command_routing: true,
            auto_mark_read: false,
            socket_log: false,
        }
    }
}

/// One logical bot service. Many connections may belong to it.
pub struct ServiceRecord {
    pub service_id: String,
    super_users: HashSet<i64>,
    blocked_users: RwLock<HashSet<i64>>,
    pub flags: ServiceFlags,
    /// Cancelled when the service is disposed.
    shutdown: CancellationToken,
}

impl ServiceRecord {
    pub fn new(
        service_id: impl Into<String>,
        super_users: HashSet<i64>,
        blocked_users: HashSet<i64>,
        flags: ServiceFlags,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            super_users,
            blocked_users: RwLock::new(blocked_users),
            flags,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.service_id.clone(),
            config.super_users.clone(),
            config.blocked_users.clone(),
            ServiceFlags {
                command_routing: config.enable_commands,
                auto_mark_read: config.auto_mark_read,
                socket_log: config.socket_log,
            },
        )
    }

    pub fn is_super_user(&self, user_id: i64) -> bool {
        self.super_users.contains(&user_id)
    }

    pub fn is_blocked(&self, user_id: i64) -> bool {
        self.blocked_users.read().contains(&user_id)
    }

    /// Returns `true` if the user was not blocked before.
    pub fn block_user(&self, user_id: i64) -> bool {
        self.blocked_users.write().insert(user_id)
    }

    /// Returns `true` if the user was blocked before.
    pub fn unblock_user(&self, user_id: i64) -> bool {
        self.blocked_users.write().remove(&user_id)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Table of running services.
pub struct ServiceRegistry {
    services: DashMap<String, Arc<ServiceRecord>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
        }
    }

    /// Insert a service. Returns `None` if the id is already taken.
    pub fn insert(&self, record: ServiceRecord) -> Option<Arc<ServiceRecord>> {
        match self.services.entry(record.service_id.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let record = Arc::new(record);
                slot.insert(record.clone());
                Some(record)
            }
        }
    }

    pub fn get(&self, service_id: &str) -> Option<Arc<ServiceRecord>> {
        self.services.get(service_id).map(|entry| entry.value().clone())
    }

    /// Remove a service and cancel its shutdown token.
    pub fn remove(&self, service_id: &str) -> Option<Arc<ServiceRecord>> {
        let (_, record) = self.services.remove(service_id)?;
        record.shutdown.cancel();
        Some(record)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> ServiceRecord {
        ServiceRecord::new(id, HashSet::from([1]), HashSet::from([99]), ServiceFlags::default())
    }

    #[test]
    fn insert_rejects_duplicate_ids() {
        let registry = ServiceRegistry::new();
        assert!(registry.insert(record("svc_a")).is_some());
        assert!(registry.insert(record("svc_a")).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn block_list_updates() {
        let service = record("svc_a");
        assert!(service.is_blocked(99));
        assert!(!service.is_blocked(5));
        assert!(service.block_user(5));
        assert!(!service.block_user(5));
        assert!(service.is_blocked(5));
        assert!(service.unblock_user(99));
        assert!(!service.is_blocked(99));
    }

    #[test]
    fn remove_cancels_shutdown_token() {
        let registry = ServiceRegistry::new();
        let service = registry.insert(record("svc_a")).unwrap();
        let token = service.shutdown_token();
        assert!(!token.is_cancelled());

        let removed = registry.remove("svc_a").unwrap();
        assert!(removed.is_disposed());
        assert!(token.is_cancelled());
        assert!(registry.get("svc_a").is_none());
        assert!(registry.remove("svc_a").is_none());
    }

    #[test]
    fn super_users() {
        let service = record("svc_a");
        assert!(service.is_super_user(1));
        assert!(!service.is_super_user(2));
    }
}
