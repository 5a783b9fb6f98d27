//! Online/offline status cache collaborator.
//!
//! Two TTL-bounded keyspaces per device: the online status (refreshed on
//! bind, cleared on unbind) and the device → connection-id mapping.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Online,
    Offline,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("status cache unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait StatusCache: Send + Sync {
    async fn set_status(&self, device_id: &str, status: ConnectionStatus)
        -> Result<(), CacheError>;

    /// `None` once the entry expired or was never written.
    async fn status(&self, device_id: &str) -> Result<Option<ConnectionStatus>, CacheError>;

    async fn set_connection(&self, device_id: &str, conn: Uuid) -> Result<(), CacheError>;

    async fn connection(&self, device_id: &str) -> Result<Option<Uuid>, CacheError>;

    /// Remove the mapping only if it still points at `conn`.
    async fn remove_connection(&self, device_id: &str, conn: Uuid) -> Result<(), CacheError>;
}

struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T: Copy> Expiring<T> {
    fn live(&self, now: Instant) -> Option<T> {
        (now < self.expires_at).then_some(self.value)
    }
}

/// In-process [`StatusCache`] with lazy TTL expiry on read.
pub struct MemoryStatusCache {
    status_ttl: Duration,
    connection_ttl: Duration,
    statuses: RwLock<HashMap<String, Expiring<ConnectionStatus>>>,
    connections: RwLock<HashMap<String, Expiring<Uuid>>>,
}

impl MemoryStatusCache {
    pub fn new(status_ttl: Duration, connection_ttl: Duration) -> Self {
        Self {
            status_ttl,
            connection_ttl,
            statuses: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &crate::config::StatusCacheConfig) -> Self {
        Self::new(config.status_ttl(), config.connection_ttl())
    }
}

#[async_trait]
impl StatusCache for MemoryStatusCache {
    async fn set_status(
        &self,
        device_id: &str,
        status: ConnectionStatus,
    ) -> Result<(), CacheError> {
        let entry = Expiring {
            value: status,
            expires_at: Instant::now() + self.status_ttl,
        };
        self.statuses
            .write()
            .await
            .insert(device_id.to_string(), entry);
        Ok(())
    }

    async fn status(&self, device_id: &str) -> Result<Option<ConnectionStatus>, CacheError> {
        let now = Instant::now();
        let statuses = self.statuses.read().await;
        Ok(statuses.get(device_id).and_then(|e| e.live(now)))
    }

    async fn set_connection(&self, device_id: &str, conn: Uuid) -> Result<(), CacheError> {
        let entry = Expiring {
            value: conn,
            expires_at: Instant::now() + self.connection_ttl,
        };
        self.connections
            .write()
            .await
            .insert(device_id.to_string(), entry);
        Ok(())
    }

    async fn connection(&self, device_id: &str) -> Result<Option<Uuid>, CacheError> {
        let now = Instant::now();
        let connections = self.connections.read().await;
        Ok(connections.get(device_id).and_then(|e| e.live(now)))
    }

    async fn remove_connection(&self, device_id: &str, conn: Uuid) -> Result<(), CacheError> {
        let mut connections = self.connections.write().await;
        if connections.get(device_id).is_some_and(|e| e.value == conn) {
            connections.remove(device_id);
        }
        Ok(())
    }
}
