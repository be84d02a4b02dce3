use std::net::SocketAddr;

use async_trait::async_trait;
use calypso_proto::ConnectionId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;

use crate::config::TransportKind;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection {0} already stored")]
    Duplicate(ConnectionId),
}

/// Where a connection came from, as reported by its transport.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOrigin {
    pub transport: TransportKind,
    pub remote_addr: Option<SocketAddr>,
}

impl ConnectionOrigin {
    pub fn socket(remote_addr: Option<SocketAddr>) -> Self {
        Self {
            transport: TransportKind::Socket,
            remote_addr,
        }
    }

    pub fn gateway() -> Self {
        Self {
            transport: TransportKind::Gateway,
            remote_addr: None,
        }
    }
}

/// What the store is told about a newly accepted connection.
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    pub id: ConnectionId,
    pub transport: TransportKind,
    pub remote_addr: Option<SocketAddr>,
}

impl ConnectionMeta {
    pub fn new(id: ConnectionId, origin: ConnectionOrigin) -> Self {
        Self {
            id,
            transport: origin.transport,
            remote_addr: origin.remote_addr,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredConnection {
    pub id: ConnectionId,
    pub transport: TransportKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<SocketAddr>,
    pub connected_at: DateTime<Utc>,
}

/// Persistence collaborator. Authoritative only for the life of the process.
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn add_connection(&self, meta: ConnectionMeta) -> Result<StoredConnection, StoreError>;
    async fn remove_connection(&self, id: &ConnectionId) -> Result<(), StoreError>;
    async fn list_connections(&self) -> Result<Vec<StoredConnection>, StoreError>;
}

#[derive(Default)]
pub struct MemoryConnectionStore {
    connections: DashMap<ConnectionId, StoredConnection>,
}

impl MemoryConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConnectionStore for MemoryConnectionStore {
    async fn add_connection(&self, meta: ConnectionMeta) -> Result<StoredConnection, StoreError> {
        let record = StoredConnection {
            id: meta.id.clone(),
            transport: meta.transport,
            remote_addr: meta.remote_addr,
            connected_at: Utc::now(),
        };
        match self.connections.entry(meta.id) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                Err(StoreError::Duplicate(entry.key().clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(record.clone());
                Ok(record)
            }
        }
    }

    async fn remove_connection(&self, id: &ConnectionId) -> Result<(), StoreError> {
        self.connections.remove(id);
        Ok(())
    }

    async fn list_connections(&self) -> Result<Vec<StoredConnection>, StoreError> {
        let mut connections: Vec<StoredConnection> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        connections.sort_by_key(|record| record.connected_at);
        Ok(connections)
    }
}
