use std::collections::HashMap;
use std::sync::Arc;

use calypso_proto::ConnectionId;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

use crate::transport::ConnectionHandle;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} is already registered")]
    AlreadyRegistered(ConnectionId),
}

/// One live connection. Owned by the registry.
#[derive(Clone)]
pub struct ConnectionRecord {
    pub id: ConnectionId,
    pub handle: Arc<dyn ConnectionHandle>,
    pub joined_at: DateTime<Utc>,
    seq: u64,
}

impl std::fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("id", &self.id)
            .field("joined_at", &self.joined_at)
            .finish()
    }
}

#[derive(Default)]
struct RegistryInner {
    records: HashMap<ConnectionId, ConnectionRecord>,
    next_seq: u64,
}

/// Tracks active transport endpoints by id.
///
/// Mutations take the write lock, so register/unregister from independent
/// connection tasks are serialized. Reads hand out owned snapshots; callers
/// never iterate while holding the lock.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record keyed by the id the transport assigned to `handle`.
    pub fn register(&self, handle: Arc<dyn ConnectionHandle>) -> Result<ConnectionId, RegistryError> {
        let id = handle.id().clone();
        let mut guard = self.inner.write();
        if guard.records.contains_key(&id) {
            return Err(RegistryError::AlreadyRegistered(id));
        }
        let seq = guard.next_seq;
        guard.next_seq += 1;
        guard.records.insert(
            id.clone(),
            ConnectionRecord {
                id: id.clone(),
                handle,
                joined_at: Utc::now(),
                seq,
            },
        );
        debug!(connection_id = %id, active = guard.records.len(), "connection registered");
        Ok(id)
    }

    /// Remove the record for `id`. Returns whether a record was removed.
    pub fn unregister(&self, id: &ConnectionId) -> bool {
        let removed = self.inner.write().records.remove(id);
        if removed.is_none() {
            warn!(connection_id = %id, "unregister for unknown connection");
        }
        removed.is_some()
    }

    /// Point-in-time copy of the registered ids in join order.
    pub fn list(&self) -> Vec<ConnectionId> {
        self.records()
            .into_iter()
            .map(|record| record.id)
            .collect()
    }

    /// Point-in-time copy of every record in join order.
    pub fn records(&self) -> Vec<ConnectionRecord> {
        let mut records: Vec<ConnectionRecord> =
            self.inner.read().records.values().cloned().collect();
        records.sort_by_key(|record| record.seq);
        records
    }

    pub fn get(&self, id: &ConnectionId) -> Option<ConnectionRecord> {
        self.inner.read().records.get(id).cloned()
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.inner.read().records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryHandle;
    use std::collections::BTreeSet;

    fn handle(id: &str) -> Arc<dyn ConnectionHandle> {
        let (handle, _rx) = MemoryHandle::new(ConnectionId::from(id));
        Arc::new(handle)
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = ConnectionRegistry::new();
        registry.register(handle("a")).expect("first");
        assert_eq!(
            registry.register(handle("a")),
            Err(RegistryError::AlreadyRegistered(ConnectionId::from("a")))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unregister_of_absent_id_is_a_no_op() {
        let registry = ConnectionRegistry::new();
        registry.register(handle("a")).expect("register");
        assert!(!registry.unregister(&ConnectionId::from("zzz")));
        assert_eq!(registry.list(), vec![ConnectionId::from("a")]);
    }

    #[test]
    fn list_tracks_every_step_of_a_mixed_sequence() {
        let registry = ConnectionRegistry::new();
        let mut model: BTreeSet<String> = BTreeSet::new();
        let steps: &[(&str, bool)] = &[
            ("a", true),
            ("b", true),
            ("a", false),
            ("c", true),
            ("a", true),
            ("b", false),
            ("b", false),
            ("d", true),
            ("c", false),
        ];
        for (id, register) in steps {
            if *register {
                registry.register(handle(id)).expect("register");
                model.insert(id.to_string());
            } else {
                registry.unregister(&ConnectionId::from(*id));
                model.remove(*id);
            }
            let listed: Vec<String> = registry.list().iter().map(|id| id.to_string()).collect();
            let unique: BTreeSet<String> = listed.iter().cloned().collect();
            assert_eq!(listed.len(), unique.len(), "duplicates in {listed:?}");
            assert_eq!(unique, model);
        }
    }

    #[test]
    fn list_preserves_join_order() {
        let registry = ConnectionRegistry::new();
        for id in ["c", "a", "b"] {
            registry.register(handle(id)).expect("register");
        }
        let ids: Vec<String> = registry.list().iter().map(|id| id.to_string()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_lifecycles_leave_no_stale_entries() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut tasks = Vec::new();
        for n in 0..32 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let id = ConnectionId::from(format!("conn-{n}"));
                registry.register(handle(id.as_str())).expect("register");
                let snapshot = registry.list();
                assert!(snapshot.contains(&id));
                if n % 2 == 0 {
                    assert!(registry.unregister(&id));
                }
            }));
        }
        for task in tasks {
            task.await.expect("task");
        }
        let mut remaining: Vec<String> = registry.list().iter().map(|id| id.to_string()).collect();
        remaining.sort();
        let mut expected: Vec<String> = (0..32)
            .filter(|n| n % 2 == 1)
            .map(|n| format!("conn-{n}"))
            .collect();
        expected.sort();
        assert_eq!(remaining, expected);
    }
}
