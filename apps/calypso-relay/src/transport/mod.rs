//! Transport adapter seam.
//!
//! The relay never talks to sockets directly. Concrete transports (the direct
//! WebSocket listener in [`crate::socket`] and the push gateway in
//! [`crate::gateway`]) mint a [`ConnectionHandle`] per connection and feed
//! lifecycle events into [`crate::relay::Relay`]. Outbound traffic goes
//! through the [`Transport`] trait.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use calypso_proto::ConnectionId;
use futures_util::future::join_all;
use metrics::counter;
use thiserror::Error;
use tracing::{debug, warn};

use crate::registry::{ConnectionRecord, ConnectionRegistry, RegistryError};

pub mod memory;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("outbound queue full")]
    Backpressure,
    #[error("no connection registered for {0}")]
    UnknownTarget(ConnectionId),
    #[error("gateway delivery failed: {0}")]
    Gateway(String),
}

/// Per-connection endpoint owned by a registry record.
#[async_trait]
pub trait ConnectionHandle: Send + Sync {
    /// Id assigned by the transport when the connection was accepted.
    fn id(&self) -> &ConnectionId;

    fn is_open(&self) -> bool;

    /// Hand one encoded frame to this connection. Must not wait on the peer;
    /// failures stay local to this connection.
    async fn deliver(&self, frame: Bytes) -> Result<(), TransportError>;
}

/// Outcome of a fan-out.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Capability interface the relay consumes.
#[async_trait]
pub trait Transport: Send + Sync {
    fn register_transport(
        &self,
        handle: Arc<dyn ConnectionHandle>,
    ) -> Result<ConnectionId, RegistryError>;

    fn unregister_transport(&self, id: &ConnectionId) -> bool;

    async fn send_to(&self, id: &ConnectionId, frame: Bytes) -> Result<(), TransportError>;

    /// Best-effort delivery to every id known at call time, minus `except`.
    async fn broadcast(&self, frame: Bytes, except: Option<&ConnectionId>) -> BroadcastReport;

    /// Best-effort delivery to a recipient list the caller already took.
    async fn fan_out(&self, recipients: &[ConnectionRecord], frame: Bytes) -> BroadcastReport;
}

/// [`Transport`] backed by the shared [`ConnectionRegistry`].
///
/// Fan-out copies the handle list under the registry read lock, releases it,
/// then delivers to all recipients concurrently so one slow or failing
/// recipient never holds up the rest.
pub struct RegistryTransport {
    registry: Arc<ConnectionRegistry>,
}

impl RegistryTransport {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Transport for RegistryTransport {
    fn register_transport(
        &self,
        handle: Arc<dyn ConnectionHandle>,
    ) -> Result<ConnectionId, RegistryError> {
        self.registry.register(handle)
    }

    fn unregister_transport(&self, id: &ConnectionId) -> bool {
        self.registry.unregister(id)
    }

    async fn send_to(&self, id: &ConnectionId, frame: Bytes) -> Result<(), TransportError> {
        let record = self
            .registry
            .get(id)
            .ok_or_else(|| TransportError::UnknownTarget(id.clone()))?;
        if !record.handle.is_open() {
            return Err(TransportError::Closed);
        }
        record.handle.deliver(frame).await
    }

    async fn broadcast(&self, frame: Bytes, except: Option<&ConnectionId>) -> BroadcastReport {
        let recipients: Vec<ConnectionRecord> = self
            .registry
            .records()
            .into_iter()
            .filter(|record| except != Some(&record.id))
            .collect();
        self.fan_out(&recipients, frame).await
    }

    async fn fan_out(&self, recipients: &[ConnectionRecord], frame: Bytes) -> BroadcastReport {
        let deliveries = recipients.iter().map(|record| {
            let frame = frame.clone();
            async move {
                if !record.handle.is_open() {
                    return Err(TransportError::Closed);
                }
                record.handle.deliver(frame).await
            }
        });
        let outcomes = join_all(deliveries).await;

        let mut report = BroadcastReport::default();
        for (record, outcome) in recipients.iter().zip(outcomes) {
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    report.failed += 1;
                    counter!("calypso_relay_frames_dropped_total", "reason" => "delivery")
                        .increment(1);
                    warn!(connection_id = %record.id, error = %err, "broadcast delivery failed");
                }
            }
        }
        debug!(
            delivered = report.delivered,
            failed = report.failed,
            "broadcast complete"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::memory::{FailingHandle, MemoryHandle};
    use super::*;

    #[tokio::test]
    async fn failing_recipient_does_not_abort_fan_out() {
        let registry = Arc::new(ConnectionRegistry::new());
        let transport = RegistryTransport::new(Arc::clone(&registry));

        let (a, mut a_rx) = MemoryHandle::new(ConnectionId::from("a"));
        let (c, mut c_rx) = MemoryHandle::new(ConnectionId::from("c"));
        transport.register_transport(Arc::new(a)).expect("a");
        transport
            .register_transport(Arc::new(FailingHandle::new(ConnectionId::from("b"))))
            .expect("b");
        transport.register_transport(Arc::new(c)).expect("c");

        let report = transport.broadcast(Bytes::from_static(b"hi"), None).await;
        assert_eq!(report, BroadcastReport { delivered: 2, failed: 1 });
        assert_eq!(a_rx.recv().await.as_deref(), Some(&b"hi"[..]));
        assert_eq!(c_rx.recv().await.as_deref(), Some(&b"hi"[..]));
    }

    #[tokio::test]
    async fn broadcast_can_skip_one_connection() {
        let registry = Arc::new(ConnectionRegistry::new());
        let transport = RegistryTransport::new(Arc::clone(&registry));
        let (a, mut a_rx) = MemoryHandle::new(ConnectionId::from("a"));
        let (b, mut b_rx) = MemoryHandle::new(ConnectionId::from("b"));
        transport.register_transport(Arc::new(a)).expect("a");
        transport.register_transport(Arc::new(b)).expect("b");

        let skip = ConnectionId::from("a");
        let report = transport.broadcast(Bytes::from_static(b"x"), Some(&skip)).await;
        assert_eq!(report.delivered, 1);
        assert!(a_rx.try_recv().is_err());
        assert_eq!(b_rx.recv().await.as_deref(), Some(&b"x"[..]));
    }

    #[tokio::test]
    async fn fan_out_uses_the_given_snapshot() {
        let registry = Arc::new(ConnectionRegistry::new());
        let transport = RegistryTransport::new(Arc::clone(&registry));
        let (a, mut a_rx) = MemoryHandle::new(ConnectionId::from("a"));
        transport.register_transport(Arc::new(a)).expect("a");
        let snapshot = registry.records();

        let (late, mut late_rx) = MemoryHandle::new(ConnectionId::from("late"));
        transport.register_transport(Arc::new(late)).expect("late");

        let report = transport.fan_out(&snapshot, Bytes::from_static(b"r")).await;
        assert_eq!(report, BroadcastReport { delivered: 1, failed: 0 });
        assert_eq!(a_rx.recv().await.as_deref(), Some(&b"r"[..]));
        assert!(late_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_to_unknown_target_is_reported() {
        let transport = RegistryTransport::new(Arc::new(ConnectionRegistry::new()));
        let missing = ConnectionId::from("ghost");
        assert_eq!(
            transport.send_to(&missing, Bytes::from_static(b"x")).await,
            Err(TransportError::UnknownTarget(missing))
        );
    }
}
