use std::sync::Arc;

use bytes::Bytes;
use calypso_proto::{
    forwarded_frame, ConnectionId, Envelope, EnvelopeError, RelayEvent, RelayRequest,
};
use metrics::{counter, gauge};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::BroadcastPolicy;
use crate::registry::{ConnectionRegistry, RegistryError};
use crate::store::{ConnectionMeta, ConnectionOrigin, ConnectionStore};
use crate::transport::{BroadcastReport, ConnectionHandle, Transport, TransportError};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("malformed envelope: {0}")]
    Malformed(EnvelopeError),
    #[error("unknown method `{0}`")]
    UnknownMethod(String),
    #[error("target {0} is not reachable")]
    UnreachableTarget(ConnectionId),
    #[error("delivery to {target} failed: {source}")]
    Delivery {
        target: ConnectionId,
        source: TransportError,
    },
}

impl From<EnvelopeError> for RelayError {
    fn from(err: EnvelopeError) -> Self {
        match err {
            EnvelopeError::UnknownMethod(method) => RelayError::UnknownMethod(method),
            other => RelayError::Malformed(other),
        }
    }
}

impl RelayError {
    fn reason(&self) -> &'static str {
        match self {
            RelayError::Malformed(_) => "malformed",
            RelayError::UnknownMethod(_) => "unknown_method",
            RelayError::UnreachableTarget(_) => "unreachable",
            RelayError::Delivery { .. } => "delivery",
        }
    }
}

/// Result of routing one client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    Unicast(ConnectionId),
    Broadcast(BroadcastReport),
}

/// Signaling relay: keeps the roster current and routes client envelopes.
///
/// Every error is local to the frame or recipient that caused it; nothing
/// here tears down other connections.
///
/// Joins, leaves and the roster publication that follows each of them run
/// under `membership`, so clients see rosters in registry order and every
/// `peers` frame goes to exactly the ids it lists.
pub struct Relay {
    registry: Arc<ConnectionRegistry>,
    transport: Arc<dyn Transport>,
    store: Arc<dyn ConnectionStore>,
    policy: BroadcastPolicy,
    membership: Mutex<()>,
}

impl Relay {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn ConnectionStore>,
        policy: BroadcastPolicy,
    ) -> Self {
        Self {
            registry,
            transport,
            store,
            policy,
            membership: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn ConnectionStore> {
        &self.store
    }

    pub fn policy(&self) -> BroadcastPolicy {
        self.policy
    }

    /// A transport accepted a connection: register it, tell it its id, then
    /// push the new roster to everyone.
    pub async fn on_connect(
        &self,
        handle: Arc<dyn ConnectionHandle>,
        origin: ConnectionOrigin,
    ) -> Result<ConnectionId, RegistryError> {
        let _membership = self.membership.lock().await;
        let id = match self.transport.register_transport(handle) {
            Ok(id) => id,
            Err(err) => {
                warn!(error = %err, "rejecting connection");
                return Err(err);
            }
        };
        if let Err(err) = self
            .store
            .add_connection(ConnectionMeta::new(id.clone(), origin))
            .await
        {
            warn!(connection_id = %id, error = %err, "connection store rejected record");
        }

        counter!("calypso_relay_connections_total").increment(1);
        gauge!("calypso_relay_active_connections").set(self.registry.len() as f64);
        info!(
            connection_id = %id,
            transport = ?origin.transport,
            active = self.registry.len(),
            "client connected"
        );

        let me = RelayEvent::Me { id: id.clone() }.into_envelope().to_bytes();
        if let Err(err) = self.transport.send_to(&id, me).await {
            warn!(connection_id = %id, error = %err, "failed to send `me`");
        }

        self.publish_roster().await;
        Ok(id)
    }

    /// A transport reported that `id` went away.
    pub async fn on_disconnect(&self, id: &ConnectionId) {
        let _membership = self.membership.lock().await;
        if self.forget(id).await {
            self.publish_roster().await;
        }
    }

    /// Inbound frame from `from`. Failures are logged and dropped.
    pub async fn on_message(&self, from: &ConnectionId, frame: &[u8]) {
        let reap = match self.route_frame(from, frame).await {
            Ok(Routed::Broadcast(report)) => report.failed > 0,
            Ok(Routed::Unicast(_)) => false,
            Err(err) => {
                counter!("calypso_relay_frames_dropped_total", "reason" => err.reason())
                    .increment(1);
                match &err {
                    RelayError::UnreachableTarget(_) => {
                        debug!(connection_id = %from, error = %err, "dropping unicast")
                    }
                    _ => warn!(connection_id = %from, error = %err, "dropping frame"),
                }
                matches!(err, RelayError::UnreachableTarget(_) | RelayError::Delivery { .. })
            }
        };
        if reap {
            self.reap_closed().await;
        }
    }

    pub async fn route_frame(
        &self,
        from: &ConnectionId,
        frame: &[u8],
    ) -> Result<Routed, RelayError> {
        let envelope = Envelope::decode(frame)?;
        debug!(connection_id = %from, method = %envelope.method, "inbound envelope");
        let request = RelayRequest::try_from(envelope)?;
        self.route(from, request).await
    }

    pub async fn route(
        &self,
        from: &ConnectionId,
        request: RelayRequest,
    ) -> Result<Routed, RelayError> {
        match request {
            RelayRequest::Message { target, payload } => {
                let frame = Bytes::from(forwarded_frame(&payload));
                match self.transport.send_to(&target, frame).await {
                    Ok(()) => {
                        counter!("calypso_relay_frames_routed_total", "kind" => "unicast")
                            .increment(1);
                        debug!(from = %from, to = %target, "unicast delivered");
                        Ok(Routed::Unicast(target))
                    }
                    Err(TransportError::UnknownTarget(_)) | Err(TransportError::Closed) => {
                        Err(RelayError::UnreachableTarget(target))
                    }
                    Err(source) => Err(RelayError::Delivery { target, source }),
                }
            }
            RelayRequest::Broadcast { payload } => {
                let frame = Bytes::from(forwarded_frame(&payload));
                let except = match self.policy {
                    BroadcastPolicy::IncludeSender => None,
                    BroadcastPolicy::ExcludeSender => Some(from),
                };
                let report = self.transport.broadcast(frame, except).await;
                counter!("calypso_relay_frames_routed_total", "kind" => "broadcast").increment(1);
                Ok(Routed::Broadcast(report))
            }
        }
    }

    /// Drop connections whose transport reported them closed and tell the
    /// rest. Covers transports that never send their own disconnect.
    pub async fn reap_closed(&self) {
        let _membership = self.membership.lock().await;
        if self.prune_closed().await {
            self.publish_roster().await;
        }
    }

    /// Unregister `id` and mirror that into the store. Callers hold
    /// `membership`.
    async fn forget(&self, id: &ConnectionId) -> bool {
        if !self.transport.unregister_transport(id) {
            return false;
        }
        if let Err(err) = self.store.remove_connection(id).await {
            warn!(connection_id = %id, error = %err, "connection store removal failed");
        }

        counter!("calypso_relay_disconnections_total").increment(1);
        gauge!("calypso_relay_active_connections").set(self.registry.len() as f64);
        info!(connection_id = %id, active = self.registry.len(), "client disconnected");
        true
    }

    async fn prune_closed(&self) -> bool {
        let closed: Vec<ConnectionId> = self
            .registry
            .records()
            .into_iter()
            .filter(|record| !record.handle.is_open())
            .map(|record| record.id)
            .collect();
        let mut pruned = false;
        for id in closed {
            debug!(connection_id = %id, "pruning closed connection");
            pruned |= self.forget(&id).await;
        }
        pruned
    }

    /// Send the roster to every registered connection. The frame content and
    /// the recipients come from the same snapshot. Callers hold `membership`.
    async fn publish_roster(&self) {
        loop {
            self.prune_closed().await;
            let recipients = self.registry.records();
            let frame = RelayEvent::roster(recipients.iter().map(|record| &record.id))
                .into_envelope()
                .to_bytes();
            let report = self.transport.fan_out(&recipients, frame).await;
            debug!(
                size = recipients.len(),
                delivered = report.delivered,
                failed = report.failed,
                "roster published"
            );
            // A recipient that turned out to be gone changes the roster again.
            if !recipients.iter().any(|record| !record.handle.is_open()) {
                return;
            }
        }
    }
}
