//! The media-negotiation capability a peer session drives.
//!
//! Sessions never touch a media stack directly. They hold an
//! `Arc<dyn Negotiator>` created per remote peer by a [`NegotiatorFactory`],
//! and receive the capability's asynchronous notifications on the
//! [`NegotiationEvents`] stream handed out alongside it.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use calypso_proto::{ConnectionId, IceCandidate, SessionDescription};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("negotiation backend error: {0}")]
    Backend(String),
    #[error("unsupported session description type `{0}`")]
    UnsupportedDescription(String),
    #[error("negotiator already closed")]
    Closed,
}

/// Which side of the offer/answer exchange a session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Caller,
    Callee,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Caller => f.write_str("caller"),
            Role::Callee => f.write_str("callee"),
        }
    }
}

/// Connectivity as reported by the negotiation backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Asynchronous notifications from a [`Negotiator`].
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationEvent {
    /// A local candidate was gathered.
    IceCandidate(IceCandidate),
    ConnectionState(ConnectionState),
}

pub type NegotiationEvents = mpsc::UnboundedReceiver<NegotiationEvent>;

#[async_trait]
pub trait Negotiator: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    /// Produce an answer to `remote`, which must already be applied.
    async fn create_answer(
        &self,
        remote: &SessionDescription,
    ) -> Result<SessionDescription, NegotiationError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    /// Release every backend resource. Idempotent.
    async fn close(&self);
}

#[async_trait]
pub trait NegotiatorFactory: Send + Sync {
    async fn create(
        &self,
        peer: &ConnectionId,
        role: Role,
    ) -> Result<(Arc<dyn Negotiator>, NegotiationEvents), NegotiationError>;
}
