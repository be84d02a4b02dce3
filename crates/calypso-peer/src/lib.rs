//! Peer side of Calypso signaling.
//!
//! A [`SignalingClient`] connects to the relay; every decoded event is fed to
//! a [`PeerManager`], which keeps one [`PeerSession`] per remote peer and
//! drives its offer/answer/ICE exchange through a [`Negotiator`].

pub mod manager;
#[cfg(any(test, feature = "test-support"))]
pub mod mock;
pub mod negotiation;
pub mod rtc;
pub mod session;
pub mod signaling;

pub use manager::{CloseReason, ContactPolicy, PeerEvent, PeerManager};
pub use negotiation::{
    ConnectionState, NegotiationError, NegotiationEvent, Negotiator, NegotiatorFactory, Role,
};
pub use rtc::RtcNegotiatorFactory;
pub use session::{PeerSession, SessionState};
pub use signaling::{RelaySender, SignalSink, SignalingClient, SignalingError};
