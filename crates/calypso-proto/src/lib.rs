//! Wire types shared by the Calypso signaling relay and its peers.
//!
//! Every frame on the wire is a single JSON [`Envelope`] of the form
//! `{ "method": string, "params": array }`. Relay-level traffic uses the
//! `me`, `peers`, `message` and `broadcast` methods; session-level traffic
//! (`peer:offer`, `peer:answer`, `peer:ice`, `peer:update`) travels inside
//! `message` payloads and is opaque to the relay.

mod envelope;
mod message;

pub use envelope::{Envelope, EnvelopeError};
pub use message::{
    forwarded_frame, method, ConnectionId, IceCandidate, Inbound, PeerInfo, PeerSignal,
    RelayEvent, RelayRequest, SdpKind, SessionDescription,
};
