use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::envelope::{Envelope, EnvelopeError};

/// Method names used on the wire.
pub mod method {
    pub const ME: &str = "me";
    pub const PEERS: &str = "peers";
    pub const MESSAGE: &str = "message";
    /// Unicast alias used by the push-gateway deployment.
    pub const POST: &str = "post";
    pub const BROADCAST: &str = "broadcast";
    pub const PEER_OFFER: &str = "peer:offer";
    pub const PEER_ANSWER: &str = "peer:answer";
    pub const PEER_ICE: &str = "peer:ice";
    pub const PEER_UPDATE: &str = "peer:update";
}

/// Opaque id of a live transport connection. Peers use the same id space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id, used by transports that mint their own ids.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Roster entry as carried by the `peers` method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: ConnectionId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description in the browser `RTCSessionDescriptionInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Requests a client sends to the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayRequest {
    /// Unicast `payload` to `target`.
    Message { target: ConnectionId, payload: Value },
    /// Fan `payload` out to every registered connection.
    Broadcast { payload: Value },
}

impl RelayRequest {
    pub fn message(target: ConnectionId, payload: Value) -> Self {
        RelayRequest::Message { target, payload }
    }

    pub fn into_envelope(self) -> Envelope {
        match self {
            RelayRequest::Message { target, payload } => Envelope::new(
                method::MESSAGE,
                vec![Value::String(target.to_string()), payload],
            ),
            RelayRequest::Broadcast { payload } => Envelope::new(method::BROADCAST, vec![payload]),
        }
    }
}

impl TryFrom<Envelope> for RelayRequest {
    type Error = EnvelopeError;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        let Envelope { method, params } = envelope;
        let mut params = params.into_iter();
        match method.as_str() {
            method::MESSAGE | method::POST => {
                let target = match params.next() {
                    Some(Value::String(target)) => ConnectionId::from(target),
                    _ => {
                        return Err(EnvelopeError::invalid_param(
                            &method,
                            0,
                            "target id must be a string",
                        ))
                    }
                };
                let payload = params.next().ok_or_else(|| {
                    EnvelopeError::invalid_param(&method, 1, "missing payload envelope")
                })?;
                Ok(RelayRequest::Message { target, payload })
            }
            method::BROADCAST => {
                let payload = params.next().ok_or_else(|| {
                    EnvelopeError::invalid_param(&method, 0, "missing payload envelope")
                })?;
                Ok(RelayRequest::Broadcast { payload })
            }
            _ => Err(EnvelopeError::UnknownMethod(method)),
        }
    }
}

/// Frame text for a forwarded payload. String payloads are already-encoded
/// envelopes and pass through untouched; anything else is serialized.
pub fn forwarded_frame(payload: &Value) -> String {
    match payload {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Events the relay pushes to its clients.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// The receiving client's own id.
    Me { id: ConnectionId },
    /// Full roster snapshot.
    Peers(Vec<PeerInfo>),
}

impl RelayEvent {
    pub fn roster<'a>(ids: impl IntoIterator<Item = &'a ConnectionId>) -> Self {
        RelayEvent::Peers(
            ids.into_iter()
                .map(|id| PeerInfo { id: id.clone() })
                .collect(),
        )
    }

    pub fn into_envelope(self) -> Envelope {
        match self {
            RelayEvent::Me { id } => Envelope::new(method::ME, vec![json!({ "id": id })]),
            RelayEvent::Peers(peers) => {
                let roster = serde_json::to_value(peers).unwrap_or(Value::Array(Vec::new()));
                Envelope::new(method::PEERS, vec![roster])
            }
        }
    }
}

/// Session-level signals exchanged between two peers through `message`.
/// The first parameter of every signal is the sender's id.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerSignal {
    Offer {
        from: ConnectionId,
        description: SessionDescription,
    },
    Answer {
        from: ConnectionId,
        description: SessionDescription,
    },
    Ice {
        from: ConnectionId,
        candidate: IceCandidate,
    },
    Update {
        from: ConnectionId,
        payload: Value,
    },
}

impl PeerSignal {
    pub fn from_peer(&self) -> &ConnectionId {
        match self {
            PeerSignal::Offer { from, .. }
            | PeerSignal::Answer { from, .. }
            | PeerSignal::Ice { from, .. }
            | PeerSignal::Update { from, .. } => from,
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            PeerSignal::Offer { .. } => method::PEER_OFFER,
            PeerSignal::Answer { .. } => method::PEER_ANSWER,
            PeerSignal::Ice { .. } => method::PEER_ICE,
            PeerSignal::Update { .. } => method::PEER_UPDATE,
        }
    }

    pub fn into_envelope(self) -> Envelope {
        let method = self.method();
        let (from, payload) = match self {
            PeerSignal::Offer { from, description } | PeerSignal::Answer { from, description } => {
                (from, serde_json::to_value(description).unwrap_or(Value::Null))
            }
            PeerSignal::Ice { from, candidate } => {
                (from, serde_json::to_value(candidate).unwrap_or(Value::Null))
            }
            PeerSignal::Update { from, payload } => (from, payload),
        };
        Envelope::new(method, vec![Value::String(from.to_string()), payload])
    }

    /// Wrap this signal in a relay `message` addressed to `target`.
    pub fn addressed_to(self, target: ConnectionId) -> RelayRequest {
        RelayRequest::Message {
            target,
            payload: self.into_envelope().to_value(),
        }
    }
}

/// Everything a client can receive from the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Relay(RelayEvent),
    Peer(PeerSignal),
}

impl TryFrom<Envelope> for Inbound {
    type Error = EnvelopeError;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        let Envelope { method, params } = envelope;
        match method.as_str() {
            method::ME => {
                let id = params
                    .first()
                    .and_then(|info| info.get("id"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| EnvelopeError::invalid_param(&method, 0, "expected {id}"))?;
                Ok(Inbound::Relay(RelayEvent::Me {
                    id: ConnectionId::from(id),
                }))
            }
            method::PEERS => {
                let roster = params
                    .into_iter()
                    .next()
                    .ok_or_else(|| EnvelopeError::invalid_param(&method, 0, "missing roster"))?;
                let peers: Vec<PeerInfo> = serde_json::from_value(roster)
                    .map_err(|err| EnvelopeError::invalid_param(&method, 0, err.to_string()))?;
                Ok(Inbound::Relay(RelayEvent::Peers(peers)))
            }
            method::PEER_OFFER | method::PEER_ANSWER | method::PEER_ICE | method::PEER_UPDATE => {
                let mut params = params.into_iter();
                let from = match params.next() {
                    Some(Value::String(from)) => ConnectionId::from(from),
                    _ => {
                        return Err(EnvelopeError::invalid_param(
                            &method,
                            0,
                            "sender id must be a string",
                        ))
                    }
                };
                let payload = params.next().unwrap_or(Value::Null);
                let signal = match method.as_str() {
                    method::PEER_OFFER => PeerSignal::Offer {
                        from,
                        description: parse_param(&method, payload)?,
                    },
                    method::PEER_ANSWER => PeerSignal::Answer {
                        from,
                        description: parse_param(&method, payload)?,
                    },
                    method::PEER_ICE => PeerSignal::Ice {
                        from,
                        candidate: parse_param(&method, payload)?,
                    },
                    _ => PeerSignal::Update { from, payload },
                };
                Ok(Inbound::Peer(signal))
            }
            _ => Err(EnvelopeError::UnknownMethod(method)),
        }
    }
}

fn parse_param<T: serde::de::DeserializeOwned>(
    method: &str,
    payload: Value,
) -> Result<T, EnvelopeError> {
    serde_json::from_value(payload)
        .map_err(|err| EnvelopeError::invalid_param(method, 1, err.to_string()))
}
