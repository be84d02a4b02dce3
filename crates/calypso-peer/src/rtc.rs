//! webrtc-rs backed negotiation capability.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use calypso_proto::{ConnectionId, IceCandidate, SdpKind, SessionDescription};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::negotiation::{
    ConnectionState, NegotiationError, NegotiationEvent, NegotiationEvents, Negotiator,
    NegotiatorFactory, Role,
};

/// Label of the data channel the caller opens.
pub const DEFAULT_CHANNEL_LABEL: &str = "defaultChannel";

pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.services.mozilla.com",
    "stun:stun.l.google.com:19302",
];

fn backend(err: webrtc::Error) -> NegotiationError {
    NegotiationError::Backend(err.to_string())
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp).map_err(backend),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp).map_err(backend),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(description.sdp).map_err(backend),
        SdpKind::Rollback => Err(NegotiationError::UnsupportedDescription("rollback".into())),
    }
}

fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription, NegotiationError> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        other => {
            return Err(NegotiationError::UnsupportedDescription(other.to_string()));
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp,
    })
}

fn connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        _ => None,
    }
}

/// Builds one `RTCPeerConnection` per remote peer.
pub struct RtcNegotiatorFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl RtcNegotiatorFactory {
    pub fn new(stun_urls: Vec<String>) -> Self {
        let ice_servers = stun_urls
            .into_iter()
            .map(|url| RTCIceServer {
                urls: vec![url],
                ..Default::default()
            })
            .collect();
        Self {
            api: APIBuilder::new().build(),
            ice_servers,
        }
    }
}

impl Default for RtcNegotiatorFactory {
    fn default() -> Self {
        Self::new(DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect())
    }
}

#[async_trait]
impl NegotiatorFactory for RtcNegotiatorFactory {
    async fn create(
        &self,
        peer: &ConnectionId,
        role: Role,
    ) -> Result<(Arc<dyn Negotiator>, NegotiationEvents), NegotiationError> {
        let rtc_config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let peer_connection = Arc::new(
            self.api
                .new_peer_connection(rtc_config)
                .await
                .map_err(backend)?,
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let ice_tx = events_tx.clone();
        let ice_peer = peer.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = ice_tx.clone();
            let peer = ice_peer.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!(peer_id = %peer, "ice gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(NegotiationEvent::IceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => warn!(peer_id = %peer, error = %err, "failed to encode local candidate"),
                }
            })
        }));

        let state_tx = events_tx;
        let state_peer = peer.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let tx = state_tx.clone();
                let peer = state_peer.clone();
                Box::pin(async move {
                    debug!(peer_id = %peer, state = %state, "peer connection state changed");
                    if let Some(state) = connection_state(state) {
                        let _ = tx.send(NegotiationEvent::ConnectionState(state));
                    }
                })
            },
        ));

        match role {
            Role::Caller => {
                let channel = peer_connection
                    .create_data_channel(DEFAULT_CHANNEL_LABEL, None)
                    .await
                    .map_err(backend)?;
                debug!(peer_id = %peer, label = channel.label(), "data channel created");
            }
            Role::Callee => {
                let dc_peer = peer.clone();
                peer_connection.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                    let peer = dc_peer.clone();
                    Box::pin(async move {
                        info!(peer_id = %peer, label = channel.label(), "data channel received");
                    })
                }));
            }
        }

        let negotiator = RtcNegotiator {
            peer_connection,
            closed: AtomicBool::new(false),
        };
        Ok((Arc::new(negotiator), events_rx))
    }
}

pub struct RtcNegotiator {
    peer_connection: Arc<RTCPeerConnection>,
    closed: AtomicBool,
}

impl RtcNegotiator {
    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NegotiationError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Negotiator for RtcNegotiator {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(backend)?;
        from_rtc(offer)
    }

    async fn create_answer(
        &self,
        remote: &SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        if remote.kind != SdpKind::Offer {
            return Err(NegotiationError::UnsupportedDescription(format!(
                "cannot answer {:?}",
                remote.kind
            )));
        }
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(backend)?;
        from_rtc(answer)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        self.peer_connection
            .set_local_description(to_rtc(description)?)
            .await
            .map_err(backend)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        self.peer_connection
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(backend)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(backend)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.peer_connection.close().await {
            warn!(error = %err, "failed to close peer connection");
        }
    }
}
