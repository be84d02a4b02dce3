//! Per-remote-peer negotiation state machine.
//!
//! ```text
//! Idle -> OfferCreated  -> AnswerReceived -> NegotiatingIce -> Connected   (caller)
//! Idle -> OfferReceived -> AnswerCreated  -> NegotiatingIce -> Connected   (callee)
//! ```
//!
//! `Closed` is reachable from every state and is applied by the owner of the
//! session (see [`crate::manager`]), which also releases the negotiator.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use calypso_proto::{ConnectionId, IceCandidate, PeerSignal, SessionDescription};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::manager::{CloseReason, PeerEvent};
use crate::negotiation::{ConnectionState, NegotiationError, Negotiator, Role};
use crate::signaling::SignalSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    OfferCreated,
    OfferReceived,
    AnswerCreated,
    AnswerReceived,
    NegotiatingIce,
    Connected,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::OfferCreated => "offer_created",
            SessionState::OfferReceived => "offer_received",
            SessionState::AnswerCreated => "answer_created",
            SessionState::AnswerReceived => "answer_received",
            SessionState::NegotiatingIce => "negotiating_ice",
            SessionState::Connected => "connected",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Inputs a session reacts to, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    /// Caller only: create and send the offer.
    Start,
    Offer(SessionDescription),
    Answer(SessionDescription),
    RemoteIce(IceCandidate),
    ConnectionState(ConnectionState),
}

/// What the owner should do after a command was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Continue,
    Close(CloseReason),
}

pub struct PeerSession {
    local_id: ConnectionId,
    peer: ConnectionId,
    role: Role,
    state: SessionState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    pending_ice: VecDeque<IceCandidate>,
    negotiator: Arc<dyn Negotiator>,
    sink: Arc<dyn SignalSink>,
    state_tx: Arc<watch::Sender<SessionState>>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerSession {
    pub fn new(
        local_id: ConnectionId,
        peer: ConnectionId,
        role: Role,
        negotiator: Arc<dyn Negotiator>,
        sink: Arc<dyn SignalSink>,
        state_tx: Arc<watch::Sender<SessionState>>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            local_id,
            peer,
            role,
            state: SessionState::Idle,
            local_description: None,
            remote_description: None,
            pending_ice: VecDeque::new(),
            negotiator,
            sink,
            state_tx,
            events,
        }
    }

    pub fn peer(&self) -> &ConnectionId {
        &self.peer
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    pub fn pending_ice(&self) -> usize {
        self.pending_ice.len()
    }

    pub async fn handle(&mut self, command: SessionCommand) -> Result<Step, NegotiationError> {
        match command {
            SessionCommand::Start => self.start().await,
            SessionCommand::Offer(offer) => self.on_offer(offer).await,
            SessionCommand::Answer(answer) => self.on_answer(answer).await,
            SessionCommand::RemoteIce(candidate) => self.on_remote_ice(candidate).await,
            SessionCommand::ConnectionState(state) => Ok(self.on_connection_state(state)),
        }
    }

    async fn start(&mut self) -> Result<Step, NegotiationError> {
        if self.role != Role::Caller || self.state != SessionState::Idle {
            debug!(peer_id = %self.peer, state = %self.state, "ignoring start");
            return Ok(Step::Continue);
        }
        let offer = self.negotiator.create_offer().await?;
        self.negotiator.set_local_description(offer.clone()).await?;
        self.local_description = Some(offer.clone());
        self.transition(SessionState::OfferCreated);
        self.send(PeerSignal::Offer {
            from: self.local_id.clone(),
            description: offer,
        });
        Ok(Step::Continue)
    }

    async fn on_offer(&mut self, offer: SessionDescription) -> Result<Step, NegotiationError> {
        if self.role != Role::Callee || self.state != SessionState::Idle {
            // First offer wins; renegotiation is not supported.
            warn!(
                peer_id = %self.peer,
                role = %self.role,
                state = %self.state,
                "ignoring offer for established session"
            );
            return Ok(Step::Continue);
        }
        self.transition(SessionState::OfferReceived);
        self.apply_remote(offer.clone()).await?;

        let answer = self.negotiator.create_answer(&offer).await?;
        self.negotiator.set_local_description(answer.clone()).await?;
        self.local_description = Some(answer.clone());
        self.transition(SessionState::AnswerCreated);
        self.send(PeerSignal::Answer {
            from: self.local_id.clone(),
            description: answer,
        });
        Ok(Step::Continue)
    }

    async fn on_answer(&mut self, answer: SessionDescription) -> Result<Step, NegotiationError> {
        if self.role != Role::Caller || self.state != SessionState::OfferCreated {
            warn!(
                peer_id = %self.peer,
                role = %self.role,
                state = %self.state,
                "ignoring unexpected answer"
            );
            return Ok(Step::Continue);
        }
        self.transition(SessionState::AnswerReceived);
        self.apply_remote(answer).await?;
        self.transition(SessionState::NegotiatingIce);
        Ok(Step::Continue)
    }

    async fn on_remote_ice(&mut self, candidate: IceCandidate) -> Result<Step, NegotiationError> {
        if self.remote_description.is_none() {
            debug!(
                peer_id = %self.peer,
                queued = self.pending_ice.len() + 1,
                "queueing remote candidate until remote description is applied"
            );
            self.pending_ice.push_back(candidate);
            return Ok(Step::Continue);
        }
        self.negotiator.add_ice_candidate(candidate).await?;
        Ok(Step::Continue)
    }

    fn on_connection_state(&mut self, state: ConnectionState) -> Step {
        debug!(peer_id = %self.peer, connection_state = ?state, "connection state changed");
        match state {
            ConnectionState::Connected => {
                if self.state != SessionState::Connected {
                    self.transition(SessionState::Connected);
                }
                Step::Continue
            }
            ConnectionState::Connecting if self.state == SessionState::AnswerCreated => {
                self.transition(SessionState::NegotiatingIce);
                Step::Continue
            }
            ConnectionState::Failed => Step::Close(CloseReason::ConnectionFailed),
            ConnectionState::Closed => Step::Close(CloseReason::ConnectionClosed),
            ConnectionState::New | ConnectionState::Connecting | ConnectionState::Disconnected => {
                Step::Continue
            }
        }
    }

    /// Apply the remote description, then hand over every queued candidate
    /// in receipt order.
    async fn apply_remote(&mut self, description: SessionDescription) -> Result<(), NegotiationError> {
        self.negotiator
            .set_remote_description(description.clone())
            .await?;
        self.remote_description = Some(description);
        if !self.pending_ice.is_empty() {
            debug!(
                peer_id = %self.peer,
                count = self.pending_ice.len(),
                "flushing queued remote candidates"
            );
        }
        while let Some(candidate) = self.pending_ice.pop_front() {
            self.negotiator.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    fn transition(&mut self, next: SessionState) {
        info!(peer_id = %self.peer, role = %self.role, from = %self.state, to = %next, "session state");
        self.state = next;
        self.state_tx.send_replace(next);
        let _ = self.events.send(PeerEvent::StateChanged {
            peer: self.peer.clone(),
            state: next,
        });
        if next == SessionState::Connected {
            let _ = self.events.send(PeerEvent::Connected(self.peer.clone()));
        }
    }

    fn send(&self, signal: PeerSignal) {
        let method = signal.method();
        if let Err(err) = self.sink.send_signal(&self.peer, signal) {
            warn!(peer_id = %self.peer, method, error = %err, "failed to send signal");
        }
    }
}
