//! Scripted in-memory negotiation capability and signal sink.
//!
//! [`MockNegotiator`] records every call in order, can be told to fail an
//! operation, and can hold an operation open until the test releases it.
//! Built for tests and behind the `test-support` feature.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use calypso_proto::{ConnectionId, IceCandidate, PeerSignal, SessionDescription};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use crate::negotiation::{
    NegotiationError, NegotiationEvent, NegotiationEvents, Negotiator, NegotiatorFactory, Role,
};
use crate::signaling::{SignalSink, SignalingError};

#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    CreateOffer,
    CreateAnswer(SessionDescription),
    SetLocalDescription(SessionDescription),
    SetRemoteDescription(SessionDescription),
    AddIceCandidate(IceCandidate),
    Close,
}

/// Holds one operation open until [`Gate::release`] is called.
#[derive(Clone, Default)]
pub struct Gate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl Gate {
    /// Resolves once the gated operation has been called.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }

    async fn pass(&self) {
        self.entered.notify_one();
        self.release.notified().await;
    }
}

pub struct MockNegotiator {
    calls: Mutex<Vec<MockCall>>,
    failures: Mutex<Vec<&'static str>>,
    gates: Mutex<HashMap<&'static str, Gate>>,
    events: mpsc::UnboundedSender<NegotiationEvent>,
    counter: Mutex<u32>,
}

impl MockNegotiator {
    pub fn new() -> (Arc<Self>, NegotiationEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let negotiator = Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            gates: Mutex::new(HashMap::new()),
            events,
            counter: Mutex::new(0),
        });
        (negotiator, rx)
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.calls.lock().contains(&MockCall::Close)
    }

    /// Make the next call to `op` (e.g. `"create_offer"`) fail.
    pub fn fail_next(&self, op: &'static str) {
        self.failures.lock().push(op);
    }

    /// Hold the next call to `op` open until the returned gate is released.
    pub fn gate(&self, op: &'static str) -> Gate {
        let gate = Gate::default();
        self.gates.lock().insert(op, gate.clone());
        gate
    }

    /// Push a notification as if the backend produced it.
    pub fn emit(&self, event: NegotiationEvent) {
        let _ = self.events.send(event);
    }

    async fn enter(&self, op: &'static str, call: MockCall) -> Result<(), NegotiationError> {
        self.calls.lock().push(call);
        let gate = self.gates.lock().remove(op);
        if let Some(gate) = gate {
            gate.pass().await;
        }
        let mut failures = self.failures.lock();
        if let Some(pos) = failures.iter().position(|failing| *failing == op) {
            failures.remove(pos);
            return Err(NegotiationError::Backend(format!("{op} failed")));
        }
        Ok(())
    }

    fn next_sdp(&self, kind: &str) -> String {
        let mut counter = self.counter.lock();
        *counter += 1;
        format!("v=0 mock-{kind}-{}", *counter)
    }
}

#[async_trait]
impl Negotiator for MockNegotiator {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.enter("create_offer", MockCall::CreateOffer).await?;
        Ok(SessionDescription::offer(self.next_sdp("offer")))
    }

    async fn create_answer(
        &self,
        remote: &SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        self.enter("create_answer", MockCall::CreateAnswer(remote.clone()))
            .await?;
        Ok(SessionDescription::answer(self.next_sdp("answer")))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.enter(
            "set_local_description",
            MockCall::SetLocalDescription(description),
        )
        .await
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.enter(
            "set_remote_description",
            MockCall::SetRemoteDescription(description),
        )
        .await
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.enter("add_ice_candidate", MockCall::AddIceCandidate(candidate))
            .await
    }

    async fn close(&self) {
        self.calls.lock().push(MockCall::Close);
        let gate = self.gates.lock().remove("close");
        if let Some(gate) = gate {
            gate.pass().await;
        }
    }
}

/// Hands out [`MockNegotiator`]s and keeps them for inspection.
#[derive(Default)]
pub struct MockNegotiatorFactory {
    created: Mutex<Vec<(ConnectionId, Role, Arc<MockNegotiator>)>>,
    prepared: Mutex<HashMap<ConnectionId, (Arc<MockNegotiator>, NegotiationEvents)>>,
    create_gate: Mutex<Option<Gate>>,
}

impl MockNegotiatorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a pre-built negotiator for the next session with `peer`, so a test
    /// can arm failures or gates before the session exists.
    pub fn prepare(&self, peer: impl Into<ConnectionId>) -> Arc<MockNegotiator> {
        let (negotiator, events) = MockNegotiator::new();
        self.prepared
            .lock()
            .insert(peer.into(), (negotiator.clone(), events));
        negotiator
    }

    /// Hold the next `create` open until the returned gate is released.
    pub fn gate_create(&self) -> Gate {
        let gate = Gate::default();
        *self.create_gate.lock() = Some(gate.clone());
        gate
    }

    pub fn created(&self) -> Vec<(ConnectionId, Role, Arc<MockNegotiator>)> {
        self.created.lock().clone()
    }

    /// Most recent negotiator created for `peer`.
    pub fn negotiator(&self, peer: &ConnectionId) -> Option<Arc<MockNegotiator>> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|(id, _, _)| id == peer)
            .map(|(_, _, negotiator)| negotiator.clone())
    }
}

#[async_trait]
impl NegotiatorFactory for MockNegotiatorFactory {
    async fn create(
        &self,
        peer: &ConnectionId,
        role: Role,
    ) -> Result<(Arc<dyn Negotiator>, NegotiationEvents), NegotiationError> {
        let gate = self.create_gate.lock().take();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        let prepared = self.prepared.lock().remove(peer);
        let (negotiator, events) = match prepared {
            Some(prepared) => prepared,
            None => MockNegotiator::new(),
        };
        self.created
            .lock()
            .push((peer.clone(), role, negotiator.clone()));
        Ok((negotiator, events))
    }
}

/// [`SignalSink`] that keeps everything it is asked to send.
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<(ConnectionId, PeerSignal)>>,
}

impl RecordingSink {
    pub fn sent(&self) -> Vec<(ConnectionId, PeerSignal)> {
        self.sent.lock().clone()
    }
}

impl SignalSink for RecordingSink {
    fn send_signal(&self, target: &ConnectionId, signal: PeerSignal) -> Result<(), SignalingError> {
        self.sent.lock().push((target.clone(), signal));
        Ok(())
    }
}
