//! Session table and relay-event dispatch.
//!
//! One [`PeerSession`] exists per remote peer id. Each runs in its own task
//! with an inbox, so a slow description request for one peer never holds up
//! another peer or the relay reader. A second task per session pumps the
//! negotiator's notifications: local candidates go straight to the relay,
//! connection-state changes go to the session inbox.
//!
//! The session task also creates the negotiator, and teardown releases it on
//! a task of its own, so the relay reader only ever touches the session table.
//! Tearing a session down aborts both tasks before the negotiator is
//! released, so a description request still in flight can never mutate the
//! session afterwards.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use calypso_proto::{ConnectionId, Inbound, PeerSignal, RelayEvent};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::negotiation::{NegotiationEvent, NegotiationEvents, Negotiator, NegotiatorFactory, Role};
use crate::session::{PeerSession, SessionCommand, SessionState, Step};
use crate::signaling::{SignalSink, SignalingError};

/// Notifications for the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// The relay told us our own id.
    Identified(ConnectionId),
    /// Current remote peers, self excluded.
    Roster(Vec<ConnectionId>),
    StateChanged {
        peer: ConnectionId,
        state: SessionState,
    },
    Connected(ConnectionId),
    Closed {
        peer: ConnectionId,
        reason: CloseReason,
    },
    /// `peer:update` payload, passed through unchanged.
    Update { peer: ConnectionId, params: Value },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    LeftRoster,
    NegotiationFailed(String),
    ConnectionFailed,
    ConnectionClosed,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::LeftRoster => f.write_str("peer left the roster"),
            CloseReason::NegotiationFailed(err) => write!(f, "negotiation failed: {err}"),
            CloseReason::ConnectionFailed => f.write_str("connection failed"),
            CloseReason::ConnectionClosed => f.write_str("connection closed"),
            CloseReason::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// Who initiates when a roster update introduces a new peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ContactPolicy {
    /// Only the side with the lexicographically smaller id calls.
    #[default]
    #[value(name = "lower-id")]
    LowerIdInitiates,
    /// Everyone calls every new peer; the first offer a side sees wins.
    Always,
}

impl ContactPolicy {
    pub fn should_initiate(self, local: &ConnectionId, remote: &ConnectionId) -> bool {
        match self {
            ContactPolicy::LowerIdInitiates => local < remote,
            ContactPolicy::Always => true,
        }
    }
}

/// Negotiator of one session, as far as its setup has got.
enum Backend {
    Pending,
    Ready {
        negotiator: Arc<dyn Negotiator>,
        pump: JoinHandle<()>,
    },
    Released,
}

struct SessionEntry {
    role: Role,
    generation: u64,
    inbox: mpsc::UnboundedSender<SessionCommand>,
    state_tx: Arc<watch::Sender<SessionState>>,
    backend: Arc<Mutex<Backend>>,
    actor: JoinHandle<()>,
}

/// Everything the session task needs to bring its session up.
struct SessionSetup {
    local: ConnectionId,
    peer: ConnectionId,
    role: Role,
    factory: Arc<dyn NegotiatorFactory>,
    sink: Arc<dyn SignalSink>,
    state_tx: Arc<watch::Sender<SessionState>>,
    events: mpsc::UnboundedSender<PeerEvent>,
    inbox: mpsc::UnboundedSender<SessionCommand>,
    backend: Arc<Mutex<Backend>>,
    manager: Weak<ManagerInner>,
    generation: u64,
}

struct ManagerInner {
    local_id: RwLock<Option<ConnectionId>>,
    sessions: Mutex<HashMap<ConnectionId, SessionEntry>>,
    factory: Arc<dyn NegotiatorFactory>,
    sink: Arc<dyn SignalSink>,
    policy: ContactPolicy,
    events: mpsc::UnboundedSender<PeerEvent>,
    generations: AtomicU64,
}

/// Owns every peer session of this client.
#[derive(Clone)]
pub struct PeerManager {
    inner: Arc<ManagerInner>,
}

impl PeerManager {
    pub fn new(
        factory: Arc<dyn NegotiatorFactory>,
        sink: Arc<dyn SignalSink>,
        policy: ContactPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ManagerInner {
            local_id: RwLock::new(None),
            sessions: Mutex::new(HashMap::new()),
            factory,
            sink,
            policy,
            events,
            generations: AtomicU64::new(0),
        });
        (Self { inner }, events_rx)
    }

    pub fn local_id(&self) -> Option<ConnectionId> {
        self.inner.local_id.read().clone()
    }

    pub fn policy(&self) -> ContactPolicy {
        self.inner.policy
    }

    pub fn session_state(&self, peer: &ConnectionId) -> Option<SessionState> {
        self.inner
            .sessions
            .lock()
            .get(peer)
            .map(|entry| *entry.state_tx.borrow())
    }

    pub fn session_role(&self, peer: &ConnectionId) -> Option<Role> {
        self.inner.sessions.lock().get(peer).map(|entry| entry.role)
    }

    /// Follow one session's state. The receiver sees `Closed` on teardown.
    pub fn watch(&self, peer: &ConnectionId) -> Option<watch::Receiver<SessionState>> {
        self.inner
            .sessions
            .lock()
            .get(peer)
            .map(|entry| entry.state_tx.subscribe())
    }

    /// Snapshot of the session table, ordered by peer id.
    pub fn sessions(&self) -> Vec<(ConnectionId, Role, SessionState)> {
        let mut sessions: Vec<_> = self
            .inner
            .sessions
            .lock()
            .iter()
            .map(|(peer, entry)| (peer.clone(), entry.role, *entry.state_tx.borrow()))
            .collect();
        sessions.sort_by(|a, b| a.0.cmp(&b.0));
        sessions
    }

    /// Send an application-level `peer:update` to `peer`.
    pub fn send_update(&self, peer: &ConnectionId, payload: Value) -> Result<(), SignalingError> {
        let from = self.local_id().ok_or(SignalingError::Closed)?;
        self.inner
            .sink
            .send_signal(peer, PeerSignal::Update { from, payload })
    }

    /// Dispatch one decoded relay event.
    pub async fn handle_inbound(&self, inbound: Inbound) {
        match inbound {
            Inbound::Relay(RelayEvent::Me { id }) => {
                info!(local_id = %id, "identified by relay");
                *self.inner.local_id.write() = Some(id.clone());
                let _ = self.inner.events.send(PeerEvent::Identified(id));
            }
            Inbound::Relay(RelayEvent::Peers(peers)) => {
                let roster: Vec<ConnectionId> = peers.into_iter().map(|peer| peer.id).collect();
                self.on_roster(roster).await;
            }
            Inbound::Peer(signal) => self.on_signal(signal).await,
        }
    }

    async fn on_roster(&self, roster: Vec<ConnectionId>) {
        let Some(local) = self.local_id() else {
            debug!("roster before identification; ignoring");
            return;
        };
        let remote: BTreeSet<ConnectionId> =
            roster.into_iter().filter(|id| *id != local).collect();
        let _ = self
            .inner
            .events
            .send(PeerEvent::Roster(remote.iter().cloned().collect()));

        let departed: Vec<ConnectionId> = self
            .inner
            .sessions
            .lock()
            .keys()
            .filter(|peer| !remote.contains(*peer))
            .cloned()
            .collect();
        for peer in departed {
            self.inner.teardown(&peer, None, CloseReason::LeftRoster);
        }

        for peer in remote {
            if self.inner.sessions.lock().contains_key(&peer) {
                continue;
            }
            if !self.inner.policy.should_initiate(&local, &peer) {
                debug!(peer_id = %peer, "waiting for the remote side to call");
                continue;
            }
            self.open_session(&local, peer, Role::Caller, SessionCommand::Start);
        }
    }

    async fn on_signal(&self, signal: PeerSignal) {
        let peer = signal.from_peer().clone();
        let command = match signal {
            PeerSignal::Update { payload, .. } => {
                let _ = self.inner.events.send(PeerEvent::Update {
                    peer,
                    params: payload,
                });
                return;
            }
            PeerSignal::Offer { description, .. } => SessionCommand::Offer(description),
            PeerSignal::Answer { description, .. } => SessionCommand::Answer(description),
            PeerSignal::Ice { candidate, .. } => SessionCommand::RemoteIce(candidate),
        };

        let inbox = self
            .inner
            .sessions
            .lock()
            .get(&peer)
            .map(|entry| entry.inbox.clone());
        if let Some(inbox) = inbox {
            if inbox.send(command).is_err() {
                debug!(peer_id = %peer, "session inbox closed; dropping signal");
            }
            return;
        }

        match command {
            SessionCommand::Offer(_) => {
                let Some(local) = self.local_id() else {
                    warn!(peer_id = %peer, "offer before identification; dropping");
                    return;
                };
                self.open_session(&local, peer, Role::Callee, command);
            }
            _ => {
                debug!(peer_id = %peer, "no session for signal; dropping");
            }
        }
    }

    /// Insert the entry and hand everything that can wait on the backend
    /// to the session task.
    fn open_session(
        &self,
        local: &ConnectionId,
        peer: ConnectionId,
        role: Role,
        first: SessionCommand,
    ) {
        let mut sessions = self.inner.sessions.lock();
        if sessions.contains_key(&peer) {
            debug!(peer_id = %peer, "session already open");
            return;
        }

        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let state_tx = Arc::new(state_tx);
        let backend = Arc::new(Mutex::new(Backend::Pending));
        let _ = inbox.send(first);

        let actor = tokio::spawn(run_session(
            SessionSetup {
                local: local.clone(),
                peer: peer.clone(),
                role,
                factory: Arc::clone(&self.inner.factory),
                sink: Arc::clone(&self.inner.sink),
                state_tx: Arc::clone(&state_tx),
                events: self.inner.events.clone(),
                inbox: inbox.clone(),
                backend: Arc::clone(&backend),
                manager: Arc::downgrade(&self.inner),
                generation,
            },
            inbox_rx,
        ));

        info!(peer_id = %peer, role = %role, "session opened");
        sessions.insert(
            peer,
            SessionEntry {
                role,
                generation,
                inbox,
                state_tx,
                backend,
                actor,
            },
        );
    }

    /// Close one session, if present.
    pub async fn close_session(&self, peer: &ConnectionId, reason: CloseReason) -> bool {
        self.inner.teardown(peer, None, reason)
    }

    /// Close every session, e.g. when the relay connection is lost.
    pub async fn shutdown(&self) {
        let peers: Vec<ConnectionId> = self.inner.sessions.lock().keys().cloned().collect();
        for peer in peers {
            self.inner.teardown(&peer, None, CloseReason::Shutdown);
        }
    }
}

impl ManagerInner {
    /// Remove the entry (only if it still belongs to `generation`, when
    /// given), stop its tasks, release the negotiator in the background and
    /// publish `Closed`.
    fn teardown(
        &self,
        peer: &ConnectionId,
        generation: Option<u64>,
        reason: CloseReason,
    ) -> bool {
        let entry = {
            let mut sessions = self.sessions.lock();
            match sessions.get(peer) {
                Some(entry) if generation.map_or(true, |g| g == entry.generation) => {
                    sessions.remove(peer)
                }
                _ => None,
            }
        };
        let Some(entry) = entry else {
            return false;
        };

        entry.actor.abort();
        let backend = std::mem::replace(&mut *entry.backend.lock(), Backend::Released);
        if let Backend::Ready { negotiator, pump } = backend {
            pump.abort();
            tokio::spawn(async move { negotiator.close().await });
        }
        entry.state_tx.send_replace(SessionState::Closed);

        info!(peer_id = %peer, role = %entry.role, reason = %reason, "session closed");
        let _ = self.events.send(PeerEvent::StateChanged {
            peer: peer.clone(),
            state: SessionState::Closed,
        });
        let _ = self.events.send(PeerEvent::Closed {
            peer: peer.clone(),
            reason,
        });
        true
    }
}

async fn run_session(setup: SessionSetup, mut inbox: mpsc::UnboundedReceiver<SessionCommand>) {
    let SessionSetup {
        local,
        peer,
        role,
        factory,
        sink,
        state_tx,
        events,
        inbox: inbox_tx,
        backend,
        manager,
        generation,
    } = setup;

    let (negotiator, negotiation_events) = match factory.create(&peer, role).await {
        Ok(created) => created,
        Err(err) => {
            warn!(peer_id = %peer, error = %err, "failed to create negotiator");
            let reason = CloseReason::NegotiationFailed(err.to_string());
            close_own_session(&manager, &peer, generation, reason);
            return;
        }
    };

    let released = {
        let mut slot = backend.lock();
        if matches!(*slot, Backend::Released) {
            true
        } else {
            let pump = tokio::spawn(pump_negotiation(
                local.clone(),
                peer.clone(),
                negotiation_events,
                Arc::clone(&sink),
                inbox_tx,
            ));
            *slot = Backend::Ready {
                negotiator: Arc::clone(&negotiator),
                pump,
            };
            false
        }
    };
    if released {
        debug!(peer_id = %peer, "session closed while its negotiator was being created");
        tokio::spawn(async move { negotiator.close().await });
        return;
    }

    let mut session = PeerSession::new(local, peer, role, negotiator, sink, state_tx, events);
    while let Some(command) = inbox.recv().await {
        let reason = match session.handle(command).await {
            Ok(Step::Continue) => continue,
            Ok(Step::Close(reason)) => reason,
            Err(err) => {
                warn!(peer_id = %session.peer(), error = %err, "negotiation failed");
                CloseReason::NegotiationFailed(err.to_string())
            }
        };
        close_own_session(&manager, session.peer(), generation, reason);
        return;
    }
}

/// Teardown from inside the session task. It aborts this task, which only
/// takes effect at the next await, so nothing after the call may await.
fn close_own_session(
    manager: &Weak<ManagerInner>,
    peer: &ConnectionId,
    generation: u64,
    reason: CloseReason,
) {
    if let Some(manager) = manager.upgrade() {
        manager.teardown(peer, Some(generation), reason);
    }
}

async fn pump_negotiation(
    local: ConnectionId,
    peer: ConnectionId,
    mut events: NegotiationEvents,
    sink: Arc<dyn SignalSink>,
    inbox: mpsc::UnboundedSender<SessionCommand>,
) {
    while let Some(event) = events.recv().await {
        match event {
            NegotiationEvent::IceCandidate(candidate) => {
                let signal = PeerSignal::Ice {
                    from: local.clone(),
                    candidate,
                };
                if let Err(err) = sink.send_signal(&peer, signal) {
                    warn!(peer_id = %peer, error = %err, "failed to forward local candidate");
                }
            }
            NegotiationEvent::ConnectionState(state) => {
                if inbox.send(SessionCommand::ConnectionState(state)).is_err() {
                    break;
                }
            }
        }
    }
}
