use std::sync::Arc;
use std::time::Duration;

use calypso_peer::mock::{MockCall, MockNegotiatorFactory};
use calypso_peer::{
    ContactPolicy, NegotiationEvent, PeerEvent, PeerManager, Role, SessionState, SignalingClient,
};
use calypso_proto::{ConnectionId, IceCandidate};
use calypso_relay::{serve_on, AppState, RelayConfig};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

struct Peer {
    manager: PeerManager,
    _events: mpsc::UnboundedReceiver<PeerEvent>,
    factory: Arc<MockNegotiatorFactory>,
    driver: JoinHandle<()>,
}

impl Peer {
    async fn join(url: &str) -> Self {
        let mut client = SignalingClient::connect(url).await.expect("connect");
        let factory = Arc::new(MockNegotiatorFactory::new());
        let (manager, events) = PeerManager::new(
            factory.clone(),
            Arc::new(client.sender()),
            ContactPolicy::LowerIdInitiates,
        );
        let inbound = manager.clone();
        let driver = tokio::spawn(async move {
            while let Some(event) = client.recv().await {
                inbound.handle_inbound(event).await;
            }
        });
        Self {
            manager,
            _events: events,
            factory,
            driver,
        }
    }

    fn id(&self) -> ConnectionId {
        self.manager.local_id().expect("identified")
    }
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(10)).await;
    }
}

async fn spawn_relay() -> (String, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener bind");
    let addr = listener.local_addr().expect("local addr");
    let config = RelayConfig {
        listen_addr: addr,
        ..RelayConfig::default()
    };
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        serve_on(listener, AppState::new(config, None), async {
            let _ = shutdown_rx.await;
        })
        .await
        .ok();
    });
    (format!("ws://{addr}/"), shutdown_tx)
}

#[tokio::test]
async fn two_peers_negotiate_through_the_relay() {
    let (url, shutdown) = spawn_relay().await;
    let first = Peer::join(&url).await;
    let second = Peer::join(&url).await;

    wait_until("identification", || {
        first.manager.local_id().is_some() && second.manager.local_id().is_some()
    })
    .await;
    let (caller, callee) = if first.id() < second.id() {
        (&first, &second)
    } else {
        (&second, &first)
    };
    let caller_id = caller.id();
    let callee_id = callee.id();

    wait_until("offer/answer exchange", || {
        caller.manager.session_state(&callee_id) == Some(SessionState::NegotiatingIce)
            && callee.manager.session_state(&caller_id) == Some(SessionState::AnswerCreated)
    })
    .await;
    assert_eq!(caller.manager.session_role(&callee_id), Some(Role::Caller));
    assert_eq!(callee.manager.session_role(&caller_id), Some(Role::Callee));

    // The callee applied exactly the offer the caller produced.
    let caller_negotiator = caller.factory.negotiator(&callee_id).expect("caller side");
    let callee_negotiator = callee.factory.negotiator(&caller_id).expect("callee side");
    let offer = caller_negotiator
        .calls()
        .into_iter()
        .find_map(|call| match call {
            MockCall::SetLocalDescription(description) => Some(description),
            _ => None,
        })
        .expect("caller offer");
    assert_eq!(
        callee_negotiator.calls()[0],
        MockCall::SetRemoteDescription(offer)
    );

    // A locally gathered candidate lands in the remote negotiator.
    let candidate = IceCandidate::new("candidate:7 1 udp 1 127.0.0.1 7000 typ host");
    caller_negotiator.emit(NegotiationEvent::IceCandidate(candidate.clone()));
    wait_until("remote candidate", || {
        callee_negotiator
            .calls()
            .contains(&MockCall::AddIceCandidate(candidate.clone()))
    })
    .await;

    // When one side leaves, the other closes its session.
    first.driver.abort();
    drop(first);
    let survivor = &second;
    wait_until("session teardown", || survivor.manager.sessions().is_empty()).await;

    shutdown.send(()).ok();
}
