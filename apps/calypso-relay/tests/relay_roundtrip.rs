use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Duration;

use calypso_proto::{ConnectionId, Envelope, Inbound, RelayEvent, RelayRequest};
use calypso_relay::{serve_on, AppState, BroadcastPolicy, RelayConfig};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_relay(policy: BroadcastPolicy) -> (SocketAddr, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener bind");
    let addr = listener.local_addr().expect("local addr");
    let config = RelayConfig {
        listen_addr: addr,
        broadcast_policy: policy,
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
    (addr, shutdown_tx)
}

async fn connect(addr: SocketAddr) -> Client {
    let (ws, _) = connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("connect");
    ws
}

async fn next_envelope(client: &mut Client) -> Envelope {
    loop {
        let frame = timeout(Duration::from_secs(2), client.next())
            .await
            .expect("frame before timeout")
            .expect("stream open")
            .expect("frame");
        if let Message::Text(text) = frame {
            return Envelope::decode_str(text.as_str()).expect("envelope");
        }
    }
}

async fn expect_me(client: &mut Client) -> ConnectionId {
    match Inbound::try_from(next_envelope(client).await).expect("inbound") {
        Inbound::Relay(RelayEvent::Me { id }) => id,
        other => panic!("expected `me`, got {other:?}"),
    }
}

async fn expect_roster(client: &mut Client) -> BTreeSet<ConnectionId> {
    match Inbound::try_from(next_envelope(client).await).expect("inbound") {
        Inbound::Relay(RelayEvent::Peers(peers)) => peers.into_iter().map(|p| p.id).collect(),
        other => panic!("expected `peers`, got {other:?}"),
    }
}

async fn send(client: &mut Client, request: RelayRequest) {
    client
        .send(Message::text(request.into_envelope().encode()))
        .await
        .expect("send");
}

#[tokio::test]
async fn sequential_joins_converge_on_full_roster() {
    let (addr, shutdown) = spawn_relay(BroadcastPolicy::IncludeSender).await;

    let mut a = connect(addr).await;
    let a_id = expect_me(&mut a).await;
    assert_eq!(expect_roster(&mut a).await, BTreeSet::from([a_id.clone()]));

    let mut b = connect(addr).await;
    let b_id = expect_me(&mut b).await;
    assert_eq!(
        expect_roster(&mut b).await,
        BTreeSet::from([a_id.clone(), b_id.clone()])
    );

    let mut c = connect(addr).await;
    let c_id = expect_me(&mut c).await;
    let full = BTreeSet::from([a_id.clone(), b_id.clone(), c_id.clone()]);
    assert_eq!(expect_roster(&mut c).await, full);

    // A saw one roster per join.
    assert_eq!(
        expect_roster(&mut a).await,
        BTreeSet::from([a_id.clone(), b_id.clone()])
    );
    assert_eq!(expect_roster(&mut a).await, full);
    assert_eq!(expect_roster(&mut b).await, full);

    // Leaving shrinks everyone's roster.
    c.close(None).await.expect("close c");
    let remaining = BTreeSet::from([a_id, b_id]);
    assert_eq!(expect_roster(&mut a).await, remaining);
    assert_eq!(expect_roster(&mut b).await, remaining);

    shutdown.send(()).ok();
}

#[tokio::test]
async fn unicast_reaches_only_its_target() {
    let (addr, shutdown) = spawn_relay(BroadcastPolicy::IncludeSender).await;

    let mut a = connect(addr).await;
    let _a_id = expect_me(&mut a).await;
    expect_roster(&mut a).await;
    let mut b = connect(addr).await;
    let b_id = expect_me(&mut b).await;
    expect_roster(&mut b).await;
    expect_roster(&mut a).await;

    let inner = json!({ "method": "ping", "params": [1] });
    send(&mut a, RelayRequest::message(b_id, inner.clone())).await;

    assert_eq!(next_envelope(&mut b).await.to_value(), inner);
    assert!(timeout(Duration::from_millis(200), a.next()).await.is_err());

    shutdown.send(()).ok();
}

#[tokio::test]
async fn unknown_target_is_dropped_without_closing_sender() {
    let (addr, shutdown) = spawn_relay(BroadcastPolicy::IncludeSender).await;

    let mut a = connect(addr).await;
    let a_id = expect_me(&mut a).await;
    expect_roster(&mut a).await;

    send(
        &mut a,
        RelayRequest::message(ConnectionId::from("ghost"), json!({ "method": "x" })),
    )
    .await;
    a.send(Message::text("not json")).await.expect("send junk");

    // Still routable afterwards.
    let inner = json!({ "method": "self", "params": [] });
    send(&mut a, RelayRequest::message(a_id, inner.clone())).await;
    assert_eq!(next_envelope(&mut a).await.to_value(), inner);

    shutdown.send(()).ok();
}

#[tokio::test]
async fn broadcast_honours_sender_policy() {
    let (addr, shutdown) = spawn_relay(BroadcastPolicy::ExcludeSender).await;

    let mut a = connect(addr).await;
    expect_me(&mut a).await;
    expect_roster(&mut a).await;
    let mut b = connect(addr).await;
    expect_me(&mut b).await;
    expect_roster(&mut b).await;
    expect_roster(&mut a).await;

    let inner = json!({ "method": "hello", "params": ["all"] });
    send(&mut a, RelayRequest::Broadcast { payload: inner.clone() }).await;

    assert_eq!(next_envelope(&mut b).await.to_value(), inner);
    assert!(timeout(Duration::from_millis(200), a.next()).await.is_err());

    shutdown.send(()).ok();
}
