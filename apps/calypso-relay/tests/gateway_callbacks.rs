use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{Request, StatusCode};
use axum::routing::post;
use axum::Router;
use calypso_proto::{ConnectionId, Envelope, Inbound, RelayEvent};
use calypso_relay::{router, AppState, RelayConfig, TransportKind};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tower::ServiceExt;

type Captured = (String, bytes::Bytes);

/// Stands in for the push gateway's connection management API.
async fn spawn_gateway(gone: &'static str) -> (SocketAddr, mpsc::UnboundedReceiver<Captured>) {
    async fn deliver(
        State((tx, gone)): State<(mpsc::UnboundedSender<Captured>, &'static str)>,
        Path(id): Path<String>,
        body: bytes::Bytes,
    ) -> StatusCode {
        if id == gone {
            return StatusCode::GONE;
        }
        let _ = tx.send((id, body));
        StatusCode::OK
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let app = Router::new()
        .route("/@connections/:id", post(deliver))
        .with_state((tx, gone));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    (addr, rx)
}

fn gateway_state(callback: SocketAddr) -> AppState {
    let config = RelayConfig {
        transport: TransportKind::Gateway,
        gateway_callback_url: Some(format!("http://{callback}")),
        ..RelayConfig::default()
    };
    AppState::new(config, None)
}

fn callback(path: &str, id: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder().method("POST").uri(path);
    if let Some(id) = id {
        builder = builder.header("x-connection-id", id);
    }
    builder.body(Body::from(body.to_string())).expect("request")
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Captured>) -> (String, Inbound) {
    let (id, body) = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("delivery before timeout")
        .expect("gateway open");
    let envelope = Envelope::decode(&body).expect("envelope");
    (id, Inbound::try_from(envelope).expect("inbound"))
}

#[tokio::test]
async fn connect_message_disconnect_round_trip() {
    let (gateway_addr, mut deliveries) = spawn_gateway("never").await;
    let state = gateway_state(gateway_addr);
    let app = router(state.clone());

    let response = app
        .clone()
        .oneshot(callback("/gateway/connect", Some("gw-a"), ""))
        .await
        .expect("connect a");
    assert_eq!(response.status(), StatusCode::OK);

    let (to, event) = recv(&mut deliveries).await;
    assert_eq!(to, "gw-a");
    assert_eq!(
        event,
        Inbound::Relay(RelayEvent::Me {
            id: ConnectionId::from("gw-a")
        })
    );
    let (_, roster) = recv(&mut deliveries).await;
    assert!(matches!(roster, Inbound::Relay(RelayEvent::Peers(ref p)) if p.len() == 1));

    let duplicate = app
        .clone()
        .oneshot(callback("/gateway/connect", Some("gw-a"), ""))
        .await
        .expect("duplicate");
    assert_eq!(duplicate.status(), StatusCode::CONFLICT);

    let message = json!({
        "method": "message",
        "params": ["gw-a", { "method": "ping", "params": [] }],
    })
    .to_string();
    let response = app
        .clone()
        .oneshot(callback("/gateway/message", Some("gw-a"), &message))
        .await
        .expect("message");
    assert_eq!(response.status(), StatusCode::OK);
    let (to, body) = timeout(Duration::from_secs(2), deliveries.recv())
        .await
        .expect("forwarded")
        .expect("open");
    assert_eq!(to, "gw-a");
    assert_eq!(
        serde_json::from_slice::<serde_json::Value>(&body).expect("json"),
        json!({ "method": "ping", "params": [] })
    );

    let response = app
        .oneshot(callback("/gateway/disconnect", Some("gw-a"), ""))
        .await
        .expect("disconnect");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(state.relay.registry().is_empty());
}

#[tokio::test]
async fn callbacks_without_connection_id_are_rejected() {
    let (gateway_addr, _deliveries) = spawn_gateway("never").await;
    let app = router(gateway_state(gateway_addr));
    for path in ["/gateway/connect", "/gateway/disconnect", "/gateway/message"] {
        let response = app
            .clone()
            .oneshot(callback(path, None, "{}"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{path}");
    }
}

#[tokio::test]
async fn gone_connection_does_not_block_others() {
    let (gateway_addr, mut deliveries) = spawn_gateway("gw-gone").await;
    let state = gateway_state(gateway_addr);
    let app = router(state.clone());

    for id in ["gw-gone", "gw-live"] {
        let response = app
            .clone()
            .oneshot(callback("/gateway/connect", Some(id), ""))
            .await
            .expect("connect");
        assert_eq!(response.status(), StatusCode::OK);
    }

    // The gateway answered 410 for gw-gone, so it never shows up in a roster
    // even though no disconnect callback arrived.
    assert_eq!(
        state.relay.registry().list(),
        vec![ConnectionId::from("gw-live")]
    );
    let mut last_roster = None;
    while let Ok(Some((to, body))) = timeout(Duration::from_millis(500), deliveries.recv()).await {
        assert_ne!(to, "gw-gone");
        let inbound = Inbound::try_from(Envelope::decode(&body).expect("envelope")).expect("inbound");
        if let Inbound::Relay(RelayEvent::Peers(peers)) = inbound {
            last_roster = Some(peers.into_iter().map(|peer| peer.id).collect::<Vec<_>>());
        }
    }
    assert_eq!(last_roster, Some(vec![ConnectionId::from("gw-live")]));
}

#[tokio::test]
async fn messages_from_unknown_connections_are_not_routed() {
    let (gateway_addr, mut deliveries) = spawn_gateway("never").await;
    let state = gateway_state(gateway_addr);
    let app = router(state.clone());

    let response = app
        .clone()
        .oneshot(callback("/gateway/connect", Some("gw-a"), ""))
        .await
        .expect("connect");
    assert_eq!(response.status(), StatusCode::OK);
    recv(&mut deliveries).await;
    recv(&mut deliveries).await;

    let message = json!({
        "method": "message",
        "params": ["gw-a", { "method": "ping", "params": [] }],
    })
    .to_string();
    let response = app
        .oneshot(callback("/gateway/message", Some("gw-stranger"), &message))
        .await
        .expect("message");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(timeout(Duration::from_millis(200), deliveries.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn health_and_debug_endpoints_respond() {
    let (gateway_addr, _deliveries) = spawn_gateway("never").await;
    let app = router(gateway_state(gateway_addr));

    let health = app
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).expect("req"))
        .await
        .expect("health");
    assert_eq!(health.status(), StatusCode::OK);

    let connections = app
        .clone()
        .oneshot(
            Request::get("/debug/connections")
                .body(Body::empty())
                .expect("req"),
        )
        .await
        .expect("connections");
    assert_eq!(connections.status(), StatusCode::OK);

    let metrics = app
        .oneshot(Request::get("/metrics").body(Body::empty()).expect("req"))
        .await
        .expect("metrics");
    assert_eq!(metrics.status(), StatusCode::NOT_FOUND);
}
