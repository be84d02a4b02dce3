//! Client side of the relay connection.

use calypso_proto::{ConnectionId, Envelope, EnvelopeError, Inbound, PeerSignal, RelayRequest};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{error::ProtocolError, Error as WsError, Message},
};
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("invalid relay url: {0}")]
    InvalidUrl(String),
    #[error("websocket connect failed: {0}")]
    Connect(String),
    #[error("signaling connection closed")]
    Closed,
}

/// Where sessions send their outbound signals.
pub trait SignalSink: Send + Sync {
    fn send_signal(&self, target: &ConnectionId, signal: PeerSignal) -> Result<(), SignalingError>;
}

/// Cloneable handle onto the signaling writer task.
#[derive(Clone)]
pub struct RelaySender {
    tx: mpsc::UnboundedSender<RelayRequest>,
}

impl RelaySender {
    pub fn send(&self, request: RelayRequest) -> Result<(), SignalingError> {
        self.tx.send(request).map_err(|_| SignalingError::Closed)
    }

    pub fn broadcast(&self, payload: Value) -> Result<(), SignalingError> {
        self.send(RelayRequest::Broadcast { payload })
    }
}

impl SignalSink for RelaySender {
    fn send_signal(&self, target: &ConnectionId, signal: PeerSignal) -> Result<(), SignalingError> {
        debug!(peer_id = %target, method = signal.method(), "sending signal");
        self.send(signal.addressed_to(target.clone()))
    }
}

/// WebSocket connection to the relay: one writer task drains outbound
/// requests, one reader task decodes inbound envelopes.
pub struct SignalingClient {
    sender: RelaySender,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    tasks: Vec<JoinHandle<()>>,
}

impl SignalingClient {
    pub async fn connect(relay_url: &str) -> Result<Self, SignalingError> {
        let url = websocket_url(relay_url)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| SignalingError::Connect(err.to_string()))?;
        debug!(url = %url, "signaling websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<RelayRequest>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<Inbound>();

        let writer = tokio::spawn(async move {
            while let Some(request) = send_rx.recv().await {
                let text = request.into_envelope().encode();
                if ws_write.send(Message::text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.send(Message::Close(None)).await;
        });

        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                let decoded = match msg {
                    Ok(Message::Text(text)) => Envelope::decode_str(text.as_str()),
                    Ok(Message::Binary(data)) => Envelope::decode(&data),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                debug!("signaling websocket closed: {err}");
                            }
                            _ => warn!("signaling websocket error: {err}"),
                        }
                        break;
                    }
                };
                match decoded.and_then(Inbound::try_from) {
                    Ok(inbound) => {
                        if inbound_tx.send(inbound).is_err() {
                            break;
                        }
                    }
                    Err(EnvelopeError::UnknownMethod(method)) => {
                        debug!(method = %method, "ignoring unknown method");
                    }
                    Err(err) => warn!(error = %err, "dropping malformed envelope"),
                }
            }
        });

        Ok(Self {
            sender: RelaySender { tx: send_tx },
            inbound,
            tasks: vec![writer, reader],
        })
    }

    pub fn sender(&self) -> RelaySender {
        self.sender.clone()
    }

    /// Next decoded envelope; `None` once the relay connection is gone.
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.inbound.recv().await
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Accepts `ws(s)://` as-is and maps `http(s)://` onto it.
fn websocket_url(raw: &str) -> Result<Url, SignalingError> {
    let mut url = Url::parse(raw).map_err(|err| SignalingError::InvalidUrl(err.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "wss" => return Ok(url),
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(SignalingError::InvalidUrl(format!(
                "unsupported scheme `{other}`"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SignalingError::InvalidUrl(raw.to_string()))?;
    Ok(url)
}
