//! Direct WebSocket transport.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use bytes::Bytes;
use calypso_proto::ConnectionId;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::relay::Relay;
use crate::server::AppState;
use crate::store::ConnectionOrigin;
use crate::transport::{ConnectionHandle, TransportError};

/// Outbound side of one WebSocket: a bounded queue drained by the writer task.
pub struct SocketHandle {
    id: ConnectionId,
    tx: mpsc::Sender<Message>,
    open: AtomicBool,
}

impl SocketHandle {
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Message>) -> Self {
        Self {
            id,
            tx,
            open: AtomicBool::new(true),
        }
    }

    fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectionHandle for SocketHandle {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    async fn deliver(&self, frame: Bytes) -> Result<(), TransportError> {
        let message = match String::from_utf8(frame.to_vec()) {
            Ok(text) => Message::Text(text),
            Err(err) => Message::Binary(err.into_bytes()),
        };
        match self.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TransportError::Backpressure),
            Err(TrySendError::Closed(_)) => {
                self.mark_closed();
                Err(TransportError::Closed)
            }
        }
    }
}

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    State(state): State<AppState>,
) -> Response {
    let remote_addr = connect_info.map(|ConnectInfo(addr)| addr);
    let buffer = state.config.outbound_buffer;
    ws.on_upgrade(move |socket| handle_socket(socket, state.relay, buffer, remote_addr))
}

/// One reader (this task) serializes inbound frames; one writer task
/// serializes outbound sends.
async fn handle_socket(
    socket: WebSocket,
    relay: Arc<Relay>,
    buffer: usize,
    remote_addr: Option<SocketAddr>,
) {
    let id = ConnectionId::generate();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(buffer);

    let writer_id = id.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
        debug!(connection_id = %writer_id, "writer task finished");
    });

    let handle = Arc::new(SocketHandle::new(id.clone(), tx));
    let registered: Arc<dyn ConnectionHandle> = handle.clone();
    if relay
        .on_connect(registered, ConnectionOrigin::socket(remote_addr))
        .await
        .is_err()
    {
        writer.abort();
        return;
    }

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                debug!(connection_id = %id, len = text.len(), "text frame");
                relay.on_message(&id, text.as_bytes()).await;
            }
            Ok(Message::Binary(data)) => {
                debug!(connection_id = %id, len = data.len(), "binary frame");
                relay.on_message(&id, &data).await;
            }
            Ok(Message::Close(frame)) => {
                info!(
                    connection_id = %id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Ok(_) => continue,
            Err(err) => {
                warn!(connection_id = %id, error = %err, "websocket error");
                break;
            }
        }
    }

    handle.mark_closed();
    relay.on_disconnect(&id).await;
    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_queue_reports_backpressure() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = SocketHandle::new(ConnectionId::from("a"), tx);
        handle
            .deliver(Bytes::from_static(b"{}"))
            .await
            .expect("first frame fits");
        assert_eq!(
            handle.deliver(Bytes::from_static(b"{}")).await,
            Err(TransportError::Backpressure)
        );
        assert!(handle.is_open());
    }

    #[tokio::test]
    async fn dropped_writer_closes_handle() {
        let (tx, rx) = mpsc::channel(4);
        let handle = SocketHandle::new(ConnectionId::from("a"), tx);
        drop(rx);
        assert_eq!(
            handle.deliver(Bytes::from_static(b"{}")).await,
            Err(TransportError::Closed)
        );
        assert!(!handle.is_open());
    }

    #[tokio::test]
    async fn text_frames_stay_text() {
        let (tx, mut rx) = mpsc::channel(4);
        let handle = SocketHandle::new(ConnectionId::from("a"), tx);
        handle
            .deliver(Bytes::from_static(br#"{"method":"me","params":[]}"#))
            .await
            .expect("deliver");
        match rx.recv().await {
            Some(Message::Text(text)) => assert!(text.contains("\"me\"")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
