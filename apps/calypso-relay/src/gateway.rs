//! Managed push-gateway transport.
//!
//! The gateway owns the client sockets. It reports lifecycle events to us via
//! HTTP callbacks that carry the gateway-assigned connection id in the
//! `x-connection-id` header, and accepts outbound frames at
//! `{callback_url}/@connections/{id}`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
};
use bytes::Bytes;
use calypso_proto::ConnectionId;
use tracing::{debug, warn};

use crate::server::AppState;
use crate::store::ConnectionOrigin;
use crate::transport::{ConnectionHandle, TransportError};

pub const CONNECTION_ID_HEADER: &str = "x-connection-id";

/// Shared HTTP client and callback endpoint for gateway deliveries.
#[derive(Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    callback_url: String,
}

impl GatewayClient {
    pub fn new(callback_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            callback_url: callback_url.into(),
        }
    }

    pub fn connection_url(&self, id: &ConnectionId) -> String {
        format!("{}/@connections/{}", self.callback_url, id)
    }

    pub fn handle(&self, id: ConnectionId) -> GatewayHandle {
        GatewayHandle {
            id,
            client: self.clone(),
            open: AtomicBool::new(true),
        }
    }
}

pub struct GatewayHandle {
    id: ConnectionId,
    client: GatewayClient,
    open: AtomicBool,
}

#[async_trait]
impl ConnectionHandle for GatewayHandle {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn deliver(&self, frame: Bytes) -> Result<(), TransportError> {
        let response = self
            .client
            .http
            .post(self.client.connection_url(&self.id))
            .body(frame)
            .send()
            .await
            .map_err(|err| TransportError::Gateway(err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == reqwest::StatusCode::GONE {
            // The relay prunes closed handles on its next roster pass.
            self.open.store(false, Ordering::SeqCst);
            return Err(TransportError::Closed);
        }
        Err(TransportError::Gateway(format!("gateway answered {status}")))
    }
}

fn connection_id(headers: &HeaderMap) -> Result<ConnectionId, StatusCode> {
    headers
        .get(CONNECTION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ConnectionId::from)
        .ok_or(StatusCode::BAD_REQUEST)
}

pub async fn on_connect(State(state): State<AppState>, headers: HeaderMap) -> StatusCode {
    let id = match connection_id(&headers) {
        Ok(id) => id,
        Err(status) => return status,
    };
    let Some(gateway) = state.gateway.as_ref() else {
        warn!("gateway callback received but no gateway is configured");
        return StatusCode::SERVICE_UNAVAILABLE;
    };
    let handle: Arc<dyn ConnectionHandle> = Arc::new(gateway.handle(id));
    match state.relay.on_connect(handle, ConnectionOrigin::gateway()).await {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::CONFLICT,
    }
}

pub async fn on_disconnect(State(state): State<AppState>, headers: HeaderMap) -> StatusCode {
    let id = match connection_id(&headers) {
        Ok(id) => id,
        Err(status) => return status,
    };
    state.relay.on_disconnect(&id).await;
    StatusCode::OK
}

pub async fn on_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let id = match connection_id(&headers) {
        Ok(id) => id,
        Err(status) => return status,
    };
    if !state.relay.registry().contains(&id) {
        debug!(connection_id = %id, "message from unregistered gateway connection");
        return StatusCode::NOT_FOUND;
    }
    state.relay.on_message(&id, &body).await;
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_url_appends_id() {
        let client = GatewayClient::new("https://gw.example/prod");
        assert_eq!(
            client.connection_url(&ConnectionId::from("abc=")),
            "https://gw.example/prod/@connections/abc="
        );
    }

    #[test]
    fn missing_header_is_a_bad_request() {
        let headers = HeaderMap::new();
        assert_eq!(connection_id(&headers), Err(StatusCode::BAD_REQUEST));

        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION_ID_HEADER, "  ".parse().expect("header"));
        assert_eq!(connection_id(&headers), Err(StatusCode::BAD_REQUEST));

        headers.insert(CONNECTION_ID_HEADER, "c-1".parse().expect("header"));
        assert_eq!(connection_id(&headers), Ok(ConnectionId::from("c-1")));
    }
}
