//! In-process connection handles for loopback use and tests.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use calypso_proto::ConnectionId;
use tokio::sync::mpsc;

use super::{ConnectionHandle, TransportError};

/// Handle that pushes frames into an unbounded channel.
pub struct MemoryHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Bytes>,
}

impl MemoryHandle {
    pub fn new(id: ConnectionId) -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id, tx }, rx)
    }
}

#[async_trait]
impl ConnectionHandle for MemoryHandle {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    async fn deliver(&self, frame: Bytes) -> Result<(), TransportError> {
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }
}

/// Handle whose every delivery fails. Stands in for a broken socket.
pub struct FailingHandle {
    id: ConnectionId,
    open: AtomicBool,
}

impl FailingHandle {
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            open: AtomicBool::new(true),
        }
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectionHandle for FailingHandle {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn deliver(&self, _frame: Bytes) -> Result<(), TransportError> {
        Err(TransportError::Backpressure)
    }
}
