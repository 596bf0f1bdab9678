//! One transport connection and its outbound queue.
//!
//! Writes never block: bytes go onto an unbounded queue drained by the
//! connection's writer task, so a message enqueued before another is also
//! written before it.

use crate::error::{WireError, WireResult};
use crate::message::Message;
use crate::session::SelfIdentity;
use ocapn_types::Encoding;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};
use tracing::debug;
use uuid::Uuid;

pub type ConnectionId = Uuid;

/// Where a connection is in session setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Nothing sent or received yet.
    Unauthenticated,
    /// Our `op:start-session` is out; waiting for the peer's.
    AwaitingPeerHello,
    Established,
    Closed,
}

/// An item for the writer task.
#[derive(Debug)]
pub enum Outbound {
    Bytes(Vec<u8>),
    /// Flush what was queued before, then shut the stream down.
    Close,
}

struct ConnectionInner {
    id: ConnectionId,
    outgoing: bool,
    self_identity: Arc<SelfIdentity>,
    encoding: Encoding,
    tx: mpsc::UnboundedSender<Outbound>,
    closed: AtomicBool,
    closed_notify: Notify,
    state: Mutex<HandshakeState>,
    close_reason: Mutex<Option<String>>,
}

#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Create a connection and the receiving end of its outbound queue.
    pub fn new(
        id: ConnectionId,
        outgoing: bool,
        self_identity: Arc<SelfIdentity>,
        encoding: Encoding,
    ) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Self {
            inner: Arc::new(ConnectionInner {
                id,
                outgoing,
                self_identity,
                encoding,
                tx,
                closed: AtomicBool::new(false),
                closed_notify: Notify::new(),
                state: Mutex::new(HandshakeState::Unauthenticated),
                close_reason: Mutex::new(None),
            }),
        };
        (connection, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// True if this side dialled.
    pub fn is_outgoing(&self) -> bool {
        self.inner.outgoing
    }

    /// The fresh identity this side uses on this connection.
    pub fn self_identity(&self) -> &Arc<SelfIdentity> {
        &self.inner.self_identity
    }

    pub fn encoding(&self) -> Encoding {
        self.inner.encoding
    }

    pub fn state(&self) -> HandshakeState {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_state(&self, state: HandshakeState) {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub fn write(&self, bytes: Vec<u8>) -> WireResult<()> {
        if self.is_closed() {
            return Err(WireError::ConnectionClosed);
        }
        self.inner
            .tx
            .send(Outbound::Bytes(bytes))
            .map_err(|_| WireError::ConnectionClosed)
    }

    pub fn send_message(&self, message: &Message) -> WireResult<()> {
        let bytes = self.inner.encoding.encode(&message.to_value())?;
        self.write(bytes)
    }

    /// Send `op:abort` and close.
    pub fn abort(&self, reason: &str) {
        if self.is_closed() {
            return;
        }
        debug!(connection = %self.id(), reason, "OCapN: aborting connection");
        let _ = self.send_message(&Message::Abort {
            reason: reason.to_string(),
        });
        self.close(reason);
    }

    /// Close without telling the peer why. The first reason sticks.
    pub fn close(&self, reason: &str) {
        {
            let mut slot = self
                .inner
                .close_reason
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(reason.to_string());
            }
        }
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(HandshakeState::Closed);
        let _ = self.inner.tx.send(Outbound::Close);
        self.inner.closed_notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn close_reason(&self) -> Option<String> {
        self.inner
            .close_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        if self.is_closed() {
            return;
        }
        self.inner.closed_notify.notified().await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("outgoing", &self.inner.outgoing)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::Location;

    fn connection() -> (Connection, mpsc::UnboundedReceiver<Outbound>) {
        let identity = SelfIdentity::generate(Location::tcp("127.0.0.1:1")).unwrap();
        Connection::new(Uuid::new_v4(), true, Arc::new(identity), Encoding::Syrup)
    }

    #[test]
    fn test_abort_sends_message_then_closes() {
        let (connection, mut rx) = connection();
        connection.abort("bye");
        assert!(connection.is_closed());
        assert_eq!(connection.state(), HandshakeState::Closed);
        assert_eq!(connection.close_reason().as_deref(), Some("bye"));

        match rx.try_recv() {
            Ok(Outbound::Bytes(bytes)) => {
                let value = Encoding::Syrup.decode(&bytes).unwrap();
                assert_eq!(
                    Message::from_value(&value).unwrap(),
                    Message::Abort {
                        reason: "bye".into()
                    }
                );
            }
            other => panic!("Expected abort bytes, got {other:?}"),
        }
        assert!(matches!(rx.try_recv(), Ok(Outbound::Close)));
    }

    #[test]
    fn test_write_after_close_fails() {
        let (connection, _rx) = connection();
        connection.close("done");
        connection.close("again");
        assert_eq!(connection.close_reason().as_deref(), Some("done"));
        assert!(matches!(
            connection.write(vec![1]),
            Err(WireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_closed_resolves() {
        let (connection, _rx) = connection();
        let waiter = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.closed().await })
        };
        connection.close("x");
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
