//! OcapnNode: TCP netlayer for OCapN sessions.
//!
//! An [`OcapnNode`] binds a local TCP listener (transport
//! `tcp-testing-only`) and dials other nodes on demand. Every connection
//! gets a fresh session keypair, runs the `op:start-session` handshake, and
//! then hands each decoded operation to its session's CapTP engine.
//!
//! Messages are concatenated canonical values with no extra framing; the
//! reader frames values with a [`FrameScanner`] that resumes where the last
//! read left off, and decodes each one once it is complete.

use crate::bootstrap::GiftTable;
use crate::captp::{CapTp, SessionContext, SESSION_DISCONNECTED};
use crate::config::NodeConfig;
use crate::connection::{Connection, ConnectionId, HandshakeState, Outbound};
use crate::crypto::PublicKey;
use crate::error::{WireError, WireResult};
use crate::eventual;
use crate::handshake::{
    handle_start_session, send_hello, HandshakeOutcome, ABORT_CROSSED_HELLOS, ABORT_INTERNAL,
};
use crate::location::Location;
use crate::message::Message;
use crate::passable::Passable;
use crate::promise::Promise;
use crate::registry::{Provided, SessionManager};
use crate::session::{SelfIdentity, Session, SessionInfo};
use async_trait::async_trait;
use bytes::BytesMut;
use dashmap::DashMap;
use ocapn_types::{Frame, FrameScanner, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Reason sent to every peer when the node shuts down.
pub const ABORT_SHUTDOWN: &str = "Node shutting down";

/// The local network node: listens for connections and dials peers.
pub struct OcapnNode {
    me: Weak<OcapnNode>,
    config: NodeConfig,
    /// Actual bound address (useful when binding to port 0).
    local_addr: SocketAddr,
    location: Location,
    sessions: SessionManager,
    connections: DashMap<ConnectionId, Connection>,
    gifts: GiftTable,
    sturdyrefs: DashMap<Vec<u8>, Passable>,
    accept_task: Mutex<Option<AbortHandle>>,
}

/// What a node's sessions see of it.
struct NodeContext {
    node: Weak<OcapnNode>,
    gifts: GiftTable,
}

#[async_trait]
impl SessionContext for NodeContext {
    async fn provide_session(&self, location: &Location) -> WireResult<Arc<Session>> {
        let node = self
            .node
            .upgrade()
            .ok_or_else(|| WireError::Disconnected("node has shut down".into()))?;
        node.provide_session(location).await
    }

    fn peer_key_for_session_id(&self, session_id: &[u8]) -> Option<PublicKey> {
        self.node
            .upgrade()?
            .sessions
            .peer_public_key_for_session_id(session_id)
    }

    fn gifts(&self) -> GiftTable {
        self.gifts.clone()
    }

    fn sturdyref(&self, swissnum: &[u8]) -> Option<Passable> {
        self.node.upgrade()?.lookup_sturdyref(swissnum)
    }
}

impl OcapnNode {
    /// Bind the configured address and start accepting connections.
    pub async fn start(config: NodeConfig) -> WireResult<(Arc<Self>, JoinHandle<()>)> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let location = Location::tcp(local_addr.to_string());

        info!(
            "OCapN: listening on {} (designator={}, encoding={})",
            local_addr,
            config.designator,
            config.encoding.name()
        );

        let node = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            local_addr,
            location,
            sessions: SessionManager::new(),
            connections: DashMap::new(),
            gifts: GiftTable::new(),
            sturdyrefs: DashMap::new(),
            accept_task: Mutex::new(None),
        });

        let accept = tokio::spawn(Self::accept_loop(listener, Arc::downgrade(&node)));
        *node.accept_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(accept.abort_handle());
        Ok((node, accept))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Where other nodes reach this one.
    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Serve `object` to anyone who fetches `swissnum` from our bootstrap.
    pub fn register_sturdyref(&self, swissnum: impl Into<Vec<u8>>, object: Passable) {
        self.sturdyrefs.insert(swissnum.into(), object);
    }

    fn lookup_sturdyref(&self, swissnum: &[u8]) -> Option<Passable> {
        self.sturdyrefs.get(swissnum).map(|o| o.clone())
    }

    /// An established session with `location`: an existing one, the one
    /// someone else is already dialling, or a fresh dial.
    pub async fn provide_session(&self, location: &Location) -> WireResult<Arc<Session>> {
        if location == &self.location {
            return Err(WireError::Protocol(format!(
                "refusing to connect to self at {location}"
            )));
        }
        let location_id = location.id();
        if let Some(session) = self.sessions.active_session(&location_id) {
            return Ok(session);
        }

        // Registered before the pending entry so a crossed hello can find it.
        let (connection, outbound) = self.new_connection(true)?;
        let waiter = match self.sessions.provide(&location_id, connection.id()) {
            Provided::Active(session) => {
                self.connections.remove(&connection.id());
                return Ok(session);
            }
            Provided::Pending(waiter) => {
                self.connections.remove(&connection.id());
                waiter
            }
            Provided::Dial(waiter) => {
                if let Err(e) = self.dial(location, &connection, outbound).await {
                    warn!(location = %location_id, error = %e, "OCapN: dial failed");
                    self.connections.remove(&connection.id());
                    self.sessions
                        .reject_pending_session_for_connection(connection.id(), &e.to_string());
                    return Err(e);
                }
                waiter
            }
        };

        match tokio::time::timeout(self.config.handshake_timeout(), waiter).await {
            Ok(Ok(Ok(session))) => Ok(session),
            Ok(Ok(Err(reason))) => Err(WireError::HandshakeFailed(reason)),
            Ok(Err(_)) => Err(WireError::HandshakeFailed(
                "pending session was dropped".into(),
            )),
            Err(_) => Err(WireError::HandshakeFailed(format!(
                "timed out establishing a session with {location_id}"
            ))),
        }
    }

    /// Fetch the object registered under `swissnum` at `location`.
    pub async fn enliven_sturdyref(&self, location: &Location, swissnum: &[u8]) -> WireResult<Promise> {
        if location == &self.location {
            return Ok(match self.lookup_sturdyref(swissnum) {
                Some(object) => Promise::fulfilled(object),
                None => Promise::broken(Passable::error("Unknown swissnum for sturdyref")),
            });
        }
        let session = self.provide_session(location).await?;
        Ok(eventual::send(
            &session.bootstrap(),
            "fetch",
            vec![Passable::Data(Value::bytes(swissnum.to_vec()))],
        ))
    }

    /// Stop accepting, abort every session and close every connection.
    pub fn shutdown(&self) {
        if let Some(accept) = self
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            accept.abort();
        }
        for session in self.sessions.active_sessions() {
            session.captp().abort(ABORT_SHUTDOWN);
        }
        for entry in self.connections.iter() {
            entry.value().abort(ABORT_SHUTDOWN);
        }
        info!("OCapN: node at {} shut down", self.local_addr);
    }

    /// Accept loop, run in a spawned task.
    async fn accept_loop(listener: TcpListener, node: Weak<OcapnNode>) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("OCapN: accepted connection from {}", addr);
                    let Some(node) = node.upgrade() else {
                        return;
                    };
                    match node.new_connection(false) {
                        Ok((connection, outbound)) => node.run_connection(stream, connection, outbound),
                        Err(e) => warn!("OCapN: could not set up connection from {}: {}", addr, e),
                    }
                }
                Err(e) => {
                    error!("OCapN: accept error: {}", e);
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    fn new_connection(
        &self,
        outgoing: bool,
    ) -> WireResult<(Connection, mpsc::UnboundedReceiver<Outbound>)> {
        let identity = Arc::new(SelfIdentity::generate(self.location.clone())?);
        let (connection, outbound) =
            Connection::new(Uuid::new_v4(), outgoing, identity, self.config.encoding);
        self.connections.insert(connection.id(), connection.clone());
        Ok((connection, outbound))
    }

    async fn dial(
        &self,
        location: &Location,
        connection: &Connection,
        outbound: mpsc::UnboundedReceiver<Outbound>,
    ) -> WireResult<()> {
        let addr = location.socket_addr()?;
        info!("OCapN: connecting to {} at {}", location, addr);
        let stream = TcpStream::connect(addr).await?;
        self.run_connection(stream, connection.clone(), outbound);
        send_hello(connection, &self.config.captp_version)
    }

    fn run_connection(
        &self,
        stream: TcpStream,
        connection: Connection,
        outbound: mpsc::UnboundedReceiver<Outbound>,
    ) {
        let Some(node) = self.me.upgrade() else {
            return;
        };
        let (reader, writer) = stream.into_split();
        tokio::spawn(write_loop(writer, outbound, connection.id()));
        tokio::spawn(async move {
            node.read_loop(reader, &connection).await;
            node.connection_closed(&connection);
        });
    }

    async fn read_loop(&self, mut reader: OwnedReadHalf, connection: &Connection) {
        let mut buffer = BytesMut::with_capacity(8 * 1024);
        let mut scanner = FrameScanner::new(connection.encoding());
        let result = loop {
            if connection.is_closed() {
                break Ok(());
            }
            let read = tokio::select! {
                _ = connection.closed() => break Ok(()),
                read = reader.read_buf(&mut buffer) => read,
            };
            match read {
                Ok(0) => break Err(WireError::ConnectionClosed),
                Ok(_) => {
                    if let Err(e) = self.drain(connection, &mut buffer, &mut scanner) {
                        break Err(e);
                    }
                }
                Err(e) => break Err(e.into()),
            }
        };
        if let Err(e) = result {
            debug!(connection = %connection.id(), "OCapN: connection ended: {}", e);
            connection.close(&e.to_string());
        }
    }

    /// Handle every complete message in `buffer`.
    fn drain(
        &self,
        connection: &Connection,
        buffer: &mut BytesMut,
        scanner: &mut FrameScanner,
    ) -> WireResult<()> {
        while !buffer.is_empty() && !connection.is_closed() {
            let end = match scanner.scan(&buffer[..]) {
                Frame::Complete(end) => end,
                Frame::Incomplete => {
                    if buffer.len() > self.config.max_message_size {
                        connection.abort(ABORT_INTERNAL);
                        return Err(WireError::MessageTooLarge {
                            size: buffer.len(),
                            max: self.config.max_message_size,
                        });
                    }
                    return Ok(());
                }
                Frame::Invalid => buffer.len(),
            };
            scanner.reset();
            match connection.encoding().decode_prefix(&buffer[..end]) {
                Ok((value, used)) => {
                    let _ = buffer.split_to(used);
                    self.handle_value(connection, value)?;
                }
                Err(e) => {
                    error!(
                        connection = %connection.id(),
                        bytes = %hex::encode(&buffer[..buffer.len().min(256)]),
                        error = %e,
                        "OCapN: undecodable input"
                    );
                    connection.abort(ABORT_INTERNAL);
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    fn handle_value(&self, connection: &Connection, value: Value) -> WireResult<()> {
        let message = match Message::from_value(&value) {
            Ok(message) => message,
            Err(e) => {
                error!(
                    connection = %connection.id(),
                    value = %value,
                    error = %e,
                    "OCapN: not an operation"
                );
                connection.abort(ABORT_INTERNAL);
                return Err(e);
            }
        };

        let session = self.sessions.session_for_connection(connection.id());
        if let Message::Abort { reason } = &message {
            info!(connection = %connection.id(), reason = %reason, "OCapN: peer aborted");
            match session {
                Some(session) => session.captp().dispatch(message.clone())?,
                None => connection.close(reason),
            }
            return Ok(());
        }

        match session {
            Some(session) => session.captp().dispatch(message).map_err(|e| {
                warn!(
                    session = %session.info().id_hex(),
                    error = %e,
                    "OCapN: protocol error"
                );
                session.captp().abort(ABORT_INTERNAL);
                e
            }),
            None => self.handshake(connection, message),
        }
    }

    fn handshake(&self, connection: &Connection, message: Message) -> WireResult<()> {
        let outcome = handle_start_session(
            connection,
            &self.sessions,
            &self.config.captp_version,
            message,
            |id| self.connections.get(&id).map(|c| c.clone()),
        )?;
        let HandshakeOutcome::Established(peer) = outcome else {
            return Ok(());
        };

        let info = Arc::new(SessionInfo::new(Arc::clone(connection.self_identity()), peer));
        let context: Arc<dyn SessionContext> = Arc::new(NodeContext {
            node: self.me.clone(),
            gifts: self.gifts.clone(),
        });
        let captp = CapTp::new(Arc::clone(&info), connection.clone(), context);
        let session = Arc::new(Session::new(Arc::clone(&info), captp));
        let location_id = info.peer.location.id();
        if let Err(e) = self
            .sessions
            .resolve_session(&location_id, connection.id(), session)
        {
            connection.abort(ABORT_INTERNAL);
            return Err(e);
        }
        connection.set_state(HandshakeState::Established);
        info!(
            location = %location_id,
            session = %info.id_hex(),
            outgoing = connection.is_outgoing(),
            "OCapN: session established"
        );
        Ok(())
    }

    fn connection_closed(&self, connection: &Connection) {
        let id = connection.id();
        let reason = connection.close_reason().unwrap_or_default();
        match self.sessions.session_for_connection(id) {
            Some(session) => {
                session.captp().unplug(SESSION_DISCONNECTED);
                self.sessions.end_session(&session);
                info!(
                    session = %session.info().id_hex(),
                    established_at = %session.established_at().to_rfc3339(),
                    age_secs = session.age().num_seconds(),
                    "OCapN: session ended"
                );
            }
            None if reason != ABORT_CROSSED_HELLOS => {
                self.sessions
                    .reject_pending_session_for_connection(id, "Connection closed during handshake.");
            }
            None => {}
        }
        self.sessions.delete_connection(id);
        self.connections.remove(&id);
        debug!(connection = %id, reason = %reason, "OCapN: connection closed");
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    connection: ConnectionId,
) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Bytes(bytes) => {
                if let Err(e) = writer.write_all(&bytes).await {
                    debug!(connection = %connection, "OCapN: write failed: {}", e);
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::{start_session_message, ABORT_INVALID_VERSION};
    use ocapn_types::Encoding;
    use std::time::Duration;

    async fn node() -> Arc<OcapnNode> {
        let (node, _accept) = OcapnNode::start(NodeConfig::default()).await.unwrap();
        node
    }

    fn greeter(greeting: &'static str) -> Passable {
        Passable::from_fn(move |method, args| match method {
            "greet" => {
                let name = args.first().and_then(Passable::as_str).unwrap_or("stranger");
                Ok(Passable::from(format!("{greeting}, {name}").as_str()))
            }
            other => Err(Passable::error(format!("no method {other}"))),
        })
    }

    async fn settle(promise: &Promise) -> Result<Passable, Passable> {
        tokio::time::timeout(Duration::from_secs(5), promise.settled())
            .await
            .expect("promise did not settle")
    }

    /// Read one value from a raw socket.
    async fn read_value(stream: &mut TcpStream) -> Value {
        let mut buffer = BytesMut::new();
        loop {
            if let Ok((value, _)) = Encoding::Syrup.decode_prefix(&buffer[..]) {
                return value;
            }
            let n = tokio::time::timeout(Duration::from_secs(5), stream.read_buf(&mut buffer))
                .await
                .expect("read timed out")
                .unwrap();
            assert!(n > 0, "connection closed before a full value arrived");
        }
    }

    fn expect_abort(value: &Value) -> String {
        match Message::from_value(value).unwrap() {
            Message::Abort { reason } => reason,
            other => panic!("Expected op:abort, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_node_start_and_fetch_sturdyref() {
        let a = node().await;
        let b = node().await;
        a.register_sturdyref("greeter", greeter("Hello"));

        let greeter = b.enliven_sturdyref(a.location(), b"greeter").await.unwrap();
        let greeting = eventual::send(
            &Passable::Promise(greeter),
            "greet",
            vec![Passable::from("world")],
        );
        assert_eq!(settle(&greeting).await.unwrap().as_str(), Some("Hello, world"));

        assert_eq!(a.sessions().active_count(), 1);
        assert_eq!(b.sessions().active_count(), 1);
        let on_a = a.sessions().active_session(&b.location().id()).unwrap();
        let on_b = b.sessions().active_session(&a.location().id()).unwrap();
        assert_eq!(on_a.id(), on_b.id());
    }

    #[tokio::test]
    async fn test_provide_session_reuses_session() {
        let a = node().await;
        let b = node().await;
        let (first, second) = tokio::join!(
            b.provide_session(a.location()),
            b.provide_session(a.location())
        );
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_eq!(first.id(), second.id());
        let third = b.provide_session(a.location()).await.unwrap();
        assert_eq!(first.id(), third.id());
    }

    #[tokio::test]
    async fn test_refuses_to_connect_to_self() {
        let a = node().await;
        let err = a.provide_session(a.location()).await.unwrap_err();
        assert!(matches!(err, WireError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_enliven_local_sturdyref() {
        let a = node().await;
        a.register_sturdyref("greeter", greeter("Hi"));
        let local = a.enliven_sturdyref(a.location(), b"greeter").await.unwrap();
        assert!(settle(&local).await.unwrap().is_local());
        let missing = a.enliven_sturdyref(a.location(), b"nope").await.unwrap();
        assert!(settle(&missing).await.is_err());
    }

    #[tokio::test]
    async fn test_dial_failure_is_reported() {
        let a = node().await;
        // Bind and drop to get a port nobody listens on.
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let err = a
            .provide_session(&Location::tcp(unused.to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::Io(_)));
        assert!(a.sessions().outgoing_connection(&Location::tcp(unused.to_string()).id()).is_none());
    }

    #[tokio::test]
    async fn test_invalid_version_is_aborted() {
        let a = node().await;
        let mut stream = TcpStream::connect(a.local_addr()).await.unwrap();
        let peer = SelfIdentity::generate(Location::tcp("127.0.0.1:1")).unwrap();
        let hello = start_session_message(&peer, "0.9");
        stream
            .write_all(&Encoding::Syrup.encode(&hello.to_value()).unwrap())
            .await
            .unwrap();
        assert_eq!(expect_abort(&read_value(&mut stream).await), ABORT_INVALID_VERSION);
        assert_eq!(a.sessions().active_count(), 0);
    }

    #[tokio::test]
    async fn test_operation_before_handshake_is_rejected() {
        let a = node().await;
        let mut stream = TcpStream::connect(a.local_addr()).await.unwrap();
        let early = Message::GcAnswer { answer_position: 0 };
        stream
            .write_all(&Encoding::Syrup.encode(&early.to_value()).unwrap())
            .await
            .unwrap();
        assert_eq!(expect_abort(&read_value(&mut stream).await), ABORT_INTERNAL);
    }

    #[tokio::test]
    async fn test_garbage_input_is_aborted() {
        let a = node().await;
        let mut stream = TcpStream::connect(a.local_addr()).await.unwrap();
        stream.write_all(b"!!not syrup").await.unwrap();
        assert_eq!(expect_abort(&read_value(&mut stream).await), ABORT_INTERNAL);
    }

    #[tokio::test]
    async fn test_hello_split_across_reads() {
        let a = node().await;
        let mut stream = TcpStream::connect(a.local_addr()).await.unwrap();
        let peer = SelfIdentity::generate(Location::tcp("127.0.0.1:1")).unwrap();
        let bytes = Encoding::Syrup
            .encode(&start_session_message(&peer, "1.0").to_value())
            .unwrap();
        let (head, tail) = bytes.split_at(bytes.len() / 2);
        stream.write_all(head).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        stream.write_all(tail).await.unwrap();

        match Message::from_value(&read_value(&mut stream).await).unwrap() {
            Message::StartSession { location, .. } => assert_eq!(&location, a.location()),
            other => panic!("Expected op:start-session, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_hello_trickled_in_small_writes() {
        let a = node().await;
        let mut stream = TcpStream::connect(a.local_addr()).await.unwrap();
        stream.set_nodelay(true).unwrap();
        let peer = SelfIdentity::generate(Location::tcp("127.0.0.1:1")).unwrap();
        let bytes = Encoding::Syrup
            .encode(&start_session_message(&peer, "1.0").to_value())
            .unwrap();
        for chunk in bytes.chunks(3) {
            stream.write_all(chunk).await.unwrap();
            stream.flush().await.unwrap();
            tokio::task::yield_now().await;
        }

        match Message::from_value(&read_value(&mut stream).await).unwrap() {
            Message::StartSession { location, .. } => assert_eq!(&location, a.location()),
            other => panic!("Expected op:start-session, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_crossed_hellos_leave_one_session() {
        let a = node().await;
        let b = node().await;
        let (on_a, on_b) = tokio::join!(
            a.provide_session(b.location()),
            b.provide_session(a.location())
        );
        let (on_a, on_b) = (on_a.unwrap(), on_b.unwrap());
        assert_eq!(on_a.id(), on_b.id());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a.sessions().active_count(), 1);
        assert_eq!(b.sessions().active_count(), 1);
        assert_eq!(a.connection_count(), 1);
        assert_eq!(b.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_breaks_outstanding_calls() {
        let a = node().await;
        let b = node().await;
        let (never, _keep) = Promise::pending();
        a.register_sturdyref(
            "stalled",
            Passable::from_fn(move |_, _| Ok(Passable::Promise(never.clone()))),
        );
        let stalled = b.enliven_sturdyref(a.location(), b"stalled").await.unwrap();
        let waiting = eventual::send(&Passable::Promise(stalled), "wait", vec![]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_settled());

        a.shutdown();
        match settle(&waiting).await {
            Err(Passable::Error(reason)) => assert_eq!(reason, SESSION_DISCONNECTED),
            other => panic!("Expected disconnection, got {other:?}"),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(b.sessions().active_count(), 0);
    }

    #[tokio::test]
    async fn test_ended_session_forgets_peer_key() {
        let a = node().await;
        let b = node().await;
        let session = b.provide_session(a.location()).await.unwrap();
        let id = *session.id();
        assert!(b.sessions().peer_public_key_for_session_id(&id).is_some());
        assert!(session.established_at() <= chrono::Utc::now());
        assert!(session.age().num_seconds() < 5);
        assert!(format!("{session:?}").contains("established_at"));
        drop(session);

        a.shutdown();
        for _ in 0..100 {
            if b.sessions().active_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(b.sessions().active_count(), 0);
        assert!(b.sessions().peer_public_key_for_session_id(&id).is_none());
    }
}
