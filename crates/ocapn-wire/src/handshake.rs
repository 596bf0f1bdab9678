//! Session setup: the `op:start-session` exchange.
//!
//! Each side sends `op:start-session` with a fresh session key and its
//! location signed by that key. The dialler sends first; the listener
//! replies once it has accepted the dialler's hello.
//!
//! When two nodes dial each other at once, each sees an incoming hello
//! while its own outgoing one is in flight. Both compare the key ID of
//! their outgoing connection with the key ID in the incoming hello; the
//! connection whose dialler's key sorts greater survives on both ends.

use crate::connection::{Connection, ConnectionId, HandshakeState};
use crate::crypto::{assert_location_signature_valid, compare_ids};
use crate::error::{WireError, WireResult};
use crate::message::Message;
use crate::registry::SessionManager;
use crate::session::{PeerIdentity, SelfIdentity};
use std::cmp::Ordering;
use tracing::{info, warn};

pub const ABORT_INVALID_VERSION: &str = "invalid-version";
pub const ABORT_INVALID_SIGNATURE: &str = "Invalid location signature";
pub const ABORT_CROSSED_HELLOS: &str = "Crossed hellos mitigated";
pub const ABORT_INTERNAL: &str = "internal error";

/// How a received hello ended.
#[derive(Debug)]
pub enum HandshakeOutcome {
    /// The peer is authenticated; build the session.
    Established(PeerIdentity),
    /// A crossed connection won; this one has been aborted.
    Superseded,
}

pub fn start_session_message(identity: &SelfIdentity, captp_version: &str) -> Message {
    Message::StartSession {
        captp_version: captp_version.to_string(),
        session_public_key: identity.keypair.public_key().clone(),
        location: identity.location.clone(),
        location_signature: identity.location_signature,
    }
}

/// Send our hello on a connection we dialled.
pub fn send_hello(connection: &Connection, captp_version: &str) -> WireResult<()> {
    connection.send_message(&start_session_message(
        connection.self_identity(),
        captp_version,
    ))?;
    connection.set_state(HandshakeState::AwaitingPeerHello);
    Ok(())
}

/// Check the peer's hello on `connection`.
///
/// Every rejection aborts `connection` before returning the error.
/// `lookup` finds our other live connections, for crossed hellos.
pub fn handle_start_session(
    connection: &Connection,
    sessions: &SessionManager,
    captp_version: &str,
    message: Message,
    lookup: impl Fn(ConnectionId) -> Option<Connection>,
) -> WireResult<HandshakeOutcome> {
    let label = message.label();
    let Message::StartSession {
        captp_version: remote_version,
        session_public_key,
        location,
        location_signature,
    } = message
    else {
        connection.abort(ABORT_INTERNAL);
        return Err(WireError::HandshakeFailed(format!(
            "expected op:start-session, got {label}"
        )));
    };

    if remote_version != captp_version {
        warn!(
            location = %location,
            local = captp_version,
            remote = %remote_version,
            "OCapN: version mismatch"
        );
        connection.abort(ABORT_INVALID_VERSION);
        return Err(WireError::VersionMismatch {
            local: captp_version.to_string(),
            remote: remote_version,
        });
    }

    let location_id = location.id();
    if sessions.active_session(&location_id).is_some() {
        warn!(location = %location_id, "OCapN: session already active");
        connection.abort(ABORT_INTERNAL);
        return Err(WireError::SessionExists(location_id));
    }

    if let Err(e) = assert_location_signature_valid(&location, &location_signature, &session_public_key) {
        warn!(location = %location_id, "OCapN: invalid location signature");
        connection.abort(ABORT_INVALID_SIGNATURE);
        return Err(e);
    }

    let crossed = sessions
        .outgoing_connection(&location_id)
        .filter(|id| *id != connection.id())
        .and_then(lookup);
    if let Some(outgoing) = crossed {
        let ours = outgoing.self_identity().key_id();
        if compare_ids(ours, session_public_key.id()) == Ordering::Greater {
            info!(location = %location_id, "OCapN: crossed hellos, keeping our outgoing connection");
            connection.abort(ABORT_CROSSED_HELLOS);
            return Ok(HandshakeOutcome::Superseded);
        }
        info!(location = %location_id, "OCapN: crossed hellos, keeping their connection");
        outgoing.abort(ABORT_CROSSED_HELLOS);
    }

    if !connection.is_outgoing() {
        connection.send_message(&start_session_message(
            connection.self_identity(),
            captp_version,
        ))?;
    }

    Ok(HandshakeOutcome::Established(PeerIdentity {
        public_key: session_public_key,
        location,
        location_signature,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbound;
    use crate::location::Location;
    use ocapn_types::Encoding;
    use std::sync::Arc;
    use tokio::sync::mpsc::UnboundedReceiver;
    use uuid::Uuid;

    fn connection(outgoing: bool, port: u16) -> (Connection, UnboundedReceiver<Outbound>) {
        let identity = SelfIdentity::generate(Location::tcp(format!("127.0.0.1:{port}"))).unwrap();
        Connection::new(Uuid::new_v4(), outgoing, Arc::new(identity), Encoding::Syrup)
    }

    fn sent(rx: &mut UnboundedReceiver<Outbound>) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Ok(Outbound::Bytes(bytes)) = rx.try_recv() {
            let value = Encoding::Syrup.decode(&bytes).unwrap();
            messages.push(Message::from_value(&value).unwrap());
        }
        messages
    }

    fn peer_hello(port: u16, version: &str) -> (SelfIdentity, Message) {
        let peer = SelfIdentity::generate(Location::tcp(format!("127.0.0.1:{port}"))).unwrap();
        let hello = start_session_message(&peer, version);
        (peer, hello)
    }

    fn no_connections(_: ConnectionId) -> Option<Connection> {
        None
    }

    #[test]
    fn test_listener_replies_with_own_hello() {
        let (conn, mut rx) = connection(false, 1);
        let (peer, hello) = peer_hello(2, "1.0");
        let outcome =
            handle_start_session(&conn, &SessionManager::new(), "1.0", hello, no_connections).unwrap();
        match outcome {
            HandshakeOutcome::Established(identity) => {
                assert_eq!(&identity.public_key, peer.keypair.public_key());
                assert_eq!(identity.location, peer.location);
            }
            other => panic!("Expected Established, got {other:?}"),
        }
        let messages = sent(&mut rx);
        assert_eq!(messages.len(), 1);
        assert!(matches!(messages[0], Message::StartSession { .. }));
    }

    #[test]
    fn test_dialler_does_not_reply() {
        let (conn, mut rx) = connection(true, 1);
        let (_peer, hello) = peer_hello(2, "1.0");
        handle_start_session(&conn, &SessionManager::new(), "1.0", hello, no_connections).unwrap();
        assert!(sent(&mut rx).is_empty());
    }

    #[test]
    fn test_version_mismatch_aborts() {
        let (conn, mut rx) = connection(false, 1);
        let (_peer, hello) = peer_hello(2, "0.9");
        let err = handle_start_session(&conn, &SessionManager::new(), "1.0", hello, no_connections)
            .unwrap_err();
        assert!(matches!(err, WireError::VersionMismatch { .. }));
        assert_eq!(
            sent(&mut rx),
            vec![Message::Abort {
                reason: ABORT_INVALID_VERSION.into()
            }]
        );
        assert!(conn.is_closed());
    }

    #[test]
    fn test_bad_signature_aborts() {
        let (conn, mut rx) = connection(false, 1);
        let (_peer, hello) = peer_hello(2, "1.0");
        let Message::StartSession {
            captp_version,
            session_public_key,
            location_signature,
            ..
        } = hello
        else {
            unreachable!()
        };
        let forged = Message::StartSession {
            captp_version,
            session_public_key,
            location: Location::tcp("127.0.0.1:3"),
            location_signature,
        };
        let err = handle_start_session(&conn, &SessionManager::new(), "1.0", forged, no_connections)
            .unwrap_err();
        assert!(matches!(err, WireError::InvalidSignature(_)));
        assert_eq!(
            sent(&mut rx),
            vec![Message::Abort {
                reason: ABORT_INVALID_SIGNATURE.into()
            }]
        );
    }

    #[test]
    fn test_non_hello_aborts() {
        let (conn, mut rx) = connection(false, 1);
        let err = handle_start_session(
            &conn,
            &SessionManager::new(),
            "1.0",
            Message::GcAnswer { answer_position: 0 },
            no_connections,
        )
        .unwrap_err();
        assert!(matches!(err, WireError::HandshakeFailed(_)));
        assert_eq!(sent(&mut rx).len(), 1);
    }

    #[test]
    fn test_crossed_hellos_pick_the_greater_dialler() {
        let sessions = SessionManager::new();
        let (outgoing, mut outgoing_rx) = connection(true, 1);
        let (incoming, mut incoming_rx) = connection(false, 1);
        let (peer, hello) = peer_hello(2, "1.0");
        sessions
            .make_pending_session(&peer.location.id(), outgoing.id())
            .unwrap();

        let lookup = {
            let outgoing = outgoing.clone();
            move |id: ConnectionId| (id == outgoing.id()).then(|| outgoing.clone())
        };
        let ours_wins =
            compare_ids(outgoing.self_identity().key_id(), peer.key_id()) == Ordering::Greater;
        let outcome = handle_start_session(&incoming, &sessions, "1.0", hello, lookup).unwrap();

        let crossed = Message::Abort {
            reason: ABORT_CROSSED_HELLOS.into(),
        };
        if ours_wins {
            assert!(matches!(outcome, HandshakeOutcome::Superseded));
            assert!(incoming.is_closed());
            assert!(!outgoing.is_closed());
            assert_eq!(sent(&mut incoming_rx), vec![crossed]);
        } else {
            assert!(matches!(outcome, HandshakeOutcome::Established(_)));
            assert!(outgoing.is_closed());
            assert!(!incoming.is_closed());
            assert_eq!(sent(&mut outgoing_rx), vec![crossed]);
        }
        assert_eq!(
            incoming.close_reason().or(outgoing.close_reason()).as_deref(),
            Some(ABORT_CROSSED_HELLOS)
        );
    }
}
