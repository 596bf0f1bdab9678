//! Authenticated sessions between two session keys.

use crate::captp::CapTp;
use crate::crypto::{make_session_id, sign_location, KeyPair, PublicKey, Signature, ID_LEN};
use crate::error::WireResult;
use crate::location::Location;
use crate::passable::Passable;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Our side of one connection: a fresh keypair and our signed location.
#[derive(Debug)]
pub struct SelfIdentity {
    pub keypair: KeyPair,
    pub location: Location,
    pub location_signature: Signature,
}

impl SelfIdentity {
    pub fn generate(location: Location) -> WireResult<Self> {
        let keypair = KeyPair::generate();
        let location_signature = sign_location(&location, &keypair)?;
        Ok(Self {
            keypair,
            location,
            location_signature,
        })
    }

    pub fn key_id(&self) -> &[u8; ID_LEN] {
        self.keypair.public_key().id()
    }
}

/// What the peer proved about itself in its `op:start-session`.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    pub public_key: PublicKey,
    pub location: Location,
    pub location_signature: Signature,
}

/// Immutable facts about a session, shared with its engine.
#[derive(Debug)]
pub struct SessionInfo {
    pub id: [u8; ID_LEN],
    pub self_identity: Arc<SelfIdentity>,
    pub peer: PeerIdentity,
}

impl SessionInfo {
    pub fn new(self_identity: Arc<SelfIdentity>, peer: PeerIdentity) -> Self {
        let id = make_session_id(self_identity.key_id(), peer.public_key.id());
        Self {
            id,
            self_identity,
            peer,
        }
    }

    pub fn id_hex(&self) -> String {
        hex::encode(self.id)
    }
}

/// An established session: its engine and its handoff counter.
pub struct Session {
    info: Arc<SessionInfo>,
    captp: CapTp,
    handoff_count: AtomicU64,
    established_at: DateTime<Utc>,
}

impl Session {
    pub fn new(info: Arc<SessionInfo>, captp: CapTp) -> Self {
        Self {
            info,
            captp,
            handoff_count: AtomicU64::new(0),
            established_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &[u8; ID_LEN] {
        &self.info.id
    }

    pub fn info(&self) -> &Arc<SessionInfo> {
        &self.info
    }

    pub fn peer(&self) -> &PeerIdentity {
        &self.info.peer
    }

    pub fn self_identity(&self) -> &Arc<SelfIdentity> {
        &self.info.self_identity
    }

    pub fn captp(&self) -> &CapTp {
        &self.captp
    }

    /// The peer's bootstrap object.
    pub fn bootstrap(&self) -> Passable {
        self.captp.bootstrap()
    }

    /// Allocate the next handoff count. Each value is handed out once.
    pub fn take_next_handoff_count(&self) -> u64 {
        self.handoff_count.fetch_add(1, Ordering::SeqCst)
    }

    pub fn handoff_count(&self) -> u64 {
        self.handoff_count.load(Ordering::SeqCst)
    }

    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }

    /// Time since the handshake completed.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.established_at
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.info.id_hex())
            .field("peer", &self.info.peer.location.id())
            .field("handoff_count", &self.handoff_count())
            .field("established_at", &self.established_at.to_rfc3339())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer_of(identity: &SelfIdentity) -> PeerIdentity {
        PeerIdentity {
            public_key: identity.keypair.public_key().clone(),
            location: identity.location.clone(),
            location_signature: identity.location_signature,
        }
    }

    #[test]
    fn test_both_sides_derive_the_same_session_id() {
        let a = Arc::new(SelfIdentity::generate(Location::tcp("127.0.0.1:1")).unwrap());
        let b = Arc::new(SelfIdentity::generate(Location::tcp("127.0.0.1:2")).unwrap());
        let from_a = SessionInfo::new(Arc::clone(&a), peer_of(&b));
        let from_b = SessionInfo::new(Arc::clone(&b), peer_of(&a));
        assert_eq!(from_a.id, from_b.id);
        assert_eq!(from_a.id_hex().len(), 64);
    }

    #[test]
    fn test_self_identity_signs_its_location() {
        let identity = SelfIdentity::generate(Location::tcp("127.0.0.1:3")).unwrap();
        crate::crypto::assert_location_signature_valid(
            &identity.location,
            &identity.location_signature,
            identity.keypair.public_key(),
        )
        .unwrap();
    }
}
