//! The bootstrap object every session exports at position 0.
//!
//! Methods:
//! - `fetch swissnum`: look up a sturdyref registered on this node.
//! - `deposit-gift gift-id object`: stage one of our own objects for a
//!   third party named in a signed handoff-give.
//! - `withdraw-gift signed-receive`: redeem a gift. The receiver's handoff
//!   count is single use per session, which is the replay defense.

use crate::captp::SessionContext;
use crate::crypto::ids_equal;
use crate::descriptors::SignedReceive;
use crate::passable::{Invocable, Passable};
use crate::promise::{Promise, Resolver};
use crate::session::SessionInfo;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

enum GiftSlot {
    Deposited(Passable),
    /// A withdrawal arrived first.
    Awaiting(Resolver),
}

/// Gifts staged on this node, keyed by gifter session and gift ID.
#[derive(Clone, Default)]
pub struct GiftTable {
    slots: Arc<DashMap<String, GiftSlot>>,
}

pub fn gift_key(session_id: &[u8], gift_id: &[u8]) -> String {
    format!("{}:{}", hex::encode(session_id), hex::encode(gift_id))
}

impl GiftTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage `gift`, handing it straight to a withdrawal that is already
    /// waiting for it.
    pub fn deposit(&self, key: String, gift: Passable) -> Result<(), String> {
        let waiting = match self.slots.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(GiftSlot::Deposited(gift));
                return Ok(());
            }
            Entry::Occupied(slot) => {
                let GiftSlot::Awaiting(_) = slot.get() else {
                    return Err("Gift already exists".into());
                };
                match slot.remove() {
                    GiftSlot::Awaiting(resolver) => resolver,
                    GiftSlot::Deposited(_) => return Err("Gift already exists".into()),
                }
            }
        };
        waiting.resolve(gift);
        Ok(())
    }

    /// Take the gift under `key`, or a promise for it if not yet deposited.
    pub fn withdraw(&self, key: String) -> Promise {
        match self.slots.entry(key) {
            Entry::Vacant(slot) => {
                let (promise, resolver) = Promise::pending();
                slot.insert(GiftSlot::Awaiting(resolver));
                promise
            }
            Entry::Occupied(slot) => {
                if let GiftSlot::Awaiting(_) = slot.get() {
                    return Promise::broken(Passable::error("Gift already claimed"));
                }
                match slot.remove() {
                    GiftSlot::Deposited(gift) => Promise::fulfilled(gift),
                    GiftSlot::Awaiting(_) => Promise::broken(Passable::error("Gift already claimed")),
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

pub struct Bootstrap {
    info: Arc<SessionInfo>,
    context: Arc<dyn SessionContext>,
    used_handoffs: Mutex<HashSet<u64>>,
}

fn reject<T>(reason: impl Into<String>) -> Result<T, Passable> {
    Err(Passable::error(reason))
}

impl Bootstrap {
    pub fn new(info: Arc<SessionInfo>, context: Arc<dyn SessionContext>) -> Self {
        Self {
            info,
            context,
            used_handoffs: Mutex::new(HashSet::new()),
        }
    }

    fn fetch(&self, args: &[Passable]) -> Result<Passable, Passable> {
        let swissnum = match args.first().and_then(Passable::as_value) {
            Some(value) => value
                .as_bytes()
                .or_else(|| value.as_str().map(str::as_bytes)),
            None => None,
        };
        let Some(swissnum) = swissnum else {
            return reject("fetch expects a swissnum");
        };
        match self.context.sturdyref(swissnum) {
            Some(object) => Ok(object),
            None => reject("Unknown swissnum for sturdyref"),
        }
    }

    fn deposit_gift(&self, mut args: Vec<Passable>) -> Result<Passable, Passable> {
        if args.len() != 2 {
            return reject("deposit-gift expects a gift id and a gift");
        }
        let gift = args.swap_remove(1);
        let Some(gift_id) = args[0].as_value().and_then(|v| v.as_bytes()) else {
            return reject("Gift id must be bytes");
        };
        if !gift.is_remotable() {
            return reject("Gift must be remotable");
        }
        if !gift.is_local() {
            return reject("Gift must be local");
        }
        let key = gift_key(&self.info.id, gift_id);
        debug!(session = %self.info.id_hex(), gift = %key, "OCapN: gift deposited");
        self.context.gifts().deposit(key, gift).map_err(Passable::error)?;
        Ok(Passable::unit())
    }

    fn withdraw_gift(&self, args: &[Passable]) -> Result<Passable, Passable> {
        let Some(value) = args.first().and_then(Passable::as_value) else {
            return reject("withdraw-gift expects a signed handoff-receive");
        };
        let signed = SignedReceive::from_value(value).map_err(|e| Passable::error(e.to_string()))?;
        let receive = &signed.receive;
        let give = &receive.signed_give.give;

        if !ids_equal(&receive.receiving_side, self.info.peer.public_key.id()) {
            return reject("Receiver key mismatch");
        }
        if !ids_equal(&receive.receiving_session, &self.info.id) {
            return reject("Session id mismatch");
        }
        let Some(gifter_key) = self.context.peer_key_for_session_id(&give.exporter_session_id)
        else {
            return reject(format!(
                "No session with id {}",
                hex::encode(&give.exporter_session_id)
            ));
        };
        if !receive.signed_give.verify(&gifter_key) {
            return reject("Invalid HandoffGive");
        }
        if !signed.verify(&give.receiver_key) {
            return reject("Invalid HandoffReceive");
        }
        let count = receive.handoff_count;
        let fresh = self
            .used_handoffs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(count);
        if !fresh {
            warn!(
                session = %self.info.id_hex(),
                count,
                "OCapN: rejected replayed handoff"
            );
            return reject(format!("Gift handoff already used: {count}"));
        }
        let key = gift_key(&give.exporter_session_id, &give.gift_id);
        debug!(session = %self.info.id_hex(), gift = %key, count, "OCapN: gift withdrawn");
        Ok(Passable::Promise(self.context.gifts().withdraw(key)))
    }
}

impl Invocable for Bootstrap {
    fn invoke(&self, method: &str, args: Vec<Passable>) -> Result<Passable, Passable> {
        match method {
            "fetch" => self.fetch(&args),
            "deposit-gift" => self.deposit_gift(args),
            "withdraw-gift" => self.withdraw_gift(&args),
            other => reject(format!("Unknown bootstrap method: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::captp::tests::{peer_of, TestContext};
    use crate::descriptors::{HandoffGive, HandoffReceive};
    use crate::location::Location;
    use crate::session::SelfIdentity;
    use ocapn_types::Value;

    fn identity(port: u16) -> Arc<SelfIdentity> {
        Arc::new(SelfIdentity::generate(Location::tcp(format!("127.0.0.1:{port}"))).unwrap())
    }

    fn reason(result: Result<Passable, Passable>) -> String {
        match result {
            Err(Passable::Error(reason)) => reason,
            other => panic!("Expected rejection, got {other:?}"),
        }
    }

    fn gift() -> Passable {
        Passable::from_fn(|_, _| Ok(Passable::from("present")))
    }

    /// Exporter B with sessions to gifter A and receiver C.
    struct World {
        context: Arc<TestContext>,
        a_side: Arc<SelfIdentity>,
        c_to_a: Arc<SelfIdentity>,
        c_to_b: Arc<SelfIdentity>,
        ab: Arc<SessionInfo>,
        bc: Arc<SessionInfo>,
    }

    impl World {
        fn new() -> Self {
            let context = Arc::new(TestContext::default());
            let a_side = identity(1);
            let b_to_a = identity(2);
            let b_to_c = identity(2);
            let c_to_b = identity(3);
            let c_to_a = identity(3);
            let ab = Arc::new(SessionInfo::new(b_to_a, peer_of(&a_side)));
            let bc = Arc::new(SessionInfo::new(b_to_c, peer_of(&c_to_b)));
            context
                .peer_keys
                .insert(ab.id.to_vec(), a_side.keypair.public_key().clone());
            Self {
                context,
                a_side,
                c_to_a,
                c_to_b,
                ab,
                bc,
            }
        }

        fn bootstrap(&self, info: &Arc<SessionInfo>) -> Bootstrap {
            Bootstrap::new(Arc::clone(info), self.context.clone())
        }

        fn give(&self, gift_id: &[u8]) -> HandoffGive {
            HandoffGive {
                receiver_key: self.c_to_a.keypair.public_key().clone(),
                exporter_location: self.ab.self_identity.location.clone(),
                exporter_session_id: self.ab.id.to_vec(),
                gifter_side_id: self.a_side.key_id().to_vec(),
                gift_id: gift_id.to_vec(),
            }
        }

        fn receive(&self, give: HandoffGive, count: u64) -> HandoffReceive {
            HandoffReceive {
                receiving_session: self.bc.id.to_vec(),
                receiving_side: self.c_to_b.key_id().to_vec(),
                handoff_count: count,
                signed_give: give.sign(&self.a_side.keypair).unwrap(),
            }
        }

        fn withdraw(&self, receive: HandoffReceive) -> Result<Passable, Passable> {
            let signed = receive.sign(&self.c_to_a.keypair).unwrap();
            self.bootstrap(&self.bc)
                .invoke("withdraw-gift", vec![Passable::Data(signed.to_value())])
        }

        fn deposit(&self, gift_id: &[u8], gift: Passable) -> Result<Passable, Passable> {
            self.bootstrap(&self.ab).invoke(
                "deposit-gift",
                vec![Passable::Data(Value::bytes(gift_id.to_vec())), gift],
            )
        }
    }

    fn withdrawn(result: Result<Passable, Passable>) -> Promise {
        match result {
            Ok(Passable::Promise(promise)) => promise,
            other => panic!("Expected promise, got {other:?}"),
        }
    }

    #[test]
    fn test_fetch_known_and_unknown() {
        let world = World::new();
        world
            .context
            .sturdyrefs
            .insert(b"greeter".to_vec(), gift());
        let bootstrap = world.bootstrap(&world.bc);
        let found = bootstrap
            .invoke("fetch", vec![Passable::Data(Value::bytes(b"greeter".to_vec()))])
            .unwrap();
        assert!(found.is_local());
        assert_eq!(
            reason(bootstrap.invoke("fetch", vec![Passable::Data(Value::bytes(b"x".to_vec()))])),
            "Unknown swissnum for sturdyref"
        );
    }

    #[test]
    fn test_deposit_rejects_data() {
        let world = World::new();
        assert_eq!(
            reason(world.deposit(b"g", Passable::from("not an object"))),
            "Gift must be remotable"
        );
        assert!(world.context.gifts.is_empty());
    }

    #[test]
    fn test_duplicate_deposit_fails() {
        let world = World::new();
        world.deposit(b"g", gift()).unwrap();
        assert_eq!(reason(world.deposit(b"g", gift())), "Gift already exists");
    }

    #[test]
    fn test_withdraw_then_replay() {
        let world = World::new();
        world.deposit(b"g1", gift()).unwrap();

        let first = withdrawn(world.withdraw(world.receive(world.give(b"g1"), 0)));
        assert!(matches!(first.settlement(), Some(Ok(ref p)) if p.is_local()));

        assert_eq!(
            reason(world.withdraw(world.receive(world.give(b"g1"), 0))),
            "Gift handoff already used: 0"
        );

        world.deposit(b"g2", gift()).unwrap();
        let second = withdrawn(world.withdraw(world.receive(world.give(b"g2"), 1)));
        assert!(matches!(second.settlement(), Some(Ok(_))));
    }

    #[test]
    fn test_withdraw_before_deposit_waits() {
        let world = World::new();
        let pending = withdrawn(world.withdraw(world.receive(world.give(b"late"), 0)));
        assert!(!pending.is_settled());
        world.deposit(b"late", gift()).unwrap();
        assert!(matches!(pending.settlement(), Some(Ok(_))));
        assert!(world.context.gifts.is_empty());
    }

    #[test]
    fn test_withdraw_checks_identities() {
        let world = World::new();
        world.deposit(b"g", gift()).unwrap();

        let mut wrong_side = world.receive(world.give(b"g"), 0);
        wrong_side.receiving_side = vec![0; 32];
        assert_eq!(reason(world.withdraw(wrong_side)), "Receiver key mismatch");

        let mut wrong_session = world.receive(world.give(b"g"), 0);
        wrong_session.receiving_session = vec![0; 32];
        assert_eq!(reason(world.withdraw(wrong_session)), "Session id mismatch");

        let mut unknown = world.give(b"g");
        unknown.exporter_session_id = vec![7; 32];
        assert!(reason(world.withdraw(world.receive(unknown, 0))).starts_with("No session with id"));

        let mut forged = world.receive(world.give(b"g"), 0);
        forged.signed_give.give.gift_id = b"other".to_vec();
        assert_eq!(reason(world.withdraw(forged)), "Invalid HandoffGive");

        let receive = world.receive(world.give(b"g"), 0);
        let signed = receive.sign(&world.c_to_b.keypair).unwrap();
        let result = world
            .bootstrap(&world.bc)
            .invoke("withdraw-gift", vec![Passable::Data(signed.to_value())]);
        assert_eq!(reason(result), "Invalid HandoffReceive");

        // None of the failures consumed the count.
        let ok = withdrawn(world.withdraw(world.receive(world.give(b"g"), 0)));
        assert!(ok.is_settled());
    }

    #[test]
    fn test_unknown_method() {
        let world = World::new();
        let result = world.bootstrap(&world.bc).invoke("explode", vec![]);
        assert_eq!(reason(result), "Unknown bootstrap method: explode");
    }
}
