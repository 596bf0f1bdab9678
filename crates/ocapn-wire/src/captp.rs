//! CapTP engine: the remote-reference protocol over one session.
//!
//! The engine owns the session's export, import, answer and question
//! tables. Incoming operations are dispatched in arrival order on the
//! connection's reader task; outgoing operations are encoded and queued
//! without waiting, so calls chained off an unresolved answer go out
//! immediately, targeted at `desc:answer n`.
//!
//! Settlement flows back as `op:deliver-only <resolver> [fulfill value]` or
//! `[break reason]`, where the resolver is a one-shot object exported by
//! whoever asked.

#![warn(missing_docs)]

use crate::bootstrap::{Bootstrap, GiftTable};
use crate::connection::Connection;
use crate::crypto::PublicKey;
use crate::descriptors::{error_value, parse_error_value, RefDesc, SignedGive};
use crate::error::{WireError, WireResult};
use crate::eventual;
use crate::handoff;
use crate::location::Location;
use crate::message::Message;
use crate::passable::{Invocable, ObjectRef, Passable};
use crate::promise::{Promise, Resolver, Settlement};
use crate::session::{Session, SessionInfo};
use crate::tables::{ExportTable, Exported, ImportTable, BOOTSTRAP_POSITION};
use async_trait::async_trait;
use ocapn_types::{Record, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Reason carried by every promise broken because its session went away.
pub const SESSION_DISCONNECTED: &str = "Session disconnected";

/// What an engine needs from the node that owns it.
#[async_trait]
pub trait SessionContext: Send + Sync + 'static {
    /// An established session with `location`, dialling if needed.
    async fn provide_session(&self, location: &Location) -> WireResult<Arc<Session>>;

    /// Peer key of a live session this node has established.
    fn peer_key_for_session_id(&self, session_id: &[u8]) -> Option<PublicKey>;

    /// Gifts deposited at this node, shared by all its sessions.
    fn gifts(&self) -> GiftTable;

    /// Object registered under `swissnum`, if any.
    fn sturdyref(&self, swissnum: &[u8]) -> Option<Passable>;
}

/// Which way an observed operation travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Queued for the peer.
    Sent,
    /// Dispatched from the peer.
    Received,
}

/// A copy of an operation as it crossed this engine.
#[derive(Debug, Clone)]
pub struct Observed {
    /// Sent or received.
    pub direction: Direction,
    /// The operation itself.
    pub message: Message,
}

struct Question {
    resolver: Resolver,
    /// Answer position to release once settled.
    answer: Option<u64>,
    /// Imported promise position this question listens to.
    listening: Option<u64>,
}

struct Tables {
    exports: ExportTable,
    imports: ImportTable,
    answers: HashMap<u64, Promise>,
    next_answer: u64,
    /// Keyed by the export position of the question's resolver object.
    questions: HashMap<u64, Question>,
}

pub(crate) struct EngineShared {
    me: Weak<EngineShared>,
    info: Arc<SessionInfo>,
    connection: Connection,
    context: Arc<dyn SessionContext>,
    tables: Mutex<Tables>,
    observers: Mutex<Vec<mpsc::UnboundedSender<Observed>>>,
    disconnected: AtomicBool,
}

/// Handle to a session's CapTP engine.
#[derive(Clone)]
pub struct CapTp {
    shared: Arc<EngineShared>,
}

impl CapTp {
    /// Engine for an established session. Export 0 is the bootstrap object.
    pub fn new(
        info: Arc<SessionInfo>,
        connection: Connection,
        context: Arc<dyn SessionContext>,
    ) -> Self {
        let bootstrap: Arc<dyn Invocable> =
            Arc::new(Bootstrap::new(Arc::clone(&info), Arc::clone(&context)));
        let shared = Arc::new_cyclic(|me| EngineShared {
            me: me.clone(),
            info,
            connection,
            context,
            tables: Mutex::new(Tables {
                exports: ExportTable::new(bootstrap),
                imports: ImportTable::default(),
                answers: HashMap::new(),
                next_answer: 0,
                questions: HashMap::new(),
            }),
            observers: Mutex::new(Vec::new()),
            disconnected: AtomicBool::new(false),
        });
        Self { shared }
    }

    /// The session this engine serves.
    pub fn info(&self) -> &Arc<SessionInfo> {
        &self.shared.info
    }

    /// The peer's bootstrap object (its export 0).
    pub fn bootstrap(&self) -> Passable {
        Passable::Object(ObjectRef::Remote(
            self.shared.import_object(BOOTSTRAP_POSITION, false),
        ))
    }

    /// Subscribe to every operation sent or received from now on.
    pub fn observe(&self) -> mpsc::UnboundedReceiver<Observed> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    /// Handle one incoming operation.
    pub fn dispatch(&self, message: Message) -> WireResult<()> {
        self.shared.dispatch(message)
    }

    /// Tell the peer we are leaving, then disconnect.
    pub fn abort(&self, reason: &str) {
        self.shared.send(Message::Abort {
            reason: reason.to_string(),
        });
        self.shared.connection.close(reason);
        self.unplug(reason);
    }

    /// Disconnect without further I/O: every outstanding question breaks
    /// with [`SESSION_DISCONNECTED`].
    pub fn unplug(&self, reason: &str) {
        self.shared.unplug(reason);
    }

    /// True once the session has been unplugged or aborted.
    pub fn is_disconnected(&self) -> bool {
        self.shared.is_disconnected()
    }

    /// Live entries in our export table, the bootstrap object included.
    pub fn export_count(&self) -> usize {
        self.shared.tables().exports.len()
    }

    /// Answers the peer can still pipeline on.
    pub fn answer_count(&self) -> usize {
        self.shared.tables().answers.len()
    }

    /// Questions we asked that have not been answered.
    pub fn question_count(&self) -> usize {
        self.shared.tables().questions.len()
    }
}

/// Where a remote reference or unsettled remote answer lives: an engine
/// and the descriptor the peer knows it by.
#[derive(Clone)]
pub(crate) struct RemoteTarget {
    engine: Weak<EngineShared>,
    desc: RefDesc,
}

fn disconnected() -> Promise {
    Promise::broken(Passable::error(SESSION_DISCONNECTED))
}

impl RemoteTarget {
    fn belongs_to(&self, engine: &EngineShared) -> bool {
        std::ptr::eq(self.engine.as_ptr(), engine)
    }

    pub(crate) fn deliver(&self, method: &str, args: Vec<Passable>) -> Promise {
        match self.engine.upgrade() {
            Some(engine) => engine.deliver(self.desc, method, args),
            None => disconnected(),
        }
    }

    pub(crate) fn deliver_only(&self, method: &str, args: Vec<Passable>) {
        if let Some(engine) = self.engine.upgrade() {
            engine.deliver_only(self.desc, method, args);
        }
    }

    pub(crate) fn get(&self, field: &str) -> Promise {
        match self.engine.upgrade() {
            Some(engine) => engine.project(
                self.desc,
                |receiver, answer_position| Message::Get {
                    receiver,
                    field_name: field.to_string(),
                    answer_position,
                },
            ),
            None => disconnected(),
        }
    }

    pub(crate) fn index(&self, index: u64) -> Promise {
        match self.engine.upgrade() {
            Some(engine) => engine.project(self.desc, |receiver, answer_position| {
                Message::Index {
                    receiver,
                    index,
                    answer_position,
                }
            }),
            None => disconnected(),
        }
    }
}

/// Shared state behind one imported object position. Dropping the last
/// [`RemoteObject`] for it reports `op:gc-export` to the peer.
pub(crate) struct ImportHandle {
    engine: Weak<EngineShared>,
    position: u64,
    /// Times the peer sent us this position.
    received: AtomicU64,
}

impl Drop for ImportHandle {
    fn drop(&mut self) {
        let wire_delta = *self.received.get_mut();
        if self.position == BOOTSTRAP_POSITION || wire_delta == 0 {
            return;
        }
        if let Some(engine) = self.engine.upgrade() {
            engine.send(Message::GcExport {
                export_position: self.position,
                wire_delta,
            });
        }
    }
}

/// An object exported by a peer.
#[derive(Clone)]
pub struct RemoteObject {
    handle: Arc<ImportHandle>,
}

impl RemoteObject {
    /// Position in the peer's export table.
    pub fn position(&self) -> u64 {
        self.handle.position
    }

    /// Whether both refer to the same import.
    pub fn ptr_eq(&self, other: &RemoteObject) -> bool {
        Arc::ptr_eq(&self.handle, &other.handle)
    }

    /// The engine of the session this object was imported over.
    pub fn captp(&self) -> Option<CapTp> {
        self.handle
            .engine
            .upgrade()
            .map(|shared| CapTp { shared })
    }

    pub(crate) fn target(&self) -> RemoteTarget {
        RemoteTarget {
            engine: self.handle.engine.clone(),
            desc: RefDesc::Export(self.handle.position),
        }
    }

    fn belongs_to(&self, engine: &EngineShared) -> bool {
        std::ptr::eq(self.handle.engine.as_ptr(), engine)
    }
}

/// One-shot object that settles a question when the peer reports back.
struct ResolveMe {
    engine: Weak<EngineShared>,
    position: u64,
}

impl Invocable for ResolveMe {
    fn invoke(&self, method: &str, mut args: Vec<Passable>) -> Result<Passable, Passable> {
        let engine = self
            .engine
            .upgrade()
            .ok_or_else(|| Passable::error(SESSION_DISCONNECTED))?;
        let value = if args.is_empty() {
            Passable::unit()
        } else {
            args.swap_remove(0)
        };
        let settlement = match method {
            "fulfill" => Ok(value),
            "break" => Err(value),
            other => return Err(Passable::error(format!("Unknown resolver method: {other}"))),
        };
        engine.settle_question(self.position, settlement);
        Ok(Passable::unit())
    }
}

impl EngineShared {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    fn session_hex(&self) -> String {
        self.info.id_hex()
    }

    fn notify(&self, direction: Direction, message: &Message) {
        let mut observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        if observers.is_empty() {
            return;
        }
        observers.retain(|tx| {
            tx.send(Observed {
                direction,
                message: message.clone(),
            })
            .is_ok()
        });
    }

    /// Queue an operation. Never touches the tables lock.
    fn send(&self, message: Message) {
        if self.is_disconnected() {
            return;
        }
        self.notify(Direction::Sent, &message);
        if let Err(e) = self.connection.send_message(&message) {
            debug!(
                session = %self.session_hex(),
                op = message.label(),
                error = %e,
                "OCapN: dropped outgoing operation"
            );
        }
    }

    fn unplug(&self, reason: &str) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        let (questions, answers, exports, imports) = {
            let mut tables = self.tables();
            let questions: Vec<Question> = tables.questions.drain().map(|(_, q)| q).collect();
            let answers: Vec<Promise> = tables.answers.drain().map(|(_, p)| p).collect();
            let exports = tables.exports.clear();
            let imports = tables.imports.clear();
            (questions, answers, exports, imports)
        };
        info!(
            session = %self.session_hex(),
            peer = %self.info.peer.location,
            reason,
            outstanding = questions.len(),
            "OCapN: session disconnected"
        );
        for question in questions {
            question
                .resolver
                .reject(Passable::error(SESSION_DISCONNECTED));
        }
        drop((answers, exports, imports));
    }

    fn import_object(&self, position: u64, received: bool) -> RemoteObject {
        let handle = self.tables().imports.object(position, || {
            Arc::new(ImportHandle {
                engine: self.me.clone(),
                position,
                received: AtomicU64::new(0),
            })
        });
        if received {
            handle.received.fetch_add(1, Ordering::SeqCst);
        }
        RemoteObject { handle }
    }

    /// Register a question and export its resolver object.
    fn new_question(
        &self,
        tables: &mut Tables,
        resolver: Resolver,
        answer: Option<u64>,
        listening: Option<u64>,
    ) -> RefDesc {
        let engine = self.me.clone();
        let position = tables.exports.export_fresh(|position| {
            Exported::Object(Arc::new(ResolveMe { engine, position }))
        });
        tables.questions.insert(
            position,
            Question {
                resolver,
                answer,
                listening,
            },
        );
        RefDesc::ImportObject(position)
    }

    fn settle_question(&self, position: u64, settlement: Settlement) {
        let (question, resolver_object, released) = {
            let mut tables = self.tables();
            let question = tables.questions.remove(&position);
            let resolver_object = tables.exports.remove(position);
            let released = question
                .as_ref()
                .and_then(|q| q.listening)
                .and_then(|listening| {
                    let (promise, received) = tables.imports.remove_promise(listening)?;
                    Some((listening, received, promise))
                });
            (question, resolver_object, released)
        };
        drop(resolver_object);
        // The peer settled it, so it will not be addressed again.
        if let Some((export_position, wire_delta, _)) = released {
            self.send(Message::GcExport {
                export_position,
                wire_delta,
            });
        }
        let Some(question) = question else {
            debug!(position, "OCapN: settlement for unknown question");
            return;
        };
        match settlement {
            Ok(value) => question.resolver.resolve(value),
            Err(reason) => question.resolver.reject(reason),
        }
        if let Some(answer_position) = question.answer {
            self.send(Message::GcAnswer { answer_position });
        }
    }

    fn import_promise(&self, position: u64) -> Promise {
        let (promise, resolve_me) = {
            let mut tables = self.tables();
            if let Some(existing) = tables.imports.receive_promise(position) {
                return existing;
            }
            let (promise, resolver) = Promise::remote(RemoteTarget {
                engine: self.me.clone(),
                desc: RefDesc::Export(position),
            });
            tables.imports.insert_promise(position, promise.clone());
            let resolve_me = self.new_question(&mut tables, resolver, None, Some(position));
            (promise, resolve_me)
        };
        self.send(Message::Listen {
            to: RefDesc::Export(position).to_value(),
            resolve_me_desc: resolve_me.to_value(),
            wants_partial: false,
        });
        promise
    }

    fn import_desc(&self, desc: RefDesc) -> WireResult<Passable> {
        match desc {
            RefDesc::ImportObject(position) => Ok(Passable::Object(ObjectRef::Remote(
                self.import_object(position, true),
            ))),
            RefDesc::ImportPromise(position) => Ok(Passable::Promise(self.import_promise(position))),
            RefDesc::Export(position) => self
                .tables()
                .exports
                .get(position)
                .map(|exported| exported.to_passable())
                .ok_or_else(|| WireError::Protocol(format!("no export at position {position}"))),
            RefDesc::Answer(position) => self
                .tables()
                .answers
                .get(&position)
                .cloned()
                .map(Passable::Promise)
                .ok_or_else(|| WireError::Protocol(format!("no answer at position {position}"))),
        }
    }

    /// Turn a received value into a passable against this session's tables.
    fn import_value(&self, value: &Value) -> WireResult<Passable> {
        if let Some(desc) = RefDesc::parse(value)? {
            return self.import_desc(desc);
        }
        match value {
            Value::Record(record) => {
                if SignedGive::matches(value) {
                    let signed_give = SignedGive::from_value(value)?;
                    return Ok(Passable::Promise(handoff::receive_handoff(
                        Arc::clone(&self.info),
                        Arc::clone(&self.context),
                        signed_give,
                    )));
                }
                if let Some(reason) = parse_error_value(value) {
                    return Ok(Passable::Error(reason.to_string()));
                }
                // Other descriptors (signed receives, bare gives) are data.
                if record.label.as_str().is_some_and(|l| l.starts_with("desc:")) {
                    return Ok(Passable::Data(value.clone()));
                }
                let fields = record
                    .fields
                    .iter()
                    .map(|f| self.import_value(f))
                    .collect::<WireResult<Vec<_>>>()?;
                Ok(Passable::tagged(record.label.clone(), fields))
            }
            Value::List(items) => Ok(Passable::list(
                items
                    .iter()
                    .map(|i| self.import_value(i))
                    .collect::<WireResult<Vec<_>>>()?,
            )),
            Value::Dictionary(entries) => Ok(Passable::dictionary(
                entries
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), self.import_value(v)?)))
                    .collect::<WireResult<Vec<_>>>()?,
            )),
            other => Ok(Passable::Data(other.clone())),
        }
    }

    /// Turn a passable into a value the peer can resolve against its tables.
    fn export_passable(&self, value: &Passable) -> WireResult<Value> {
        Ok(match value {
            Passable::Data(v) => v.clone(),
            Passable::List(items) => Value::List(
                items
                    .iter()
                    .map(|i| self.export_passable(i))
                    .collect::<WireResult<_>>()?,
            ),
            Passable::Dictionary(entries) => Value::Dictionary(
                entries
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), self.export_passable(v)?)))
                    .collect::<WireResult<_>>()?,
            ),
            Passable::Tagged { label, fields } => Value::Record(Record {
                label: label.clone(),
                fields: fields
                    .iter()
                    .map(|f| self.export_passable(f))
                    .collect::<WireResult<_>>()?,
            }),
            Passable::Error(reason) => error_value(reason),
            Passable::Object(ObjectRef::Local(object)) => {
                let position = self
                    .tables()
                    .exports
                    .export(Exported::Object(Arc::clone(object)));
                RefDesc::ImportObject(position).to_value()
            }
            Passable::Object(ObjectRef::Remote(remote)) => {
                if remote.belongs_to(self) {
                    RefDesc::Export(remote.position()).to_value()
                } else {
                    handoff::send_handoff(&self.info, remote)?.to_value()
                }
            }
            Passable::Promise(promise) => match promise.origin() {
                Some(origin) if origin.belongs_to(self) && !promise.is_settled() => {
                    origin.desc.to_value()
                }
                _ => {
                    let position = self
                        .tables()
                        .exports
                        .export(Exported::Promise(promise.clone()));
                    RefDesc::ImportPromise(position).to_value()
                }
            },
        })
    }

    fn export_call(&self, method: &str, args: &[Passable]) -> WireResult<Vec<Value>> {
        let mut values = Vec::with_capacity(args.len() + 1);
        values.push(Value::symbol(method));
        for arg in args {
            values.push(self.export_passable(arg)?);
        }
        Ok(values)
    }

    fn import_call(&self, args: &[Value]) -> WireResult<(String, Vec<Passable>)> {
        let (selector, rest) = args
            .split_first()
            .ok_or_else(|| WireError::Protocol("delivery without a selector".into()))?;
        let method = selector
            .as_symbol()
            .or_else(|| selector.as_str())
            .ok_or_else(|| WireError::Protocol(format!("selector must be a symbol, got {selector}")))?;
        let args = rest
            .iter()
            .map(|a| self.import_value(a))
            .collect::<WireResult<Vec<_>>>()?;
        Ok((method.to_string(), args))
    }

    fn deliver(&self, to: RefDesc, method: &str, args: Vec<Passable>) -> Promise {
        if self.is_disconnected() {
            return disconnected();
        }
        let args = match self.export_call(method, &args) {
            Ok(args) => args,
            Err(e) => return Promise::broken(Passable::error(e.to_string())),
        };
        let (promise, resolve_me, answer_position) = {
            let mut tables = self.tables();
            let answer_position = tables.next_answer;
            tables.next_answer += 1;
            let (promise, resolver) = Promise::remote(RemoteTarget {
                engine: self.me.clone(),
                desc: RefDesc::Answer(answer_position),
            });
            let resolve_me =
                self.new_question(&mut tables, resolver, Some(answer_position), None);
            (promise, resolve_me, answer_position)
        };
        self.send(Message::Deliver {
            to: to.to_value(),
            args,
            answer_position: Some(answer_position),
            resolve_me_desc: resolve_me.to_value(),
        });
        promise
    }

    fn deliver_only(&self, to: RefDesc, method: &str, args: Vec<Passable>) {
        match self.export_call(method, &args) {
            Ok(args) => self.send(Message::DeliverOnly {
                to: to.to_value(),
                args,
            }),
            Err(e) => warn!(error = %e, method, "OCapN: could not encode deliver-only"),
        }
    }

    /// `op:get` or `op:index` into a fresh answer, then listen to it.
    fn project(&self, to: RefDesc, make: impl FnOnce(Value, u64) -> Message) -> Promise {
        if self.is_disconnected() {
            return disconnected();
        }
        let (promise, resolve_me, answer_position) = {
            let mut tables = self.tables();
            let answer_position = tables.next_answer;
            tables.next_answer += 1;
            let (promise, resolver) = Promise::remote(RemoteTarget {
                engine: self.me.clone(),
                desc: RefDesc::Answer(answer_position),
            });
            let resolve_me =
                self.new_question(&mut tables, resolver, Some(answer_position), None);
            (promise, resolve_me, answer_position)
        };
        self.send(make(to.to_value(), answer_position));
        self.send(Message::Listen {
            to: RefDesc::Answer(answer_position).to_value(),
            resolve_me_desc: resolve_me.to_value(),
            wants_partial: false,
        });
        promise
    }

    fn dispatch(&self, message: Message) -> WireResult<()> {
        if self.is_disconnected() {
            return Err(WireError::Disconnected(SESSION_DISCONNECTED.into()));
        }
        self.notify(Direction::Received, &message);
        match message {
            Message::StartSession { .. } => Err(WireError::Protocol(
                "op:start-session on an established session".into(),
            )),
            Message::Abort { reason } => {
                self.connection.close(&reason);
                self.unplug(&reason);
                Ok(())
            }
            Message::Deliver {
                to,
                args,
                answer_position,
                resolve_me_desc,
            } => {
                let target = self.import_value(&to)?;
                let (method, args) = self.import_call(&args)?;
                let resolver = match &resolve_me_desc {
                    Value::Boolean(false) => None,
                    desc => Some(self.import_value(desc)?),
                };
                let result = eventual::send(&target, &method, args);
                if let Some(position) = answer_position {
                    self.tables().answers.insert(position, result.clone());
                }
                if let Some(resolver) = resolver {
                    report_settlement(&result, resolver);
                }
                Ok(())
            }
            Message::DeliverOnly { to, args } => {
                let target = self.import_value(&to)?;
                let (method, args) = self.import_call(&args)?;
                eventual::send_only(&target, &method, args);
                Ok(())
            }
            Message::Get {
                receiver,
                field_name,
                answer_position,
            } => {
                let target = self.import_value(&receiver)?;
                let result = eventual::get(&target, &field_name);
                self.tables().answers.insert(answer_position, result);
                Ok(())
            }
            Message::Index {
                receiver,
                index,
                answer_position,
            } => {
                let target = self.import_value(&receiver)?;
                let result = eventual::index(&target, index);
                self.tables().answers.insert(answer_position, result);
                Ok(())
            }
            Message::Listen {
                to,
                resolve_me_desc,
                wants_partial: _,
            } => {
                let target = match self.import_value(&to)? {
                    Passable::Promise(promise) => promise,
                    settled => Promise::fulfilled(settled),
                };
                let resolver = self.import_value(&resolve_me_desc)?;
                report_settlement(&target, resolver);
                Ok(())
            }
            Message::GcExport {
                export_position,
                wire_delta,
            } => {
                let dropped = self.tables().exports.gc(export_position, wire_delta);
                drop(dropped);
                Ok(())
            }
            Message::GcAnswer { answer_position } => {
                let dropped = self.tables().answers.remove(&answer_position);
                drop(dropped);
                Ok(())
            }
        }
    }
}

/// Push the settlement of `promise` to a peer's resolver object.
fn report_settlement(promise: &Promise, resolver: Passable) {
    promise.when_settled(move |settled| match settled {
        Ok(value) => eventual::send_only(&resolver, "fulfill", vec![value.clone()]),
        Err(reason) => eventual::send_only(&resolver, "break", vec![reason.clone()]),
    });
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::connection::Outbound;
    use crate::session::{PeerIdentity, SelfIdentity};
    use dashmap::DashMap;
    use ocapn_types::Encoding;
    use std::time::Duration;
    use uuid::Uuid;

    /// A node stand-in: sturdyrefs and gifts, no dialling.
    #[derive(Default)]
    pub(crate) struct TestContext {
        pub sturdyrefs: DashMap<Vec<u8>, Passable>,
        pub gifts: GiftTable,
        pub peer_keys: DashMap<Vec<u8>, PublicKey>,
    }

    #[async_trait]
    impl SessionContext for TestContext {
        async fn provide_session(&self, location: &Location) -> WireResult<Arc<Session>> {
            Err(WireError::NoSession(location.id()))
        }

        fn peer_key_for_session_id(&self, session_id: &[u8]) -> Option<PublicKey> {
            self.peer_keys.get(session_id).map(|k| k.clone())
        }

        fn gifts(&self) -> GiftTable {
            self.gifts.clone()
        }

        fn sturdyref(&self, swissnum: &[u8]) -> Option<Passable> {
            self.sturdyrefs.get(swissnum).map(|o| o.clone())
        }
    }

    pub(crate) fn peer_of(identity: &SelfIdentity) -> PeerIdentity {
        PeerIdentity {
            public_key: identity.keypair.public_key().clone(),
            location: identity.location.clone(),
            location_signature: identity.location_signature,
        }
    }

    async fn pump(mut rx: mpsc::UnboundedReceiver<Outbound>, to: CapTp) {
        while let Some(Outbound::Bytes(bytes)) = rx.recv().await {
            let value = Encoding::Syrup.decode(&bytes).unwrap();
            let message = Message::from_value(&value).unwrap();
            if let Err(e) = to.dispatch(message) {
                panic!("dispatch failed: {e}");
            }
        }
    }

    /// Two engines wired back to back through in-memory queues.
    pub(crate) fn engine_pair(
        a_context: Arc<TestContext>,
        b_context: Arc<TestContext>,
    ) -> (CapTp, CapTp) {
        let a_id = Arc::new(SelfIdentity::generate(Location::tcp("127.0.0.1:1001")).unwrap());
        let b_id = Arc::new(SelfIdentity::generate(Location::tcp("127.0.0.1:1002")).unwrap());
        let (a_conn, a_rx) = Connection::new(Uuid::new_v4(), true, Arc::clone(&a_id), Encoding::Syrup);
        let (b_conn, b_rx) = Connection::new(Uuid::new_v4(), false, Arc::clone(&b_id), Encoding::Syrup);
        let a_info = Arc::new(SessionInfo::new(Arc::clone(&a_id), peer_of(&b_id)));
        let b_info = Arc::new(SessionInfo::new(Arc::clone(&b_id), peer_of(&a_id)));
        let a = CapTp::new(a_info, a_conn, a_context);
        let b = CapTp::new(b_info, b_conn, b_context);
        tokio::spawn(pump(a_rx, b.clone()));
        tokio::spawn(pump(b_rx, a.clone()));
        (a, b)
    }

    async fn settle(promise: &Promise) -> Settlement {
        tokio::time::timeout(Duration::from_secs(5), promise.settled())
            .await
            .expect("promise did not settle")
    }

    fn counter() -> Passable {
        let count = Arc::new(AtomicU64::new(0));
        Passable::from_fn(move |method, _args| match method {
            "inc" => Ok(Passable::from(
                (count.fetch_add(1, Ordering::SeqCst) + 1) as i64,
            )),
            other => Err(Passable::error(format!("no method {other}"))),
        })
    }

    fn as_i64(p: &Passable) -> i64 {
        match p.as_value() {
            Some(Value::Integer(i)) => i.to_i64().unwrap(),
            _ => panic!("Expected integer, got {p:?}"),
        }
    }

    fn context_with(name: &str, object: Passable) -> Arc<TestContext> {
        let context = TestContext::default();
        context.sturdyrefs.insert(name.as_bytes().to_vec(), object);
        Arc::new(context)
    }

    #[tokio::test]
    async fn test_fetch_and_call() {
        let (a, _b) = engine_pair(Arc::default(), context_with("counter", counter()));
        let counter = eventual::send(
            &a.bootstrap(),
            "fetch",
            vec![Passable::Data(Value::bytes(b"counter".to_vec()))],
        );
        let counter = settle(&counter).await.unwrap();
        assert!(matches!(counter, Passable::Object(ObjectRef::Remote(_))));

        let first = settle(&eventual::send(&counter, "inc", vec![])).await.unwrap();
        assert_eq!(as_i64(&first), 1);
    }

    #[tokio::test]
    async fn test_unknown_swissnum_breaks() {
        let (a, _b) = engine_pair(Arc::default(), Arc::default());
        let result = eventual::send(
            &a.bootstrap(),
            "fetch",
            vec![Passable::Data(Value::bytes(b"nope".to_vec()))],
        );
        match settle(&result).await {
            Err(Passable::Error(reason)) => assert_eq!(reason, "Unknown swissnum for sturdyref"),
            other => panic!("Expected broken promise, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_pipelined_calls_go_out_before_any_answer() {
        let (a, _b) = engine_pair(Arc::default(), context_with("counter", counter()));
        let mut observed = a.observe();

        let counter = eventual::send(
            &a.bootstrap(),
            "fetch",
            vec![Passable::Data(Value::bytes(b"counter".to_vec()))],
        );
        let target = Passable::Promise(counter);
        let first = eventual::send(&target, "inc", vec![]);
        let second = eventual::send(&target, "inc", vec![]);

        // All three deliveries were queued synchronously, in program order.
        let mut sent = Vec::new();
        for _ in 0..3 {
            let Observed { direction, message } = observed.try_recv().unwrap();
            assert_eq!(direction, Direction::Sent);
            sent.push(message);
        }
        match &sent[1] {
            Message::Deliver { to, .. } => assert_eq!(to, &RefDesc::Answer(0).to_value()),
            other => panic!("Expected pipelined deliver, got {other:?}"),
        }
        assert!(matches!(&sent[2], Message::Deliver { to, .. } if to == &RefDesc::Answer(0).to_value()));

        assert_eq!(as_i64(&settle(&first).await.unwrap()), 1);
        assert_eq!(as_i64(&settle(&second).await.unwrap()), 2);
    }

    #[tokio::test]
    async fn test_pipelined_get_and_index() {
        let record = Passable::Data(Value::Dictionary(vec![(
            Value::string("names"),
            Value::List(vec![Value::string("alice"), Value::string("bob")]),
        )]));
        let directory = Passable::from_fn(move |_method, _args| Ok(record.clone()));
        let (a, _b) = engine_pair(Arc::default(), context_with("directory", directory));

        let directory = eventual::send(
            &a.bootstrap(),
            "fetch",
            vec![Passable::Data(Value::bytes(b"directory".to_vec()))],
        );
        let listing = eventual::send(&Passable::Promise(directory), "list", vec![]);
        let names = eventual::get(&Passable::Promise(listing), "names");
        let bob = eventual::index(&Passable::Promise(names), 1);
        assert_eq!(settle(&bob).await.unwrap().as_str(), Some("bob"));

        let again = eventual::send(
            &a.bootstrap(),
            "fetch",
            vec![Passable::Data(Value::bytes(b"directory".to_vec()))],
        );
        let listing = eventual::send(&Passable::Promise(again), "list", vec![]);
        let missing = eventual::get(&Passable::Promise(listing), "nope");
        assert!(settle(&missing).await.is_err());
    }

    #[tokio::test]
    async fn test_passing_local_object_allows_callbacks() {
        let relay = Passable::from_fn(|_method, mut args| {
            // Call whatever object was passed in.
            let callback = args.pop().ok_or_else(|| Passable::error("no callback"))?;
            Ok(Passable::Promise(eventual::send(&callback, "inc", vec![])))
        });
        let (a, _b) = engine_pair(Arc::default(), context_with("relay", relay));
        let relay = eventual::send(
            &a.bootstrap(),
            "fetch",
            vec![Passable::Data(Value::bytes(b"relay".to_vec()))],
        );
        let result = eventual::send(&Passable::Promise(relay), "call", vec![counter()]);
        assert_eq!(as_i64(&settle(&result).await.unwrap()), 1);
    }

    #[tokio::test]
    async fn test_remote_error_breaks_with_reason() {
        let (a, _b) = engine_pair(Arc::default(), context_with("counter", counter()));
        let counter = eventual::send(
            &a.bootstrap(),
            "fetch",
            vec![Passable::Data(Value::bytes(b"counter".to_vec()))],
        );
        let result = eventual::send(&Passable::Promise(counter), "explode", vec![]);
        match settle(&result).await {
            Err(Passable::Error(reason)) => assert_eq!(reason, "no method explode"),
            other => panic!("Expected broken promise, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_answers_are_released_after_settlement() {
        let (a, b) = engine_pair(Arc::default(), context_with("counter", counter()));
        let counter = eventual::send(
            &a.bootstrap(),
            "fetch",
            vec![Passable::Data(Value::bytes(b"counter".to_vec()))],
        );
        settle(&counter).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(b.answer_count(), 0);
        assert_eq!(a.question_count(), 0);
    }

    #[tokio::test]
    async fn test_dropping_import_reports_gc() {
        let (a, b) = engine_pair(Arc::default(), context_with("counter", counter()));
        let counter = {
            let fetched = eventual::send(
                &a.bootstrap(),
                "fetch",
                vec![Passable::Data(Value::bytes(b"counter".to_vec()))],
            );
            settle(&fetched).await.unwrap()
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let before = b.export_count();
        drop(counter);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(b.export_count(), before - 1);
    }

    #[tokio::test]
    async fn test_settled_promise_export_is_released() {
        let sink = Passable::from_fn(|_method, _args| Ok(Passable::unit()));
        let (a, b) = engine_pair(Arc::default(), context_with("sink", sink));
        let sink = eventual::send(
            &a.bootstrap(),
            "fetch",
            vec![Passable::Data(Value::bytes(b"sink".to_vec()))],
        );
        let sink = settle(&sink).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let baseline = a.export_count();

        let (promise, resolver) = Promise::pending();
        let taken = eventual::send(&sink, "take", vec![Passable::Promise(promise)]);
        settle(&taken).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a.export_count(), baseline + 1);

        resolver.resolve(Passable::from("done"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a.export_count(), baseline);
        assert_eq!(b.question_count(), 0);
    }

    #[tokio::test]
    async fn test_unplug_breaks_outstanding_questions() {
        let (never, _keep) = Promise::pending();
        let stalled = Passable::from_fn(move |_method, _args| Ok(Passable::Promise(never.clone())));
        let (a, _b) = engine_pair(Arc::default(), context_with("stalled", stalled));
        let stalled = eventual::send(
            &a.bootstrap(),
            "fetch",
            vec![Passable::Data(Value::bytes(b"stalled".to_vec()))],
        );
        let result = eventual::send(&Passable::Promise(stalled), "wait", vec![]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!result.is_settled());

        a.unplug("test");
        match settle(&result).await {
            Err(Passable::Error(reason)) => assert_eq!(reason, SESSION_DISCONNECTED),
            other => panic!("Expected disconnection, got {other:?}"),
        }
        assert!(a.is_disconnected());
        let late = eventual::send(&a.bootstrap(), "fetch", vec![]);
        assert!(settle(&late).await.is_err());
    }

    #[tokio::test]
    async fn test_start_session_after_establishment_is_rejected() {
        let (a, _b) = engine_pair(Arc::default(), Arc::default());
        let identity = SelfIdentity::generate(Location::tcp("127.0.0.1:9")).unwrap();
        let result = a.dispatch(Message::StartSession {
            captp_version: "1.0".into(),
            session_public_key: identity.keypair.public_key().clone(),
            location: identity.location.clone(),
            location_signature: identity.location_signature,
        });
        assert!(matches!(result, Err(WireError::Protocol(_))));
    }
}
