//! Local promises with settlement callbacks.
//!
//! A [`Promise`] settles once, to `Ok(value)` (fulfilled) or `Err(reason)`
//! (broken). Callbacks registered with [`Promise::when_settled`] run in
//! registration order, which is what keeps queued deliveries in arrival
//! order. A promise that stands for a remote answer also records where it
//! lives, so calls on it can be pipelined to the peer.

use crate::captp::RemoteTarget;
use crate::passable::Passable;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// Outcome of a settled promise.
pub type Settlement = Result<Passable, Passable>;

type Callback = Box<dyn FnOnce(&Settlement) + Send>;

struct State {
    settled: Option<Settlement>,
    callbacks: Vec<Callback>,
}

struct Inner {
    state: Mutex<State>,
    origin: Option<RemoteTarget>,
}

impl Inner {
    fn new(origin: Option<RemoteTarget>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                settled: None,
                callbacks: Vec::new(),
            }),
            origin,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Clone)]
pub struct Promise {
    inner: Arc<Inner>,
}

/// The settling half of a [`Promise`]. Only the first settlement counts.
#[derive(Clone)]
pub struct Resolver {
    inner: Arc<Inner>,
}

impl Promise {
    pub fn pending() -> (Promise, Resolver) {
        Self::with_origin(None)
    }

    pub(crate) fn remote(origin: RemoteTarget) -> (Promise, Resolver) {
        Self::with_origin(Some(origin))
    }

    fn with_origin(origin: Option<RemoteTarget>) -> (Promise, Resolver) {
        let inner = Inner::new(origin);
        (
            Promise {
                inner: Arc::clone(&inner),
            },
            Resolver { inner },
        )
    }

    pub fn fulfilled(value: Passable) -> Promise {
        let (promise, resolver) = Self::pending();
        resolver.resolve(value);
        promise
    }

    pub fn broken(reason: Passable) -> Promise {
        let (promise, resolver) = Self::pending();
        resolver.reject(reason);
        promise
    }

    pub fn settlement(&self) -> Option<Settlement> {
        self.inner.lock().settled.clone()
    }

    pub fn is_settled(&self) -> bool {
        self.inner.lock().settled.is_some()
    }

    /// Run `f` once settled; immediately if already settled.
    pub fn when_settled(&self, f: impl FnOnce(&Settlement) + Send + 'static) {
        let settled = {
            let mut state = self.inner.lock();
            match &state.settled {
                Some(settled) => settled.clone(),
                None => {
                    state.callbacks.push(Box::new(f));
                    return;
                }
            }
        };
        f(&settled);
    }

    /// Wait for settlement.
    pub async fn settled(&self) -> Settlement {
        let (tx, rx) = oneshot::channel();
        self.when_settled(move |settled| {
            let _ = tx.send(settled.clone());
        });
        rx.await
            .unwrap_or_else(|_| Err(Passable::error("Promise abandoned")))
    }

    /// Remote location of this promise, if it is still unsettled there.
    pub(crate) fn origin(&self) -> Option<&RemoteTarget> {
        self.inner.origin.as_ref()
    }

    pub fn ptr_eq(&self, other: &Promise) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Identity key for export tables.
    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.settlement() {
            None => write!(f, "Promise(pending)"),
            Some(Ok(value)) => write!(f, "Promise(fulfilled: {value:?})"),
            Some(Err(reason)) => write!(f, "Promise(broken: {reason:?})"),
        }
    }
}

impl Resolver {
    /// Fulfill with `value`, or follow it if it is itself a promise.
    pub fn resolve(&self, value: Passable) {
        match value {
            Passable::Promise(target) => {
                if Arc::ptr_eq(&target.inner, &self.inner) {
                    self.settle(Err(Passable::error("Promise resolved to itself")));
                    return;
                }
                let resolver = self.clone();
                target.when_settled(move |settled| resolver.settle(settled.clone()));
            }
            value => self.settle(Ok(value)),
        }
    }

    pub fn reject(&self, reason: Passable) {
        self.settle(Err(reason));
    }

    pub fn settle(&self, settlement: Settlement) {
        let callbacks = {
            let mut state = self.inner.lock();
            if state.settled.is_some() {
                return;
            }
            state.settled = Some(settlement.clone());
            std::mem::take(&mut state.callbacks)
        };
        for callback in callbacks {
            callback(&settlement);
        }
    }

    pub fn is_settled(&self) -> bool {
        self.inner.lock().settled.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocapn_types::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn int(p: &Passable) -> i64 {
        match p {
            Passable::Data(Value::Integer(i)) => i.to_i64().unwrap(),
            other => panic!("Expected integer, got {other:?}"),
        }
    }

    #[test]
    fn test_first_settlement_wins() {
        let (promise, resolver) = Promise::pending();
        assert!(!promise.is_settled());
        resolver.resolve(Passable::from(1i64));
        resolver.resolve(Passable::from(2i64));
        resolver.reject(Passable::error("late"));
        assert_eq!(int(&promise.settlement().unwrap().unwrap()), 1);
    }

    #[test]
    fn test_callbacks_run_in_registration_order() {
        let (promise, resolver) = Promise::pending();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            promise.when_settled(move |_| order.lock().unwrap().push(i));
        }
        resolver.resolve(Passable::unit());
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);

        // Late registration fires immediately.
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        promise.when_settled(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_resolving_with_promise_follows_it() {
        let (outer, outer_resolver) = Promise::pending();
        let (inner, inner_resolver) = Promise::pending();
        outer_resolver.resolve(Passable::Promise(inner));
        assert!(!outer.is_settled());
        inner_resolver.reject(Passable::error("nope"));
        match outer.settlement() {
            Some(Err(Passable::Error(reason))) => assert_eq!(reason, "nope"),
            other => panic!("Expected broken promise, got {other:?}"),
        }
    }

    #[test]
    fn test_resolving_with_self_breaks() {
        let (promise, resolver) = Promise::pending();
        resolver.resolve(Passable::Promise(promise.clone()));
        assert!(matches!(promise.settlement(), Some(Err(_))));
    }

    #[test]
    fn test_settled_on_already_broken_promise() {
        let promise = Promise::broken(Passable::error("gone"));
        match tokio_test::block_on(promise.settled()) {
            Err(Passable::Error(reason)) => assert_eq!(reason, "gone"),
            other => panic!("Expected broken promise, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_settled_awaits() {
        let (promise, resolver) = Promise::pending();
        let waiter = tokio::spawn({
            let promise = promise.clone();
            async move { promise.settled().await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        resolver.resolve(Passable::from(42i64));
        assert_eq!(int(&waiter.await.unwrap().unwrap()), 42);
    }
}
