//! Eventual sends: `send`, `send_only`, `get` and `index` on any passable.
//!
//! Local objects are invoked directly. Remote objects and unsettled remote
//! answers are forwarded to their session, so chained calls go out on the
//! wire without waiting. Sends to an unsettled local promise are queued and
//! forwarded, in order, once it settles.

use crate::passable::{ObjectRef, Passable};
use crate::promise::Promise;

fn settle_local(result: Result<Passable, Passable>) -> Promise {
    match result {
        Ok(value) => {
            let (promise, resolver) = Promise::pending();
            resolver.resolve(value);
            promise
        }
        Err(reason) => Promise::broken(reason),
    }
}

fn not_invocable(target: &Passable) -> Promise {
    Promise::broken(Passable::error(format!(
        "Cannot deliver to {}",
        target.kind()
    )))
}

/// Queue `forward` until `promise` settles, then chain its result.
fn when_fulfilled(promise: &Promise, forward: impl FnOnce(&Passable) -> Promise + Send + 'static) -> Promise {
    let (result, resolver) = Promise::pending();
    promise.when_settled(move |settled| match settled {
        Ok(value) => resolver.resolve(Passable::Promise(forward(value))),
        Err(reason) => resolver.reject(reason.clone()),
    });
    result
}

/// Invoke `method` on `target`, returning a promise for the result.
pub fn send(target: &Passable, method: &str, args: Vec<Passable>) -> Promise {
    match target {
        Passable::Object(ObjectRef::Local(object)) => settle_local(object.invoke(method, args)),
        Passable::Object(ObjectRef::Remote(remote)) => remote.target().deliver(method, args),
        Passable::Promise(promise) => match promise.settlement() {
            Some(Ok(value)) => send(&value, method, args),
            Some(Err(reason)) => Promise::broken(reason),
            None => match promise.origin() {
                Some(origin) => origin.deliver(method, args),
                None => {
                    let method = method.to_string();
                    when_fulfilled(promise, move |value| send(value, &method, args))
                }
            },
        },
        other => not_invocable(other),
    }
}

/// Invoke `method` on `target` without asking for a result.
pub fn send_only(target: &Passable, method: &str, args: Vec<Passable>) {
    match target {
        Passable::Object(ObjectRef::Local(object)) => {
            if let Err(reason) = object.invoke(method, args) {
                tracing::debug!(?reason, method, "OCapN: deliver-only to local object failed");
            }
        }
        Passable::Object(ObjectRef::Remote(remote)) => remote.target().deliver_only(method, args),
        Passable::Promise(promise) => match promise.settlement() {
            Some(Ok(value)) => send_only(&value, method, args),
            Some(Err(_)) => {}
            None => match promise.origin() {
                Some(origin) => origin.deliver_only(method, args),
                None => {
                    let method = method.to_string();
                    promise.when_settled(move |settled| {
                        if let Ok(value) = settled {
                            send_only(value, &method, args);
                        }
                    });
                }
            },
        },
        other => tracing::debug!(kind = other.kind(), method, "OCapN: deliver-only to non-object dropped"),
    }
}

/// Project field `name` of the dictionary `target` resolves to.
pub fn get(target: &Passable, name: &str) -> Promise {
    match target {
        Passable::Object(ObjectRef::Remote(remote)) => remote.target().get(name),
        Passable::Promise(promise) => match promise.settlement() {
            Some(Ok(value)) => get(&value, name),
            Some(Err(reason)) => Promise::broken(reason),
            None => match promise.origin() {
                Some(origin) => origin.get(name),
                None => {
                    let name = name.to_string();
                    when_fulfilled(promise, move |value| get(value, &name))
                }
            },
        },
        other => settle_local(other.get_field(name)),
    }
}

/// Project element `index` of the list `target` resolves to.
pub fn index(target: &Passable, index: u64) -> Promise {
    match target {
        Passable::Object(ObjectRef::Remote(remote)) => remote.target().index(index),
        Passable::Promise(promise) => match promise.settlement() {
            Some(Ok(value)) => self::index(&value, index),
            Some(Err(reason)) => Promise::broken(reason),
            None => match promise.origin() {
                Some(origin) => origin.index(index),
                None => when_fulfilled(promise, move |value| self::index(value, index)),
            },
        },
        other => settle_local(other.get_index(index)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocapn_types::Value;
    use std::sync::{Arc, Mutex};

    fn counter(log: Arc<Mutex<Vec<String>>>) -> Passable {
        Passable::from_fn(move |method, _args| {
            log.lock().unwrap().push(method.to_string());
            Ok(Passable::from(method))
        })
    }

    #[test]
    fn test_send_to_local_object() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let target = counter(Arc::clone(&log));
        let result = send(&target, "hello", vec![]);
        assert_eq!(
            result.settlement().unwrap().unwrap().as_str(),
            Some("hello")
        );
        assert_eq!(*log.lock().unwrap(), vec!["hello"]);
    }

    #[test]
    fn test_sends_to_pending_promise_are_queued_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (promise, resolver) = Promise::pending();
        let target = Passable::Promise(promise);

        let first = send(&target, "f", vec![]);
        let second = send(&target, "g", vec![]);
        send_only(&target, "h", vec![]);
        assert!(log.lock().unwrap().is_empty());
        assert!(!first.is_settled());

        resolver.resolve(counter(Arc::clone(&log)));
        assert_eq!(*log.lock().unwrap(), vec!["f", "g", "h"]);
        assert!(first.is_settled() && second.is_settled());
    }

    #[test]
    fn test_send_to_broken_promise_breaks() {
        let target = Passable::Promise(Promise::broken(Passable::error("dead")));
        match send(&target, "f", vec![]).settlement() {
            Some(Err(Passable::Error(reason))) => assert_eq!(reason, "dead"),
            other => panic!("Expected broken promise, got {other:?}"),
        }
    }

    #[test]
    fn test_send_to_data_breaks() {
        let result = send(&Passable::from(5i64), "f", vec![]);
        assert!(matches!(result.settlement(), Some(Err(_))));
    }

    #[test]
    fn test_get_and_index_on_local_data() {
        let record = Passable::Data(Value::Dictionary(vec![(
            Value::string("items"),
            Value::List(vec![Value::int(7), Value::int(8)]),
        )]));
        let (promise, resolver) = Promise::pending();
        let items = get(&Passable::Promise(promise), "items");
        let second = index(&Passable::Promise(items), 1);
        resolver.resolve(record);
        assert_eq!(
            second.settlement().unwrap().unwrap().as_value(),
            Some(&Value::int(8))
        );

        assert!(matches!(
            get(&Passable::from(1i64), "x").settlement(),
            Some(Err(_))
        ));
    }
}
